//! Server configuration.

use clap::Parser;
use regex::{Regex, RegexBuilder};

/// Burrow Server - Expose private HTTP services to the public internet.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on for all traffic (tunnel and public)
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Bearer token tunnel clients must present when connecting
    #[arg(long, env = "CONN_TOKEN")]
    pub conn_token: Option<String>,

    /// Bearer token public callers must present
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Regex of public paths that bypass auth; `/pattern/i` is accepted
    #[arg(long, env = "AUTH_RULE", value_parser = parse_auth_rule)]
    pub auth_rule: Option<AuthRule>,

    /// Pass the original Host header through instead of x-forwarded-host
    #[arg(long, env = "FORWARD_HOST", default_value = "false", value_parser = parse_bool)]
    pub forward_host: bool,

    /// Buffer request bodies and send each request as a single frame
    #[arg(long, env = "BUFFER_REQUEST", default_value = "false", value_parser = parse_bool)]
    pub buffer_request: bool,

    /// Enable debug logging
    #[arg(long, env = "DEBUG", default_value = "false", value_parser = parse_bool)]
    pub debug: bool,
}

/// Compiled auth-bypass rule.
#[derive(Debug, Clone)]
pub struct AuthRule(pub Regex);

impl AuthRule {
    pub fn matches(&self, path: &str) -> bool {
        self.0.is_match(path)
    }
}

/// Booleans are a case-insensitive match against `true|on|1`; anything else
/// is false.
pub fn parse_bool(s: &str) -> Result<bool, String> {
    Ok(matches!(
        s.to_ascii_lowercase().as_str(),
        "true" | "on" | "1"
    ))
}

/// Accepts a bare pattern, `/pattern/`, or `/pattern/i`.
pub fn parse_auth_rule(s: &str) -> Result<AuthRule, String> {
    let (pattern, case_insensitive) = match s.strip_prefix('/') {
        Some(inner) => {
            if let Some(p) = inner.strip_suffix("/i") {
                (p, true)
            } else if let Some(p) = inner.strip_suffix('/') {
                (p, false)
            } else {
                (s, false)
            }
        }
        None => (s, false),
    };

    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map(AuthRule)
        .map_err(|e| format!("invalid auth rule: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        for s in ["true", "TRUE", "on", "On", "1"] {
            assert!(parse_bool(s).unwrap(), "{} should parse true", s);
        }
        for s in ["false", "off", "0", "yes", ""] {
            assert!(!parse_bool(s).unwrap(), "{} should parse false", s);
        }
    }

    #[test]
    fn test_parse_auth_rule_bare() {
        let rule = parse_auth_rule("^/public/").unwrap();
        assert!(rule.matches("/public/index.html"));
        assert!(!rule.matches("/private/index.html"));
    }

    #[test]
    fn test_parse_auth_rule_slash_delimited() {
        let rule = parse_auth_rule("/^\\/health$/").unwrap();
        assert!(rule.matches("/health"));
        assert!(!rule.matches("/Health"));
    }

    #[test]
    fn test_parse_auth_rule_case_insensitive() {
        let rule = parse_auth_rule("/^\\/Assets\\//i").unwrap();
        assert!(rule.matches("/assets/app.js"));
        assert!(rule.matches("/ASSETS/app.js"));
    }

    #[test]
    fn test_parse_auth_rule_rejects_bad_regex() {
        assert!(parse_auth_rule("/(unclosed/").is_err());
    }
}
