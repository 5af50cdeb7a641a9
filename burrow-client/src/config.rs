//! Client configuration.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::time::Duration;
use url::Url;

use burrow_core::RequestId;

/// Ping intervals below this are clamped up.
pub const MIN_PING_INTERVAL_SECS: u64 = 5;

/// Burrow Client - Expose a local HTTP service through a burrow server.
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Identifier for this tunnel endpoint, stable across reconnects
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: String,

    /// Public tunnel server URL (http(s):// or ws(s)://)
    #[arg(long, env = "REMOTE_URL")]
    pub remote_url: String,

    /// Local origin requests are forwarded to (http://host:port[/prefix])
    #[arg(long, env = "LOCAL_URL")]
    pub local_url: String,

    /// Bearer token presented on the control connection
    #[arg(long, env = "CONN_TOKEN")]
    pub conn_token: Option<String>,

    /// Idle seconds before a liveness ping (minimum 5)
    #[arg(long, env = "PING_INTERVAL", default_value = "30")]
    pub ping_interval: u64,

    /// Check that the local origin accepts connections before starting
    #[arg(long, env = "VERIFY_UPSTREAM")]
    pub verify_upstream: bool,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    pub debug: bool,
}

/// Where the client forwards traffic to, pre-digested from `LOCAL_URL`.
#[derive(Debug, Clone)]
pub struct LocalOrigin {
    /// Value for the `host` header on forwarded requests.
    pub host: String,
    /// `host:port` for TCP connects.
    pub addr: String,
    /// Path prefix joined in front of proxied paths; empty for `/`.
    pub base_path: String,
}

impl LocalOrigin {
    /// Origin-form request target for a proxied path (includes the query).
    pub fn request_uri(&self, path: &str) -> String {
        let joined = format!("{}{}", self.base_path, path);
        if joined.is_empty() {
            "/".to_string()
        } else {
            joined
        }
    }

    /// WebSocket URL for a proxied upgrade against the local origin.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, self.request_uri(path))
    }
}

impl ClientConfig {
    /// The effective ping interval, clamped to the minimum.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval.max(MIN_PING_INTERVAL_SECS))
    }

    /// WebSocket URL of the server's control endpoint.
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = self.remote_base("ws", "wss")?;
        url.set_path("/__connect__");
        url.query_pairs_mut().append_pair("clientId", &self.client_id);
        if let Some(token) = &self.conn_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    /// HTTP URL of the server's ping endpoint for this client.
    pub fn ping_url(&self) -> Result<Url> {
        let mut url = self.remote_base("http", "https")?;
        url.set_path("/__ping__");
        url.query_pairs_mut().append_pair("clientId", &self.client_id);
        Ok(url)
    }

    /// WebSocket URL of the dial-back endpoint for one tunnelled upgrade.
    pub fn ws_tunnel_url(&self, request_id: &RequestId) -> Result<Url> {
        let mut url = self.remote_base("ws", "wss")?;
        url.set_path("/__ws__");
        url.query_pairs_mut()
            .append_pair("clientId", &self.client_id)
            .append_pair("requestId", request_id.as_str());
        if let Some(token) = &self.conn_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    fn remote_base(&self, plain: &str, tls: &str) -> Result<Url> {
        let mut url = Url::parse(&self.remote_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => plain,
            "https" | "wss" => tls,
            other => bail!("unsupported REMOTE_URL scheme: {}", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive {} URL from {}", scheme, self.remote_url))?;
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    /// Parse and validate `LOCAL_URL`.
    pub fn local_origin(&self) -> Result<LocalOrigin> {
        let url = Url::parse(&self.local_url)?;
        if url.scheme() != "http" {
            bail!("LOCAL_URL must be http://, got {}://", url.scheme());
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("LOCAL_URL has no host"))?;
        let port = url.port().unwrap_or(80);
        let host_header = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        Ok(LocalOrigin {
            host: host_header,
            addr: format!("{}:{}", host, port),
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(remote: &str, local: &str) -> ClientConfig {
        ClientConfig {
            client_id: "edge-1".to_string(),
            remote_url: remote.to_string(),
            local_url: local.to_string(),
            conn_token: None,
            ping_interval: 30,
            verify_upstream: false,
            debug: false,
        }
    }

    #[test]
    fn test_ping_interval_is_clamped() {
        let mut cfg = config("https://t.example.com", "http://localhost:3000");
        cfg.ping_interval = 1;
        assert_eq!(cfg.ping_interval(), Duration::from_secs(5));
        cfg.ping_interval = 30;
        assert_eq!(cfg.ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_connect_url_scheme_and_query() {
        let mut cfg = config("https://t.example.com", "http://localhost:3000");
        cfg.conn_token = Some("s3cret".to_string());
        let url = cfg.connect_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/__connect__");
        assert_eq!(
            url.query(),
            Some("clientId=edge-1&token=s3cret")
        );

        let cfg = config("http://t.example.com:8080", "http://localhost:3000");
        let url = cfg.connect_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.query(), Some("clientId=edge-1"));
    }

    #[test]
    fn test_ping_url_uses_http_scheme() {
        let cfg = config("wss://t.example.com", "http://localhost:3000");
        let url = cfg.ping_url().unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/__ping__");
    }

    #[test]
    fn test_ws_tunnel_url_carries_both_ids() {
        let cfg = config("https://t.example.com", "http://localhost:3000");
        let url = cfg.ws_tunnel_url(&RequestId::from("1f")).unwrap();
        assert_eq!(url.path(), "/__ws__");
        assert_eq!(url.query(), Some("clientId=edge-1&requestId=1f"));
    }

    #[test]
    fn test_local_origin_parsing() {
        let cfg = config("https://t.example.com", "http://127.0.0.1:3000");
        let origin = cfg.local_origin().unwrap();
        assert_eq!(origin.addr, "127.0.0.1:3000");
        assert_eq!(origin.host, "127.0.0.1:3000");
        assert_eq!(origin.request_uri("/a/b?x=1"), "/a/b?x=1");

        let cfg = config("https://t.example.com", "http://app.internal/svc/");
        let origin = cfg.local_origin().unwrap();
        assert_eq!(origin.addr, "app.internal:80");
        assert_eq!(origin.host, "app.internal");
        assert_eq!(origin.request_uri("/a"), "/svc/a");
        assert_eq!(origin.ws_url("/sock"), "ws://app.internal:80/svc/sock");
    }

    #[test]
    fn test_local_origin_rejects_non_http() {
        let cfg = config("https://t.example.com", "https://app.internal");
        assert!(cfg.local_origin().is_err());
    }
}
