//! Liveness checking for the control channel.
//!
//! Two layers: a text ping raced against a pong timeout, and a secondary
//! HTTP probe of the server's ping endpoint that detects a server which was
//! redeployed and no longer knows this client. Either failure forces the
//! control channel closed, which triggers a reconnect.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info, warn};

use burrow_core::PING;

use crate::tunnel::Session;

/// How long to wait for the pong before declaring the channel dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the out-of-band ping-endpoint probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct PingReply {
    ok: bool,
    code: u16,
    #[serde(default)]
    #[allow(dead_code)]
    message: String,
}

/// Spawn the 1-Hz health check for a session.
///
/// Fires whenever the channel has been idle for the configured ping
/// interval; receipt of any message (the pong included) resets the clock.
pub fn spawn_liveness(session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let probe = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .ok();
        let ping_interval = session.config.ping_interval();
        let mut tick = interval(Duration::from_secs(1));

        loop {
            tick.tick().await;
            if session.idle_for() < ping_interval {
                continue;
            }

            // Register for the pong before the ping goes out.
            let pong = session.pong.notified();
            if !session.send_text(PING).await {
                session.close();
                return;
            }
            if timeout(PONG_TIMEOUT, pong).await.is_err() {
                warn!(
                    "no pong within {}s, closing control channel",
                    PONG_TIMEOUT.as_secs()
                );
                session.close();
                return;
            }

            // The socket answers, but does the server still know us? A
            // redeployed server keeps pongs flowing while the slot is gone.
            if let Some(client) = &probe {
                if probe_says_forgotten(client, &session).await {
                    info!("server no longer knows this client, forcing reconnect");
                    session.close();
                    return;
                }
            }
        }
    })
}

/// True only on a definitive `ok:false, code:404` from the ping endpoint.
/// Every other failure (endpoint absent, bad JSON, network error) is OK.
async fn probe_says_forgotten(client: &reqwest::Client, session: &Session) -> bool {
    let url = match session.config.ping_url() {
        Ok(url) => url,
        Err(_) => return false,
    };
    match client.get(url.as_str()).send().await {
        Ok(response) => match response.json::<PingReply>().await {
            Ok(reply) => !reply.ok && reply.code == 404,
            Err(e) => {
                debug!("ping endpoint returned non-JSON: {}", e);
                false
            }
        },
        Err(e) => {
            debug!("ping endpoint unreachable: {}", e);
            false
        }
    }
}

/// Verify the local origin accepts TCP connections.
pub async fn verify_upstream(addr: &str, timeout_secs: u64) -> Result<Duration, String> {
    let start = Instant::now();
    match timeout(
        Duration::from_secs(timeout_secs),
        tokio::net::TcpStream::connect(addr),
    )
    .await
    {
        Ok(Ok(_stream)) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_reply_parsing() {
        let reply: PingReply =
            serde_json::from_str(r#"{"ok":false,"code":404,"message":"unknown client"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.code, 404);

        // `message` is optional.
        let reply: PingReply = serde_json::from_str(r#"{"ok":true,"code":200}"#).unwrap();
        assert!(reply.ok);
    }
}
