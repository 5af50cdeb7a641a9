//! Control-channel connection and reconnection.
//!
//! One session per connection to the server. The session owns the outbound
//! writer queue, the liveness bookkeeping, and the per-request state the
//! executor needs; everything is torn down together when the channel closes.

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as TungsteniteMessage,
    tungstenite::Error as WsError,
};
use tracing::{debug, info, warn};

use burrow_core::{ClientFrame, RequestId, ServerFrame, PONG};

use crate::config::{ClientConfig, LocalOrigin};
use crate::{executor, health};

/// Delay before retrying when the server cannot be reached at all.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound frames queued before producers start blocking.
const OUTBOUND_QUEUE: usize = 256;

/// A message queued for the control-channel writer task.
pub enum Outbound {
    Frame(ClientFrame),
    Text(String),
}

/// Shared state of one control-channel connection.
pub struct Session {
    pub config: Arc<ClientConfig>,
    pub origin: LocalOrigin,
    outbound: mpsc::Sender<Outbound>,
    /// Stamped on every message received on the control channel.
    last_activity: Mutex<Instant>,
    /// Signalled when a text pong arrives.
    pub pong: Notify,
    /// Signalled by the health check to force the channel closed.
    shutdown: Notify,
    /// Writers feeding streamed request bodies into local requests.
    pub body_writers: DashMap<RequestId, mpsc::Sender<Bytes>>,
    /// In-flight local work, abortable per request id.
    pub inflight: DashMap<RequestId, JoinHandle<()>>,
}

impl Session {
    fn new(config: Arc<ClientConfig>, origin: LocalOrigin, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            config,
            origin,
            outbound,
            last_activity: Mutex::new(Instant::now()),
            pong: Notify::new(),
            shutdown: Notify::new(),
            body_writers: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Time since the last message arrived on the control channel.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Queue a frame for the writer task. False when the channel is gone.
    pub async fn send_frame(&self, frame: ClientFrame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).await.is_ok()
    }

    pub async fn send_text(&self, text: &str) -> bool {
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .await
            .is_ok()
    }

    /// Ask the session loop to close the control channel.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Cancel all local work for this session.
    fn abort_inflight(&self) {
        for entry in self.inflight.iter() {
            entry.value().abort();
        }
        self.inflight.clear();
        self.body_writers.clear();
    }
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("server rejected the connection token")]
    Unauthorized,
    #[error(transparent)]
    Connect(anyhow::Error),
}

/// Run the tunnel until the token is rejected.
///
/// A session that closes after being open reconnects immediately; a failed
/// connection attempt retries after a delay.
pub async fn run_tunnel_loop(config: Arc<ClientConfig>) -> Result<()> {
    let origin = config.local_origin()?;

    loop {
        match run_session(&config, &origin).await {
            Ok(()) => {
                info!("control channel closed, reconnecting");
            }
            Err(SessionError::Unauthorized) => {
                anyhow::bail!("server rejected the connection token (401), not retrying");
            }
            Err(SessionError::Connect(e)) => {
                warn!("connection failed: {:#}", e);
                info!("retrying in {} seconds", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Run a single control-channel connection to completion.
async fn run_session(config: &Arc<ClientConfig>, origin: &LocalOrigin) -> Result<(), SessionError> {
    let url = config.connect_url().map_err(SessionError::Connect)?;
    info!("connecting to {}", config.remote_url);

    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(WsError::Http(response)) if response.status().as_u16() == 401 => {
            return Err(SessionError::Unauthorized);
        }
        Err(e) => return Err(SessionError::Connect(e.into())),
    };
    info!("control channel established");

    let (mut ws_tx, mut ws_rx) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let session = Arc::new(Session::new(config.clone(), origin.clone(), outbound_tx));

    // Single writer task: concurrent request executors all funnel through
    // the queue, so frames never interleave on the socket.
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let msg = match out {
                Outbound::Frame(frame) => match frame.to_bytes() {
                    Ok(bytes) => TungsteniteMessage::Binary(bytes),
                    Err(e) => {
                        warn!("failed to encode frame: {}", e);
                        continue;
                    }
                },
                Outbound::Text(text) => TungsteniteMessage::Text(text),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let health = health::spawn_liveness(session.clone());

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                let Some(result) = message else { break };
                match result {
                    Ok(msg) => handle_message(&session, msg).await,
                    Err(e) => {
                        warn!("control channel error: {}", e);
                        break;
                    }
                }
            }
            _ = session.shutdown.notified() => {
                info!("closing control channel");
                break;
            }
        }
    }

    writer.abort();
    health.abort();
    session.abort_inflight();
    Ok(())
}

async fn handle_message(session: &Arc<Session>, msg: TungsteniteMessage) {
    session.touch();
    match msg {
        TungsteniteMessage::Binary(data) => match ServerFrame::from_bytes(&data) {
            Ok(frame) => executor::handle_frame(session, frame).await,
            Err(e) => {
                debug!("dropping undecodable frame: {}", e);
            }
        },
        TungsteniteMessage::Text(text) => {
            if text == PONG {
                session.pong.notify_one();
            }
            // Other text messages are ignored.
        }
        _ => {}
    }
}
