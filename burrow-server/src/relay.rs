//! Per-request rendezvous state.
//!
//! Two process-wide maps keyed by request id: the tasks waiting for a
//! response, and the writers feeding response bodies that are still
//! streaming. Creation, lookup and removal are the only operations; nothing
//! here performs I/O while a map shard is held.

use axum::extract::ws::WebSocket;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use burrow_core::{RequestId, RequestIdAllocator};

/// Response status line and headers, as relayed from the client.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// The synthetic response used when a client vanishes mid-request.
    pub fn internal_error() -> Self {
        Self {
            status: 500,
            status_text: "Internal Server Error".to_string(),
            headers: Vec::new(),
        }
    }
}

/// What a waiting dispatcher receives when its request resolves.
pub enum TaskOutcome {
    /// An HTTP response; `body` is `None` for bodyless responses.
    Http {
        head: ResponseHead,
        body: Option<mpsc::Receiver<Bytes>>,
    },
    /// The client dialled back with the upstream leg of a WebSocket tunnel.
    WebSocket(WebSocket),
}

/// How many body chunks may sit between the assembler and a slow public
/// reader before the assembler blocks.
const BODY_CHANNEL_CAPACITY: usize = 64;

/// Registry of per-request state shared by the dispatcher, the response
/// assembler and the client-disconnect handler.
#[derive(Default)]
pub struct RelayState {
    ids: RequestIdAllocator,
    tasks: DashMap<RequestId, oneshot::Sender<TaskOutcome>>,
    writers: DashMap<RequestId, mpsc::Sender<Bytes>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a request id and register the rendezvous for it.
    pub fn allocate(&self) -> (RequestId, oneshot::Receiver<TaskOutcome>) {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.tasks.insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolve the task for `id`, removing it from the map.
    ///
    /// Returns false when no task is waiting (timed out or cleaned up); the
    /// caller drops the outcome in that case.
    pub fn resolve(&self, id: &RequestId, outcome: TaskOutcome) -> bool {
        match self.tasks.remove(id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop the task for `id` without resolving it (timeout or abort path).
    pub fn remove_task(&self, id: &RequestId) {
        self.tasks.remove(id);
    }

    pub fn has_task(&self, id: &RequestId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Open a response body writer for `id` and hand back the reader end.
    pub fn open_writer(&self, id: &RequestId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        self.writers.insert(id.clone(), tx);
        rx
    }

    /// The writer for `id`, if its response body is still streaming.
    pub fn writer(&self, id: &RequestId) -> Option<mpsc::Sender<Bytes>> {
        self.writers.get(id).map(|w| w.clone())
    }

    /// Close the writer for `id`; the reader observes end-of-stream.
    pub fn close_writer(&self, id: &RequestId) {
        self.writers.remove(id);
    }
}
