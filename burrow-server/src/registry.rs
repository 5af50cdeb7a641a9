//! Client registry with slot-preserving tombstones.
//!
//! Clients occupy slots in insertion order; the sticky load balancer indexes
//! into the live slots, so a disconnecting client leaves a tombstone behind
//! instead of vacating its position. A reconnect under the same id
//! reoccupies the original slot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use burrow_core::{ClientId, RequestId, ServerFrame};

use crate::relay::{RelayState, ResponseHead, TaskOutcome};

/// A message queued for the control-channel writer task.
///
/// All producers funnel through one queue per client, so concurrent sends
/// never interleave partial writes on the socket.
pub enum Outbound {
    Frame(ServerFrame),
    Text(String),
}

/// Per-connection state for one live tunnel client.
pub struct ClientHandle {
    pub id: ClientId,
    /// Queue drained by the connection's writer task.
    pub tx: mpsc::Sender<Outbound>,
    /// Requests dispatched to this client whose response has not begun.
    pending_requests: Mutex<HashSet<RequestId>>,
    /// Requests whose response body is still streaming.
    active_responses: Mutex<HashSet<RequestId>>,
}

impl ClientHandle {
    pub fn new(id: ClientId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            pending_requests: Mutex::new(HashSet::new()),
            active_responses: Mutex::new(HashSet::new()),
        }
    }

    pub fn track_pending(&self, id: RequestId) {
        self.pending_requests.lock().unwrap().insert(id);
    }

    pub fn untrack_pending(&self, id: &RequestId) -> bool {
        self.pending_requests.lock().unwrap().remove(id)
    }

    pub fn track_active(&self, id: RequestId) {
        self.active_responses.lock().unwrap().insert(id);
    }

    pub fn untrack_active(&self, id: &RequestId) {
        self.active_responses.lock().unwrap().remove(id);
    }

    /// Fail everything in flight against this client.
    ///
    /// Pending requests resolve with a synthetic 500 so callers do not hang;
    /// streaming response bodies are closed so truncation surfaces
    /// immediately. Idempotent: both sets are drained.
    pub fn fail_inflight(&self, relay: &RelayState) {
        let pending: Vec<RequestId> = self.pending_requests.lock().unwrap().drain().collect();
        for id in pending {
            relay.resolve(
                &id,
                TaskOutcome::Http {
                    head: ResponseHead::internal_error(),
                    body: None,
                },
            );
        }

        let active: Vec<RequestId> = self.active_responses.lock().unwrap().drain().collect();
        for id in active {
            relay.close_writer(&id);
        }
    }
}

enum Slot {
    Live(Arc<ClientHandle>),
    Tombstone,
}

struct SlotEntry {
    id: ClientId,
    slot: Slot,
}

/// Ordered mapping from client id to a live record or a tombstone.
#[derive(Default)]
pub struct ClientRegistry {
    slots: Mutex<Vec<SlotEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a freshly connected client, reoccupying its slot if one exists.
    ///
    /// Returns the record this one displaced, if the id was still live; the
    /// caller is responsible for failing that record's in-flight requests.
    pub fn bind(&self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let mut slots = self.slots.lock().unwrap();
        for entry in slots.iter_mut() {
            if entry.id == handle.id {
                let previous = std::mem::replace(&mut entry.slot, Slot::Live(handle));
                return match previous {
                    Slot::Live(old) => Some(old),
                    Slot::Tombstone => None,
                };
            }
        }
        slots.push(SlotEntry {
            id: handle.id.clone(),
            slot: Slot::Live(handle),
        });
        None
    }

    /// Tombstone the slot held by `handle`.
    ///
    /// A no-op when a reconnect already reoccupied the slot with a newer
    /// record.
    pub fn tombstone(&self, handle: &Arc<ClientHandle>) {
        let mut slots = self.slots.lock().unwrap();
        for entry in slots.iter_mut() {
            if entry.id == handle.id {
                if let Slot::Live(current) = &entry.slot {
                    if Arc::ptr_eq(current, handle) {
                        entry.slot = Slot::Tombstone;
                        debug!("client {} slot tombstoned", handle.id);
                    }
                }
                return;
            }
        }
    }

    /// The live record for `id`, if its slot is occupied.
    pub fn get(&self, id: &ClientId) -> Option<Arc<ClientHandle>> {
        let slots = self.slots.lock().unwrap();
        slots.iter().find_map(|entry| match &entry.slot {
            Slot::Live(handle) if entry.id == *id => Some(handle.clone()),
            _ => None,
        })
    }

    /// Live clients in slot insertion order, tombstones skipped.
    pub fn live_clients(&self) -> Vec<Arc<ClientHandle>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter_map(|entry| match &entry.slot {
                Slot::Live(handle) => Some(handle.clone()),
                Slot::Tombstone => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live_clients().len()
    }

    /// Sticky selection: `CRC32(ip) mod N` over the live slots.
    ///
    /// The same source IP keeps routing to the same client for as long as
    /// the set of live slots is unchanged.
    pub fn select(&self, ip: &str) -> Option<Arc<ClientHandle>> {
        let live = self.live_clients();
        if live.is_empty() {
            return None;
        }
        let index = crc32fast::hash(ip.as_bytes()) as usize % live.len();
        Some(live[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> Arc<ClientHandle> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(ClientHandle::new(ClientId::from(id), tx))
    }

    #[test]
    fn test_reconnect_preserves_slot_position() {
        let registry = ClientRegistry::new();
        let a = handle("a");
        let b = handle("b");
        let c = handle("c");
        registry.bind(a.clone());
        registry.bind(b.clone());
        registry.bind(c.clone());

        registry.tombstone(&b);
        let live: Vec<String> = registry
            .live_clients()
            .iter()
            .map(|h| h.id.to_string())
            .collect();
        assert_eq!(live, vec!["a", "c"]);

        let b2 = handle("b");
        registry.bind(b2);
        let live: Vec<String> = registry
            .live_clients()
            .iter()
            .map(|h| h.id.to_string())
            .collect();
        assert_eq!(live, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bind_displaces_live_record() {
        let registry = ClientRegistry::new();
        let first = handle("a");
        registry.bind(first.clone());

        let second = handle("a");
        let displaced = registry.bind(second.clone()).expect("old record displaced");
        assert!(Arc::ptr_eq(&displaced, &first));

        // Tombstoning through the stale record must not unseat the new one.
        registry.tombstone(&first);
        assert!(registry.get(&ClientId::from("a")).is_some());
    }

    #[test]
    fn test_select_is_sticky_and_ordered() {
        let registry = ClientRegistry::new();
        let ids = ["a", "b", "c"];
        for id in ids {
            registry.bind(handle(id));
        }

        let ip = "1.2.3.4";
        let expected = ids[crc32fast::hash(ip.as_bytes()) as usize % 3];
        let selected = registry.select(ip).unwrap();
        assert_eq!(selected.id.as_str(), expected);

        // Same IP, same choice.
        assert_eq!(registry.select(ip).unwrap().id.as_str(), expected);
    }

    #[test]
    fn test_select_skips_tombstones() {
        let registry = ClientRegistry::new();
        let a = handle("a");
        let b = handle("b");
        let c = handle("c");
        registry.bind(a);
        registry.bind(b.clone());
        registry.bind(c);
        registry.tombstone(&b);

        let ip = "10.0.0.9";
        let live = ["a", "c"];
        let expected = live[crc32fast::hash(ip.as_bytes()) as usize % 2];
        assert_eq!(registry.select(ip).unwrap().id.as_str(), expected);
    }

    #[test]
    fn test_select_empty_registry() {
        let registry = ClientRegistry::new();
        assert!(registry.select("1.2.3.4").is_none());
    }

    #[tokio::test]
    async fn test_fail_inflight_resolves_pending_with_500() {
        let registry = ClientRegistry::new();
        let relay = RelayState::new();
        let client = handle("a");
        registry.bind(client.clone());

        let (id, rx) = relay.allocate();
        client.track_pending(id.clone());

        client.fail_inflight(&relay);
        match rx.await.unwrap() {
            TaskOutcome::Http { head, body } => {
                assert_eq!(head.status, 500);
                assert!(body.is_none());
            }
            TaskOutcome::WebSocket(_) => panic!("expected http outcome"),
        }
        assert!(!relay.has_task(&id));
    }

    #[tokio::test]
    async fn test_fail_inflight_closes_active_writers() {
        let relay = RelayState::new();
        let client = handle("a");

        let id = RequestId::from("1f");
        let mut body_rx = relay.open_writer(&id);
        client.track_active(id.clone());

        client.fail_inflight(&relay);
        assert!(relay.writer(&id).is_none());
        assert!(body_rx.recv().await.is_none());
    }
}
