//! Identifiers used on the control channel.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier for a tunnel endpoint, chosen by the client.
///
/// Stable across reconnects: a client that reconnects under the same id
/// reoccupies its slot on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for one public request, allocated by the server.
///
/// The server owns this namespace; the client only ever echoes ids back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates request ids unique for the lifetime of the process.
///
/// Ids are a base-32 rendering of a monotonically increasing counter, so
/// they stay short and never repeat while the server is up.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    counter: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh request id.
    pub fn next(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId(to_base32(n))
    }
}

const BASE32_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

fn to_base32(mut n: u64) -> String {
    // 13 digits cover the full u64 range.
    let mut buf = [0u8; 13];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = BASE32_ALPHABET[(n % 32) as usize];
        n /= 32;
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_base32_rendering() {
        assert_eq!(to_base32(0), "0");
        assert_eq!(to_base32(31), "v");
        assert_eq!(to_base32(32), "10");
        assert_eq!(to_base32(1025), "101");
    }

    #[test]
    fn test_allocator_is_unique_and_monotonic() {
        let alloc = RequestIdAllocator::new();
        let mut seen = HashSet::new();
        let mut prev = 0u64;
        for _ in 0..10_000 {
            let id = alloc.next();
            assert!(seen.insert(id.clone()), "duplicate id {}", id);
            let n = u64::from_str_radix(id.as_str(), 32).unwrap();
            assert!(n > prev);
            prev = n;
        }
    }

    #[test]
    fn test_client_id_display() {
        let id = ClientId::from("edge-7");
        assert_eq!(id.to_string(), "edge-7");
        assert_eq!(id.as_str(), "edge-7");
    }
}
