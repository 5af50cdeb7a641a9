//! Wire protocol for the control channel.
//!
//! Every binary message on the control channel carries exactly one frame,
//! encoded as a MessagePack map with a `type` discriminator. Connection-level
//! liveness uses the out-of-band text messages [`PING`] and [`PONG`] and
//! never touches the binary codec.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::id::RequestId;

/// Text message a peer sends to probe liveness.
pub const PING: &str = "ping";
/// Text message answering a [`PING`].
pub const PONG: &str = "pong";

/// Codec errors.
///
/// Decode failures are benign protocol skew: callers drop the message and
/// carry on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Frames flowing server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Start of a proxied request. `eof` is true when no body follows.
    #[serde(rename_all = "camelCase")]
    Header {
        request_id: RequestId,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        eof: bool,
    },
    /// One request body chunk; a final chunk carries `eof = true`.
    #[serde(rename_all = "camelCase")]
    Body {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ByteBuf>,
        eof: bool,
    },
    /// A whole request with its body inline (buffered mode).
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: RequestId,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<ByteBuf>,
    },
    /// The public caller went away; the client may cancel its local request.
    #[serde(rename_all = "camelCase")]
    Abort { request_id: RequestId },
}

impl ServerFrame {
    pub fn request_id(&self) -> &RequestId {
        match self {
            ServerFrame::Header { request_id, .. }
            | ServerFrame::Body { request_id, .. }
            | ServerFrame::Request { request_id, .. }
            | ServerFrame::Abort { request_id } => request_id,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Frames flowing client → server.
///
/// The `header`/`body` tags are shared with [`ServerFrame`]; direction
/// disambiguates which variant a reader expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Response status line and headers. `eof` is true for bodyless responses.
    #[serde(rename_all = "camelCase")]
    Header {
        request_id: RequestId,
        status: u16,
        status_text: String,
        headers: Vec<(String, String)>,
        eof: bool,
    },
    /// One response body chunk; a final chunk carries `eof = true`.
    #[serde(rename_all = "camelCase")]
    Body {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ByteBuf>,
        eof: bool,
    },
}

impl ClientFrame {
    pub fn request_id(&self) -> &RequestId {
        match self {
            ClientFrame::Header { request_id, .. } | ClientFrame::Body { request_id, .. } => {
                request_id
            }
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RequestId {
        RequestId::from(s)
    }

    #[test]
    fn test_request_header_round_trip() {
        let frame = ServerFrame::Header {
            request_id: rid("1f"),
            method: "POST".to_string(),
            path: "/api/items?page=2".to_string(),
            headers: vec![
                ("host".to_string(), "tunnel.example.com".to_string()),
                ("x-forwarded-for".to_string(), "1.2.3.4".to_string()),
            ],
            eof: false,
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(ServerFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_body_round_trip_with_and_without_data() {
        let chunk = ServerFrame::Body {
            request_id: rid("2g"),
            data: Some(ByteBuf::from(b"hello".to_vec())),
            eof: false,
        };
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(ServerFrame::from_bytes(&bytes).unwrap(), chunk);

        let terminal = ServerFrame::Body {
            request_id: rid("2g"),
            data: None,
            eof: true,
        };
        let bytes = terminal.to_bytes().unwrap();
        assert_eq!(ServerFrame::from_bytes(&bytes).unwrap(), terminal);
    }

    #[test]
    fn test_buffered_request_round_trip() {
        let frame = ServerFrame::Request {
            request_id: rid("a0"),
            method: "PUT".to_string(),
            path: "/upload".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Some(ByteBuf::from(b"ABCD".to_vec())),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(ServerFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_abort_round_trip() {
        let frame = ServerFrame::Abort {
            request_id: rid("zz"),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(ServerFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_response_frames_round_trip() {
        let header = ClientFrame::Header {
            request_id: rid("1f"),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            eof: false,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(ClientFrame::from_bytes(&bytes).unwrap(), header);

        let body = ClientFrame::Body {
            request_id: rid("1f"),
            data: Some(ByteBuf::from(b"hi".to_vec())),
            eof: true,
        };
        let bytes = body.to_bytes().unwrap();
        assert_eq!(ClientFrame::from_bytes(&bytes).unwrap(), body);
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        // A map without a `type` field is not a frame.
        let mut buf = Vec::new();
        rmp_serde::encode::write_named(
            &mut buf,
            &std::collections::BTreeMap::from([("requestId", "1f")]),
        )
        .unwrap();
        assert!(ServerFrame::from_bytes(&buf).is_err());
        assert!(ClientFrame::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_request_id() {
        let mut buf = Vec::new();
        rmp_serde::encode::write_named(
            &mut buf,
            &std::collections::BTreeMap::from([("type", "abort")]),
        )
        .unwrap();
        assert!(ServerFrame::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_non_string_request_id() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Bogus {
            r#type: &'static str,
            request_id: u32,
        }
        let buf = rmp_serde::to_vec_named(&Bogus {
            r#type: "abort",
            request_id: 7,
        })
        .unwrap();
        assert!(ServerFrame::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ServerFrame::from_bytes(&[0xc1, 0x00, 0xff]).is_err());
        assert!(ClientFrame::from_bytes(b"not msgpack").is_err());
    }
}
