//! Core types and wire protocol for the burrow reverse tunnel.
//!
//! This crate provides the pieces shared between the tunnel server and
//! client: the frame codec spoken on the control channel and the identifier
//! types that correlate traffic across it.

pub mod frame;
pub mod id;

pub use frame::{ClientFrame, FrameError, ServerFrame, PING, PONG};
pub use id::{ClientId, RequestId, RequestIdAllocator};
