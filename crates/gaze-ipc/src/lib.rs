//! IPC between the Gaze verifier and the model daemon.
//!
//! The transport is a filesystem Unix stream socket carrying framed
//! messages: a big-endian u32 length followed by exactly that many payload
//! bytes. Payloads are bincode-encoded serde types — a data-only format,
//! chosen deliberately: this endpoint is reachable from the login path and
//! must never execute code on deserialization.
//!
//! Each connection carries exactly one request/response round and closes.

pub mod client;
pub mod proto;
pub mod wire;

pub use client::{ClientError, ModelClient};
pub use proto::{
    EncodingsPayload, Request, Response, ServiceErrorKind, ServiceStats, WireLuma, WireRgb,
};
pub use wire::{read_frame, write_frame, WireError, MAX_FRAME_BYTES};
