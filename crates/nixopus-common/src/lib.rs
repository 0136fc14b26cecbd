//! Shared wire types for the Nixopus live-dev sync protocol.
//!
//! Both halves of the protocol depend on this crate: the CLI side
//! (`nixopus::sync`) produces [`SyncMessage`] frames and the server side
//! (`nixopus::deploy::ingest`) consumes them.

pub mod protocol;

pub use protocol::{
    AckPayload, CHUNK_SIZE, ErrorPayload, FileChangePayload, FileContentPayload,
    FileDeletePayload, FileOperation, MAX_MESSAGE_SIZE, MessageType, Payload, ProtocolError,
    SyncMessage, SyncPayload, SyncPhase, checksum, chunk_count, normalize_relative_path,
};
