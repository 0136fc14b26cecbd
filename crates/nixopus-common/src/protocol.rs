use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum bytes of file data carried by a single `file_content` frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum size of one encoded frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

// ── Envelope ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    FileChange,
    FileContent,
    FileDelete,
    Sync,
    Ack,
    Error,
    Ping,
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileChange => "file_change",
            Self::FileContent => "file_content",
            Self::FileDelete => "file_delete",
            Self::Sync => "sync",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical frame: `{ "type", "timestamp", "payload" }`.
///
/// The `type` field on the wire is derived from the payload variant, so a
/// message can never disagree with itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct SyncMessage {
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    FileChange(FileChangePayload),
    FileContent(FileContentPayload),
    FileDelete(FileDeletePayload),
    Sync(SyncPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Ping,
    Pong,
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::FileChange(_) => MessageType::FileChange,
            Self::FileContent(_) => MessageType::FileContent,
            Self::FileDelete(_) => MessageType::FileDelete,
            Self::Sync(_) => MessageType::Sync,
            Self::Ack(_) => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    /// Relative path the frame refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::FileChange(p) => Some(&p.path),
            Self::FileContent(p) => Some(&p.path),
            Self::FileDelete(p) => Some(&p.path),
            Self::Ack(p) => Some(&p.path),
            Self::Error(p) => p.path.as_deref(),
            Self::Sync(_) | Self::Ping | Self::Pong => None,
        }
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl TryFrom<RawMessage> for SyncMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let payload = match raw.kind {
            MessageType::FileChange => Payload::FileChange(serde_json::from_value(raw.payload)?),
            MessageType::FileContent => Payload::FileContent(serde_json::from_value(raw.payload)?),
            MessageType::FileDelete => Payload::FileDelete(serde_json::from_value(raw.payload)?),
            MessageType::Sync => Payload::Sync(serde_json::from_value(raw.payload)?),
            MessageType::Ack => Payload::Ack(serde_json::from_value(raw.payload)?),
            MessageType::Error => Payload::Error(serde_json::from_value(raw.payload)?),
            MessageType::Ping => Payload::Ping,
            MessageType::Pong => Payload::Pong,
        };
        Ok(Self {
            timestamp: raw.timestamp,
            payload,
        })
    }
}

/// Outgoing envelope; the payload is serialized in place so its errors
/// surface through the serializer.
#[derive(Serialize)]
struct Envelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: MessageType,
    timestamp: &'a DateTime<Utc>,
    payload: P,
}

#[derive(Serialize)]
struct Empty {}

impl Serialize for SyncMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let kind = self.kind();
        let timestamp = &self.timestamp;
        match &self.payload {
            Payload::FileChange(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::FileContent(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::FileDelete(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::Sync(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::Ack(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::Error(payload) => Envelope { kind, timestamp, payload }.serialize(serializer),
            Payload::Ping | Payload::Pong => Envelope {
                kind,
                timestamp,
                payload: Empty {},
            }
            .serialize(serializer),
        }
    }
}

impl SyncMessage {
    pub fn new(payload: Payload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(Payload::Ping)
    }

    pub fn pong() -> Self {
        Self::new(Payload::Pong)
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)?;
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: json.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(json)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangePayload {
    pub path: String,
    pub operation: FileOperation,
    pub size: u64,
    /// Hex-encoded sha-256 of the whole file.
    pub checksum: String,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContentPayload {
    pub path: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Checksum of the whole file, not of this chunk.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeletePayload {
    pub path: String,
    pub operation: FileOperation,
}

impl FileDeletePayload {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            operation: FileOperation::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Start,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub phase: SyncPhase,
    #[serde(default)]
    pub total_files: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Hex sha-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Number of `file_content` frames needed for a file of `size` bytes.
/// A zero-byte file still produces one (empty) chunk.
pub fn chunk_count(size: usize) -> u32 {
    if size == 0 {
        1
    } else {
        size.div_ceil(CHUNK_SIZE) as u32
    }
}

/// Normalise a relative path to forward slashes without a leading `./`.
pub fn normalize_relative_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let trimmed = replaced.trim_start_matches("./").trim_start_matches('/');
    trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
