//! Network protocol message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! Document updates travel as opaque [`Blob`]s; this crate never looks
//! inside them.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::frame::MAX_FRAME_SIZE;

/// Room left in a frame for the JSON around a single blob
const ENVELOPE_OVERHEAD: usize = 64;

/// Opaque bytes, carried as base64 inside JSON frames
#[derive(Clone, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size on the wire once base64-encoded
    pub fn encoded_len(&self) -> usize {
        self.0.len().div_ceil(3) * 4
    }

    /// Whether a message carrying just this blob fits in one frame
    pub fn fits_frame(&self) -> bool {
        self.encoded_len() + ENVELOPE_OVERHEAD <= MAX_FRAME_SIZE as usize
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map(Blob).map_err(serde::de::Error::custom)
    }
}

/// Information about a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub replica_id: Uuid,
    pub room: String,
}

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Dialer introduces itself
    Hello {
        room: String,
        replica_id: Uuid,
        secret: Option<String>,
    },
    /// Listener accepted the dialer
    Welcome {
        room: String,
        replica_id: Uuid,
        peers: Vec<PeerInfo>,
    },
    /// Listener refused the dialer
    Rejected { reason: String },
    /// A newly committed document update
    Update { blob: Blob },
    /// Ask for every update not covered by the encoded version
    SyncRequest { state: Blob },
    /// Answer to a sync request
    SyncBatch { blobs: Vec<Blob> },
    /// Peers currently connected to the listener
    PeerList { peers: Vec<PeerInfo> },
    PeerLeft { replica_id: Uuid },
    /// Listener liveness signal
    Heartbeat { timestamp: DateTime<Utc> },
    Ping,
    Pong,
    /// Graceful close
    Shutdown,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Split blobs into `SyncBatch` messages whose payload stays under
    /// `budget` bytes. A single blob larger than the budget gets a batch of
    /// its own. Always yields at least one message so an empty answer is
    /// still an answer.
    pub fn sync_batches(blobs: Vec<Blob>, budget: usize) -> Vec<Message> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut size = 0usize;

        for blob in blobs {
            let len = blob.encoded_len() + 3;
            if !current.is_empty() && size + len > budget {
                batches.push(Message::SyncBatch {
                    blobs: std::mem::take(&mut current),
                });
                size = 0;
            }
            size += len;
            current.push(blob);
        }

        if !current.is_empty() || batches.is_empty() {
            batches.push(Message::SyncBatch { blobs: current });
        }
        batches
    }
}
