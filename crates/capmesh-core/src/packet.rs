//! Packet model: the wire unit exchanged between hubs
//!
//! A [`Packet`] is the logical form of one wire frame: typed header fields
//! plus an AEAD-sealed payload. The plaintext payload bodies live in
//! [`PayloadBody`]; they are serialized to JSON, sealed under the per-peer
//! key, and only then handed to the codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::{KnowledgeCapsule, now_millis};
use crate::error::CapsuleError;
use crate::identity::NodeId;
use crate::manifest::Manifest;

/// Wire protocol version carried in every frame header.
pub const WIRE_VERSION: u8 = 1;

/// Length of the AEAD nonce carried in the header.
pub const NONCE_LEN: usize = 12;

/// Length of the AEAD authentication tag trailing the payload.
pub const TAG_LEN: usize = 16;

/// Discriminant for the frame payload, carried as the header type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// A question forwarded from a mini hub
    Query = 1,
    /// A signed capsule response
    Capsule = 2,
    /// Transport acknowledgment (reserved on the wire; reported via callbacks)
    Ack = 3,
    /// Transport negative acknowledgment (reserved; reported via callbacks)
    Nak = 4,
    /// A signed manifest broadcast
    Manifest = 5,
    /// Request for a specific capsule by id
    CapsuleRequest = 6,
}

impl PacketType {
    /// Decode from the header type byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PacketType::Query),
            2 => Some(PacketType::Capsule),
            3 => Some(PacketType::Ack),
            4 => Some(PacketType::Nak),
            5 => Some(PacketType::Manifest),
            6 => Some(PacketType::CapsuleRequest),
            _ => None,
        }
    }

    /// The header type byte
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Delivery priority, packed into the low two bits of the header flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    /// Can be delayed
    Low,
    /// Default
    #[default]
    Normal,
    /// Deliver ahead of normal traffic
    High,
    /// Never delay
    Critical,
}

impl Priority {
    /// Decode from the flags byte
    pub fn from_flags(flags: u8) -> Self {
        match flags & 0b11 {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }

    /// Encode into the low bits of a flags byte
    pub fn to_flags(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Logical form of a wire frame
///
/// `ciphertext` holds the AEAD output including the trailing 16-byte tag;
/// the codec splits the tag out when laying down header bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Unique identifier, reused verbatim across retransmissions
    pub packet_id: Uuid,
    /// Payload discriminant
    pub packet_type: PacketType,
    /// Delivery priority
    pub priority: Priority,
    /// Sending node
    pub src: NodeId,
    /// Destination node
    pub dst: NodeId,
    /// AEAD nonce for this frame
    pub nonce: [u8; NONCE_LEN],
    /// Sealed payload, tag appended
    pub ciphertext: Vec<u8>,
}

impl Packet {
    /// Construct a packet around a sealed payload
    pub fn new(
        packet_type: PacketType,
        src: NodeId,
        dst: NodeId,
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            packet_id: Uuid::new_v4(),
            packet_type,
            priority: Priority::Normal,
            src,
            dst,
            nonce,
            ciphertext,
        }
    }

    /// Override the generated packet id (used when re-encoding replies)
    pub fn with_packet_id(mut self, packet_id: Uuid) -> Self {
        self.packet_id = packet_id;
        self
    }

    /// Set the delivery priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Plaintext payload bodies, JSON-serialized before sealing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadBody {
    /// A forwarded question
    Query(QueryPayload),
    /// A signed capsule response
    Capsule(CapsulePayload),
    /// A signed manifest broadcast
    Manifest(ManifestPayload),
    /// Request for one capsule by id
    CapsuleRequest(CapsuleRequestPayload),
}

impl PayloadBody {
    /// The packet type this body must travel under
    pub fn packet_type(&self) -> PacketType {
        match self {
            PayloadBody::Query(_) => PacketType::Query,
            PayloadBody::Capsule(_) => PacketType::Capsule,
            PayloadBody::Manifest(_) => PacketType::Manifest,
            PayloadBody::CapsuleRequest(_) => PacketType::CapsuleRequest,
        }
    }

    /// Serialize to plaintext bytes for sealing
    pub fn to_bytes(&self) -> Result<Vec<u8>, CapsuleError> {
        serde_json::to_vec(self).map_err(|e| CapsuleError::Canonical(e.to_string()))
    }

    /// Deserialize from opened plaintext bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CapsuleError> {
        serde_json::from_slice(bytes).map_err(|e| CapsuleError::Canonical(e.to_string()))
    }
}

/// A question on its way to the authoritative hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    /// Identifier of the asking user
    pub user_id: String,
    /// The question, verbatim
    pub question: String,
    /// Where the capsule response should be addressed
    pub reply_to: NodeId,
    /// Optional capsule the asker believes may already answer this
    pub hint_id: Option<Uuid>,
    /// When the question was submitted
    pub asked_at: DateTime<Utc>,
}

impl QueryPayload {
    /// Build a query payload stamped with the current time
    pub fn new(user_id: &str, question: &str, reply_to: NodeId) -> Self {
        Self {
            user_id: user_id.to_string(),
            question: question.to_string(),
            reply_to,
            hint_id: None,
            asked_at: now_millis(),
        }
    }

    /// Attach a cache hint
    pub fn with_hint(mut self, hint_id: Uuid) -> Self {
        self.hint_id = Some(hint_id);
        self
    }
}

/// A capsule response, fresh or replayed from the dedup window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsulePayload {
    /// The signed capsule
    pub capsule: KnowledgeCapsule,
    /// Generator confidence in the bound answer
    pub confidence: f32,
    /// Machine-readable failure code on ERROR capsules
    pub error_code: Option<String>,
}

impl CapsulePayload {
    /// Wrap a capsule for transmission
    pub fn new(capsule: KnowledgeCapsule, confidence: f32) -> Self {
        Self {
            capsule,
            confidence,
            error_code: None,
        }
    }

    /// Wrap an ERROR capsule with its failure code
    pub fn error(capsule: KnowledgeCapsule, error_code: &str) -> Self {
        Self {
            capsule,
            confidence: 0.0,
            error_code: Some(error_code.to_string()),
        }
    }
}

/// A manifest broadcast body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    /// The signed manifest
    pub manifest: Manifest,
}

/// Request for one capsule, issued during selective sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleRequestPayload {
    /// The capsule being fetched
    pub capsule_id: Uuid,
    /// Where the capsule should be sent
    pub reply_to: NodeId,
}
