//! Fixed-layout wire frames
//!
//! Header layout (big-endian, 68 bytes):
//!
//! ```text
//! version(1) | type(1) | flags(1) | reserved(1) | packet_id(16)
//! | src_id(16) | dst_id(16) | nonce(12) | payload_len(4)
//! ```
//!
//! followed by `payload_len` bytes of AEAD ciphertext and a 16-byte auth
//! tag. `payload_len` excludes the tag.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use capmesh_core::{
    NODE_ID_LEN, NONCE_LEN, NodeId, Packet, PacketType, Priority, TAG_LEN, WIRE_VERSION,
};

use crate::error::CodecError;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4 + 16 + NODE_ID_LEN * 2 + NONCE_LEN + 4;

/// Decoded header fields, available without touching the payload
///
/// The simulator uses this to learn `packet_id` and addressing for chunk
/// bookkeeping without ever holding the plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Wire protocol version
    pub version: u8,
    /// Payload discriminant
    pub packet_type: PacketType,
    /// Delivery priority from the flags byte
    pub priority: Priority,
    /// Packet identifier
    pub packet_id: Uuid,
    /// Sending node
    pub src: NodeId,
    /// Destination node
    pub dst: NodeId,
    /// Ciphertext length excluding the tag
    pub payload_len: usize,
}

/// Encode a packet into wire bytes
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    if packet.ciphertext.len() < TAG_LEN {
        return Err(CodecError::Truncated {
            expected: TAG_LEN,
            actual: packet.ciphertext.len(),
        });
    }
    let payload_len = packet.ciphertext.len() - TAG_LEN;

    let mut out = Vec::with_capacity(HEADER_LEN + packet.ciphertext.len());
    out.put_u8(WIRE_VERSION);
    out.put_u8(packet.packet_type.as_byte());
    out.put_u8(packet.priority.to_flags());
    out.put_u8(0); // reserved
    out.put_slice(packet.packet_id.as_bytes());
    out.put_slice(packet.src.as_bytes());
    out.put_slice(packet.dst.as_bytes());
    out.put_slice(&packet.nonce);
    out.put_u32(payload_len as u32);
    out.put_slice(&packet.ciphertext[..payload_len]);
    out.put_slice(&packet.ciphertext[payload_len..]);
    Ok(out)
}

/// Decode just the header of a wire frame
pub fn decode_header(frame: &[u8]) -> Result<FrameHeader, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }

    let mut buf = frame;
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let type_byte = buf.get_u8();
    let packet_type =
        PacketType::from_byte(type_byte).ok_or(CodecError::UnknownPacketType(type_byte))?;
    let priority = Priority::from_flags(buf.get_u8());
    let _reserved = buf.get_u8();

    let mut id_bytes = [0u8; 16];
    buf.copy_to_slice(&mut id_bytes);
    let packet_id = Uuid::from_bytes(id_bytes);

    let mut node_bytes = [0u8; NODE_ID_LEN];
    buf.copy_to_slice(&mut node_bytes);
    let src = NodeId::from_bytes(&node_bytes).map_err(|_| CodecError::Truncated {
        expected: NODE_ID_LEN,
        actual: 0,
    })?;
    buf.copy_to_slice(&mut node_bytes);
    let dst = NodeId::from_bytes(&node_bytes).map_err(|_| CodecError::Truncated {
        expected: NODE_ID_LEN,
        actual: 0,
    })?;

    let mut nonce = [0u8; NONCE_LEN];
    buf.copy_to_slice(&mut nonce);
    let payload_len = buf.get_u32() as usize;

    Ok(FrameHeader {
        version,
        packet_type,
        priority,
        packet_id,
        src,
        dst,
        payload_len,
    })
}

/// Decode a full wire frame back into a packet
pub fn decode(frame: &[u8]) -> Result<Packet, CodecError> {
    let header = decode_header(frame)?;

    let expected = HEADER_LEN + header.payload_len + TAG_LEN;
    if frame.len() != expected {
        return Err(CodecError::LengthMismatch {
            declared: expected,
            actual: frame.len(),
        });
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&frame[HEADER_LEN - 4 - NONCE_LEN..HEADER_LEN - 4]);

    Ok(Packet {
        packet_id: header.packet_id,
        packet_type: header.packet_type,
        priority: header.priority,
        src: header.src,
        dst: header.dst,
        nonce,
        ciphertext: frame[HEADER_LEN..].to_vec(),
    })
}
