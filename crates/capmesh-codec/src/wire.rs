//! Sealed-frame construction and opening
//!
//! The one path from a plaintext payload body to wire bytes and back:
//! serialize, seal under the per-peer key, wrap in a packet, encode. Both
//! hub roles and the gossip workers go through these helpers so the type
//! byte and the payload body can never disagree.

use thiserror::Error;

use capmesh_core::{CapsuleError, NodeId, Packet, PayloadBody};
use capmesh_crypto::{CryptoError, PayloadKey, Sealed, open, seal};

use crate::error::CodecError;
use crate::frame;

/// Errors on the seal/encode or decode/open path
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Payload error: {0}")]
    Payload(#[from] CapsuleError),

    #[error("Header type {header:?} disagrees with payload body {body:?}")]
    TypeMismatch {
        header: capmesh_core::PacketType,
        body: capmesh_core::PacketType,
    },
}

/// Seal a payload body into a packet addressed `src -> dst`
pub fn seal_body(
    body: &PayloadBody,
    src: NodeId,
    dst: NodeId,
    key: &PayloadKey,
) -> Result<Packet, WireError> {
    let plaintext = body.to_bytes()?;
    let sealed = seal(key, &plaintext)?;
    Ok(Packet::new(
        body.packet_type(),
        src,
        dst,
        sealed.nonce,
        sealed.ciphertext,
    ))
}

/// Seal a payload body and encode it to wire bytes in one step
pub fn seal_frame(
    body: &PayloadBody,
    src: NodeId,
    dst: NodeId,
    key: &PayloadKey,
) -> Result<(Packet, Vec<u8>), WireError> {
    let packet = seal_body(body, src, dst, key)?;
    let bytes = frame::encode(&packet)?;
    Ok((packet, bytes))
}

/// Open a packet's payload and parse the body
///
/// Rejects frames whose header type byte disagrees with the decrypted
/// body's variant.
pub fn open_packet(packet: &Packet, key: &PayloadKey) -> Result<PayloadBody, WireError> {
    let sealed = Sealed {
        nonce: packet.nonce,
        ciphertext: packet.ciphertext.clone(),
    };
    let plaintext = open(key, &sealed)?;
    let body = PayloadBody::from_bytes(&plaintext)?;

    if body.packet_type() != packet.packet_type {
        return Err(WireError::TypeMismatch {
            header: packet.packet_type,
            body: body.packet_type(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::{PacketType, QueryPayload};

    #[test]
    fn test_seal_open_roundtrip() {
        let key = PayloadKey::generate();
        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let body = PayloadBody::Query(QueryPayload::new("u1", "Define entropy", mini));

        let (packet, bytes) = seal_frame(&body, mini, main, &key).unwrap();
        assert_eq!(packet.packet_type, PacketType::Query);

        let decoded = frame::decode(&bytes).unwrap();
        let opened = open_packet(&decoded, &key).unwrap();
        assert_eq!(opened, body);
    }

    #[test]
    fn test_wrong_key_fails_open() {
        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let body = PayloadBody::Query(QueryPayload::new("u1", "Define entropy", mini));

        let (packet, _) = seal_frame(&body, mini, main, &PayloadKey::generate()).unwrap();
        let result = open_packet(&packet, &PayloadKey::generate());
        assert!(matches!(
            result,
            Err(WireError::Crypto(CryptoError::DecryptFailed))
        ));
    }

    #[test]
    fn test_type_byte_must_match_body() {
        let key = PayloadKey::generate();
        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let body = PayloadBody::Query(QueryPayload::new("u1", "Define entropy", mini));

        let (mut packet, _) = seal_frame(&body, mini, main, &key).unwrap();
        packet.packet_type = PacketType::Capsule;

        assert!(matches!(
            open_packet(&packet, &key),
            Err(WireError::TypeMismatch { .. })
        ));
    }
}
