//! Chunk framing, fragmentation, and reassembly
//!
//! The simulator never moves more than `max_chunk_size_bytes` of payload at
//! once; larger frames are split into chunks and reassembled at the
//! destination endpoint. Chunk framing (big-endian, 20-byte header):
//!
//! ```text
//! packet_id(16) | chunk_index(2) | chunk_count(2) | chunk_bytes
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::CodecError;

/// Size of the chunk framing header.
pub const CHUNK_HEADER_LEN: usize = 16 + 2 + 2;

/// One fragment of an encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The frame this fragment belongs to
    pub packet_id: Uuid,
    /// Position within the frame, zero-based
    pub chunk_index: u16,
    /// Total fragments for this frame
    pub chunk_count: u16,
    /// Fragment payload
    pub bytes: Vec<u8>,
}

impl Chunk {
    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.bytes.len());
        out.put_slice(self.packet_id.as_bytes());
        out.put_u16(self.chunk_index);
        out.put_u16(self.chunk_count);
        out.put_slice(&self.bytes);
        out
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(CodecError::Truncated {
                expected: CHUNK_HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let mut id_bytes = [0u8; 16];
        buf.copy_to_slice(&mut id_bytes);
        let packet_id = Uuid::from_bytes(id_bytes);
        let chunk_index = buf.get_u16();
        let chunk_count = buf.get_u16();

        if chunk_index >= chunk_count {
            return Err(CodecError::ChunkIndexOutOfRange {
                index: chunk_index,
                count: chunk_count,
            });
        }

        Ok(Self {
            packet_id,
            chunk_index,
            chunk_count,
            bytes: buf.to_vec(),
        })
    }

    /// Total wire size of this chunk
    pub fn wire_size(&self) -> usize {
        CHUNK_HEADER_LEN + self.bytes.len()
    }
}

/// Split an encoded frame into chunks of at most `max_chunk_size` bytes
///
/// Produces `ceil(len / max_chunk_size)` chunks; a frame at or under the
/// limit yields a single chunk. Every transmission attempt re-fragments, so
/// chunk boundaries are a property of the attempt, not the frame.
pub fn fragment(
    packet_id: Uuid,
    frame: &[u8],
    max_chunk_size: usize,
) -> Result<Vec<Chunk>, CodecError> {
    if max_chunk_size == 0 {
        return Err(CodecError::ZeroChunkSize);
    }

    let chunk_count = frame.len().div_ceil(max_chunk_size).max(1);
    let chunk_count: u16 = chunk_count
        .try_into()
        .map_err(|_| CodecError::ChunkIndexOutOfRange {
            index: u16::MAX,
            count: u16::MAX,
        })?;

    Ok(frame
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(i, bytes)| Chunk {
            packet_id,
            chunk_index: i as u16,
            chunk_count,
            bytes: bytes.to_vec(),
        })
        .collect())
}

/// A frame under reassembly
#[derive(Debug)]
struct PendingFrame {
    chunk_count: u16,
    received: BTreeMap<u16, Vec<u8>>,
    started_at: Instant,
}

/// Reassembles chunks into frames at a receiving endpoint
///
/// Buffers are keyed by `packet_id`. A frame is emitted exactly when all
/// `chunk_count` distinct indices are present; buffers that sit incomplete
/// past the configured timeout are silently discarded (no ACK, no NAK).
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<Uuid, PendingFrame>,
    timeout: Duration,
}

impl Reassembler {
    /// Create a reassembler with the given buffer timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Offer a chunk; returns the reassembled frame when it completes
    ///
    /// Duplicate indices (from overlapping retransmission attempts) are
    /// accepted idempotently. A chunk whose declared count disagrees with
    /// the buffer's is rejected.
    pub fn offer(&mut self, chunk: Chunk) -> Result<Option<Vec<u8>>, CodecError> {
        let packet_id = chunk.packet_id;
        let declared_count = chunk.chunk_count;

        let complete = {
            let entry = self.pending.entry(packet_id).or_insert_with(|| PendingFrame {
                chunk_count: declared_count,
                received: BTreeMap::new(),
                started_at: Instant::now(),
            });

            if entry.chunk_count != declared_count {
                return Err(CodecError::ChunkCountMismatch(
                    packet_id,
                    entry.chunk_count,
                    declared_count,
                ));
            }

            entry.received.insert(chunk.chunk_index, chunk.bytes);
            trace!(
                packet = %packet_id,
                have = entry.received.len(),
                want = entry.chunk_count,
                "Buffered chunk"
            );
            entry.received.len() == entry.chunk_count as usize
        };

        if complete {
            let frame = self
                .pending
                .remove(&packet_id)
                .map(|p| p.received.into_values().flatten().collect())
                .unwrap_or_default();
            return Ok(Some(frame));
        }

        Ok(None)
    }

    /// Discard buffers that have sat incomplete past the timeout
    ///
    /// Returns the packet ids whose buffers were dropped.
    pub fn sweep(&mut self) -> Vec<Uuid> {
        let timeout = self.timeout;
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.started_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.pending.remove(id);
            warn!(packet = %id, "Discarded incomplete reassembly buffer");
        }

        expired
    }

    /// Number of frames currently buffered
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Adjust the buffer timeout (applies from the next sweep)
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_encode_decode_roundtrip() {
        let chunk = Chunk {
            packet_id: Uuid::new_v4(),
            chunk_index: 2,
            chunk_count: 5,
            bytes: b"fragment body".to_vec(),
        };

        let wire = chunk.encode();
        assert_eq!(wire.len(), CHUNK_HEADER_LEN + 13);
        assert_eq!(Chunk::decode(&wire).unwrap(), chunk);
    }

    #[test]
    fn test_decode_rejects_bad_index() {
        let chunk = Chunk {
            packet_id: Uuid::new_v4(),
            chunk_index: 5,
            chunk_count: 5,
            bytes: vec![],
        };
        // Encode does not validate; decode must.
        assert!(matches!(
            Chunk::decode(&chunk.encode()),
            Err(CodecError::ChunkIndexOutOfRange { index: 5, count: 5 })
        ));
    }

    #[test]
    fn test_fragment_counts() {
        let id = Uuid::new_v4();
        let frame = make_test_frame(2500);

        let chunks = fragment(id, &frame, 800).unwrap();
        assert_eq!(chunks.len(), 4); // ceil(2500 / 800)
        assert!(chunks.iter().all(|c| c.chunk_count == 4));
        assert!(chunks.iter().all(|c| c.bytes.len() <= 800));

        let single = fragment(id, &make_test_frame(100), 800).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_fragment_zero_chunk_size() {
        let result = fragment(Uuid::new_v4(), b"data", 0);
        assert_eq!(result, Err(CodecError::ZeroChunkSize));
    }

    #[test]
    fn test_reassemble_in_order() {
        let id = Uuid::new_v4();
        let frame = make_test_frame(1000);
        let chunks = fragment(id, &frame, 300).unwrap();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let mut result = None;
        for chunk in chunks {
            result = reassembler.offer(chunk).unwrap();
        }
        assert_eq!(result.unwrap(), frame);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let id = Uuid::new_v4();
        let frame = make_test_frame(1000);
        let mut chunks = fragment(id, &frame, 256).unwrap();
        chunks.reverse();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let mut result = None;
        for chunk in chunks {
            result = reassembler.offer(chunk).unwrap();
        }
        assert_eq!(result.unwrap(), frame);
    }

    #[test]
    fn test_duplicate_chunks_are_idempotent() {
        let id = Uuid::new_v4();
        let frame = make_test_frame(600);
        let chunks = fragment(id, &frame, 200).unwrap();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert!(reassembler.offer(chunks[0].clone()).unwrap().is_none());
        assert!(reassembler.offer(chunks[0].clone()).unwrap().is_none());
        assert!(reassembler.offer(chunks[1].clone()).unwrap().is_none());
        let result = reassembler.offer(chunks[2].clone()).unwrap();
        assert_eq!(result.unwrap(), frame);
    }

    #[test]
    fn test_incomplete_buffer_swept_after_timeout() {
        let id = Uuid::new_v4();
        let chunks = fragment(id, &make_test_frame(600), 200).unwrap();

        let mut reassembler = Reassembler::new(Duration::from_millis(0));
        reassembler.offer(chunks[0].clone()).unwrap();
        assert_eq!(reassembler.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        let expired = reassembler.sweep();
        assert_eq!(expired, vec![id]);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let id = Uuid::new_v4();
        let mut reassembler = Reassembler::new(Duration::from_secs(5));

        let first = Chunk {
            packet_id: id,
            chunk_index: 0,
            chunk_count: 3,
            bytes: vec![1],
        };
        let liar = Chunk {
            packet_id: id,
            chunk_index: 1,
            chunk_count: 4,
            bytes: vec![2],
        };

        reassembler.offer(first).unwrap();
        assert!(matches!(
            reassembler.offer(liar),
            Err(CodecError::ChunkCountMismatch(_, 3, 4))
        ));
    }

    #[test]
    fn test_interleaved_frames() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let frame_a = make_test_frame(400);
        let frame_b = make_test_frame(500);

        let chunks_a = fragment(id_a, &frame_a, 200).unwrap();
        let chunks_b = fragment(id_b, &frame_b, 200).unwrap();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        assert!(reassembler.offer(chunks_a[0].clone()).unwrap().is_none());
        assert!(reassembler.offer(chunks_b[0].clone()).unwrap().is_none());
        assert!(reassembler.offer(chunks_b[1].clone()).unwrap().is_none());
        assert_eq!(
            reassembler.offer(chunks_a[1].clone()).unwrap().unwrap(),
            frame_a
        );
        assert_eq!(
            reassembler.offer(chunks_b[2].clone()).unwrap().unwrap(),
            frame_b
        );
    }
}
