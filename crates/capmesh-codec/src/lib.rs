//! # Capmesh Codec
//!
//! The byte-level contract of the mesh: fixed-layout wire frames and the
//! chunk fragmentation/reassembly the simulator uses to respect its
//! bandwidth ceiling.
//!
//! Two laws hold for arbitrary inputs and are enforced by the test suites:
//!
//! - `decode(encode(p)) == p`
//! - `reassemble(fragment(f, size)) == f` for any `size > 0`

pub mod chunk;
pub mod error;
pub mod frame;
pub mod wire;

pub use chunk::{CHUNK_HEADER_LEN, Chunk, Reassembler, fragment};
pub use error::{CodecError, CodecResult};
pub use frame::{FrameHeader, HEADER_LEN, decode, decode_header, encode};
pub use wire::{WireError, open_packet, seal_body, seal_frame};
