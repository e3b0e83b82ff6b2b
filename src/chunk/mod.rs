//! Chunked framing.
//!
//! - [`ChunkReader`] - resumable chunk-size / trailer state machine
//! - [`Trailers`] / [`TrailerSlot`] - trailer fields and their write-once sink

mod reader;
mod trailers;

pub use reader::{ChunkProgress, ChunkReader, ChunkState, Completion, FinishListener};
pub use trailers::{TrailerSlot, Trailers};
