#![no_main]

use bytes::Buf;
use dechunkrs::{ChunkProgress, ChunkReader, ConduitConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the feed size, the rest is the wire
    let Some((&step, wire)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);

    let mut reader = ChunkReader::new(&ConduitConfig::default());

    for mut piece in wire.chunks(step) {
        while piece.has_remaining() {
            match reader.read_chunk(&mut piece) {
                Ok(ChunkProgress::ChunkAvailable(n)) => {
                    // Verify: chunk_remaining mirrors the pending size
                    assert_eq!(reader.chunk_remaining(), i64::try_from(n).unwrap());
                    let take = n.min(piece.remaining() as u64);
                    piece.advance(take as usize);
                    reader.set_chunk_remaining(n - take);
                }
                Ok(ChunkProgress::NeedMoreInput) => assert!(!piece.has_remaining()),
                Ok(ChunkProgress::StreamComplete) => {
                    // Verify: trailers are published with completion
                    assert!(reader.is_finished());
                    assert!(reader.trailers().get().is_some());
                    assert_eq!(reader.chunk_remaining(), -1);
                    return;
                }
                Err(_) => return,
            }
        }
    }

    assert!(!reader.is_finished());
    assert!(reader.trailers().get().is_none());
});
