#![no_main]

use dechunkrs::{
    BufferPool, ChunkedSourceConduit, ConduitConfig, IoSource, PushBackSource, ReadStatus,
    SharedExchange,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Two leading bytes pick the destination size and the entity limit
    let [dst_len, limit, wire @ ..] = data else {
        return;
    };
    let dst_len = usize::from(*dst_len).max(1);
    let limit = i64::from(*limit);

    let config = ConduitConfig::default().with_buffer_size(64);
    let pool = BufferPool::new(&config);
    let exchange = SharedExchange::new(limit);
    let mut conduit =
        ChunkedSourceConduit::new(PushBackSource::new(IoSource::new(wire)), pool.clone(), &config)
            .with_exchange(exchange.clone());

    let mut dst = vec![0u8; dst_len];
    let mut delivered = 0i64;
    loop {
        match conduit.read(&mut dst) {
            Ok(ReadStatus::Data(n)) => {
                assert!(n > 0 && n <= dst_len);
                delivered += n as i64;
            }
            // Verify: a slice upstream never blocks, so neither does the conduit
            Ok(ReadStatus::WouldBlock) => panic!("WouldBlock from a non-blocking upstream"),
            Ok(ReadStatus::Eof) => {
                // Verify: EOF is idempotent and only reached within the limit
                assert!(conduit.is_finished());
                assert!(limit == 0 || delivered <= limit);
                assert!(conduit.read(&mut dst).unwrap().is_eof());
                break;
            }
            Err(_) => {
                if conduit.is_closed() {
                    assert!(!exchange.is_persistent());
                    assert!(conduit.read(&mut dst).is_err());
                }
                break;
            }
        }
    }

    // Verify: every raw buffer comes back once the source is gone
    drop(conduit);
    assert_eq!(pool.stats().outstanding, 0);
});
