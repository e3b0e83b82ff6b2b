//! Decodes a chunked body stored in a file.
//!
//! Run with:
//!     cargo run --example decode_file -- /path/to/body.chunked [max-entity-size]

use std::env;
use std::fs::File;
use std::io::{self, Write};

use dechunkrs::{
    BufferPool, ChunkedSourceConduit, ConduitConfig, IoSource, PushBackSource, ReadStatus,
    SharedExchange,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().ok_or("usage: decode_file <path> [max-entity-size]")?;
    let limit: i64 = args.next().map(|s| s.parse::<i64>()).transpose()?.unwrap_or(0);

    let config = ConduitConfig::new(
        4 * 1024, // raw buffer: 4 KiB
        16,       // idle buffers kept
    )?
    .with_max_entity_size(limit);

    let exchange = SharedExchange::from_config(&config);
    let mut conduit = ChunkedSourceConduit::new(
        PushBackSource::new(IoSource::new(File::open(&path)?)),
        BufferPool::new(&config),
        &config,
    )
    .with_exchange(exchange.clone());

    let mut out = io::stdout().lock();
    let mut buf = [0u8; 8 * 1024];
    let mut total = 0;
    loop {
        match conduit.read(&mut buf)? {
            ReadStatus::Data(n) => {
                out.write_all(&buf[..n])?;
                total += n;
            }
            // Files never block
            ReadStatus::WouldBlock => {}
            ReadStatus::Eof => break,
        }
    }
    out.flush()?;

    eprintln!("\nDecoded {total} payload bytes");
    if let Some(trailers) = conduit.trailers().get() {
        for (name, value) in trailers.iter() {
            eprintln!("trailer {name}: {value}");
        }
    }
    eprintln!("Connection persistent: {}", exchange.is_persistent());
    eprintln!("Pool: {:?}", conduit.pool().stats());

    Ok(())
}
