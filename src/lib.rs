//! dechunkrs
//!
//! Non-blocking HTTP/1.1 chunked transfer-coding decoding for Rust.
//!
//! `dechunkrs` sits between a non-blocking byte source and the consumer of a
//! request body. It strips chunk-size lines, extensions, CRLFs and the
//! trailer section so the consumer sees payload bytes only. It is built for:
//!
//! - request bodies sent with `Transfer-Encoding: chunked`
//! - event-driven servers reading from non-blocking sockets
//! - hard limits on body size
//!
//! The crate intentionally:
//! - does NOT parse request lines or headers
//! - does NOT own sockets or schedule reads
//! - does NOT block, ever
//!
//! It only does one thing: **Raw bytes → payload & trailers**
//!
//! Raw reads go through pooled buffers. Bytes that were read but not consumed
//! are pushed back upstream in a reference-counted handle
//! ([`RefCountedPooled`]), so a buffer can be viewed by one holder and pushed
//! back by another while returning to the pool exactly once.
//!
//! # Decoding
//!
//! ```
//! use dechunkrs::{
//!     BufferPool, ChunkedSourceConduit, ConduitConfig, ConduitError, IoSource, PushBackSource,
//!     ReadStatus,
//! };
//!
//! fn main() -> Result<(), ConduitError> {
//!     let wire = &b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n"[..];
//!     let config = ConduitConfig::default();
//!     let mut conduit = ChunkedSourceConduit::new(
//!         PushBackSource::new(IoSource::new(wire)),
//!         BufferPool::new(&config),
//!         &config,
//!     );
//!
//!     let mut body = Vec::new();
//!     let mut buf = [0u8; 1024];
//!     loop {
//!         match conduit.read(&mut buf)? {
//!             ReadStatus::Data(n) => body.extend_from_slice(&buf[..n]),
//!             ReadStatus::WouldBlock => continue, // wait for readability here
//!             ReadStatus::Eof => break,
//!         }
//!     }
//!
//!     assert_eq!(body, b"Wikipedia");
//!     let trailers = conduit.trailers().get().expect("finished");
//!     assert_eq!(trailers.get("expires"), Some("never"));
//!     Ok(())
//! }
//! ```
//!
//! # Entity size limit
//!
//! ```
//! use dechunkrs::{
//!     BufferPool, ChunkedSourceConduit, ConduitConfig, ConduitError, IoSource, PushBackSource,
//!     SharedExchange,
//! };
//!
//! let wire = &b"a\r\n0123456789\r\n0\r\n\r\n"[..];
//! let config = ConduitConfig::default();
//! let exchange = SharedExchange::new(5);
//! let mut conduit = ChunkedSourceConduit::new(
//!     PushBackSource::new(IoSource::new(wire)),
//!     BufferPool::new(&config),
//!     &config,
//! )
//! .with_exchange(exchange.clone());
//!
//! let err = conduit.read(&mut [0u8; 64]).unwrap_err();
//! assert!(matches!(err, ConduitError::EntityTooLarge { limit: 5 }));
//! assert!(!exchange.is_persistent());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod buffer;
mod chunk;
mod conduit;
mod config;
mod error;

//
// Public surface (intentionally tiny)
//

pub use buffer::{
    BufferPool, BufferSlice, PoolStats, Pooled, PooledBuffer, PooledView, RefCountedPooled,
    SharedBuffer,
};
pub use chunk::{
    ChunkProgress, ChunkReader, ChunkState, Completion, FinishListener, TrailerSlot, Trailers,
};
pub use conduit::{
    ChunkedSourceConduit, ConduitReader, Exchange, IoSource, PushBack, PushBackSource, ReadStatus,
    SharedExchange, SharedRead, StreamSource,
};
pub use config::{
    ConduitConfig, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_EXTENSION_SIZE, DEFAULT_MAX_TRAILER_SIZE,
    DEFAULT_POOL_CAPACITY, MIN_BUFFER_SIZE,
};
pub use error::{ConduitError, Result};
