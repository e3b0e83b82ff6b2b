//! Chunked decoding on top of a non-blocking byte source.
//!
//! - [`ChunkedSourceConduit`] - strips chunked framing, enforces the entity limit
//! - [`StreamSource`] / [`PushBack`] - what the conduit needs from upstream
//! - [`PushBackSource`] / [`IoSource`] - ready-made upstream implementations
//! - [`Exchange`] / [`SharedExchange`] - entity limit and connection persistence
//! - [`ConduitReader`] - `std::io::Read` adapter

mod channel;
mod chunked;
mod exchange;
mod source;

pub use channel::ConduitReader;
pub use chunked::{ChunkedSourceConduit, SharedRead};
pub use exchange::{Exchange, SharedExchange};
pub use source::{IoSource, PushBack, PushBackSource, ReadStatus, StreamSource};
