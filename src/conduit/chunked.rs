//! The chunked decode layer.
//!
//! [`ChunkedSourceConduit`] sits between an upstream [`StreamSource`] and the
//! consumer of a request body. Every read allocates one pooled raw buffer,
//! fills it from upstream, lets the [`ChunkReader`] strip framing, and copies
//! payload into the caller's buffer. Raw bytes that were read but not
//! consumed (the rest of a chunk, the next chunk's header, a pipelined
//! request) are pushed back upstream before the call returns.

use std::fmt;
use std::io::IoSliceMut;
use std::ops::ControlFlow;

use bytes::Buf;

use super::exchange::Exchange;
use super::source::{PushBack, ReadStatus, StreamSource};
use crate::buffer::{BufferPool, BufferSlice, Pooled, PooledBuffer, SharedBuffer};
use crate::chunk::{ChunkProgress, ChunkReader, Completion, TrailerSlot};
use crate::config::ConduitConfig;
use crate::error::{ConduitError, Result};

/// Remaining payload allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityBudget {
    /// Not looked up yet; resolved on the first payload bytes.
    Unresolved,
    /// No exchange, or its limit is `<= 0`.
    Unlimited,
    Remaining {
        limit: i64,
        left: i64,
    },
}

/// Outcome of [`ChunkedSourceConduit::read_shared`].
#[derive(Debug)]
pub enum SharedRead {
    /// Payload bytes still resident in a pooled raw buffer.
    Data(BufferSlice),
    /// No payload is available right now.
    WouldBlock,
    /// The body has been fully decoded.
    Eof,
}

impl From<ReadStatus> for SharedRead {
    fn from(status: ReadStatus) -> Self {
        match status {
            ReadStatus::Eof => Self::Eof,
            ReadStatus::Data(_) | ReadStatus::WouldBlock => Self::WouldBlock,
        }
    }
}

/// Decodes a chunked request body from a non-blocking upstream source.
///
/// Reads return payload bytes only. Chunk-size lines, extensions, CRLFs and
/// the trailer section are consumed transparently, and trailers are
/// published to [`trailers`](Self::trailers) once the terminating chunk has
/// been read.
///
/// # Entity size
///
/// With an [`Exchange`] attached, payload bytes are charged against its
/// maximum entity size. Exceeding it terminates upstream reads, fires the
/// completion listener with [`Completion::Aborted`], marks the exchange
/// non-persistent and fails with [`ConduitError::EntityTooLarge`]. Every
/// later read fails with [`ConduitError::ClosedChannel`].
///
/// # Example
///
/// ```
/// use dechunkrs::{
///     BufferPool, ChunkedSourceConduit, ConduitConfig, IoSource, PushBackSource, ReadStatus,
/// };
///
/// let wire = &b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"[..];
/// let config = ConduitConfig::default();
/// let pool = BufferPool::new(&config);
/// let mut conduit =
///     ChunkedSourceConduit::new(PushBackSource::new(IoSource::new(wire)), pool, &config);
///
/// let mut body = Vec::new();
/// let mut buf = [0u8; 64];
/// while let ReadStatus::Data(n) = conduit.read(&mut buf)? {
///     body.extend_from_slice(&buf[..n]);
/// }
///
/// assert_eq!(body, b"Wikipedia");
/// assert!(conduit.is_finished());
/// # Ok::<(), dechunkrs::ConduitError>(())
/// ```
pub struct ChunkedSourceConduit<S> {
    next: S,
    pool: BufferPool,
    reader: ChunkReader,
    exchange: Option<Box<dyn Exchange + Send>>,
    budget: EntityBudget,
    closed: bool,
}

impl<S> ChunkedSourceConduit<S> {
    /// Creates a conduit decoding one body from `next`, with raw buffers from `pool`.
    pub fn new(next: S, pool: BufferPool, config: &ConduitConfig) -> Self {
        Self {
            next,
            pool,
            reader: ChunkReader::new(config),
            exchange: None,
            budget: EntityBudget::Unresolved,
            closed: false,
        }
    }

    /// Attaches the exchange supplying the entity limit and persistence flag.
    pub fn with_exchange(mut self, exchange: impl Exchange + Send + 'static) -> Self {
        self.exchange = Some(Box::new(exchange));
        self
    }

    /// Sets the listener fired once when the body completes or is aborted.
    pub fn with_listener(mut self, listener: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.reader.set_listener(listener);
        self
    }

    /// Publishes trailers into `slot`, typically the request's own header store.
    pub fn with_trailer_slot(mut self, slot: TrailerSlot) -> Self {
        self.reader = self.reader.with_trailer_slot(slot);
        self
    }

    /// Returns whether the terminating chunk and trailers have been read.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Returns whether the conduit was force-closed by a size violation.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the trailer slot, filled once the body is finished.
    pub fn trailers(&self) -> &TrailerSlot {
        self.reader.trailers()
    }

    /// Returns the framing state machine.
    pub fn reader(&self) -> &ChunkReader {
        &self.reader
    }

    /// Returns the pool raw buffers are allocated from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns a reference to the upstream source.
    pub fn get_ref(&self) -> &S {
        &self.next
    }

    /// Returns a mutable reference to the upstream source.
    ///
    /// Reading from it directly bypasses the framing state.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.next
    }

    /// Returns the upstream source.
    pub fn into_inner(self) -> S {
        self.next
    }
}

impl<S: StreamSource + PushBack> ChunkedSourceConduit<S> {
    /// Reads decoded payload into `dst`.
    ///
    /// Returns [`ReadStatus::Eof`] once the body is finished, on every call.
    /// An empty `dst` returns `Data(0)` without touching upstream.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::ClosedChannel`] if upstream ended early or the
    ///   conduit was force-closed
    /// - [`ConduitError::MalformedChunk`] on invalid framing
    /// - [`ConduitError::EntityTooLarge`] when the entity limit is exceeded
    /// - [`ConduitError::Io`] on upstream failure
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadStatus> {
        if self.reader.is_finished() {
            return Ok(ReadStatus::Eof);
        }
        if self.closed {
            return Err(ConduitError::ClosedChannel);
        }
        if dst.is_empty() {
            return Ok(ReadStatus::Data(0));
        }

        let mut raw = self.pool.allocate();
        let result = self.read_into(&mut raw, dst);
        self.release_raw(raw);
        result
    }

    /// Reads into the first non-empty buffer of `dsts`.
    ///
    /// Returns `Data(0)` when every buffer is empty.
    pub fn read_vectored(&mut self, dsts: &mut [IoSliceMut<'_>]) -> Result<ReadStatus> {
        match dsts.iter_mut().find(|dst| !dst.is_empty()) {
            Some(dst) => self.read(dst),
            None => Ok(ReadStatus::Data(0)),
        }
    }

    /// Returns payload without copying it.
    ///
    /// The returned slice views payload bytes inside the pooled raw buffer
    /// they were read into. Framing or next-chunk bytes in that same buffer
    /// are pushed back upstream under a second reference, so the buffer goes
    /// back to the pool only after both the slice and the pushed-back bytes
    /// are released.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn read_shared(&mut self) -> Result<SharedRead> {
        if self.reader.is_finished() {
            return Ok(SharedRead::Eof);
        }
        if self.closed {
            return Err(ConduitError::ClosedChannel);
        }

        loop {
            let mut raw = self.pool.allocate();
            let chunk = match self.prepare(&mut raw) {
                Ok(ControlFlow::Continue(chunk)) => chunk,
                Ok(ControlFlow::Break(status)) => {
                    self.release_raw(raw);
                    return Ok(status.into());
                }
                Err(e) => {
                    self.release_raw(raw);
                    return Err(e);
                }
            };

            let take = clamp(chunk, raw.remaining());
            if take == 0 {
                // The header used up every byte; the payload is still upstream
                self.release_raw(raw);
                continue;
            }

            let start = raw.position();
            raw.advance(take);
            self.reader.set_chunk_remaining(chunk - take as u64);

            let push_rest = raw.has_remaining();
            let shared = SharedBuffer::from(raw);
            let slice = shared.create_view(start..start + take);
            if push_rest {
                self.next.push_back(shared);
            } else {
                shared.free();
            }

            let slice = slice?;
            self.charge(take)?;
            return Ok(SharedRead::Data(slice));
        }
    }

    /// Terminates upstream reads.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::MidChunkClose`] if the body was not fully
    /// decoded. Upstream failures are only reported once the body is finished.
    pub fn terminate_reads(&mut self) -> Result<()> {
        let terminated = self.next.terminate_reads();
        if self.reader.is_finished() {
            return terminated.map_err(ConduitError::from);
        }
        if let Err(e) = terminated {
            log::debug!("failed to terminate upstream reads mid chunk: {e}");
        }
        Err(ConduitError::MidChunkClose)
    }

    fn read_into(&mut self, raw: &mut PooledBuffer, dst: &mut [u8]) -> Result<ReadStatus> {
        match self.prepare(raw)? {
            ControlFlow::Continue(chunk) => self.copy_payload(raw, dst, chunk),
            ControlFlow::Break(status) => Ok(status),
        }
    }

    /// Fills `raw` from upstream and parses framing.
    ///
    /// Continues with the pending size of the current chunk, or breaks with
    /// the status to report. Framing-only reads are followed by another
    /// upstream read, so `WouldBlock` is only reported when upstream blocked.
    fn prepare(&mut self, raw: &mut PooledBuffer) -> Result<ControlFlow<ReadStatus, u64>> {
        loop {
            match self.next.read(raw.spare_mut())? {
                ReadStatus::Eof => return Err(ConduitError::ClosedChannel),
                ReadStatus::WouldBlock | ReadStatus::Data(0) => {
                    return Ok(ControlFlow::Break(ReadStatus::WouldBlock));
                }
                ReadStatus::Data(n) => raw.commit(n),
            }

            match self.reader.read_chunk(raw)? {
                ChunkProgress::ChunkAvailable(chunk) => return Ok(ControlFlow::Continue(chunk)),
                ChunkProgress::StreamComplete => return Ok(ControlFlow::Break(ReadStatus::Eof)),
                // Every byte was framing; the buffer is empty and reusable
                ChunkProgress::NeedMoreInput => raw.clear(),
            }
        }
    }

    fn copy_payload(
        &mut self,
        raw: &mut PooledBuffer,
        dst: &mut [u8],
        mut chunk: u64,
    ) -> Result<ReadStatus> {
        let in_buffer = clamp(chunk, raw.remaining());

        if in_buffer > dst.len() {
            // Fill dst from the raw buffer; the rest is pushed back
            let n = dst.len();
            raw.copy_to_slice(dst);
            self.reader.set_chunk_remaining(chunk - n as u64);
            self.charge(n)?;
            return Ok(ReadStatus::Data(n));
        }

        raw.copy_to_slice(&mut dst[..in_buffer]);
        let mut read = in_buffer;
        chunk -= in_buffer as u64;

        // Read the rest of the chunk straight into dst, never past its end
        let mut upstream = Ok(());
        let limit = read + clamp(chunk, dst.len() - read);
        while read < limit {
            match self.next.read(&mut dst[read..limit]) {
                Ok(ReadStatus::Data(0) | ReadStatus::WouldBlock) => break,
                Ok(ReadStatus::Data(n)) => {
                    read += n;
                    chunk -= n as u64;
                }
                Ok(ReadStatus::Eof) => {
                    upstream = Err(ConduitError::ClosedChannel);
                    break;
                }
                Err(e) => {
                    upstream = Err(e.into());
                    break;
                }
            }
        }

        self.reader.set_chunk_remaining(chunk);
        upstream?;
        self.charge(read)?;

        Ok(match read {
            0 => ReadStatus::WouldBlock,
            n => ReadStatus::Data(n),
        })
    }

    /// Charges `written` payload bytes against the entity budget.
    fn charge(&mut self, written: usize) -> Result<()> {
        if written == 0 {
            return Ok(());
        }

        let (limit, left) = match self.budget {
            EntityBudget::Unlimited => return Ok(()),
            EntityBudget::Remaining { limit, left } => (limit, left),
            EntityBudget::Unresolved => {
                let limit = self.exchange.as_ref().map_or(0, |e| e.max_entity_size());
                if limit <= 0 {
                    self.budget = EntityBudget::Unlimited;
                    return Ok(());
                }
                (limit, limit)
            }
        };

        let left = left.saturating_sub(i64::try_from(written).unwrap_or(i64::MAX));
        self.budget = EntityBudget::Remaining { limit, left };
        if left < 0 {
            return Err(self.abort_oversized(limit));
        }
        Ok(())
    }

    fn abort_oversized(&mut self, limit: i64) -> ConduitError {
        log::debug!("chunked body exceeded max entity size of {limit} bytes, closing");
        if let Err(e) = self.next.terminate_reads() {
            log::debug!("exception terminating reads due to exceeding max size: {e}");
        }
        self.closed = true;
        self.reader.abort();
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.set_persistent(false);
        }
        ConduitError::EntityTooLarge { limit }
    }

    /// Pushes unread raw bytes back upstream, or frees the buffer.
    fn release_raw(&mut self, raw: PooledBuffer) {
        if raw.has_remaining() {
            self.next.push_back(SharedBuffer::from(raw));
        } else {
            raw.free();
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ChunkedSourceConduit<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedSourceConduit")
            .field("next", &self.next)
            .field("reader", &self.reader)
            .field("budget", &self.budget)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// `min(chunk, available)` as a `usize`.
#[inline]
fn clamp(chunk: u64, available: usize) -> usize {
    usize::try_from(chunk).map_or(available, |chunk| chunk.min(available))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;
    use crate::conduit::SharedExchange;
    use crate::conduit::source::{IoSource, PushBackSource};

    /// Source returning one scripted step per read.
    #[derive(Debug, Default)]
    struct Steps {
        steps: VecDeque<Step>,
        terminated: bool,
    }

    #[derive(Debug)]
    enum Step {
        Bytes(&'static [u8]),
        Block,
        Fail(io::ErrorKind),
    }

    impl Steps {
        fn new(steps: impl IntoIterator<Item = Step>) -> PushBackSource<Self> {
            PushBackSource::new(Self {
                steps: steps.into_iter().collect(),
                terminated: false,
            })
        }
    }

    impl StreamSource for Steps {
        fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus> {
            if self.terminated {
                return Ok(ReadStatus::Eof);
            }
            match self.steps.pop_front() {
                Some(Step::Bytes(bytes)) => {
                    let n = bytes.len().min(dst.len());
                    dst[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Step::Bytes(&bytes[n..]));
                    }
                    Ok(ReadStatus::Data(n))
                }
                Some(Step::Block) => Ok(ReadStatus::WouldBlock),
                Some(Step::Fail(kind)) => Err(kind.into()),
                None => Ok(ReadStatus::Eof),
            }
        }

        fn terminate_reads(&mut self) -> io::Result<()> {
            self.terminated = true;
            Ok(())
        }
    }

    fn conduit(
        steps: impl IntoIterator<Item = Step>,
    ) -> ChunkedSourceConduit<PushBackSource<Steps>> {
        let config = ConduitConfig::default().with_buffer_size(64);
        ChunkedSourceConduit::new(Steps::new(steps), BufferPool::new(&config), &config)
    }

    #[test]
    fn test_budget_resolved_lazily() {
        let mut c = conduit([Step::Bytes(b"3\r\nabc\r\n0\r\n\r\n")])
            .with_exchange(SharedExchange::new(10));
        assert_eq!(c.budget, EntityBudget::Unresolved);

        c.read(&mut [0u8; 8]).unwrap();
        assert_eq!(c.budget, EntityBudget::Remaining { limit: 10, left: 7 });
    }

    #[test]
    fn test_no_exchange_is_unlimited() {
        let mut c = conduit([Step::Bytes(b"3\r\nabc\r\n")]);
        c.read(&mut [0u8; 8]).unwrap();
        assert_eq!(c.budget, EntityBudget::Unlimited);
    }

    #[test]
    fn test_header_only_read_reads_payload_directly() {
        let mut c = conduit([Step::Bytes(b"5\r\n"), Step::Bytes(b"hel"), Step::Block]);
        let mut buf = [0u8; 16];
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(&buf[..3], b"hel");
        assert_eq!(c.reader().chunk_remaining(), 2);
    }

    #[test]
    fn test_direct_read_stops_at_chunk_end() {
        // The second step holds the rest of the chunk and the next header
        let mut c = conduit([Step::Bytes(b"4\r\n"), Step::Bytes(b"Wiki\r\n0\r\n\r\n")]);
        let mut buf = [0u8; 16];
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(4));
        assert_eq!(&buf[..4], b"Wiki");
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Eof);
    }

    #[test]
    fn test_framing_only_buffer_reads_on() {
        // The CRLF after "def" is alone in the last pushed-back bytes
        let config = ConduitConfig::default().with_buffer_size(16);
        let wire = &b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n"[..];
        let mut c = ChunkedSourceConduit::new(
            PushBackSource::new(IoSource::new(wire)),
            BufferPool::new(&config),
            &config,
        );

        let mut buf = [0u8; 8];
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(3));
        assert_eq!(&buf[..3], b"def");
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Eof);
        assert!(c.is_finished());
        assert_eq!(c.pool().stats().outstanding, 0);
    }

    #[test]
    fn test_framing_then_block_reports_would_block() {
        let mut c = conduit([
            Step::Bytes(b"3\r\nabc\r"),
            Step::Block,
            Step::Bytes(b"\n0\r\n\r\n"),
        ]);
        let mut buf = [0u8; 8];
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(3));
        // Only the pushed-back CR is left, then upstream blocks
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::WouldBlock);
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Eof);
    }

    #[test]
    fn test_upstream_error_propagates() {
        let mut c = conduit([
            Step::Bytes(b"5\r\n"),
            Step::Fail(io::ErrorKind::ConnectionReset),
        ]);
        let err = c.read(&mut [0u8; 8]).unwrap_err();
        assert!(
            matches!(err, ConduitError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset)
        );
        assert_eq!(c.pool().stats().outstanding, 0);
    }

    #[test]
    fn test_read_shared_views_raw_buffer() {
        let mut c = conduit([Step::Bytes(b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n")]);

        let SharedRead::Data(first) = c.read_shared().unwrap() else {
            panic!("expected data");
        };
        assert_eq!(first.to_vec().unwrap(), b"abc");
        // The raw buffer is pushed back and viewed at once
        assert_eq!(c.get_ref().pushed_back(), 1);
        assert_eq!(c.pool().stats().outstanding, 1);

        let mut buf = [0u8; 8];
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Data(2));
        assert_eq!(&buf[..2], b"de");
        assert_eq!(c.read(&mut buf).unwrap(), ReadStatus::Eof);

        // Only the view keeps the first raw buffer alive now
        assert_eq!(c.pool().stats().outstanding, 1);
        first.free();
        assert_eq!(c.pool().stats().outstanding, 0);
    }

    #[test]
    fn test_read_shared_skips_header_only_reads() {
        let mut c = conduit([Step::Bytes(b"2\r\n"), Step::Bytes(b"xy\r\n")]);
        let SharedRead::Data(slice) = c.read_shared().unwrap() else {
            panic!("expected data");
        };
        assert_eq!(slice.to_vec().unwrap(), b"xy");
        assert!(slice.with_pooled(|raw| raw.resource().to_vec()).is_ok());
    }

    #[test]
    fn test_read_shared_reports_would_block_and_eof() {
        let mut c = conduit([Step::Block, Step::Bytes(b"0\r\n\r\n")]);
        assert!(matches!(c.read_shared().unwrap(), SharedRead::WouldBlock));
        assert!(matches!(c.read_shared().unwrap(), SharedRead::Eof));
        assert!(matches!(c.read_shared().unwrap(), SharedRead::Eof));
    }

    #[test]
    fn test_read_vectored_uses_first_non_empty() {
        let mut c = conduit([Step::Bytes(b"3\r\nabc\r\n")]);
        let mut empty = [0u8; 0];
        let mut target = [0u8; 8];
        let mut dsts = [IoSliceMut::new(&mut empty), IoSliceMut::new(&mut target)];

        assert_eq!(c.read_vectored(&mut dsts).unwrap(), ReadStatus::Data(3));
        assert_eq!(&target[..3], b"abc");

        let mut none: [IoSliceMut<'_>; 0] = [];
        assert_eq!(c.read_vectored(&mut none).unwrap(), ReadStatus::Data(0));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(3, 10), 3);
        assert_eq!(clamp(30, 10), 10);
        assert_eq!(clamp(u64::MAX, 10), 10);
    }
}
