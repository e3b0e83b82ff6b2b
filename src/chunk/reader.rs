//! Resumable chunked framing state machine.
//!
//! [`ChunkReader`] consumes chunk-size lines, chunk-data terminators and the
//! trailer section from whatever bytes are resident in a buffer, and keeps
//! enough state to resume when a line is split across reads. Payload bytes
//! are never consumed by the reader; the caller copies them and reports
//! progress through [`ChunkReader::set_chunk_remaining`].
//!
//! # Example
//!
//! ```
//! use bytes::Buf;
//! use dechunkrs::{ChunkProgress, ChunkReader, ConduitConfig};
//!
//! let mut reader = ChunkReader::new(&ConduitConfig::default());
//! let mut input = &b"5\r\nhello\r\n0\r\n\r\n"[..];
//!
//! assert_eq!(reader.read_chunk(&mut input)?, ChunkProgress::ChunkAvailable(5));
//! input.advance(5);
//! reader.set_chunk_remaining(0);
//!
//! assert_eq!(reader.read_chunk(&mut input)?, ChunkProgress::StreamComplete);
//! assert!(reader.is_finished());
//! # Ok::<(), dechunkrs::ConduitError>(())
//! ```

use std::fmt;
use std::mem;

use bytes::Buf;

use super::trailers::{TrailerSlot, Trailers};
use crate::config::ConduitConfig;
use crate::error::{ConduitError, Result};

/// A `u64` is at most 16 hex digits, leading zeros included.
const MAX_SIZE_DIGITS: u8 = 16;

/// Largest size that still fits the signed chunk-remaining regime after one more digit.
const MAX_SIZE_BEFORE_SHIFT: u64 = (i64::MAX as u64) >> 4;

/// Framing state visible to the conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// The next chunk-size line (or the trailer section) must be parsed.
    AwaitingHeader,
    /// Payload bytes of the current chunk are still pending.
    InChunk {
        /// Payload bytes not yet consumed.
        remaining: u64,
    },
    /// The last chunk and its trailers have been decoded.
    Done,
}

/// Outcome of [`ChunkReader::read_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    /// The header or trailer section is incomplete; supply more bytes and retry.
    NeedMoreInput,
    /// This many payload bytes of the current chunk are pending.
    ChunkAvailable(u64),
    /// The terminating chunk and all trailers were consumed.
    StreamComplete,
}

/// Why the completion listener fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The body was fully decoded and trailers are available.
    Decoded,
    /// Decoding was abandoned because the entity size limit was exceeded.
    Aborted,
}

/// Listener invoked exactly once when a body completes or is aborted.
pub type FinishListener = Box<dyn FnOnce(Completion) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Expecting the CR that ends a chunk's payload.
    DataCr,
    /// Expecting the LF that ends a chunk's payload.
    DataLf,
    /// Reading hex digits of the chunk size.
    Size,
    /// Skipping a chunk extension.
    Extension,
    /// Expecting the LF that ends the chunk-size line.
    SizeLf,
    /// Reading trailer lines after the last chunk.
    Trailer,
}

/// Parses chunked transfer-coding framing incrementally.
///
/// The reader starts in [`ChunkState::AwaitingHeader`]. Each chunk-size line
/// moves it to [`ChunkState::InChunk`]; the caller moves it back by persisting
/// a remaining count of zero, after which the reader expects the CRLF closing
/// the chunk data. A zero-size chunk makes the reader parse the trailer
/// section, publish it to its [`TrailerSlot`], fire the completion listener
/// and only then enter [`ChunkState::Done`].
pub struct ChunkReader {
    state: ChunkState,
    phase: Phase,
    size: u64,
    digits: u8,
    extension_len: usize,
    /// Partial trailer line carried across reads.
    line: Vec<u8>,
    trailer_len: usize,
    trailers: Trailers,
    slot: TrailerSlot,
    listener: Option<FinishListener>,
    max_trailer_size: usize,
    max_extension_size: usize,
}

impl ChunkReader {
    /// Creates a reader using the framing limits of `config`.
    pub fn new(config: &ConduitConfig) -> Self {
        Self {
            state: ChunkState::AwaitingHeader,
            phase: Phase::Size,
            size: 0,
            digits: 0,
            extension_len: 0,
            line: Vec::new(),
            trailer_len: 0,
            trailers: Trailers::new(),
            slot: TrailerSlot::new(),
            listener: None,
            max_trailer_size: config.max_trailer_size(),
            max_extension_size: config.max_extension_size(),
        }
    }

    /// Publishes trailers into `slot` instead of a private one.
    pub fn with_trailer_slot(mut self, slot: TrailerSlot) -> Self {
        self.slot = slot;
        self
    }

    /// Sets the completion listener.
    pub fn with_listener(mut self, listener: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.set_listener(listener);
        self
    }

    /// Replaces the completion listener. Has no effect once it has fired.
    pub fn set_listener(&mut self, listener: impl FnOnce(Completion) + Send + 'static) {
        if self.state != ChunkState::Done {
            self.listener = Some(Box::new(listener));
        }
    }

    /// Returns the slot trailers are published into.
    pub fn trailers(&self) -> &TrailerSlot {
        &self.slot
    }

    /// Returns the framing state.
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Returns whether the body has been fully decoded.
    pub fn is_finished(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Returns the pending payload bytes of the current chunk, `0` when a
    /// header must be parsed next, or `-1` once the body is fully decoded.
    pub fn chunk_remaining(&self) -> i64 {
        match self.state {
            ChunkState::AwaitingHeader => 0,
            ChunkState::InChunk { remaining } => i64::try_from(remaining).unwrap_or(i64::MAX),
            ChunkState::Done => -1,
        }
    }

    /// Persists how many payload bytes of the current chunk remain.
    ///
    /// Setting zero while inside a chunk ends it: the next
    /// [`read_chunk`](Self::read_chunk) first expects the CRLF that closes
    /// the chunk data.
    pub fn set_chunk_remaining(&mut self, remaining: u64) {
        match (self.state, remaining) {
            (ChunkState::Done, _) => {}
            (ChunkState::InChunk { .. }, 0) => {
                self.state = ChunkState::AwaitingHeader;
                self.phase = Phase::DataCr;
            }
            (ChunkState::AwaitingHeader, 0) => {}
            (_, remaining) => self.state = ChunkState::InChunk { remaining },
        }
    }

    /// Parses framing bytes from the front of `buf`.
    ///
    /// Consumes the chunk-size line (and, for the last chunk, the trailer
    /// section) and stops in front of the payload. Inside a chunk or once
    /// done, returns the current state without consuming anything.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::MalformedChunk`] on invalid framing, an
    /// oversized chunk extension or trailer section.
    pub fn read_chunk<B: Buf>(&mut self, buf: &mut B) -> Result<ChunkProgress> {
        match self.state {
            ChunkState::Done => return Ok(ChunkProgress::StreamComplete),
            ChunkState::InChunk { remaining } => {
                return Ok(ChunkProgress::ChunkAvailable(remaining));
            }
            ChunkState::AwaitingHeader => {}
        }

        while buf.has_remaining() {
            if self.phase == Phase::Trailer {
                if self.read_trailer_lines(buf)? {
                    self.complete();
                    return Ok(ChunkProgress::StreamComplete);
                }
                continue;
            }

            let byte = buf.get_u8();
            if let Some(size) = self.header_byte(byte)? {
                log::trace!("chunk header parsed: {size} bytes");
                self.state = ChunkState::InChunk { remaining: size };
                return Ok(ChunkProgress::ChunkAvailable(size));
            }
        }

        Ok(ChunkProgress::NeedMoreInput)
    }

    /// Fires the completion listener with [`Completion::Aborted`] if it has not fired yet.
    pub fn abort(&mut self) {
        self.notify(Completion::Aborted);
    }

    /// Feeds one byte of a chunk-size line or data terminator.
    ///
    /// Returns the size once a line announcing a non-empty chunk is complete.
    fn header_byte(&mut self, byte: u8) -> Result<Option<u64>> {
        match self.phase {
            Phase::DataCr => match byte {
                b'\r' => self.phase = Phase::DataLf,
                _ => return Err(ConduitError::malformed("missing CRLF after chunk data")),
            },
            Phase::DataLf => match byte {
                b'\n' => self.start_size_line(),
                _ => return Err(ConduitError::malformed("missing CRLF after chunk data")),
            },
            Phase::Size => self.size_byte(byte)?,
            Phase::Extension => match byte {
                b'\r' => self.phase = Phase::SizeLf,
                b'\n' => return Err(ConduitError::malformed("bare LF in chunk-size line")),
                _ => {
                    self.extension_len += 1;
                    if self.extension_len > self.max_extension_size {
                        return Err(ConduitError::malformed("chunk extension too long"));
                    }
                }
            },
            Phase::SizeLf => {
                if byte != b'\n' {
                    return Err(ConduitError::malformed("missing LF after chunk size"));
                }
                if self.size > 0 {
                    return Ok(Some(self.size));
                }
                self.phase = Phase::Trailer;
                self.line.clear();
                self.trailer_len = 0;
            }
            Phase::Trailer => {}
        }
        Ok(None)
    }

    fn start_size_line(&mut self) {
        self.phase = Phase::Size;
        self.size = 0;
        self.digits = 0;
        self.extension_len = 0;
    }

    fn size_byte(&mut self, byte: u8) -> Result<()> {
        if let Some(digit) = char::from(byte).to_digit(16) {
            if self.digits == MAX_SIZE_DIGITS {
                return Err(ConduitError::malformed("chunk size too long"));
            }
            if self.size > MAX_SIZE_BEFORE_SHIFT {
                return Err(ConduitError::malformed("chunk size overflow"));
            }
            self.size = (self.size << 4) | u64::from(digit);
            self.digits += 1;
            return Ok(());
        }

        if self.digits == 0 {
            return Err(ConduitError::malformed("missing chunk size"));
        }

        match byte {
            b';' | b' ' | b'\t' => self.phase = Phase::Extension,
            b'\r' => self.phase = Phase::SizeLf,
            _ => return Err(ConduitError::malformed("invalid chunk size")),
        }
        Ok(())
    }

    /// Consumes trailer lines. Returns `true` once the empty line ending the section is read.
    fn read_trailer_lines<B: Buf>(&mut self, buf: &mut B) -> Result<bool> {
        while buf.has_remaining() {
            let chunk = buf.chunk();
            let (take, line_end) = match memchr::memchr(b'\n', chunk) {
                Some(i) => (i + 1, true),
                None => (chunk.len(), false),
            };

            self.trailer_len += take;
            if self.trailer_len > self.max_trailer_size {
                return Err(ConduitError::malformed("trailer section too large"));
            }
            self.line.extend_from_slice(&chunk[..take]);
            buf.advance(take);

            if line_end && self.finish_trailer_line()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `true` if the completed line was the empty terminator.
    fn finish_trailer_line(&mut self) -> Result<bool> {
        let Some(content) = self.line.strip_suffix(b"\r\n") else {
            return Err(ConduitError::malformed("bare LF in trailer section"));
        };
        if content.is_empty() {
            return Ok(true);
        }

        let (name, value) = parse_trailer(content)?;
        self.trailers.append(name, value);
        self.line.clear();
        Ok(false)
    }

    fn complete(&mut self) {
        let trailers = mem::take(&mut self.trailers);
        log::trace!("chunked body complete with {} trailer(s)", trailers.len());
        if !self.slot.publish(trailers) {
            log::debug!("trailer slot was already filled, dropping trailers");
        }
        self.line = Vec::new();
        self.notify(Completion::Decoded);
        self.state = ChunkState::Done;
    }

    fn notify(&mut self, completion: Completion) {
        if let Some(listener) = self.listener.take() {
            listener(completion);
        }
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new(&ConduitConfig::default())
    }
}

impl fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReader")
            .field("state", &self.state)
            .field("phase", &self.phase)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Splits `name: value` and validates both halves.
fn parse_trailer(line: &[u8]) -> Result<(String, String)> {
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ConduitError::malformed("obsolete line folding in trailer"));
    }

    let colon = memchr::memchr(b':', line)
        .ok_or(ConduitError::malformed("trailer field without colon"))?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    if name.is_empty() || !name.iter().copied().all(is_tchar) {
        return Err(ConduitError::malformed("invalid trailer field name"));
    }

    let name = std::str::from_utf8(name)
        .map_err(|_| ConduitError::malformed("invalid trailer field name"))?;
    let value = std::str::from_utf8(value.trim_ascii())
        .map_err(|_| ConduitError::malformed("trailer value is not valid UTF-8"))?;

    Ok((name.to_owned(), value.to_owned()))
}

/// RFC 9110 `tchar`.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn reader() -> ChunkReader {
        ChunkReader::default()
    }

    /// Consumes a chunk's payload the way the conduit does.
    fn consume(reader: &mut ChunkReader, input: &mut &[u8], n: u64) {
        input.advance(n as usize);
        reader.set_chunk_remaining(0);
    }

    #[test]
    fn test_initial_state() {
        let reader = reader();
        assert_eq!(reader.state(), ChunkState::AwaitingHeader);
        assert_eq!(reader.chunk_remaining(), 0);
        assert!(!reader.is_finished());
        assert!(reader.trailers().get().is_none());
    }

    #[test]
    fn test_single_chunk_and_terminator() {
        let mut reader = reader();
        let mut input = &b"4\r\nWiki\r\n0\r\n\r\n"[..];

        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::ChunkAvailable(4)
        );
        assert_eq!(input, b"Wiki\r\n0\r\n\r\n");
        assert_eq!(reader.chunk_remaining(), 4);

        consume(&mut reader, &mut input, 4);
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::StreamComplete
        );
        assert!(input.is_empty());
        assert_eq!(reader.chunk_remaining(), -1);
        assert!(reader.trailers().get().unwrap().is_empty());
    }

    #[test]
    fn test_in_chunk_does_not_consume() {
        let mut reader = reader();
        let mut input = &b"a\r\n0123456789"[..];
        reader.read_chunk(&mut input).unwrap();

        reader.set_chunk_remaining(3);
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::ChunkAvailable(3)
        );
        assert_eq!(input.len(), 10);
    }

    #[test]
    fn test_header_split_byte_by_byte() {
        let mut reader = reader();
        let wire = b"1F;name=value\r\n";

        for (i, byte) in wire.iter().enumerate() {
            let mut one = std::slice::from_ref(byte);
            let progress = reader.read_chunk(&mut one).unwrap();
            if i + 1 < wire.len() {
                assert_eq!(progress, ChunkProgress::NeedMoreInput);
            } else {
                assert_eq!(progress, ChunkProgress::ChunkAvailable(0x1f));
            }
        }
    }

    #[test]
    fn test_uppercase_and_leading_zero_sizes() {
        let mut reader = reader();
        let mut input = &b"00FF\r\n"[..];
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::ChunkAvailable(255)
        );
    }

    #[test]
    fn test_extension_with_whitespace() {
        let mut reader = reader();
        let mut input = &b"5 ; foo=\"bar\"\r\n"[..];
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::ChunkAvailable(5)
        );
    }

    #[test]
    fn test_trailers_published_before_done() {
        let listener_saw_trailers = Arc::new(AtomicUsize::new(0));
        let slot = TrailerSlot::new();

        let observed = Arc::clone(&listener_saw_trailers);
        let observed_slot = slot.clone();
        let mut reader = reader()
            .with_trailer_slot(slot.clone())
            .with_listener(move |completion| {
                assert_eq!(completion, Completion::Decoded);
                if let Some(trailers) = observed_slot.get() {
                    observed.store(trailers.len(), Ordering::SeqCst);
                }
            });

        let mut input = &b"0\r\nExpires: never\r\nX-Sum:  abc \r\n\r\n"[..];
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::StreamComplete
        );

        assert_eq!(listener_saw_trailers.load(Ordering::SeqCst), 2);
        let trailers = slot.get().unwrap();
        assert_eq!(trailers.get("expires"), Some("never"));
        assert_eq!(trailers.get("x-sum"), Some("abc"));
    }

    #[test]
    fn test_trailers_split_across_reads() {
        let mut reader = reader();
        let parts: [&[u8]; 4] = [b"0\r\nFoo: b", b"ar\r", b"\n\r", b"\n"];

        let mut last = ChunkProgress::NeedMoreInput;
        for part in parts {
            let mut input = part;
            last = reader.read_chunk(&mut input).unwrap();
        }
        assert_eq!(last, ChunkProgress::StreamComplete);
        assert_eq!(reader.trailers().get().unwrap().get("foo"), Some("bar"));
    }

    #[test]
    fn test_trailers_absent_until_complete() {
        let mut reader = reader();
        let mut input = &b"0\r\nFoo: bar\r\n"[..];
        assert_eq!(
            reader.read_chunk(&mut input).unwrap(),
            ChunkProgress::NeedMoreInput
        );
        assert!(reader.trailers().get().is_none());
        assert!(!reader.is_finished());
    }

    #[test]
    fn test_listener_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut reader = reader().with_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut input = &b"0\r\n\r\n"[..];
        reader.read_chunk(&mut input).unwrap();
        reader.abort();
        assert_eq!(reader.read_chunk(&mut input).unwrap(), ChunkProgress::StreamComplete);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_reports_aborted() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut reader = reader().with_listener(move |c| *sink.lock() = Some(c));

        reader.abort();
        assert_eq!(*seen.lock(), Some(Completion::Aborted));
        assert!(!reader.is_finished());
    }

    #[test]
    fn test_missing_crlf_after_data() {
        let mut reader = reader();
        let mut input = &b"2\r\nabXY"[..];
        reader.read_chunk(&mut input).unwrap();
        consume(&mut reader, &mut input, 2);

        let err = reader.read_chunk(&mut input).unwrap_err();
        assert!(matches!(err, ConduitError::MalformedChunk { .. }));
    }

    #[test]
    fn test_malformed_sizes() {
        let cases: [&[u8]; 6] = [
            b"\r\n",
            b"xyz\r\n",
            b"4x\r\n",
            b"4\n",
            b"4\rX",
            b"11111111111111111\r\n",
        ];
        for case in cases {
            let mut input = case;
            let result = reader().read_chunk(&mut input);
            assert!(
                matches!(result, Err(ConduitError::MalformedChunk { .. })),
                "expected malformed for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_size_overflow_rejected() {
        let mut input = &b"8000000000000000\r\n"[..];
        let err = reader().read_chunk(&mut input).unwrap_err();
        assert!(err.to_string().contains("overflow"));

        let mut input = &b"7fffffffffffffff\r\n"[..];
        assert_eq!(
            reader().read_chunk(&mut input).unwrap(),
            ChunkProgress::ChunkAvailable(i64::MAX as u64)
        );
    }

    #[test]
    fn test_extension_limit() {
        let config = ConduitConfig::default().with_max_extension_size(4);
        let mut input = &b"1;abcdef\r\n"[..];
        let result = ChunkReader::new(&config).read_chunk(&mut input);
        assert!(matches!(result, Err(ConduitError::MalformedChunk { .. })));
    }

    #[test]
    fn test_trailer_limit() {
        let config = ConduitConfig::default().with_max_trailer_size(8);
        let mut input = &b"0\r\nX-Long: value\r\n\r\n"[..];
        let result = ChunkReader::new(&config).read_chunk(&mut input);
        assert!(matches!(result, Err(ConduitError::MalformedChunk { .. })));
    }

    #[test]
    fn test_malformed_trailers() {
        let cases: [&[u8]; 4] = [
            b"0\r\nno-colon\r\n\r\n",
            b"0\r\n: empty\r\n\r\n",
            b"0\r\nBad Name: x\r\n\r\n",
            b"0\r\nA: 1\r\n folded\r\n\r\n",
        ];
        for case in cases {
            let mut input = case;
            assert!(reader().read_chunk(&mut input).is_err());
        }

        let mut input = &b"0\r\nA: 1\n\r\n"[..];
        assert!(reader().read_chunk(&mut input).is_err());
    }
}
