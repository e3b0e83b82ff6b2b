//! Upstream byte sources.
//!
//! The conduit reads raw bytes from a [`StreamSource`] and hands unconsumed
//! raw buffers back through [`PushBack`]. [`PushBackSource`] implements both
//! on top of any source; [`IoSource`] adapts a non-blocking [`std::io::Read`].

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};

use crate::buffer::SharedBuffer;

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were written to the destination.
    Data(usize),
    /// No bytes are available right now; retry when the source is readable.
    WouldBlock,
    /// The stream has ended.
    Eof,
}

impl ReadStatus {
    /// Returns the number of bytes read, zero for anything but [`Data`](Self::Data).
    pub fn bytes(&self) -> usize {
        match self {
            Self::Data(n) => *n,
            Self::WouldBlock | Self::Eof => 0,
        }
    }

    /// Returns whether the stream has ended.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// A non-blocking source of raw bytes.
pub trait StreamSource {
    /// Reads into `dst`, never blocking.
    ///
    /// Returns [`ReadStatus::WouldBlock`] (or `Data(0)`) when nothing is available.
    fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus>;

    /// Shuts down the read side. Later reads report [`ReadStatus::Eof`].
    fn terminate_reads(&mut self) -> io::Result<()>;
}

impl<S: StreamSource + ?Sized> StreamSource for &mut S {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus> {
        (**self).read(dst)
    }

    fn terminate_reads(&mut self) -> io::Result<()> {
        (**self).terminate_reads()
    }
}

impl<S: StreamSource + ?Sized> StreamSource for Box<S> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus> {
        (**self).read(dst)
    }

    fn terminate_reads(&mut self) -> io::Result<()> {
        (**self).terminate_reads()
    }
}

/// A sink for raw buffers holding bytes that were read but not consumed.
///
/// The pushed-back bytes must be returned by the next reads, ahead of
/// anything still upstream. The sink owns one reference on the buffer and
/// releases it once the bytes are consumed.
pub trait PushBack {
    /// Returns `buffer`'s unread bytes to the front of the stream.
    fn push_back(&mut self, buffer: SharedBuffer);
}

impl<P: PushBack + ?Sized> PushBack for &mut P {
    fn push_back(&mut self, buffer: SharedBuffer) {
        (**self).push_back(buffer);
    }
}

impl<P: PushBack + ?Sized> PushBack for Box<P> {
    fn push_back(&mut self, buffer: SharedBuffer) {
        (**self).push_back(buffer);
    }
}

/// Serves pushed-back buffers before reading from the wrapped source.
///
/// # Example
///
/// ```
/// use dechunkrs::{BufferPool, IoSource, PushBack, PushBackSource, ReadStatus, SharedBuffer, StreamSource};
///
/// let pool = BufferPool::with_capacity(64, 4);
/// let mut source = PushBackSource::new(IoSource::new(&b" world"[..]));
///
/// let mut raw = pool.allocate();
/// raw.spare_mut()[..5].copy_from_slice(b"hello");
/// raw.commit(5);
/// source.push_back(SharedBuffer::from(raw));
///
/// let mut out = [0u8; 16];
/// assert_eq!(source.read(&mut out)?, ReadStatus::Data(5));
/// assert_eq!(&out[..5], b"hello");
/// assert_eq!(pool.stats().outstanding, 0);
///
/// assert_eq!(source.read(&mut out)?, ReadStatus::Data(6));
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct PushBackSource<S> {
    next: S,
    /// Pushed buffers and how many of their unread bytes were served already.
    pushed: VecDeque<(SharedBuffer, usize)>,
    terminated: bool,
}

impl<S> PushBackSource<S> {
    /// Wraps `next`.
    pub fn new(next: S) -> Self {
        Self {
            next,
            pushed: VecDeque::new(),
            terminated: false,
        }
    }

    /// Returns the number of buffers waiting to be served.
    pub fn pushed_back(&self) -> usize {
        self.pushed.len()
    }

    /// Returns a reference to the wrapped source.
    pub fn get_ref(&self) -> &S {
        &self.next
    }

    /// Returns a mutable reference to the wrapped source.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.next
    }

    /// Releases every pushed-back buffer and returns the wrapped source.
    pub fn into_inner(mut self) -> S {
        self.release_all();
        self.next
    }

    fn release_all(&mut self) {
        for (buffer, _) in self.pushed.drain(..) {
            buffer.free();
        }
    }

    /// Copies pushed-back bytes into `dst`. Returns `None` once nothing is pushed back.
    fn read_pushed(&mut self, dst: &mut [u8]) -> Option<usize> {
        while let Some((buffer, served)) = self.pushed.front_mut() {
            let copied = buffer.with_resource(|unread| {
                let rest = &unread[*served..];
                let n = rest.len().min(dst.len());
                dst[..n].copy_from_slice(&rest[..n]);
                (n, rest.len() - n)
            });

            match copied {
                Ok((n, left)) => {
                    *served += n;
                    if left == 0 {
                        if let Some((buffer, _)) = self.pushed.pop_front() {
                            buffer.free();
                        }
                    }
                    if n > 0 {
                        return Some(n);
                    }
                }
                Err(_) => {
                    // Released behind our back; nothing left to serve
                    self.pushed.pop_front();
                }
            }
        }
        None
    }
}

impl<S: StreamSource> StreamSource for PushBackSource<S> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus> {
        if dst.is_empty() {
            return Ok(ReadStatus::Data(0));
        }
        if let Some(n) = self.read_pushed(dst) {
            return Ok(ReadStatus::Data(n));
        }
        if self.terminated {
            return Ok(ReadStatus::Eof);
        }
        self.next.read(dst)
    }

    fn terminate_reads(&mut self) -> io::Result<()> {
        self.terminated = true;
        self.release_all();
        self.next.terminate_reads()
    }
}

impl<S> PushBack for PushBackSource<S> {
    fn push_back(&mut self, buffer: SharedBuffer) {
        if self.terminated {
            buffer.free();
            return;
        }
        self.pushed.push_front((buffer, 0));
    }
}

impl<S: fmt::Debug> fmt::Debug for PushBackSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushBackSource")
            .field("next", &self.next)
            .field("pushed_back", &self.pushed.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Adapts a non-blocking [`Read`] into a [`StreamSource`].
///
/// `ErrorKind::WouldBlock` maps to [`ReadStatus::WouldBlock`], `Ok(0)` to
/// [`ReadStatus::Eof`], and interrupted reads are retried.
#[derive(Debug)]
pub struct IoSource<R> {
    inner: R,
    terminated: bool,
}

impl<R> IoSource<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            terminated: false,
        }
    }

    /// Returns a reference to the wrapped reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Returns the wrapped reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> StreamSource for IoSource<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<ReadStatus> {
        if self.terminated {
            return Ok(ReadStatus::Eof);
        }
        if dst.is_empty() {
            return Ok(ReadStatus::Data(0));
        }
        loop {
            match self.inner.read(dst) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => return Ok(ReadStatus::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn terminate_reads(&mut self) -> io::Result<()> {
        self.terminated = true;
        Ok(())
    }
}
