//! Byte-channel adapter and bulk transfers.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::chunked::ChunkedSourceConduit;
use super::source::{PushBack, ReadStatus, StreamSource};
use crate::buffer::Pooled;
use crate::error::Result;

/// An [`io::Read`] view of a [`ChunkedSourceConduit`].
///
/// [`ReadStatus::Eof`] reads as `Ok(0)` and [`ReadStatus::WouldBlock`] as
/// an `ErrorKind::WouldBlock` error. Conduit errors are carried inside the
/// `io::Error` and come back out unchanged through `ConduitError::from`.
///
/// # Example
///
/// ```
/// use std::io::Read;
/// use dechunkrs::{BufferPool, ChunkedSourceConduit, ConduitConfig, IoSource, PushBackSource};
///
/// let wire = &b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n"[..];
/// let config = ConduitConfig::default();
/// let mut conduit = ChunkedSourceConduit::new(
///     PushBackSource::new(IoSource::new(wire)),
///     BufferPool::new(&config),
///     &config,
/// );
///
/// let mut body = String::new();
/// conduit.as_reader().read_to_string(&mut body)?;
/// assert_eq!(body, "foobar");
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct ConduitReader<'a, S> {
    conduit: &'a mut ChunkedSourceConduit<S>,
}

impl<S> ChunkedSourceConduit<S> {
    /// Borrows the conduit as an [`io::Read`].
    pub fn as_reader(&mut self) -> ConduitReader<'_, S> {
        ConduitReader { conduit: self }
    }
}

impl<S: StreamSource + PushBack> Read for ConduitReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conduit.read(buf)? {
            ReadStatus::Data(n) => Ok(n),
            ReadStatus::Eof => Ok(0),
            ReadStatus::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

impl<S: StreamSource + PushBack> ChunkedSourceConduit<S> {
    /// Moves up to `count` payload bytes into `target`, staged through `through`.
    ///
    /// Stops early when the body ends or upstream would block. Returns the
    /// number of bytes written to `target`.
    ///
    /// # Errors
    ///
    /// Any error of [`read`](Self::read), or a write failure of `target`.
    pub fn transfer_to<W: Write + ?Sized>(
        &mut self,
        count: u64,
        through: &mut [u8],
        target: &mut W,
    ) -> Result<u64> {
        let mut reader = self.as_reader();
        let mut total = 0u64;

        while total < count && !through.is_empty() {
            let want = usize::try_from(count - total)
                .map_or(through.len(), |left| left.min(through.len()));
            let n = match reader.read(&mut through[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            target.write_all(&through[..n])?;
            total += n as u64;
        }

        Ok(total)
    }

    /// Writes up to `count` payload bytes into `target` starting at `position`.
    ///
    /// A pooled buffer is used as scratch space. The target's cursor is left
    /// after the last byte written.
    ///
    /// # Errors
    ///
    /// Same as [`transfer_to`](Self::transfer_to), plus seek failures.
    pub fn transfer_to_file<W: Write + Seek + ?Sized>(
        &mut self,
        position: u64,
        count: u64,
        target: &mut W,
    ) -> Result<u64> {
        target.seek(SeekFrom::Start(position))?;
        let mut scratch = self.pool().allocate();
        let transferred = self.transfer_to(count, scratch.spare_mut(), target);
        scratch.free();
        transferred
    }
}
