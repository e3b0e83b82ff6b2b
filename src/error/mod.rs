//! Error types for dechunkrs.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ConduitError> = std::result::Result<T, E>;

/// Errors that can occur while decoding a chunked body or managing its buffers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConduitError {
    /// The chunk-size line, a chunk terminator or a trailer line could not be parsed.
    #[error("malformed chunked body: {reason}")]
    MalformedChunk {
        /// What was wrong with the framing.
        reason: &'static str,
    },

    /// The upstream source ended before the terminal chunk, or this conduit was
    /// force-closed by an earlier size violation.
    #[error("channel closed")]
    ClosedChannel,

    /// Payload bytes exceeded the configured maximum entity size.
    #[error("request entity too large: limit is {limit} bytes")]
    EntityTooLarge {
        /// The configured maximum entity size.
        limit: i64,
    },

    /// Reads were terminated before the chunked body was fully decoded.
    #[error("chunked channel closed mid chunk")]
    MidChunkClose,

    /// A reference was taken on a pooled object that was already released.
    #[error("object was already freed")]
    ObjectWasFreed,

    /// Invalid configuration parameter.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of what was invalid.
        message: &'static str,
    },

    /// An I/O error occurred in the upstream source or a transfer target.
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl ConduitError {
    pub(crate) const fn malformed(reason: &'static str) -> Self {
        Self::MalformedChunk { reason }
    }
}

impl From<io::Error> for ConduitError {
    /// Unwraps errors that were produced from a `ConduitError` by the
    /// `io::Read` adapter, so the original variant survives a round trip.
    fn from(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<ConduitError>()) {
            return Self::Io(e);
        }

        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<ConduitError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Io(io::Error::new(kind, other)),
            None => Self::Io(kind.into()),
        }
    }
}

impl From<ConduitError> for io::Error {
    fn from(e: ConduitError) -> Self {
        match e {
            ConduitError::Io(inner) => inner,
            other => {
                let kind = match &other {
                    ConduitError::MalformedChunk { .. } => io::ErrorKind::InvalidData,
                    ConduitError::ClosedChannel | ConduitError::MidChunkClose => {
                        io::ErrorKind::UnexpectedEof
                    }
                    ConduitError::InvalidConfig { .. } => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}
