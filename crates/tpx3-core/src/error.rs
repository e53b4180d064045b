//! Error types for the detector driver.
//!
//! [`Tpx3Error`] consolidates every failure the acquisition engine can
//! report. The variants fall into three categories with different
//! recovery policies:
//!
//! 1. **Configuration errors** (`Config`, `ByteWidth`, `BufferSize`) -
//!    fatal, rejected before a measurement starts.
//! 2. **Transport errors** (`Transport`, `Io`) - recoverable: the driver
//!    constructs in a degraded offline state, and a failed start leaves
//!    the controller idle rather than streaming.
//! 3. **Stream errors** (`Framing`, `Decode`) - recovered locally by the
//!    reader loop: the offending record or chunk is dropped and the
//!    session continues. They never terminate a session by themselves.
//!
//! `State` errors cover misuse of the controller lifecycle; stop on an
//! idle controller is a no-op, so only start-path conflicts surface here.

use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, Tpx3Error>;

/// Primary error type for the detector driver.
#[derive(Error, Debug)]
pub enum Tpx3Error {
    /// Semantic configuration error caught before a measurement starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Element byte width outside the supported set {1, 2, 4, 8}.
    #[error("Unsupported element byte width: {0} (expected 1, 2, 4 or 8)")]
    ByteWidth(u8),

    /// An allocation request was empty or exceeded the hard ceiling.
    #[error("Buffer of {bytes} bytes outside allowed range (1..={max})")]
    BufferSize { bytes: usize, max: usize },

    /// Control-plane or data-plane transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire header could not be located or failed its size assertions.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Malformed numeric payload in a stream chunk.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation invalid for the current controller state.
    #[error("State error: {0}")]
    State(String),

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Tpx3Error {
    /// Whether the reader loop may drop the offending data and continue.
    ///
    /// Framing and decode failures are per-record conditions; everything
    /// else ends the session or the operation that raised it.
    pub fn is_stream_recoverable(&self) -> bool {
        matches!(self, Tpx3Error::Framing(_) | Tpx3Error::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Tpx3Error::ByteWidth(3);
        assert_eq!(
            err.to_string(),
            "Unsupported element byte width: 3 (expected 1, 2, 4 or 8)"
        );
    }

    #[test]
    fn recoverability_split() {
        assert!(Tpx3Error::Framing("short header".into()).is_stream_recoverable());
        assert!(Tpx3Error::Decode("trailing bytes".into()).is_stream_recoverable());
        assert!(!Tpx3Error::Transport("refused".into()).is_stream_recoverable());
        assert!(!Tpx3Error::Config("zero scan size".into()).is_stream_recoverable());
    }
}
