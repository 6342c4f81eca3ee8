//! Error types for the APKES core.
//!
//! The protocol has no fatal errors: adversarial or malformed input is
//! dropped, and [`Discard`] names the reason for the debug log.

use thiserror::Error;

/// Command-frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload shorter than the fixed layout requires
    #[error("frame too short: expected {expected}, got {actual}")]
    TooShort {
        /// Expected payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Payload length does not match the fixed layout
    #[error("unexpected frame length: expected {expected}, got {actual}")]
    UnexpectedLength {
        /// Expected payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Unknown command-frame identifier byte
    #[error("unknown command identifier: {0:#04x}")]
    UnknownIdentifier(u8),
}

/// Why an incoming frame was dropped.
///
/// Every variant is a silent drop on the wire; the reason only reaches
/// the debug log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Discard {
    /// Neighbor pool or wait-timer pool is full
    #[error("capacity exhausted")]
    CapacityExhausted,

    /// MIC verification or decryption failed
    #[error("crypto reject")]
    CryptoReject,

    /// Anti-replay window rejected the frame counter
    #[error("replayed frame")]
    Replay,

    /// The keying scheme has no secret for this peer
    #[error("no scheme secret for peer")]
    SchemeNoSecret,

    /// Sender already known (duplicate HELLO) or not known when required
    #[error("unexpected sender")]
    UnexpectedSender,

    /// Sender is in the wrong life stage for this frame
    #[error("bad neighbor state")]
    BadState,

    /// Payload does not decode
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
}
