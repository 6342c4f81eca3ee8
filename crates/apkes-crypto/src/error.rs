//! Error types for APKES cryptographic operations.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// MIC verification or AE decryption failed
    #[error("frame authentication failed")]
    AuthFailed,

    /// The OS entropy source failed
    #[error("random generation failed")]
    RandomFailed,
}
