//! Encryption error types

use thiserror::Error;

/// Errors raised by the encryption service
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("ciphertext failed to decrypt or authenticate")]
    DecryptError,

    #[error("ciphertext is not valid base64")]
    MalformedCiphertext,

    #[error("ciphertext is shorter than the minimum nonce + tag length")]
    Truncated,

    #[error("unknown encryption scheme version {0}")]
    UnknownVersion(u8),

    #[error("encryption key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Result alias using crypto Error
pub type Result<T> = std::result::Result<T, Error>;
