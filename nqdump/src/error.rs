use std::io;

use base64::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("not a recognized container (bad magic)")]
    FormatMismatch,
    #[error("input truncated while reading {0}")]
    Truncated(&'static str),
    #[error("decryption failed: {0}")]
    Crypto(String),
    #[error("malformed metadata: {0}")]
    MetadataMalformed(String),
    #[error("no valid mflac key found in the first 0x8000 bytes")]
    KeyRecoveryFailed,
    #[error("cover fetch failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] DecodeError),
    #[error("tagging error: {0}")]
    Tag(String),
    #[error("unsupported format: {extension}")]
    Unsupported { extension: String },
}

impl DumpError {
    /// Map a short read to [`DumpError::Truncated`], keeping other I/O errors intact.
    pub(crate) fn from_read(err: io::Error, field: &'static str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated(field)
        } else {
            Self::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, DumpError>;
