//! Binary codec for wire records.
//!
//! All packet fields are serialized with bincode using a single fixed
//! configuration: `standard()` with fixed-width integers. Fixed widths keep
//! record sizes deterministic, which packet building relies on when it
//! decides whether another record still fits in the datagram.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    Encode {
        /// The underlying bincode error, as text. Bincode errors are opaque
        /// and only expose a `Display` implementation.
        message: String,
    },
    /// The decoding operation failed, usually meaning a truncated or
    /// corrupted record.
    Decode {
        /// The underlying bincode error, as text.
        message: String,
    },
    /// The provided output buffer has no room for the record.
    BufferTooSmall {
        /// The buffer size that was provided.
        provided: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "encoding failed: {message}"),
            Self::Decode { message } => write!(f, "decoding failed: {message}"),
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
///
/// Allocates; packet building uses [`encode_into`] on a reused scratch
/// buffer instead.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Encodes a value into an existing byte slice, returning the number of
/// bytes written.
///
/// # Errors
///
/// Returns [`CodecError::BufferTooSmall`] when the value does not fit;
/// packet building uses that outcome to close out the current datagram and
/// carry the record over to the next one.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            provided: buffer.len(),
        },
        other => CodecError::Encode {
            message: other.to_string(),
        },
    })
}

/// Encodes a value by appending to a `Vec<u8>`, returning the number of
/// bytes appended.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::Encode {
            message: e.to_string(),
        })
}

/// Decodes a value from the front of a byte slice, returning it with the
/// number of bytes consumed so the caller can continue parsing the rest of
/// the datagram.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on truncated or malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}
