//! Payload compression for broker records.
//!
//! The encoding travels with each record (a `Content-Encoding` header on
//! NATS), so consumers can decode records from mixed producers.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Header carrying the record encoding.
pub const ENCODING_HEADER: &str = "Content-Encoding";

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(io::Error),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(io::Error),
}

/// Compression applied to a record payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
}

impl CompressionKind {
    /// Header value naming this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Gzip => "gzip",
        }
    }

    /// Parse a header value. Unknown encodings are treated as uncompressed.
    pub fn from_header(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("gzip") {
            CompressionKind::Gzip
        } else {
            CompressionKind::None
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        match self {
            CompressionKind::None => Ok(Bytes::copy_from_slice(data)),
            CompressionKind::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::fast());
                encoder
                    .write_all(data)
                    .map_err(CompressionError::CompressionFailed)?;
                let buffer = encoder
                    .finish()
                    .map_err(CompressionError::CompressionFailed)?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Bytes, CompressionError> {
        match self {
            CompressionKind::None => Ok(Bytes::copy_from_slice(data)),
            CompressionKind::Gzip => {
                let mut buffer = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut buffer)
                    .map_err(CompressionError::DecompressionFailed)?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
