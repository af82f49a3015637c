//! Compression adapter: wraps archive streams with a selectable codec.
//! Purely a pass-through transform; the codec is picked by the caller
//! (typically whatever the cache advertises for an entry).

use std::io::{self, Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::SyncError;
use crate::store_path::StorePath;

/// Wire codec for compressed archives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    #[default]
    Xz,
}

impl Compression {
    /// Codec name as advertised on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        }
    }

    /// Parse a codec name (accepts common aliases and file extensions).
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            "xz" | "lzma" => Ok(Compression::Xz),
            other => Err(format!("unknown compression type '{}'", other)),
        }
    }

    /// Wrap a writer so bytes written to the result come out compressed.
    pub fn writer<W: Write>(&self, inner: W) -> Encoder<W> {
        match self {
            Compression::None => Encoder::None(inner),
            Compression::Gzip => Encoder::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
            Compression::Bzip2 => Encoder::Bzip2(BzEncoder::new(inner, bzip2::Compression::default())),
            Compression::Xz => Encoder::Xz(XzEncoder::new(inner, 6)),
        }
    }

    /// Wrap a reader so reads from the result come out decompressed.
    /// Malformed input surfaces as read errors, never silent truncation.
    pub fn reader<'a, R: Read + 'a>(&self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            Compression::None => Box::new(inner),
            Compression::Gzip => Box::new(GzDecoder::new(inner)),
            Compression::Bzip2 => Box::new(BzDecoder::new(inner)),
            Compression::Xz => Box::new(XzDecoder::new(inner)),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming compressing writer; `finish` flushes codec trailers.
pub enum Encoder<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Finish the compressed stream and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::None(w) => Ok(w),
            Encoder::Gzip(e) => e.finish(),
            Encoder::Bzip2(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::None(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Bzip2(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::None(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Bzip2(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
        }
    }
}

/// Compress a full payload in memory (transfer pipeline convenience).
pub fn compress(path: &StorePath, bytes: &[u8], codec: Compression) -> Result<Vec<u8>, SyncError> {
    let mut encoder = codec.writer(Vec::new());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| SyncError::io("compress", Some(&path.render()), e))
}

/// Decompress a full payload in memory. Malformed or truncated input fails
/// with `Decompression` for the owning path.
pub fn decompress(path: &StorePath, bytes: &[u8], codec: Compression) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    codec
        .reader(bytes)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::Decompression {
            path: path.render(),
            source: e.to_string(),
        })?;
    Ok(out)
}
