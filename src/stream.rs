// SPDX-License-Identifier: CC0-1.0

//! Primitives for reading the PSBT byte stream in place.
//!
//! The container never loads large values into memory: scripts, UTXOs
//! and similar blobs are remembered as a [`Span`] into the backing
//! stream and re-read (or hashed) in small chunks when actually needed.

use std::io::{Read, Seek, SeekFrom, Write};

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};

use crate::error::Result;

/// Chunk size used when streaming a value through a hasher or copier.
const CHUNK: usize = 256;

/// A byte range inside the backing stream.
///
/// Logically a borrow of the container's stream; a span is only
/// meaningful for the stream it was recorded against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Span {
    /// Absolute offset of the first byte.
    pub pos: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Span {
    pub(crate) fn end(&self) -> u64 { self.pos + self.len }
}

/// Reads one byte, or `None` on a clean end-of-stream.
fn read_byte_or_eof<F: Read>(fd: &mut F) -> Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match fd.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub(crate) fn read_u8<F: Read>(fd: &mut F) -> Result<u8> {
    let mut b = [0u8; 1];
    fd.read_exact(&mut b)?;
    Ok(b[0])
}

pub(crate) fn read_u32_le<F: Read>(fd: &mut F) -> Result<u32> {
    let mut b = [0u8; 4];
    fd.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub(crate) fn read_i32_le<F: Read>(fd: &mut F) -> Result<i32> {
    let mut b = [0u8; 4];
    fd.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

pub(crate) fn read_u64_le<F: Read>(fd: &mut F) -> Result<u64> {
    let mut b = [0u8; 8];
    fd.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

pub(crate) fn read_bytes<F: Read>(fd: &mut F, n: usize) -> Result<Vec<u8>> {
    let mut v = vec![0u8; n];
    fd.read_exact(&mut v)?;
    Ok(v)
}

/// Decodes a Bitcoin compact-size integer.
///
/// Returns `None` when the stream ends cleanly before the first byte,
/// which the key/value parser uses as a section terminator.
pub(crate) fn read_compact_size<F: Read>(fd: &mut F) -> Result<Option<u64>> {
    let first = match read_byte_or_eof(fd)? {
        Some(b) => b,
        None => return Ok(None),
    };

    let n = match first {
        0xfd => {
            let mut b = [0u8; 2];
            fd.read_exact(&mut b)?;
            u16::from_le_bytes(b) as u64
        }
        0xfe => read_u32_le(fd)? as u64,
        0xff => read_u64_le(fd)?,
        n => n as u64,
    };
    Ok(Some(n))
}

/// Like [`read_compact_size`] but treats end-of-stream as an error.
pub(crate) fn read_compact_size_req<F: Read>(fd: &mut F) -> Result<u64> {
    match read_compact_size(fd)? {
        Some(n) => Ok(n),
        None => fatal!("eof"),
    }
}

/// Encodes a compact-size integer.
pub(crate) fn compact_size(n: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(9);
    if n < 0xfd {
        v.push(n as u8);
    } else if n <= 0xffff {
        v.push(0xfd);
        v.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        v.push(0xfe);
        v.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        v.push(0xff);
        v.extend_from_slice(&n.to_le_bytes());
    }
    v
}

/// Length-prefixed byte string (compact size, then the bytes).
pub(crate) fn var_bytes(data: &[u8]) -> Vec<u8> {
    let mut v = compact_size(data.len() as u64);
    v.extend_from_slice(data);
    v
}

/// Streams a span of the file through a SHA-256 engine.
///
/// Only `CHUNK` bytes are resident at a time regardless of the span
/// length. The caller's position in the stream is clobbered.
pub(crate) fn hash_span_into<F: Read + Seek>(
    fd: &mut F,
    span: Span,
    engine: &mut sha256::HashEngine,
) -> Result<()> {
    let mut scratch = [0u8; CHUNK];
    fd.seek(SeekFrom::Start(span.pos))?;

    let mut remaining = span.len;
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        fd.read_exact(&mut scratch[..want])?;
        engine.input(&scratch[..want]);
        remaining -= want as u64;
    }
    Ok(())
}

/// Double-SHA-256 of a span of the file, without loading it.
pub(crate) fn hash256_span<F: Read + Seek>(fd: &mut F, span: Span) -> Result<sha256d::Hash> {
    let mut engine = sha256::Hash::engine();
    hash_span_into(fd, span, &mut engine)?;
    Ok(sha256d::Hash::from_engine(engine))
}

/// Reads a span of the file into memory.
pub(crate) fn read_span<F: Read + Seek>(fd: &mut F, span: Span) -> Result<Vec<u8>> {
    fd.seek(SeekFrom::Start(span.pos))?;
    read_bytes(fd, span.len as usize)
}

/// Copies a span of the file into a writer, in small chunks.
pub(crate) fn copy_span<F: Read + Seek, W: Write>(
    fd: &mut F,
    span: Span,
    out: &mut W,
) -> Result<()> {
    let mut scratch = [0u8; 64];
    fd.seek(SeekFrom::Start(span.pos))?;

    let mut remaining = span.len;
    while remaining > 0 {
        let want = remaining.min(64) as usize;
        fd.read_exact(&mut scratch[..want])?;
        out.write_all(&scratch[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}
