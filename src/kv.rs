// SPDX-License-Identifier: CC0-1.0

//! Generic reader for the PSBT key/value record format.
//!
//! Each section is a run of `varint(keylen) || key || varint(vallen) ||
//! value` records terminated by a zero-length key. Per key type one of
//! three storage disciplines applies:
//!
//! - `NO_KEYS`: the key must be exactly the type byte;
//! - `SHORT_VALUES`: the value is small and read into memory;
//! - everything else: the value is remembered as a [`Span`] and
//!   skipped.
//!
//! Unknown key types are stashed verbatim; a duplicate key anywhere in
//! a section is fatal.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::stream::{
    compact_size, copy_span, read_bytes, read_compact_size, read_compact_size_req, Span,
};

/// PSBT proprietary key type.
pub(crate) const PSBT_PROPRIETARY: u8 = 0xfc;

/// Proprietary identifier we recognize (output attestations).
pub(crate) const PROP_CK_ID: &[u8] = b"COINKITE";

/// Proprietary subtype for attestation entries.
pub(crate) const PROP_ATTESTATION_SUBTYPE: u64 = 0;

/// A stored value: either a range of the backing stream or bytes we
/// created ourselves (signatures added during signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Span(Span),
    Bytes(Vec<u8>),
}

impl Value {
    pub(crate) fn len(&self) -> u64 {
        match self {
            Value::Span(s) => s.len,
            Value::Bytes(b) => b.len() as u64,
        }
    }
}

/// One PSBT section (globals, an input, or an output).
pub(crate) trait Section {
    /// Key types whose value is read into memory at parse time.
    const SHORT_VALUES: &'static [u8] = &[];
    /// Key types that must not carry key data beyond the type byte.
    const NO_KEYS: &'static [u8] = &[];

    /// Stores one record. `key` excludes the leading type byte.
    fn store(&mut self, key_type: u8, key: &[u8], value: Value) -> Result<()>;
}

/// Reads records until the zero-key terminator (or end of stream).
pub(crate) fn parse_section<F: Read + Seek, S: Section>(fd: &mut F, section: &mut S) -> Result<()> {
    loop {
        let key_len = match read_compact_size(fd)? {
            None | Some(0) => break,
            Some(n) => n,
        };

        let key = read_bytes(fd, key_len as usize)?;
        let val_len = read_compact_size_req(fd)?;

        let key_type = key[0];

        if S::NO_KEYS.contains(&key_type) {
            check!(key.len() == 1, "not expecting key");
        }

        if S::SHORT_VALUES.contains(&key_type) {
            let actual = read_bytes(fd, val_len as usize)?;
            section.store(key_type, &key[1..], Value::Bytes(actual))?;
        } else {
            let span = Span { pos: fd.stream_position()?, len: val_len };
            fd.seek(SeekFrom::Current(val_len as i64))?;
            section.store(key_type, &key[1..], Value::Span(span))?;
        }
    }
    Ok(())
}

/// Serializes one key/value record, copying span values out of the
/// original stream.
pub(crate) fn write_kv<F: Read + Seek, W: Write>(
    out: &mut W,
    fd: &mut F,
    key_type: u8,
    key: &[u8],
    value: &Value,
) -> Result<()> {
    out.write_all(&compact_size(1 + key.len() as u64))?;
    out.write_all(&[key_type])?;
    out.write_all(key)?;

    match value {
        Value::Span(span) => {
            out.write_all(&compact_size(span.len))?;
            copy_span(fd, *span, out)?;
        }
        Value::Bytes(b) => {
            out.write_all(&compact_size(b.len() as u64))?;
            out.write_all(b)?;
        }
    }
    Ok(())
}

/// Serializes a classic derivation record from its parsed form (the
/// zero-XFP substitution is therefore visible in our output).
pub(crate) fn write_keypath_kv<W: Write>(
    out: &mut W,
    key_type: u8,
    key: &[u8],
    keypath: &crate::keypath::Keypath,
) -> Result<()> {
    out.write_all(&compact_size(1 + key.len() as u64))?;
    out.write_all(&[key_type])?;
    out.write_all(key)?;

    out.write_all(&compact_size((1 + keypath.steps.len()) as u64 * 4))?;
    out.write_all(&keypath.xfp.to_le_bytes())?;
    for step in &keypath.steps {
        out.write_all(&step.to_le_bytes())?;
    }
    Ok(())
}

/// Serializes a taproot derivation record (leaf hashes, then origin).
pub(crate) fn write_tap_keypath_kv<W: Write>(
    out: &mut W,
    key_type: u8,
    key: &[u8],
    tap: &crate::keypath::TapKeypath,
) -> Result<()> {
    out.write_all(&compact_size(1 + key.len() as u64))?;
    out.write_all(&[key_type])?;
    out.write_all(key)?;

    let mut value = compact_size(tap.leaf_hashes.len() as u64);
    for lh in &tap.leaf_hashes {
        value.extend_from_slice(lh);
    }
    value.extend_from_slice(&tap.origin.xfp.to_le_bytes());
    for step in &tap.origin.steps {
        value.extend_from_slice(&step.to_le_bytes());
    }

    out.write_all(&compact_size(value.len() as u64))?;
    out.write_all(&value)?;
    Ok(())
}

/// Decodes a proprietary (0xFC) key into identifier, subtype, keydata.
pub(crate) fn decode_prop_key(key: &[u8]) -> Result<(Vec<u8>, u64, Vec<u8>)> {
    let mut fd = std::io::Cursor::new(key);
    let id_len = read_compact_size_req(&mut fd)?;
    let identifier = read_bytes(&mut fd, id_len as usize)?;
    let subtype = read_compact_size_req(&mut fd)?;
    let mut keydata = Vec::new();
    fd.read_to_end(&mut keydata)?;
    Ok((identifier, subtype, keydata))
}

/// Encodes a proprietary (0xFC) key.
pub(crate) fn encode_prop_key(identifier: &[u8], subtype: u64, keydata: &[u8]) -> Vec<u8> {
    let mut key = compact_size(identifier.len() as u64);
    key.extend_from_slice(identifier);
    key.extend_from_slice(&compact_size(subtype));
    key.extend_from_slice(keydata);
    key
}
