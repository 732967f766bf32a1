// SPDX-License-Identifier: CC0-1.0

//! Skeleton parsing of the embedded unsigned transaction.
//!
//! The unsigned transaction inside a PSBT can be bigger than all the
//! RAM we have, so it is never deserialized whole. We walk it once to
//! learn the vector offsets and counts, then re-read single `TxIn`s and
//! `TxOut`s on demand.

use std::io::{Read, Seek, SeekFrom};

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

use crate::error::Result;
use crate::stream::{
    self, hash256_span, hash_span_into, read_compact_size_req, read_i32_le, read_u32_le,
    read_u64_le, Span,
};

/// Offsets and counts discovered inside the unsigned transaction.
#[derive(Debug, Copy, Clone)]
pub(crate) struct TxSkeleton {
    /// Transaction nVersion (consensus allows only 1 or 2 here).
    pub version: i32,
    /// True iff the serialization carried the segwit marker.
    pub had_witness: bool,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Offset of the first `TxIn`.
    pub vin_start: u64,
    /// Offset of the first `TxOut`.
    pub vout_start: u64,
    /// Offset of the witness stacks, when present.
    pub wit_start: Option<u64>,
    pub lock_time: u32,
}

/// Skips over `n` serialized `TxIn`s, returning the starting offset.
pub(crate) fn skip_tx_ins<F: Read + Seek>(fd: &mut F, n: u64) -> Result<u64> {
    let start = fd.stream_position()?;
    for _ in 0..n {
        // outpoint
        fd.seek(SeekFrom::Current(36))?;
        let script_len = read_compact_size_req(fd)?;
        // script plus sequence
        fd.seek(SeekFrom::Current(script_len as i64 + 4))?;
    }
    Ok(start)
}

/// Skips over `n` serialized `TxOut`s, returning the starting offset.
pub(crate) fn skip_tx_outs<F: Read + Seek>(fd: &mut F, n: u64) -> Result<u64> {
    let start = fd.stream_position()?;
    for _ in 0..n {
        fd.seek(SeekFrom::Current(8))?;
        let script_len = read_compact_size_req(fd)?;
        fd.seek(SeekFrom::Current(script_len as i64))?;
    }
    Ok(start)
}

/// Skips over `n` witness stacks, returning the starting offset.
pub(crate) fn skip_witnesses<F: Read + Seek>(fd: &mut F, n: u64) -> Result<u64> {
    let start = fd.stream_position()?;
    for _ in 0..n {
        let items = read_compact_size_req(fd)?;
        for _ in 0..items {
            let len = read_compact_size_req(fd)?;
            fd.seek(SeekFrom::Current(len as i64))?;
        }
    }
    Ok(start)
}

/// Reads a single `TxIn` at the current position.
pub(crate) fn read_tx_in<F: Read + Seek>(fd: &mut F) -> Result<TxIn> {
    let mut txid = [0u8; 32];
    fd.read_exact(&mut txid)?;
    let vout = read_u32_le(fd)?;
    let script_len = read_compact_size_req(fd)?;
    let script_sig = stream::read_bytes(fd, script_len as usize)?;
    let sequence = read_u32_le(fd)?;

    Ok(TxIn {
        previous_output: OutPoint { txid: Txid::from_byte_array(txid), vout },
        script_sig: ScriptBuf::from_bytes(script_sig),
        sequence: Sequence(sequence),
        witness: Witness::new(),
    })
}

/// Reads a single `TxOut` at the current position.
pub(crate) fn read_tx_out<F: Read + Seek>(fd: &mut F) -> Result<TxOut> {
    let value = read_u64_le(fd)?;
    let script_len = read_compact_size_req(fd)?;
    let script = stream::read_bytes(fd, script_len as usize)?;

    Ok(TxOut { value: Amount::from_sat(value), script_pubkey: ScriptBuf::from_bytes(script) })
}

/// Reads a single witness stack at the current position.
pub(crate) fn read_witness<F: Read + Seek>(fd: &mut F) -> Result<Witness> {
    let items = read_compact_size_req(fd)?;
    let mut stack = Vec::with_capacity(items as usize);
    for _ in 0..items {
        let len = read_compact_size_req(fd)?;
        stack.push(stream::read_bytes(fd, len as usize)?);
    }
    Ok(Witness::from_slice(&stack))
}

impl TxSkeleton {
    /// Semi-parses the unsigned transaction found at `span`.
    ///
    /// Only the counts, offsets and lock time are captured; nothing
    /// else is materialized.
    pub(crate) fn parse<F: Read + Seek>(fd: &mut F, span: Span) -> Result<Self> {
        fd.seek(SeekFrom::Start(span.pos))?;

        let version = read_i32_le(fd)?;
        let marker = stream::read_u8(fd)?;
        let flags = stream::read_u8(fd)?;
        let had_witness = marker == 0 && flags != 0;

        check!(version == 1 || version == 2, "bad txn version");

        if !had_witness {
            fd.seek(SeekFrom::Current(-2))?;
        }

        let num_in = read_compact_size_req(fd)?;
        check!(num_in > 0, "no ins?");

        let vin_start = skip_tx_ins(fd, num_in)?;
        let num_out = read_compact_size_req(fd)?;
        let vout_start = skip_tx_outs(fd, num_out)?;

        let wit_start =
            if had_witness { Some(skip_witnesses(fd, num_in)?) } else { None };

        let lock_time = read_u32_le(fd)?;
        check!(fd.stream_position()? == span.end(), "txn read end wrong");

        Ok(TxSkeleton {
            version,
            had_witness,
            num_inputs: num_in as usize,
            num_outputs: num_out as usize,
            vin_start,
            vout_start,
            wit_start,
            lock_time,
        })
    }
}

/// Computes the TXID of a transaction serialized at `span`.
///
/// Detects witness vs. legacy encoding by itself. For legacy encodings
/// the TXID is a straight double-SHA-256 of the whole region; witness
/// encodings hash `version || vin || vout || lock_time`, with the body
/// region either provided by the caller or rediscovered by re-skipping
/// the vectors.
pub(crate) fn calc_txid<F: Read + Seek>(
    fd: &mut F,
    span: Span,
    body: Option<Span>,
) -> Result<Txid> {
    fd.seek(SeekFrom::Start(span.pos))?;

    let version = read_i32_le(fd)?;
    let marker = stream::read_u8(fd)?;
    let flags = stream::read_u8(fd)?;
    let has_witness = marker == 0 && flags != 0;

    if !has_witness {
        // txid == wtxid
        return Ok(Txid::from_raw_hash(hash256_span(fd, span)?));
    }

    let mut engine = sha256::Hash::engine();
    engine.input(&version.to_le_bytes());

    let body = match body {
        Some(b) => b,
        None => {
            let start = fd.stream_position()?;
            let num_in = read_compact_size_req(fd)?;
            skip_tx_ins(fd, num_in)?;
            let num_out = read_compact_size_req(fd)?;
            skip_tx_outs(fd, num_out)?;
            Span { pos: start, len: fd.stream_position()? - start }
        }
    };

    hash_span_into(fd, body, &mut engine)?;

    // last four bytes are the lock time
    fd.seek(SeekFrom::Start(span.end() - 4))?;
    let mut lock_time = [0u8; 4];
    fd.read_exact(&mut lock_time)?;
    engine.input(&lock_time);

    Ok(Txid::from_raw_hash(sha256d::Hash::from_engine(engine)))
}

/// Encodes `data` as a scriptSig push (handles the OP_PUSHDATA forms).
pub(crate) fn push_data(data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(data.len() + 3);
    match data.len() {
        n if n <= 75 => v.push(n as u8),
        n if n <= 255 => {
            v.push(0x4c); // OP_PUSHDATA1
            v.push(n as u8);
        }
        n => {
            v.push(0x4d); // OP_PUSHDATA2
            v.extend_from_slice(&(n as u16).to_le_bytes());
        }
    }
    v.extend_from_slice(data);
    v
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bitcoin::consensus::deserialize;
    use bitcoin::Transaction;

    use super::*;

    // One input, two outputs, no witness.
    const LEGACY_TX: &str = "0100000001a2e1a7bbb9e7b45c0e1a1f2c5c387663e3d4d2a8c92c3e2bba8747f\
        3cb0e8a47000000006a47304402200e4a1c6ecb7c291d9b74b3eb2c1f24b9c5f2ab0535cb0b6b9d40bdb814a1\
        33d502202cfa5564812a2084d5fc3b0e5a7ba3e1b81d7c1f2b3ab7302f1a2cdbcba0c1cf012103a1af804ac10\
        8a8a64245a1cb84c9b2e2db2ea938a0a68a1e34b9e4b7a4aa6c9cfeffffff0240420f00000000001976a91446\
        5a8297357ab68cbea01ab54f6cd1522a2b551188ac5009a118000000001976a914f6e81e2d5252aa85b432d0d\
        902e9402bc4c5d35188ac00000000";

    fn legacy_tx_bytes() -> Vec<u8> {
        hex::decode(LEGACY_TX.replace(' ', "")).unwrap()
    }

    #[test]
    fn skeleton_of_legacy_txn() {
        let raw = legacy_tx_bytes();
        let mut fd = Cursor::new(&raw);
        let skel =
            TxSkeleton::parse(&mut fd, Span { pos: 0, len: raw.len() as u64 }).unwrap();

        assert_eq!(skel.version, 1);
        assert!(!skel.had_witness);
        assert_eq!(skel.num_inputs, 1);
        assert_eq!(skel.num_outputs, 2);
        assert_eq!(skel.vin_start, 5);
        assert_eq!(skel.lock_time, 0);
    }

    #[test]
    fn txid_agrees_with_rust_bitcoin() {
        let raw = legacy_tx_bytes();
        let tx: Transaction = deserialize(&raw).unwrap();

        let mut fd = Cursor::new(&raw);
        let txid = calc_txid(&mut fd, Span { pos: 0, len: raw.len() as u64 }, None).unwrap();
        assert_eq!(txid, tx.compute_txid());
    }

    #[test]
    fn txid_stable_across_encodings() {
        // Same logical txn, serialized with and without the witness
        // marker (empty witness stacks), must produce one TXID.
        let raw = legacy_tx_bytes();
        let tx: Transaction = deserialize(&raw).unwrap();

        let mut witness_enc = Vec::new();
        witness_enc.extend_from_slice(&raw[..4]);
        witness_enc.extend_from_slice(&[0x00, 0x01]);
        witness_enc.extend_from_slice(&raw[4..raw.len() - 4]);
        witness_enc.push(0x00); // one empty witness stack
        witness_enc.extend_from_slice(&raw[raw.len() - 4..]);

        let mut fd = Cursor::new(&witness_enc);
        let txid =
            calc_txid(&mut fd, Span { pos: 0, len: witness_enc.len() as u64 }, None).unwrap();
        assert_eq!(txid, tx.compute_txid());
    }

    #[test]
    fn single_tx_out_read() {
        let raw = legacy_tx_bytes();
        let tx: Transaction = deserialize(&raw).unwrap();

        let mut fd = Cursor::new(&raw);
        let skel =
            TxSkeleton::parse(&mut fd, Span { pos: 0, len: raw.len() as u64 }).unwrap();

        fd.seek(SeekFrom::Start(skel.vout_start)).unwrap();
        let out0 = read_tx_out(&mut fd).unwrap();
        let out1 = read_tx_out(&mut fd).unwrap();
        assert_eq!(out0, tx.output[0]);
        assert_eq!(out1, tx.output[1]);
    }

    #[test]
    fn push_data_forms() {
        assert_eq!(push_data(&[0xab; 4])[0], 4);
        assert_eq!(push_data(&[0xab; 76])[..2], [0x4c, 76]);
        assert_eq!(push_data(&[0xab; 300])[..3], [0x4d, 0x2c, 0x01]);
    }
}
