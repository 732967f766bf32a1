// SPDX-License-Identifier: CC0-1.0

//! Sighash engines: legacy, BIP-143 (segwit v0) and BIP-341 (taproot).
//!
//! All three work straight off the backing stream, re-reading the
//! unsigned transaction's inputs and outputs as needed. The per-PSBT
//! midstate caches are populated lazily, at most once, and never
//! shared across signing operations. BIP-143 caches double-SHA-256
//! values while BIP-341 caches single-SHA-256 values, so they are
//! distinct fields.
//!
//! [BIP-143]: <https://github.com/bitcoin/bips/blob/master/bip-0143.mediawiki>
//! [BIP-341]: <https://github.com/bitcoin/bips/blob/master/bip-0341.mediawiki>

use std::io::{Read, Seek, SeekFrom};

use bitcoin::consensus::encode::serialize as consensus_serialize;
use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use bitcoin::sighash::{LegacySighash, SegwitV0Sighash, TapSighash};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Script, ScriptBuf, Sequence, TxIn, TxOut};

use crate::error::Result;
use crate::psbt::Psbt;
use crate::stream::{compact_size, var_bytes};
use crate::transaction::{read_tx_in, read_tx_out, skip_tx_ins, skip_tx_outs};

pub(crate) const SIGHASH_DEFAULT: u32 = 0x00;
pub(crate) const SIGHASH_ALL: u32 = 0x01;
pub(crate) const SIGHASH_NONE: u32 = 0x02;
pub(crate) const SIGHASH_SINGLE: u32 = 0x03;
pub(crate) const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Every sighash value we are able to sign.
pub(crate) const ALL_SIGHASH_FLAGS: [u32; 7] = [
    SIGHASH_DEFAULT,
    SIGHASH_ALL,
    SIGHASH_NONE,
    SIGHASH_SINGLE,
    SIGHASH_ALL | SIGHASH_ANYONECANPAY,
    SIGHASH_NONE | SIGHASH_ANYONECANPAY,
    SIGHASH_SINGLE | SIGHASH_ANYONECANPAY,
];

/// BIP-143 midstates, only cached for plain SIGHASH_ALL.
pub(crate) struct SegwitV0Cache {
    pub prevouts: sha256d::Hash,
    pub sequences: sha256d::Hash,
    pub outputs: sha256d::Hash,
}

/// BIP-341 midstates (single SHA-256, per the BIP).
pub(crate) struct TaprootCache {
    pub prevouts: sha256::Hash,
    pub amounts: sha256::Hash,
    pub script_pubkeys: sha256::Hash,
    pub sequences: sha256::Hash,
}

/// A serialized `TxOut` blanked to `nValue = -1`, empty script.
const BLANK_OUTPUT: [u8; 9] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

fn or_zeros(h: Option<sha256d::Hash>) -> [u8; 32] {
    match h {
        Some(h) => h.to_byte_array(),
        None => [0u8; 32],
    }
}

impl<F: Read + Seek> Psbt<F> {
    /// Reads the `idx`th input of the unsigned transaction.
    pub(crate) fn read_txin_at(&mut self, idx: usize) -> Result<TxIn> {
        self.fd.seek(SeekFrom::Start(self.vin_start))?;
        skip_tx_ins(&mut self.fd, idx as u64)?;
        read_tx_in(&mut self.fd)
    }

    /// Reads the `idx`th output of the unsigned transaction.
    pub(crate) fn read_txout_at(&mut self, idx: usize) -> Result<TxOut> {
        self.fd.seek(SeekFrom::Start(self.vout_start))?;
        skip_tx_outs(&mut self.fd, idx as u64)?;
        read_tx_out(&mut self.fd)
    }

    /// Original (pre-segwit) sighash: reserialize the whole txn with
    /// scripts blanked, the target input's scriptSig replaced, then
    /// double-SHA-256.
    pub(crate) fn make_txn_sighash(
        &mut self,
        replace_idx: usize,
        sighash_type: u32,
    ) -> Result<LegacySighash> {
        // sighash regardless of the ANYONECANPAY input part
        let out_sighash = sighash_type & 0x7f;
        let anyonecanpay = sighash_type & SIGHASH_ANYONECANPAY != 0;

        check!(!self.inputs[replace_idx].is_segwit, "legacy sighash for segwit input");
        let replacement_script = match &self.inputs[replace_idx].script_sig {
            Some(s) => s.clone(),
            None => fatal!("no scriptSig for input #{}", replace_idx),
        };

        let mut engine = sha256::Hash::engine();
        engine.input(&self.txn_version.to_le_bytes());

        let num_inputs = if anyonecanpay { 1 } else { self.num_inputs };
        engine.input(&compact_size(num_inputs as u64));

        let mut pos = self.vin_start;
        for in_idx in 0..self.num_inputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let mut txi = read_tx_in(&mut self.fd)?;
            pos = self.fd.stream_position()?;

            if in_idx == replace_idx {
                txi.script_sig = ScriptBuf::from_bytes(replacement_script.clone());
                engine.input(&consensus_serialize(&txi));
            } else if !anyonecanpay {
                if out_sighash == SIGHASH_NONE || out_sighash == SIGHASH_SINGLE {
                    // other inputs' sequences are zeroed so they can be
                    // replaced after signing
                    txi.sequence = Sequence(0);
                }
                txi.script_sig = ScriptBuf::new();
                engine.input(&consensus_serialize(&txi));
            }
        }

        if out_sighash == SIGHASH_NONE {
            engine.input(&compact_size(0));
        } else if out_sighash == SIGHASH_SINGLE {
            check!(
                replace_idx < self.num_outputs,
                "SINGLE corresponding output ({}) missing", replace_idx
            );
            engine.input(&compact_size(replace_idx as u64 + 1));
            let mut pos = self.vout_start;
            for out_idx in 0..=replace_idx {
                self.fd.seek(SeekFrom::Start(pos))?;
                let txo = read_tx_out(&mut self.fd)?;
                pos = self.fd.stream_position()?;

                if out_idx < replace_idx {
                    engine.input(&BLANK_OUTPUT);
                } else {
                    engine.input(&consensus_serialize(&txo));
                }
            }
        } else {
            check!(out_sighash == SIGHASH_ALL, "unsupported sighash");
            engine.input(&compact_size(self.num_outputs as u64));
            let mut pos = self.vout_start;
            for _ in 0..self.num_outputs {
                self.fd.seek(SeekFrom::Start(pos))?;
                let txo = read_tx_out(&mut self.fd)?;
                pos = self.fd.stream_position()?;
                engine.input(&consensus_serialize(&txo));
            }
        }

        engine.input(&self.lock_time.to_le_bytes());
        engine.input(&sighash_type.to_le_bytes());

        Ok(LegacySighash::from_raw_hash(sha256d::Hash::from_engine(engine)))
    }

    /// BIP-143 sighash for segwit v0 programs.
    pub(crate) fn make_txn_segwit_sighash(
        &mut self,
        replace_idx: usize,
        amount: u64,
        script_code: &[u8],
        sighash_type: u32,
    ) -> Result<SegwitV0Sighash> {
        let out_sighash = sighash_type & 0x7f;
        let anyonecanpay = sighash_type & SIGHASH_ANYONECANPAY != 0;

        let (hash_prevouts, hash_sequences, hash_outputs) = if sighash_type == SIGHASH_ALL
            && self.segwit_cache.is_some()
        {
            let cache = self.segwit_cache.as_ref().unwrap();
            (Some(cache.prevouts), Some(cache.sequences), Some(cache.outputs))
        } else {
            let mut prevouts = None;
            let mut sequences = None;

            if !anyonecanpay {
                let mut prevouts_eng = sha256::Hash::engine();
                let mut sequences_eng = sha256::Hash::engine();

                let mut pos = self.vin_start;
                for _ in 0..self.num_inputs {
                    self.fd.seek(SeekFrom::Start(pos))?;
                    let txi = read_tx_in(&mut self.fd)?;
                    pos = self.fd.stream_position()?;

                    prevouts_eng.input(&consensus_serialize(&txi.previous_output));
                    if out_sighash == SIGHASH_ALL {
                        sequences_eng.input(&txi.sequence.0.to_le_bytes());
                    }
                }

                prevouts = Some(sha256d::Hash::from_engine(prevouts_eng));
                if out_sighash == SIGHASH_ALL {
                    sequences = Some(sha256d::Hash::from_engine(sequences_eng));
                }
            }

            let mut outputs = None;
            if out_sighash == SIGHASH_ALL {
                let mut outputs_eng = sha256::Hash::engine();
                let mut pos = self.vout_start;
                for _ in 0..self.num_outputs {
                    self.fd.seek(SeekFrom::Start(pos))?;
                    let txo = read_tx_out(&mut self.fd)?;
                    pos = self.fd.stream_position()?;
                    outputs_eng.input(&consensus_serialize(&txo));
                }
                outputs = Some(sha256d::Hash::from_engine(outputs_eng));
            } else if out_sighash == SIGHASH_SINGLE {
                check!(
                    replace_idx < self.num_outputs,
                    "SINGLE corresponding output ({}) missing", replace_idx
                );
                let txo = self.read_txout_at(replace_idx)?;
                outputs = Some(sha256d::Hash::hash(&consensus_serialize(&txo)));
            }

            if sighash_type == SIGHASH_ALL {
                self.segwit_cache = Some(SegwitV0Cache {
                    prevouts: prevouts.unwrap(),
                    sequences: sequences.unwrap(),
                    outputs: outputs.unwrap(),
                });
            }

            (prevouts, sequences, outputs)
        };

        let replacement = self.read_txin_at(replace_idx)?;

        let mut engine = sha256::Hash::engine();
        engine.input(&self.txn_version.to_le_bytes());
        engine.input(&or_zeros(hash_prevouts));
        engine.input(&or_zeros(hash_sequences));

        engine.input(&consensus_serialize(&replacement.previous_output));

        check!(!script_code.is_empty(), "need scriptCode here");
        engine.input(script_code);

        engine.input(&amount.to_le_bytes());
        engine.input(&replacement.sequence.0.to_le_bytes());

        engine.input(&or_zeros(hash_outputs));

        engine.input(&self.lock_time.to_le_bytes());
        engine.input(&sighash_type.to_le_bytes());

        Ok(SegwitV0Sighash::from_raw_hash(sha256d::Hash::from_engine(engine)))
    }

    /// BIP-341 sighash. `leaf` carries `(script, leaf_version)` for
    /// script-path spends. Annexes are not supported.
    pub(crate) fn make_txn_taproot_sighash(
        &mut self,
        input_index: usize,
        hash_type: u32,
        leaf: Option<(&[u8], u8)>,
    ) -> Result<TapSighash> {
        let out_type = if hash_type == SIGHASH_DEFAULT { SIGHASH_ALL } else { hash_type & 3 };
        let in_type = hash_type & SIGHASH_ANYONECANPAY;

        if self.tap_cache.is_none() && in_type != SIGHASH_ANYONECANPAY {
            let mut prevouts_eng = sha256::Hash::engine();
            let mut sequences_eng = sha256::Hash::engine();
            let mut amounts_eng = sha256::Hash::engine();
            let mut scripts_eng = sha256::Hash::engine();

            let mut pos = self.vin_start;
            for in_idx in 0..self.num_inputs {
                self.fd.seek(SeekFrom::Start(pos))?;
                let txi = read_tx_in(&mut self.fd)?;
                pos = self.fd.stream_position()?;

                prevouts_eng.input(&consensus_serialize(&txi.previous_output));
                sequences_eng.input(&txi.sequence.0.to_le_bytes());

                let utxo = self.inputs[in_idx].get_utxo(&mut self.fd, txi.previous_output.vout)?;
                amounts_eng.input(&utxo.value.to_sat().to_le_bytes());
                scripts_eng.input(&var_bytes(utxo.script_pubkey.as_bytes()));
            }

            self.tap_cache = Some(TaprootCache {
                prevouts: sha256::Hash::from_engine(prevouts_eng),
                amounts: sha256::Hash::from_engine(amounts_eng),
                script_pubkeys: sha256::Hash::from_engine(scripts_eng),
                sequences: sha256::Hash::from_engine(sequences_eng),
            });
        }

        if self.tap_outputs.is_none() && out_type == SIGHASH_ALL {
            let mut outputs_eng = sha256::Hash::engine();
            let mut pos = self.vout_start;
            for _ in 0..self.num_outputs {
                self.fd.seek(SeekFrom::Start(pos))?;
                let txo = read_tx_out(&mut self.fd)?;
                pos = self.fd.stream_position()?;
                outputs_eng.input(&consensus_serialize(&txo));
            }
            self.tap_outputs = Some(sha256::Hash::from_engine(outputs_eng));
        }

        let mut msg = Vec::with_capacity(212);
        msg.push(0x00); // sighash epoch
        msg.push(hash_type as u8);
        msg.extend_from_slice(&self.txn_version.to_le_bytes());
        msg.extend_from_slice(&self.lock_time.to_le_bytes());

        if in_type != SIGHASH_ANYONECANPAY {
            let cache = self.tap_cache.as_ref().unwrap();
            msg.extend_from_slice(&cache.prevouts.to_byte_array());
            msg.extend_from_slice(&cache.amounts.to_byte_array());
            msg.extend_from_slice(&cache.script_pubkeys.to_byte_array());
            msg.extend_from_slice(&cache.sequences.to_byte_array());
        }

        if out_type == SIGHASH_ALL {
            msg.extend_from_slice(&self.tap_outputs.unwrap().to_byte_array());
        }

        // spend type: bit 0 annex (unsupported), bit 1 script path
        let spend_type: u8 = if leaf.is_some() { 2 } else { 0 };
        msg.push(spend_type);

        if in_type == SIGHASH_ANYONECANPAY {
            let txi = self.read_txin_at(input_index)?;
            let utxo = self.inputs[input_index].get_utxo(&mut self.fd, txi.previous_output.vout)?;
            msg.extend_from_slice(&consensus_serialize(&txi.previous_output));
            msg.extend_from_slice(&utxo.value.to_sat().to_le_bytes());
            msg.extend_from_slice(&var_bytes(utxo.script_pubkey.as_bytes()));
            msg.extend_from_slice(&txi.sequence.0.to_le_bytes());
        } else {
            msg.extend_from_slice(&(input_index as u32).to_le_bytes());
        }

        if out_type == SIGHASH_SINGLE {
            check!(
                input_index < self.num_outputs,
                "SINGLE corresponding output ({}) missing", input_index
            );
            let txo = self.read_txout_at(input_index)?;
            msg.extend_from_slice(&sha256::Hash::hash(&consensus_serialize(&txo)).to_byte_array());
        }

        if let Some((script, leaf_ver)) = leaf {
            let leaf_ver = match LeafVersion::from_consensus(leaf_ver) {
                Ok(v) => v,
                Err(_) => fatal!("bad tapleaf version"),
            };
            let leaf_hash = TapLeafHash::from_script(Script::from_bytes(script), leaf_ver);
            msg.extend_from_slice(&leaf_hash.to_byte_array());
            msg.push(0x00); // key version
            msg.extend_from_slice(&(-1i32).to_le_bytes()); // codesep position
        }

        let mut engine = TapSighash::engine();
        engine.input(&msg);
        Ok(TapSighash::from_engine(engine))
    }
}
