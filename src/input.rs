// SPDX-License-Identifier: CC0-1.0

//! Per-input state of the PSBT: parse, validate, resolve the UTXO and
//! decide which of our keys (if any) signs it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Script, TxIn, TxOut, Txid};

use crate::error::{Error, Result};
use crate::keypath::{parse_subpaths, parse_taproot_subpaths, Keypath, TapKeypath};
use crate::kv::{self, Section, Value};
use crate::script::{classify, disassemble_multisig_mn, disassemble_multisig_mn_tr, taptweak, AddressType};
use crate::stream::{read_span, var_bytes, Span};
use crate::transaction::{calc_txid, read_tx_out, skip_tx_ins, skip_tx_outs};
use crate::wallet::{MultisigRegistry, MultisigWallet};
use crate::Warning;

const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
const PSBT_IN_SIGHASH_TYPE: u8 = 0x03;
const PSBT_IN_REDEEM_SCRIPT: u8 = 0x04;
const PSBT_IN_WITNESS_SCRIPT: u8 = 0x05;
const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;
const PSBT_IN_FINAL_SCRIPTSIG: u8 = 0x07;
const PSBT_IN_FINAL_SCRIPTWITNESS: u8 = 0x08;
const PSBT_IN_TAP_KEY_SIG: u8 = 0x13;
const PSBT_IN_TAP_SCRIPT_SIG: u8 = 0x14;
const PSBT_IN_TAP_LEAF_SCRIPT: u8 = 0x15;
const PSBT_IN_TAP_BIP32_DERIVATION: u8 = 0x16;
const PSBT_IN_TAP_INTERNAL_KEY: u8 = 0x17;
const PSBT_IN_TAP_MERKLE_ROOT: u8 = 0x18;

/// Which key(s) will sign this input.
///
/// Simple inputs need exactly one pubkey; multisig and tapscript
/// inputs carry the set of our candidate keys (master fingerprints are
/// not guaranteed unique, so there can be more than one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequiredKey {
    Single(Vec<u8>),
    Multi(BTreeSet<Vec<u8>>),
}

/// Everything we track about one PSBT input.
///
/// Large values stay in the backing stream as [`Span`]s; only small
/// decisions and parsed key paths live in memory.
#[derive(Debug, Default)]
pub struct InputProxy {
    pub(crate) utxo: Option<Span>,
    pub(crate) witness_utxo: Option<Span>,
    pub(crate) part_sig: BTreeMap<Vec<u8>, Span>,
    pub(crate) sighash: Option<u32>,
    pub(crate) redeem_script: Option<Span>,
    pub(crate) witness_script: Option<Span>,
    pub(crate) taproot_internal_key: Option<Span>,
    pub(crate) taproot_key_sig: Option<Value>,
    pub(crate) taproot_merkle_root: Option<Span>,
    pub(crate) unknown: BTreeMap<Vec<u8>, Span>,

    subpath_spans: BTreeMap<Vec<u8>, Span>,
    taproot_subpath_spans: BTreeMap<Vec<u8>, Span>,
    taproot_script_sig_spans: BTreeMap<Vec<u8>, Span>,
    taproot_script_spans: BTreeMap<Vec<u8>, Span>,

    /// pubkey -> key origin, after validation.
    pub(crate) subpaths: BTreeMap<Vec<u8>, Keypath>,
    /// xonly pubkey -> (leaf hashes, key origin), after validation.
    pub(crate) taproot_subpaths: BTreeMap<Vec<u8>, TapKeypath>,
    /// (xonly pubkey, leaf hash) -> signature.
    pub(crate) taproot_script_sigs: BTreeMap<(Vec<u8>, [u8; 32]), Value>,
    /// (leaf script, leaf version) -> control blocks.
    pub(crate) taproot_scripts: BTreeMap<(Vec<u8>, u8), BTreeSet<Vec<u8>>>,

    pub(crate) num_our_keys: Option<usize>,
    pub(crate) fully_signed: bool,
    pub(crate) is_segwit: bool,
    pub(crate) is_multisig: bool,
    pub(crate) is_p2sh: bool,
    pub(crate) tapscript: bool,
    pub(crate) required_key: Option<RequiredKey>,
    /// Redeem script (p2sh) or scriptPubKey (legacy) used when signing.
    pub(crate) script_sig: Option<Vec<u8>>,
    /// BIP-143 scriptCode, segwit v0 inputs only.
    pub(crate) script_code: Option<Vec<u8>>,
    pub(crate) amount: u64,
    /// Signature we produced: `(pubkey, der_sig || sighash_byte)`.
    pub(crate) added_sig: Option<(Vec<u8>, Vec<u8>)>,
}

impl Section for InputProxy {
    const SHORT_VALUES: &'static [u8] = &[PSBT_IN_SIGHASH_TYPE];
    const NO_KEYS: &'static [u8] = &[
        PSBT_IN_NON_WITNESS_UTXO,
        PSBT_IN_WITNESS_UTXO,
        PSBT_IN_SIGHASH_TYPE,
        PSBT_IN_REDEEM_SCRIPT,
        PSBT_IN_WITNESS_SCRIPT,
        PSBT_IN_FINAL_SCRIPTSIG,
        PSBT_IN_FINAL_SCRIPTWITNESS,
        PSBT_IN_TAP_KEY_SIG,
        PSBT_IN_TAP_INTERNAL_KEY,
        PSBT_IN_TAP_MERKLE_ROOT,
    ];

    fn store(&mut self, key_type: u8, key: &[u8], value: Value) -> Result<()> {
        fn set_once(slot: &mut Option<Span>, value: Value) -> Result<()> {
            let span = match value {
                Value::Span(s) => s,
                Value::Bytes(_) => unreachable!("long values arrive as spans"),
            };
            check!(slot.replace(span).is_none(), "Duplicate key in input.");
            Ok(())
        }

        match key_type {
            PSBT_IN_NON_WITNESS_UTXO => set_once(&mut self.utxo, value)?,
            PSBT_IN_WITNESS_UTXO => set_once(&mut self.witness_utxo, value)?,
            PSBT_IN_PARTIAL_SIG => {
                if let Value::Span(s) = value {
                    check!(
                        self.part_sig.insert(key.to_vec(), s).is_none(),
                        "Duplicate key in input."
                    );
                }
            }
            PSBT_IN_SIGHASH_TYPE => {
                if let Value::Bytes(b) = value {
                    check!(b.len() == 4, "bad sighash length");
                    check!(self.sighash.is_none(), "Duplicate key in input.");
                    self.sighash = Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                }
            }
            PSBT_IN_REDEEM_SCRIPT => set_once(&mut self.redeem_script, value)?,
            PSBT_IN_WITNESS_SCRIPT => set_once(&mut self.witness_script, value)?,
            PSBT_IN_BIP32_DERIVATION => {
                if let Value::Span(s) = value {
                    check!(
                        self.subpath_spans.insert(key.to_vec(), s).is_none(),
                        "Duplicate key in input."
                    );
                }
            }
            PSBT_IN_TAP_INTERNAL_KEY => set_once(&mut self.taproot_internal_key, value)?,
            PSBT_IN_TAP_BIP32_DERIVATION => {
                if let Value::Span(s) = value {
                    check!(
                        self.taproot_subpath_spans.insert(key.to_vec(), s).is_none(),
                        "Duplicate key in input."
                    );
                }
            }
            PSBT_IN_TAP_KEY_SIG => {
                check!(self.taproot_key_sig.is_none(), "Duplicate key in input.");
                self.taproot_key_sig = Some(value);
            }
            PSBT_IN_TAP_MERKLE_ROOT => set_once(&mut self.taproot_merkle_root, value)?,
            PSBT_IN_TAP_SCRIPT_SIG => {
                if let Value::Span(s) = value {
                    check!(
                        self.taproot_script_sig_spans.insert(key.to_vec(), s).is_none(),
                        "Duplicate key in input."
                    );
                }
            }
            PSBT_IN_TAP_LEAF_SCRIPT => {
                if let Value::Span(s) = value {
                    check!(
                        self.taproot_script_spans.insert(key.to_vec(), s).is_none(),
                        "Duplicate key in input."
                    );
                }
            }
            _ => {
                // including PSBT_IN_FINAL_SCRIPTSIG, PSBT_IN_FINAL_SCRIPTWITNESS
                if let Value::Span(s) = value {
                    let mut full_key = vec![key_type];
                    full_key.extend_from_slice(key);
                    check!(
                        self.unknown.insert(full_key, s).is_none(),
                        "Duplicate key. Key for unknown value already provided in input."
                    );
                }
            }
        }
        Ok(())
    }
}

impl InputProxy {
    /// Number of keys in this input that belong to our seed.
    pub fn num_our_keys(&self) -> usize { self.num_our_keys.unwrap_or(0) }

    /// True once the input has all the signatures it appears to need.
    pub fn fully_signed(&self) -> bool { self.fully_signed }

    /// True when the input spends a segwit output (any version).
    pub fn is_segwit(&self) -> bool { self.is_segwit }

    /// Do we have a copy of the corresponding UTXO?
    pub fn has_utxo(&self) -> bool { self.utxo.is_some() || self.witness_utxo.is_some() }

    /// The sighash to actually sign with: explicit value if supplied,
    /// else ALL (DEFAULT for taproot, saving one witness byte).
    pub(crate) fn effective_sighash(&self) -> u32 {
        match self.sighash {
            Some(s) => s,
            None if !self.taproot_subpaths.is_empty() => crate::sighash::SIGHASH_DEFAULT,
            None => crate::sighash::SIGHASH_ALL,
        }
    }

    fn parse_taproot_script_sigs(&mut self) -> Result<()> {
        for (key, span) in std::mem::take(&mut self.taproot_script_sig_spans) {
            check!(key.len() == 64, "PSBT_IN_TAP_SCRIPT_SIG key length != 64");
            check!(
                span.len == 64 || span.len == 65,
                "PSBT_IN_TAP_SCRIPT_SIG signature length != 64 or 65"
            );
            let xonly = key[..32].to_vec();
            let mut leaf_hash = [0u8; 32];
            leaf_hash.copy_from_slice(&key[32..]);
            self.taproot_script_sigs.insert((xonly, leaf_hash), Value::Span(span));
        }
        Ok(())
    }

    fn parse_taproot_scripts<F: Read + Seek>(&mut self, fd: &mut F) -> Result<()> {
        for (key, span) in std::mem::take(&mut self.taproot_script_spans) {
            check!(key.len() > 32, "PSBT_IN_TAP_LEAF_SCRIPT control block is too short");
            check!((key.len() - 1) % 32 == 0, "PSBT_IN_TAP_LEAF_SCRIPT control block is not valid");
            let mut script = read_span(fd, span)?;
            check!(!script.is_empty(), "PSBT_IN_TAP_LEAF_SCRIPT cannot be empty");
            let leaf_ver = script.pop().unwrap();
            self.taproot_scripts.entry((script, leaf_ver)).or_default().insert(key);
        }
        Ok(())
    }

    /// First-pass validation against the deserialized `TxIn`.
    pub(crate) fn validate<F: Read + Seek>(
        &mut self,
        fd: &mut F,
        idx: usize,
        txin: &TxIn,
        my_xfp: u32,
        warnings: &mut Vec<Warning>,
    ) -> Result<()> {
        if let Some(ws) = self.witness_script {
            check!(ws.len >= 30, "witness script too short");
        }
        if let Some(rs) = self.redeem_script {
            check!(rs.len >= 22, "redeem script too short");
        }
        if let Some(ik) = self.taproot_internal_key {
            check!(ik.len == 32, "PSBT_IN_TAP_INTERNAL_KEY length != 32");
        }

        self.parse_taproot_script_sigs()?;
        self.parse_taproot_scripts(fd)?;

        // rework the pubkey => subpath mappings, note which are ours
        if self.num_our_keys.is_none() {
            let (subpaths, ours) =
                parse_subpaths(fd, &std::mem::take(&mut self.subpath_spans), my_xfp, warnings)?;
            let (tap_subpaths, tap_ours) = parse_taproot_subpaths(
                fd,
                &std::mem::take(&mut self.taproot_subpath_spans),
                my_xfp,
                warnings,
            )?;
            self.subpaths = subpaths;
            self.taproot_subpaths = tap_subpaths;
            self.num_our_keys = Some(ours + tap_ours);
        }

        // How complete is the set of signatures so far? Imperfect
        // heuristic for mixed-party multisig, but being fooled into
        // thinking an input is already signed only makes us do nothing.
        if !self.part_sig.is_empty() {
            self.fully_signed = self.part_sig.len() >= self.subpaths.len();
        } else if !self.taproot_script_sigs.is_empty() {
            self.fully_signed = self.taproot_script_sigs.len() >= self.taproot_subpaths.len();
        } else {
            self.fully_signed = false;
        }

        if let Some(tks) = self.taproot_key_sig.clone() {
            check!(
                tks.len() == 64 || tks.len() == 65,
                "PSBT_IN_TAP_KEY_SIG length != 64 or 65"
            );
            if tks.len() == 65 {
                let sig = match tks {
                    Value::Span(s) => read_span(fd, s)?,
                    Value::Bytes(b) => b,
                };
                if let Some(sh) = self.sighash {
                    check!(
                        sig[64] as u32 == sh,
                        "PSBT_IN_SIGHASH_TYPE != PSBT_IN_TAP_KEY_SIG[64]"
                    );
                }
            }
            self.fully_signed = true;
        }

        if let Some(utxo) = self.utxo {
            // They might be trying to trick us with an unrelated
            // funding transaction that does not match the outpoint
            // we're signing.
            let observed: Txid = calc_txid(fd, utxo, None)
                .map_err(|_| Error::Fatal(format!("Trouble parsing UTXO given for input #{}", idx)))?;
            check!(
                txin.previous_output.txid == observed,
                "utxo hash mismatch for input #{}", idx
            );
        }

        Ok(())
    }

    /// Loads the `TxOut` this input spends.
    ///
    /// Prefers the witness UTXO; otherwise walks the embedded funding
    /// transaction to the requested output. The stream position is
    /// preserved.
    pub(crate) fn get_utxo<F: Read + Seek>(&self, fd: &mut F, idx: u32) -> Result<TxOut> {
        let old_pos = fd.stream_position()?;

        if let Some(span) = self.witness_utxo {
            fd.seek(SeekFrom::Start(span.pos))?;
            let utxo = read_tx_out(fd)?;
            fd.seek(SeekFrom::Start(old_pos))?;
            return Ok(utxo);
        }

        let span = match self.utxo {
            Some(s) => s,
            None => fatal!("no utxo"),
        };

        fd.seek(SeekFrom::Start(span.pos))?;

        let _version = crate::stream::read_i32_le(fd)?;
        let marker = crate::stream::read_u8(fd)?;
        let flags = crate::stream::read_u8(fd)?;
        if !(marker == 0 && flags != 0) {
            fd.seek(SeekFrom::Current(-2))?;
        }

        // zero inputs accepted: the funding txn may have been trimmed
        let num_in = crate::stream::read_compact_size_req(fd)?;
        skip_tx_ins(fd, num_in)?;

        let num_out = crate::stream::read_compact_size_req(fd)?;
        check!((idx as u64) < num_out, "not enuf outs");
        skip_tx_outs(fd, idx as u64)?;

        let utxo = read_tx_out(fd)?;
        fd.seek(SeekFrom::Start(old_pos))?;

        Ok(utxo)
    }

    /// Works out what it takes to sign this input: script type, which
    /// pubkey(s), scriptSig/scriptCode values. Validates any redeem
    /// script and resolves the multisig wallet on the way.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn determine_my_signing_key<F: Read + Seek>(
        &mut self,
        fd: &mut F,
        my_idx: usize,
        utxo: &TxOut,
        my_xfp: u32,
        registry: &dyn MultisigRegistry,
        active_multisig: &mut Option<Arc<dyn MultisigWallet>>,
        secp: &Secp256k1<All>,
    ) -> Result<()> {
        self.amount = utxo.value.to_sat();

        if (self.subpaths.is_empty() && self.taproot_subpaths.is_empty()) || self.fully_signed {
            // without xfp+path we cannot sign this input; okay if it is
            // fully signed or someone else's leg of the transaction
            self.required_key = None;
            return Ok(());
        }

        self.is_multisig = false;
        self.is_p2sh = false;
        let mut which_key: Option<RequiredKey> = None;

        let info = classify(&utxo.script_pubkey);
        if info.is_segwit && !self.is_segwit {
            self.is_segwit = true;
        }

        // hash160 the scriptCode wants, for the pkh family
        let mut pkh_family = false;
        let mut pkh_addr: Vec<u8> = Vec::new();
        let mut redeem_script: Vec<u8> = Vec::new();

        match info.kind {
            AddressType::P2sh => {
                self.is_p2sh = true;

                // we must have the redeem script already (else fail)
                let ks = match self.witness_script.or(self.redeem_script) {
                    Some(s) => s,
                    None => fatal!("Missing redeem/witness script for input #{}", my_idx),
                };
                redeem_script = read_span(fd, ks)?;
                self.script_sig = Some(redeem_script.clone());

                if self.subpaths.len() == 1 {
                    // psbt creator telling us exactly what key to use
                    let pk = self.subpaths.keys().next().unwrap().clone();
                    which_key = Some(RequiredKey::Single(pk));
                } else {
                    // we'll sign with any key we know; limitation: we
                    // cannot be two legs of a multisig
                    let mut ours = BTreeSet::new();
                    for (pubkey, path) in &self.subpaths {
                        if self.part_sig.contains_key(pubkey) {
                            // already signed by this pubkey
                            continue;
                        }
                        if path.xfp == my_xfp {
                            ours.insert(pubkey.clone());
                        }
                    }
                    if !ours.is_empty() {
                        which_key = Some(RequiredKey::Multi(ours));
                    }
                }

                if !info.is_segwit
                    && redeem_script.len() == 22
                    && redeem_script[0] == 0
                    && redeem_script[1] == 20
                {
                    // it's actually segwit p2pkh inside p2sh
                    pkh_family = true;
                    pkh_addr = redeem_script[2..22].to_vec();
                    self.is_segwit = true;
                } else {
                    // multiple keys involved, we probably can't finalize
                    self.is_multisig = true;
                }

                if self.witness_script.is_some() && !self.is_segwit && self.is_multisig {
                    // p2sh-p2wsh
                    self.is_segwit = true;
                }
            }

            AddressType::P2pkh => {
                self.script_sig = Some(utxo.script_pubkey.to_bytes());
                pkh_family = true;
                pkh_addr = info.payload.clone();

                let mut found = None;
                for pubkey in self.subpaths.keys() {
                    if hash160::Hash::hash(pubkey).to_byte_array()[..] == pkh_addr[..] {
                        found = Some(pubkey.clone());
                        break;
                    }
                }
                match found {
                    Some(pk) => which_key = Some(RequiredKey::Single(pk)),
                    // none of the pubkeys provided hashes to that address
                    None => fatal!("Input #{}: pubkey vs. address wrong", my_idx),
                }
            }

            AddressType::P2pk => {
                // input is a single bare public key (less common)
                self.script_sig = Some(utxo.script_pubkey.to_bytes());
                check!(info.payload.len() == 33, "uncompressed p2pk");

                if self.subpaths.contains_key(&info.payload) {
                    which_key = Some(RequiredKey::Single(info.payload.clone()));
                } else {
                    // pubkey provided is just wrong vs. UTXO
                    fatal!("Input #{}: pubkey wrong", my_idx);
                }
            }

            AddressType::P2tr => {
                return self.determine_taproot_key(
                    fd,
                    my_idx,
                    &info.payload,
                    my_xfp,
                    registry,
                    active_multisig,
                    secp,
                );
            }

            AddressType::Unknown => {
                // we don't know how to "solve" this type of input
            }
        }

        if self.is_multisig && which_key.is_some() {
            // find which wallet this is, or check it matches the one
            // already selected, then verify the redeem script exactly
            let (m, n) = disassemble_multisig_mn(&redeem_script)?;
            let mut xfp_paths: Vec<Vec<u32>> =
                self.subpaths.values().map(Keypath::to_words).collect();
            xfp_paths.sort();

            resolve_active_multisig(registry, active_multisig, m, n, &xfp_paths)?;

            let wallet = active_multisig.as_ref().unwrap();
            if let Err(e) = wallet.validate_script(&redeem_script, &self.subpaths) {
                fatal!("Input #{}: {}", my_idx, e);
            }
        }

        self.required_key = which_key;

        if self.is_segwit {
            if pkh_family {
                // scriptCode for p2wpkh and p2sh-p2wpkh is always
                // 0x1976a914 {20-byte keyhash} 88ac, not the
                // redeemScript nor scriptPubKey
                check!(!self.is_multisig, "multisig pkh?");
                let mut sc = vec![0x19, 0x76, 0xa9, 0x14];
                sc.extend_from_slice(&pkh_addr);
                sc.extend_from_slice(&[0x88, 0xac]);
                self.script_code = Some(sc);
            } else if self.script_code.is_none() {
                // segwit p2sh; scriptCode is the witnessScript behind a
                // compact-size length
                let ws = match self.witness_script {
                    Some(s) => s,
                    None => fatal!("Need witness script for input #{}", my_idx),
                };
                self.script_code = Some(var_bytes(&read_span(fd, ws)?));
            }
        }

        Ok(())
    }

    /// Taproot leg of [`Self::determine_my_signing_key`]: key path when
    /// possible, single-leaf tapscript multisig otherwise.
    #[allow(clippy::too_many_arguments)]
    fn determine_taproot_key<F: Read + Seek>(
        &mut self,
        fd: &mut F,
        my_idx: usize,
        output_key: &[u8],
        my_xfp: u32,
        registry: &dyn MultisigRegistry,
        active_multisig: &mut Option<Arc<dyn MultisigWallet>>,
        secp: &Secp256k1<All>,
    ) -> Result<()> {
        let merkle_root: Option<[u8; 32]> = match self.taproot_merkle_root {
            Some(span) => {
                check!(span.len == 32, "PSBT_IN_TAP_MERKLE_ROOT length != 32");
                let v = read_span(fd, span)?;
                let mut h = [0u8; 32];
                h.copy_from_slice(&v);
                Some(h)
            }
            None => None,
        };

        let mut which_key: Option<RequiredKey> = None;

        if self.taproot_subpaths.len() == 1 {
            // keyspend without a script path
            check!(merkle_root.is_none(), "merkle_root should not be defined for simple keyspend");
            let (xonly, tkp) = self.taproot_subpaths.iter().next().unwrap();
            check!(tkp.leaf_hashes.is_empty(), "LeafHashes have to be empty for internal key");

            if tkp.origin.xfp == my_xfp {
                let tweaked = taptweak(secp, xonly, None)?;
                if tweaked[..] == output_key[..] {
                    which_key = Some(RequiredKey::Single(xonly.clone()));
                }
            }
        } else {
            // tapscript
            let mut candidates = BTreeSet::new();
            for (xonly, tkp) in &self.taproot_subpaths {
                // ignore keys with someone else's fingerprint
                if tkp.origin.xfp != my_xfp {
                    continue;
                }
                let mr = match merkle_root {
                    Some(h) => h,
                    None => fatal!("Merkle root not defined"),
                };

                if tkp.leaf_hashes.is_empty() {
                    // internal key is ours: prefer spending the key
                    // path even though a script path is available
                    let tweaked = taptweak(secp, xonly, Some(mr))?;
                    if tweaked[..] == output_key[..] {
                        which_key = Some(RequiredKey::Single(xonly.clone()));
                        self.tapscript = false;
                        self.is_multisig = false;
                        break;
                    }
                } else {
                    self.tapscript = true;
                    self.is_multisig = true;
                    let ik_span = match self.taproot_internal_key {
                        Some(s) => s,
                        None => fatal!("missing taproot internal key"),
                    };
                    let internal_key = read_span(fd, ik_span)?;
                    let expect = taptweak(secp, &internal_key, Some(mr))?;
                    if expect[..] == output_key[..] {
                        candidates.insert(xonly.clone());
                    }
                }
            }

            if which_key.is_none() && !candidates.is_empty() {
                which_key = Some(RequiredKey::Multi(candidates));
            }

            if which_key.is_some() {
                // only tree depth zero is supported: one script, whose
                // leaf hash must equal the merkle root
                check!(self.taproot_scripts.len() == 1, "Multiple tapleafs");
                let (script, leaf_ver) = {
                    let ((s, v), _cbs) = self.taproot_scripts.iter().next().unwrap();
                    (s.clone(), *v)
                };

                let (m, n) = disassemble_multisig_mn_tr(&script)?;
                let mut xfp_paths: Vec<Vec<u32>> = self
                    .taproot_subpaths
                    .values()
                    .filter(|t| !t.leaf_hashes.is_empty())
                    .map(|t| t.origin.to_words())
                    .collect();
                xfp_paths.sort();

                resolve_active_multisig(registry, active_multisig, m, n, &xfp_paths)?;
                let wallet = active_multisig.as_ref().unwrap();

                let internal_key = wallet.validate_tr_internal_key(&self.taproot_subpaths)?;
                let provided = match self.taproot_internal_key {
                    Some(s) => read_span(fd, s)?,
                    None => fatal!("missing taproot internal key"),
                };
                if internal_key[..] != provided[..] {
                    return Err(Error::fraud(
                        my_idx,
                        "Internal key from PSBT does not match registered key",
                    ));
                }

                let target = wallet.make_multisig_tr(&self.taproot_subpaths)?;
                check!(
                    target == script,
                    "Input #{}: Script does not match registered multisig descriptor", my_idx
                );

                // The merkle root must be verified, or an unknown
                // script path could rug us after signing.
                let leaf_ver = match LeafVersion::from_consensus(leaf_ver) {
                    Ok(v) => v,
                    Err(_) => fatal!("bad tapleaf version"),
                };
                let leaf = TapLeafHash::from_script(Script::from_bytes(&script), leaf_ver);
                check!(
                    Some(leaf.to_byte_array()) == merkle_root,
                    "Input #{}: Merkle root does not match", my_idx
                );
            }
        }

        self.required_key = which_key;
        Ok(())
    }

    /// Re-emits this input's records, including any signature we added.
    pub(crate) fn serialize<F: Read + Seek, W: Write>(
        &self,
        out: &mut W,
        fd: &mut F,
    ) -> Result<()> {
        if let Some(s) = self.utxo {
            kv::write_kv(out, fd, PSBT_IN_NON_WITNESS_UTXO, &[], &Value::Span(s))?;
        }
        if let Some(s) = self.witness_utxo {
            kv::write_kv(out, fd, PSBT_IN_WITNESS_UTXO, &[], &Value::Span(s))?;
        }

        for (pk, sig) in &self.part_sig {
            kv::write_kv(out, fd, PSBT_IN_PARTIAL_SIG, pk, &Value::Span(*sig))?;
        }
        if let Some((pubkey, sig)) = &self.added_sig {
            kv::write_kv(out, fd, PSBT_IN_PARTIAL_SIG, pubkey, &Value::Bytes(sig.clone()))?;
        }

        if let Some(tks) = &self.taproot_key_sig {
            kv::write_kv(out, fd, PSBT_IN_TAP_KEY_SIG, &[], tks)?;
        }

        if let Some(sh) = self.sighash {
            kv::write_kv(
                out,
                fd,
                PSBT_IN_SIGHASH_TYPE,
                &[],
                &Value::Bytes(sh.to_le_bytes().to_vec()),
            )?;
        }

        if self.num_our_keys.is_some() {
            for (pk, keypath) in &self.subpaths {
                kv::write_keypath_kv(out, PSBT_IN_BIP32_DERIVATION, pk, keypath)?;
            }
        } else {
            // not validated yet, so the raw records are still good
            for (pk, span) in &self.subpath_spans {
                kv::write_kv(out, fd, PSBT_IN_BIP32_DERIVATION, pk, &Value::Span(*span))?;
            }
        }

        if let Some(s) = self.redeem_script {
            kv::write_kv(out, fd, PSBT_IN_REDEEM_SCRIPT, &[], &Value::Span(s))?;
        }
        if let Some(s) = self.witness_script {
            kv::write_kv(out, fd, PSBT_IN_WITNESS_SCRIPT, &[], &Value::Span(s))?;
        }

        if let Some(s) = self.taproot_internal_key {
            kv::write_kv(out, fd, PSBT_IN_TAP_INTERNAL_KEY, &[], &Value::Span(s))?;
        }

        if self.num_our_keys.is_some() {
            for (xonly, tap) in &self.taproot_subpaths {
                kv::write_tap_keypath_kv(out, PSBT_IN_TAP_BIP32_DERIVATION, xonly, tap)?;
            }
        } else {
            for (xonly, span) in &self.taproot_subpath_spans {
                kv::write_kv(out, fd, PSBT_IN_TAP_BIP32_DERIVATION, xonly, &Value::Span(*span))?;
            }
        }

        if let Some(s) = self.taproot_merkle_root {
            kv::write_kv(out, fd, PSBT_IN_TAP_MERKLE_ROOT, &[], &Value::Span(s))?;
        }

        for ((xonly, leaf_hash), sig) in &self.taproot_script_sigs {
            let mut key = xonly.clone();
            key.extend_from_slice(leaf_hash);
            kv::write_kv(out, fd, PSBT_IN_TAP_SCRIPT_SIG, &key, sig)?;
        }
        // raw records, when serializing before validation
        for (key, span) in &self.taproot_script_sig_spans {
            kv::write_kv(out, fd, PSBT_IN_TAP_SCRIPT_SIG, key, &Value::Span(*span))?;
        }

        for ((script, leaf_ver), control_blocks) in &self.taproot_scripts {
            let mut val = script.clone();
            val.push(*leaf_ver);
            for cb in control_blocks {
                kv::write_kv(out, fd, PSBT_IN_TAP_LEAF_SCRIPT, cb, &Value::Bytes(val.clone()))?;
            }
        }
        for (key, span) in &self.taproot_script_spans {
            kv::write_kv(out, fd, PSBT_IN_TAP_LEAF_SCRIPT, key, &Value::Span(*span))?;
        }

        for (key, val) in &self.unknown {
            kv::write_kv(out, fd, key[0], &key[1..], &Value::Span(*val))?;
        }

        Ok(())
    }
}

/// Finds the multisig wallet for `(m, n, xfp_paths)`, or checks the
/// PSBT stays consistent with the wallet already selected.
pub(crate) fn resolve_active_multisig(
    registry: &dyn MultisigRegistry,
    active: &mut Option<Arc<dyn MultisigWallet>>,
    m: usize,
    n: usize,
    xfp_paths: &[Vec<u32>],
) -> Result<()> {
    match active {
        None => match registry.find_match(m, n, xfp_paths) {
            Some(wallet) => *active = Some(wallet),
            None => fatal!("Unknown multisig wallet"),
        },
        Some(wallet) => wallet.assert_matching(m, n, xfp_paths)?,
    }
    Ok(())
}
