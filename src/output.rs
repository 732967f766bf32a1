// SPDX-License-Identifier: CC0-1.0

//! Per-output state of the PSBT: change detection and fraud checks.
//!
//! A PSBT creator can mark any output with our key paths to make it
//! look like change. We believe nothing: the expected scriptPubKey is
//! re-derived from the claimed paths and script hints and compared
//! byte for byte. Any mismatch is raised as fraud, because these are
//! not innocent errors.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Script, TxOut};

use crate::error::{Error, Result};
use crate::keypath::{parse_subpaths, parse_taproot_subpaths, Keypath, TapKeypath};
use crate::kv::{self, decode_prop_key, encode_prop_key, Section, Value};
use crate::kv::{PROP_ATTESTATION_SUBTYPE, PROP_CK_ID, PSBT_PROPRIETARY};
use crate::script::{classify, taptweak, AddressType};
use crate::stream::{read_span, Span};
use crate::wallet::{MultisigRegistry, MultisigWallet};
use crate::Warning;

const PSBT_OUT_REDEEM_SCRIPT: u8 = 0x00;
const PSBT_OUT_WITNESS_SCRIPT: u8 = 0x01;
const PSBT_OUT_BIP32_DERIVATION: u8 = 0x02;
const PSBT_OUT_TAP_INTERNAL_KEY: u8 = 0x05;
const PSBT_OUT_TAP_TREE: u8 = 0x06;
const PSBT_OUT_TAP_BIP32_DERIVATION: u8 = 0x07;

/// Everything we track about one PSBT output.
#[derive(Debug, Default)]
pub struct OutputProxy {
    pub(crate) redeem_script: Option<Span>,
    pub(crate) witness_script: Option<Span>,
    pub(crate) taproot_internal_key: Option<Span>,
    pub(crate) taproot_tree: Option<Span>,
    /// Attestation signature from our proprietary key, if present.
    pub(crate) attestation: Option<Span>,
    pub(crate) unknown: BTreeMap<Vec<u8>, Span>,

    subpath_spans: BTreeMap<Vec<u8>, Span>,
    taproot_subpath_spans: BTreeMap<Vec<u8>, Span>,
    pub(crate) subpaths: BTreeMap<Vec<u8>, Keypath>,
    pub(crate) taproot_subpaths: BTreeMap<Vec<u8>, TapKeypath>,

    pub(crate) num_our_keys: Option<usize>,
    /// Set when we are satisfied this output pays back to our wallet.
    pub(crate) is_change: bool,
}

impl Section for OutputProxy {
    const NO_KEYS: &'static [u8] = &[
        PSBT_OUT_REDEEM_SCRIPT,
        PSBT_OUT_WITNESS_SCRIPT,
        PSBT_OUT_TAP_INTERNAL_KEY,
        PSBT_OUT_TAP_TREE,
    ];

    fn store(&mut self, key_type: u8, key: &[u8], value: Value) -> Result<()> {
        let span = match value {
            Value::Span(s) => s,
            Value::Bytes(_) => unreachable!("output values arrive as spans"),
        };

        match key_type {
            PSBT_OUT_BIP32_DERIVATION => {
                check!(
                    self.subpath_spans.insert(key.to_vec(), span).is_none(),
                    "Duplicate key in output."
                );
            }
            PSBT_OUT_REDEEM_SCRIPT => {
                check!(self.redeem_script.replace(span).is_none(), "Duplicate key in output.");
            }
            PSBT_OUT_WITNESS_SCRIPT => {
                check!(self.witness_script.replace(span).is_none(), "Duplicate key in output.");
            }
            PSBT_PROPRIETARY => {
                let (identifier, subtype, _keydata) = decode_prop_key(key)?;
                // examine only our own proprietary keys; the value is a
                // recoverable signature, so there is no keydata
                if identifier == PROP_CK_ID && subtype == PROP_ATTESTATION_SUBTYPE {
                    check!(self.attestation.replace(span).is_none(), "Duplicate key in output.");
                } else {
                    let mut full_key = vec![key_type];
                    full_key.extend_from_slice(key);
                    check!(
                        self.unknown.insert(full_key, span).is_none(),
                        "Duplicate key. Key for unknown value already provided in output."
                    );
                }
            }
            PSBT_OUT_TAP_INTERNAL_KEY => {
                check!(
                    self.taproot_internal_key.replace(span).is_none(),
                    "Duplicate key in output."
                );
            }
            PSBT_OUT_TAP_BIP32_DERIVATION => {
                check!(
                    self.taproot_subpath_spans.insert(key.to_vec(), span).is_none(),
                    "Duplicate key in output."
                );
            }
            PSBT_OUT_TAP_TREE => {
                check!(self.taproot_tree.replace(span).is_none(), "Duplicate key in output.");
            }
            _ => {
                let mut full_key = vec![key_type];
                full_key.extend_from_slice(key);
                check!(
                    self.unknown.insert(full_key, span).is_none(),
                    "Duplicate key. Key for unknown value already provided in output."
                );
            }
        }
        Ok(())
    }
}

impl OutputProxy {
    /// True when this output was proven to pay back into our wallet.
    pub fn is_change(&self) -> bool { self.is_change }

    /// Number of keys in this output that belong to our seed.
    pub fn num_our_keys(&self) -> usize { self.num_our_keys.unwrap_or(0) }

    /// Decodes `PSBT_OUT_TAP_TREE`: `(depth, leaf_version, script)`
    /// triples.
    pub(crate) fn parse_taproot_tree<F: Read + Seek>(
        &self,
        fd: &mut F,
    ) -> Result<Vec<(u8, u8, Vec<u8>)>> {
        let span = match self.taproot_tree {
            Some(s) => s,
            None => fatal!("missing taproot tree"),
        };
        let raw = read_span(fd, span)?;
        let mut cursor = std::io::Cursor::new(&raw);

        let mut leaves = Vec::new();
        while (cursor.position() as usize) < raw.len() {
            let depth = crate::stream::read_u8(&mut cursor)?;
            let leaf_ver = crate::stream::read_u8(&mut cursor)?;
            let script_len = crate::stream::read_compact_size_req(&mut cursor)?;
            let script = crate::stream::read_bytes(&mut cursor, script_len as usize)?;
            leaves.push((depth, leaf_ver, script));
        }
        Ok(leaves)
    }

    pub(crate) fn parse_output_subpaths<F: Read + Seek>(
        &mut self,
        fd: &mut F,
        my_xfp: u32,
        warnings: &mut Vec<Warning>,
    ) -> Result<usize> {
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
        Ok(self.num_our_keys.unwrap())
    }

    /// Decides whether this output is change and, if it claims to be,
    /// proves it. Raises [`Error::FraudulentChangeOutput`] on any
    /// mismatch.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn validate<F: Read + Seek>(
        &mut self,
        fd: &mut F,
        out_idx: usize,
        txo: &TxOut,
        my_xfp: u32,
        active_multisig: &Option<Arc<dyn MultisigWallet>>,
        registry: &dyn MultisigRegistry,
        warnings: &mut Vec<Warning>,
        secp: &Secp256k1<All>,
    ) -> Result<()> {
        if let Some(ik) = self.taproot_internal_key {
            check!(ik.len == 32, "PSBT_OUT_TAP_INTERNAL_KEY length != 32");
        }

        let num_ours = self.parse_output_subpaths(fd, my_xfp, warnings)?;

        if num_ours == 0 {
            // not considered fraud: other signers looking at this PSBT
            // may have these keys, and the user sees a normal output
            return Ok(());
        }

        let info = classify(&txo.script_pubkey);

        let expect_pubkey: Option<Vec<u8>> = if self.subpaths.len() == 1 {
            self.subpaths.keys().next().cloned()
        } else if self.taproot_subpaths.len() == 1 {
            self.taproot_subpaths.keys().next().cloned()
        } else {
            // p2wsh/p2sh cases need the full set of pubkeys, and
            // therefore a redeem script
            None
        };

        if info.kind == AddressType::P2pk {
            check!(info.payload.len() == 33, "uncompressed p2pk change");
            if Some(&info.payload) != expect_pubkey.as_ref() {
                return Err(Error::fraud(out_idx, "P2PK change output is fraudulent"));
            }
            self.is_change = true;
            return Ok(());
        }

        // figure out what the hashed address should be
        let mut pkh = info.payload.clone();

        let expect_pkh: Vec<u8> = match info.kind {
            AddressType::P2sh => {
                let redeem_script =
                    self.redeem_script.map(|s| read_span(fd, s)).transpose()?;
                let witness_script =
                    self.witness_script.map(|s| read_span(fd, s)).transpose()?;

                if redeem_script.is_none() && witness_script.is_none() {
                    // perhaps an omission, so not fraud; but without a
                    // script we don't know where this money is going
                    fatal!("Missing redeem/witness script for output #{}", out_idx);
                }

                let is_wrapped_wpkh = !info.is_segwit
                    && matches!(&redeem_script, Some(rs)
                        if rs.len() == 22 && rs[0] == 0 && rs[1] == 20);

                if is_wrapped_wpkh {
                    // segwit p2pkh wrapped in p2sh
                    let rs = redeem_script.as_ref().unwrap();
                    if hash160::Hash::hash(rs).to_byte_array()[..] != info.payload[..] {
                        return Err(Error::fraud(
                            out_idx,
                            "P2SH-P2WPKH redeem script has wrong hash",
                        ));
                    }
                    pkh = rs[2..22].to_vec();
                    let pk = match &expect_pubkey {
                        Some(pk) => pk,
                        None => fatal!("Output #{}: expected single key path", out_idx),
                    };
                    hash160::Hash::hash(pk).to_byte_array().to_vec()
                } else {
                    // multisig change output, for a wallet we're
                    // supposed to be part of; it cannot be change if it
                    // doesn't precisely match our multisig setup
                    let wallet = match active_multisig {
                        Some(w) => w,
                        None => {
                            // might be a p2sh output for a wallet that
                            // isn't us; more details than we need
                            self.is_change = false;
                            return Ok(());
                        }
                    };

                    if registry.checks_disabled() {
                        // without validation we must assume all outputs
                        // are taken from us, and are not really change
                        self.is_change = false;
                        return Ok(());
                    }

                    // the script must be exactly what we expect:
                    // pubkeys reconstructed from derived paths,
                    // BIP-45/BIP-67 rules applied
                    let script = witness_script.as_deref().or(redeem_script.as_deref()).unwrap();
                    if let Err(e) = wallet.validate_script(script, &self.subpaths) {
                        return Err(Error::fraud(
                            out_idx,
                            format!("P2WSH or P2SH change output script: {}", e),
                        ));
                    }

                    if info.is_segwit {
                        // p2wsh: check witness script hash against the
                        // proposed program
                        check!(info.payload.len() == 32, "bad p2wsh program");
                        let ws = match &witness_script {
                            Some(ws) => ws,
                            None => fatal!("Missing witness script for output #{}", out_idx),
                        };
                        let expect_wsh = sha256::Hash::hash(ws);
                        if expect_wsh.to_byte_array()[..] != info.payload[..] {
                            return Err(Error::fraud(
                                out_idx,
                                "P2WSH witness script has wrong hash",
                            ));
                        }
                        self.is_change = true;
                        return Ok(());
                    }

                    if let Some(ws) = &witness_script {
                        // p2sh-p2wsh (it had a witness script)
                        let mut expect_rs = vec![0x00, 0x20];
                        expect_rs.extend_from_slice(&sha256::Hash::hash(ws).to_byte_array());

                        if let Some(rs) = &redeem_script {
                            // iff they provide a redeem script, it must
                            // match what we expect it to be
                            if rs != &expect_rs {
                                return Err(Error::fraud(
                                    out_idx,
                                    "P2SH-P2WSH redeem script provided, and doesn't match",
                                ));
                            }
                        }
                        hash160::Hash::hash(&expect_rs).to_byte_array().to_vec()
                    } else {
                        // old BIP-16 style; looks like a payment addr
                        hash160::Hash::hash(redeem_script.as_ref().unwrap())
                            .to_byte_array()
                            .to_vec()
                    }
                }
            }

            AddressType::P2pkh => {
                check!(info.payload.len() == 20, "bad p2pkh hash");
                let pk = match &expect_pubkey {
                    Some(pk) => pk,
                    None => fatal!("Output #{}: expected single key path", out_idx),
                };
                hash160::Hash::hash(pk).to_byte_array().to_vec()
            }

            AddressType::P2tr => {
                if expect_pubkey.is_none() && self.taproot_subpaths.len() > 1 {
                    // tapscript
                    let wallet = match active_multisig {
                        Some(w) => w,
                        None => {
                            self.is_change = false;
                            return Ok(());
                        }
                    };
                    if registry.checks_disabled() {
                        self.is_change = false;
                        return Ok(());
                    }

                    let internal_key = wallet.validate_tr_internal_key(&self.taproot_subpaths)?;
                    let provided = match self.taproot_internal_key {
                        Some(s) => read_span(fd, s)?,
                        None => fatal!("missing taproot internal key"),
                    };
                    if internal_key[..] != provided[..] {
                        return Err(Error::fraud(
                            out_idx,
                            "Internal key from PSBT does not match registered key",
                        ));
                    }

                    let tree = self.parse_taproot_tree(fd)?;
                    check!(tree.len() == 1, "Taproot tree too complex");
                    let (_depth, leaf_ver, script) = &tree[0];

                    let target = wallet.make_multisig_tr(&self.taproot_subpaths)?;
                    if &target != script {
                        return Err(Error::fraud(out_idx, "Taproot leaf script does not match"));
                    }

                    let leaf_ver = match LeafVersion::from_consensus(*leaf_ver) {
                        Ok(v) => v,
                        Err(_) => fatal!("bad tapleaf version"),
                    };
                    let leaf = TapLeafHash::from_script(Script::from_bytes(script), leaf_ver);
                    taptweak(secp, &internal_key, Some(leaf.to_byte_array()))?.to_vec()
                } else {
                    let pk = match &expect_pubkey {
                        Some(pk) => pk,
                        None => fatal!("Output #{}: expected single key path", out_idx),
                    };
                    check!(pk.len() == 32, "bad taproot change key");
                    taptweak(secp, pk, None)?.to_vec()
                }
            }

            AddressType::P2pk | AddressType::Unknown => {
                // we don't know how to "solve" this type of output
                return Ok(());
            }
        };

        if pkh != expect_pkh {
            return Err(Error::fraud(out_idx, "Change output is fraudulent"));
        }

        // the pubkey value itself is re-checked at the last second,
        // during signing
        self.is_change = true;
        Ok(())
    }

    /// Re-emits this output's records.
    pub(crate) fn serialize<F: Read + Seek, W: Write>(
        &self,
        out: &mut W,
        fd: &mut F,
    ) -> Result<()> {
        if self.num_our_keys.is_some() {
            for (pk, keypath) in &self.subpaths {
                kv::write_keypath_kv(out, PSBT_OUT_BIP32_DERIVATION, pk, keypath)?;
            }
        } else {
            // not validated yet, so the raw records are still good
            for (pk, span) in &self.subpath_spans {
                kv::write_kv(out, fd, PSBT_OUT_BIP32_DERIVATION, pk, &Value::Span(*span))?;
            }
        }

        if let Some(s) = self.redeem_script {
            kv::write_kv(out, fd, PSBT_OUT_REDEEM_SCRIPT, &[], &Value::Span(s))?;
        }
        if let Some(s) = self.witness_script {
            kv::write_kv(out, fd, PSBT_OUT_WITNESS_SCRIPT, &[], &Value::Span(s))?;
        }

        if let Some(s) = self.taproot_internal_key {
            kv::write_kv(out, fd, PSBT_OUT_TAP_INTERNAL_KEY, &[], &Value::Span(s))?;
        }

        if self.num_our_keys.is_some() {
            for (xonly, tap) in &self.taproot_subpaths {
                kv::write_tap_keypath_kv(out, PSBT_OUT_TAP_BIP32_DERIVATION, xonly, tap)?;
            }
        } else {
            for (xonly, span) in &self.taproot_subpath_spans {
                kv::write_kv(out, fd, PSBT_OUT_TAP_BIP32_DERIVATION, xonly, &Value::Span(*span))?;
            }
        }

        if let Some(s) = self.taproot_tree {
            kv::write_kv(out, fd, PSBT_OUT_TAP_TREE, &[], &Value::Span(s))?;
        }

        if let Some(s) = self.attestation {
            let key = encode_prop_key(PROP_CK_ID, PROP_ATTESTATION_SUBTYPE, &[]);
            kv::write_kv(out, fd, PSBT_PROPRIETARY, &key, &Value::Span(s))?;
        }

        for (key, val) in &self.unknown {
            kv::write_kv(out, fd, key[0], &key[1..], &Value::Span(*val))?;
        }

        Ok(())
    }
}
