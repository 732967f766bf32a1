// SPDX-License-Identifier: CC0-1.0

//! The PSBT container and its signing state machine.
//!
//! States run strictly forward: parse ([`Psbt::read_psbt`]) →
//! [`Psbt::validate`] → [`Psbt::consider_inputs`] /
//! [`Psbt::consider_keys`] / [`Psbt::consider_outputs`] /
//! [`Psbt::consider_dangerous_sighash`] → [`Psbt::sign`] →
//! [`Psbt::serialize`] or [`Psbt::finalize`]. There are no reverse
//! transitions; a failed step aborts the whole operation.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bitcoin::consensus::encode::serialize as consensus_serialize;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{ScriptBuf, Txid, Witness};

use crate::error::Result;
use crate::input::InputProxy;
use crate::keypath::xfp2str;
use crate::kv::{self, parse_section, Section, Value};
use crate::output::OutputProxy;
use crate::script::disassemble_multisig_mn;
use crate::sighash::{SegwitV0Cache, TaprootCache};
use crate::stream::{compact_size, read_span, Span};
use crate::transaction::{
    calc_txid, push_data, read_tx_in, read_tx_out, read_witness, TxSkeleton,
};
use crate::wallet::{GlobalXpub, MultisigRegistry, MultisigWallet};
use crate::{Settings, Warning, MAX_SIGNERS};

const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
const PSBT_GLOBAL_XPUB: u8 = 0x01;

/// Scratch used while parsing the globals section.
#[derive(Default)]
struct GlobalSection {
    txn: Option<Span>,
    xpubs: Vec<(Vec<u8>, Span)>,
    unknown: BTreeMap<Vec<u8>, Span>,
}

impl Section for GlobalSection {
    const NO_KEYS: &'static [u8] = &[PSBT_GLOBAL_UNSIGNED_TX];

    fn store(&mut self, key_type: u8, key: &[u8], value: Value) -> Result<()> {
        let span = match value {
            Value::Span(s) => s,
            Value::Bytes(_) => unreachable!("global values arrive as spans"),
        };

        match key_type {
            PSBT_GLOBAL_UNSIGNED_TX => {
                check!(self.txn.replace(span).is_none(), "Duplicate unsigned txn.");
            }
            PSBT_GLOBAL_XPUB => {
                self.xpubs.push((key.to_vec(), span));
                check!(self.xpubs.len() <= MAX_SIGNERS, "too many xpubs");
            }
            _ => {
                let mut full_key = vec![key_type];
                full_key.extend_from_slice(key);
                check!(
                    self.unknown.insert(full_key, span).is_none(),
                    "Duplicate key. Key for unknown value already provided in global namespace."
                );
            }
        }
        Ok(())
    }
}

/// A parsed PSBT, owning its backing stream.
pub struct Psbt<F> {
    pub(crate) fd: F,
    pub(crate) secp: Secp256k1<All>,
    pub(crate) settings: Settings,

    /// Where the unsigned transaction lives in the stream.
    pub(crate) txn: Span,
    pub(crate) xpubs: Vec<GlobalXpub>,
    pub(crate) unknown: BTreeMap<Vec<u8>, Span>,

    pub(crate) txn_version: i32,
    pub(crate) had_witness: bool,
    pub(crate) num_inputs: usize,
    pub(crate) num_outputs: usize,
    pub(crate) vin_start: u64,
    pub(crate) vout_start: u64,
    pub(crate) wit_start: Option<u64>,
    pub(crate) lock_time: u32,

    /// Per-input and per-output proxies, same order as the txn vectors.
    pub inputs: Vec<InputProxy>,
    pub outputs: Vec<OutputProxy>,

    pub(crate) total_value_out: Option<u64>,
    pub(crate) total_value_in: Option<u64>,
    pub(crate) presigned_inputs: BTreeSet<usize>,
    /// True when every output is change back to ourselves.
    pub(crate) consolidation_tx: bool,
    pub(crate) num_change_outputs: usize,

    // sighash midstate caches, populated at most once per PSBT
    pub(crate) segwit_cache: Option<SegwitV0Cache>,
    pub(crate) tap_cache: Option<TaprootCache>,
    pub(crate) tap_outputs: Option<sha256::Hash>,

    /// The single multisig wallet in play, if any.
    pub(crate) active_multisig: Option<Arc<dyn MultisigWallet>>,

    pub(crate) warnings: Vec<Warning>,
}

impl<F: Read + Seek> Psbt<F> {
    /// Reads a PSBT. Captures the stream and keeps it for the rest of
    /// the operation.
    pub fn read_psbt(mut fd: F, settings: Settings) -> Result<Self> {
        let mut magic = [0u8; 5];
        fd.read_exact(&mut magic)?;
        check!(&magic == b"psbt\xff", "bad hdr");

        let mut globals = GlobalSection::default();
        parse_section(&mut fd, &mut globals)?;

        let txn = match globals.txn {
            Some(t) => t,
            None => fatal!("missing reqd section"),
        };

        // input sections start right after the globals terminator
        let sections_start = fd.stream_position()?;

        let mut xpubs = Vec::with_capacity(globals.xpubs.len());
        for (xfp_path, span) in globals.xpubs {
            xpubs.push(GlobalXpub { xfp_path, xpub: read_span(&mut fd, span)? });
        }

        // learn about the bitcoin transaction we are signing
        let skel = TxSkeleton::parse(&mut fd, txn)?;

        // per-input and per-output sections follow, each consuming
        // records until its zero-length key terminator
        fd.seek(SeekFrom::Start(sections_start))?;

        let mut inputs = Vec::with_capacity(skel.num_inputs);
        for _ in 0..skel.num_inputs {
            let mut input = InputProxy::default();
            parse_section(&mut fd, &mut input)?;
            inputs.push(input);
        }

        let mut outputs = Vec::with_capacity(skel.num_outputs);
        for _ in 0..skel.num_outputs {
            let mut output = OutputProxy::default();
            parse_section(&mut fd, &mut output)?;
            outputs.push(output);
        }

        Ok(Psbt {
            fd,
            secp: Secp256k1::new(),
            settings,
            txn,
            xpubs,
            unknown: globals.unknown,
            txn_version: skel.version,
            had_witness: skel.had_witness,
            num_inputs: skel.num_inputs,
            num_outputs: skel.num_outputs,
            vin_start: skel.vin_start,
            vout_start: skel.vout_start,
            wit_start: skel.wit_start,
            lock_time: skel.lock_time,
            inputs,
            outputs,
            total_value_out: None,
            total_value_in: None,
            presigned_inputs: BTreeSet::new(),
            consolidation_tx: false,
            num_change_outputs: 0,
            segwit_cache: None,
            tap_cache: None,
            tap_outputs: None,
            active_multisig: None,
            warnings: Vec::new(),
        })
    }

    /// Non-fatal observations accumulated so far; the UI renders these
    /// for user confirmation before signing.
    pub fn warnings(&self) -> &[Warning] { &self.warnings }

    /// Sum of all outputs, known after [`Self::consider_outputs`].
    pub fn total_value_out(&self) -> Option<u64> { self.total_value_out }

    /// Sum of all inputs; `None` when some input UTXO is foreign.
    pub fn total_value_in(&self) -> Option<u64> { self.total_value_in }

    /// True when every output pays back into our own wallet.
    pub fn is_consolidation(&self) -> bool { self.consolidation_tx }

    /// Miner fee, when the input side is fully known.
    pub fn calculate_fee(&self) -> Option<i64> {
        let total_in = self.total_value_in? as i64;
        Some(total_in - self.total_value_out.unwrap_or(0) as i64)
    }

    /// Runs every check between parsing and signing, in order.
    pub fn evaluate(&mut self, registry: &dyn MultisigRegistry) -> Result<()> {
        self.validate(registry)?;
        self.consider_inputs(registry)?;
        self.consider_keys()?;
        self.consider_outputs(registry)?;
        self.consider_dangerous_sighash()?;
        Ok(())
    }

    /// First pass over the txn: per-input validation, xpub handling.
    /// These are syntax/fatal errors, so messages are terse.
    pub fn validate(&mut self, registry: &dyn MultisigRegistry) -> Result<()> {
        check!(self.txn.len > 63, "too short");

        let my_xfp = self.settings.xfp;
        let mut pos = self.vin_start;
        for idx in 0..self.num_inputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let txin = read_tx_in(&mut self.fd)?;
            pos = self.fd.stream_position()?;

            self.inputs[idx].validate(&mut self.fd, idx, &txin, my_xfp, &mut self.warnings)?;
        }

        // if multisig xpub details are provided, they better be right
        // and/or offer import
        if !self.xpubs.is_empty() {
            self.handle_xpubs(registry)?;
        }

        check!(self.num_outputs >= 1, "need outputs");

        Ok(())
    }

    /// Peeks at input scripts to guess the M/N of the multisig, used
    /// when the global xpubs alone are ambiguous.
    fn guess_m_of_n(&mut self) -> Result<Option<(usize, usize)>> {
        for i in 0..self.inputs.len() {
            let ks = match self.inputs[i].witness_script.or(self.inputs[i].redeem_script) {
                Some(s) => s,
                None => continue,
            };
            let rs = read_span(&mut self.fd, ks)?;
            if rs.last() != Some(&0xae) {
                // not OP_CHECKMULTISIG
                continue;
            }
            return Ok(Some(disassemble_multisig_mn(&rs)?));
        }
        // not multisig, probably
        Ok(None)
    }

    /// Looks up (or imports) the right multisig wallet based on the
    /// global xpubs.
    fn handle_xpubs(&mut self, registry: &dyn MultisigRegistry) -> Result<()> {
        debug_assert!(self.active_multisig.is_none());

        let my_xfp = self.settings.xfp;
        let mut xfp_paths: Vec<Vec<u32>> = Vec::new();
        let mut has_mine = 0;
        for gx in &self.xpubs {
            check!(
                !gx.xfp_path.is_empty() && gx.xfp_path.len() % 4 == 0,
                "bad xpub key source"
            );
            let words: Vec<u32> = gx
                .xfp_path
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            if words[0] == my_xfp {
                has_mine += 1;
            }
            xfp_paths.push(words);
        }

        check!(has_mine > 0, "My XFP not involved");

        let candidates = registry.find_candidates(&xfp_paths);

        let selected: Arc<dyn MultisigWallet>;
        if candidates.len() == 1 {
            // exact match by xfp+derivation set, the normal case
            selected = candidates.into_iter().next().unwrap();
        } else {
            let (m, n) = match self.guess_m_of_n()? {
                Some(mn) => mn,
                // not multisig; the XFPs were checked above and
                // re-deriving the xpub here is too slow, so we're done
                None => return Ok(()),
            };
            check!(n == xfp_paths.len(), "wrong number of xpubs for M/N");

            match candidates.into_iter().find(|c| c.m() == m && c.n() == n) {
                Some(c) => selected = c,
                None => {
                    // no enrolled wallet matched: offer to import the
                    // one described by the PSBT
                    let (proposed, need_approval) =
                        registry.import_from_psbt(m, n, &self.xpubs)?;
                    if need_approval {
                        check!(!self.settings.hsm_active, "MS enroll not allowed in HSM mode");
                        check!(
                            registry.approve_import(proposed.as_ref()),
                            "Refused to import new wallet"
                        );
                    }
                    self.active_multisig = Some(proposed);
                    return Ok(());
                }
            }
        }

        // The xpubs must be exactly right, but we use our stored
        // values at signing time regardless; a mismatch here is a
        // fraud attempt in some way, not innocent.
        selected.validate_psbt_xpubs(&self.xpubs)?;
        self.active_multisig = Some(selected);

        Ok(())
    }

    /// Resolves every input's UTXO, accumulates the input value, and
    /// decides which key signs each input.
    pub fn consider_inputs(&mut self, registry: &dyn MultisigRegistry) -> Result<()> {
        let my_xfp = self.settings.xfp;
        let mut foreign = Vec::new();
        let mut total_in: u64 = 0;

        let mut pos = self.vin_start;
        for i in 0..self.num_inputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let txi = read_tx_in(&mut self.fd)?;
            pos = self.fd.stream_position()?;

            if self.inputs[i].fully_signed {
                self.presigned_inputs.insert(i);
            }

            if !self.inputs[i].has_utxo() {
                if self.inputs[i].num_our_keys() > 0 && !self.inputs[i].fully_signed {
                    fatal!("Missing own UTXO(s). Cannot determine value being signed");
                }
                // input clearly not ours
                foreign.push(i);
                continue;
            }

            // pull out just the TxOut (expensive)
            let utxo = self.inputs[i].get_utxo(&mut self.fd, txi.previous_output.vout)?;
            check!(utxo.value.to_sat() > 0, "zero-value input");
            total_in += utxo.value.to_sat();

            // what kind of input will this be, what type of signing,
            // which key; also validates any redeem script and finds
            // the multisig wallet to be used
            self.inputs[i].determine_my_signing_key(
                &mut self.fd,
                i,
                &utxo,
                my_xfp,
                registry,
                &mut self.active_multisig,
                &self.secp,
            )?;
        }

        if foreign.is_empty() {
            check!(total_in > 0, "no value in");
            self.total_value_in = Some(total_in);
        } else {
            // 1+ inputs don't belong to us, so the total input value is
            // unknowable; fine for coinjoin and other multi-party txns
            self.total_value_in = None;
            self.warnings.push(Warning::new(
                "Unable to calculate fee",
                format!("Some input(s) haven't provided UTXO(s): {}", seq_to_str(&foreign)),
            ));
        }

        if self.presigned_inputs.len() == self.num_inputs {
            fatal!("Transaction looks completely signed already?");
        }

        let no_keys: Vec<usize> = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, inp)| inp.required_key.is_none() && !inp.fully_signed)
            .map(|(n, _)| n)
            .collect();
        if !no_keys.is_empty() {
            // seen when you re-sign the same signed file by accident
            self.warnings.push(Warning::new(
                "Limited Signing",
                format!(
                    "We are not signing these inputs, because we do not know the key: {}",
                    seq_to_str(&no_keys)
                ),
            ));
        }

        if !self.presigned_inputs.is_empty() {
            let presigned: Vec<usize> = self.presigned_inputs.iter().copied().collect();
            self.warnings.push(Warning::new(
                "Partly Signed Already",
                format!(
                    "Some input(s) provided were already completely signed by other parties: {}",
                    seq_to_str(&presigned)
                ),
            ));
        }

        if registry.checks_disabled() {
            self.warnings.push(Warning::new("Danger", "Some multisig checks are disabled."));
        }

        Ok(())
    }

    /// Confirms we hold at least one key involved in this transaction.
    pub fn consider_keys(&self) -> Result<()> {
        if self.inputs.iter().any(|i| i.num_our_keys() > 0) {
            return Ok(());
        }

        // collect the XFPs named in the file that are not ours
        let mut others = BTreeSet::new();
        for inp in &self.inputs {
            for keypath in inp.subpaths.values() {
                others.insert(keypath.xfp);
            }
            for tap in inp.taproot_subpaths.values() {
                others.insert(tap.origin.xfp);
            }
        }

        if others.is_empty() {
            // happens with watch-only wallets that don't know any XFP
            // and so can't insert one into the PSBT
            fatal!("PSBT does not contain any key path information.");
        }

        let my_xfp = self.settings.xfp;
        others.remove(&my_xfp);
        let found: Vec<String> = others.iter().map(|x| xfp2str(*x)).collect();
        fatal!(
            "None of the keys involved in this transaction belong to this device (need {}, found {}).",
            xfp2str(my_xfp),
            found.join(", ")
        )
    }

    /// Validates change outputs, totals the output side, and enforces
    /// the fee policy.
    pub fn consider_outputs(&mut self, registry: &dyn MultisigRegistry) -> Result<()> {
        let my_xfp = self.settings.xfp;
        let mut total_out: u64 = 0;
        self.num_change_outputs = 0;

        let mut pos = self.vout_start;
        for idx in 0..self.num_outputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let txo = read_tx_out(&mut self.fd)?;
            pos = self.fd.stream_position()?;

            total_out += txo.value.to_sat();

            self.outputs[idx].validate(
                &mut self.fd,
                idx,
                &txo,
                my_xfp,
                &self.active_multisig,
                registry,
                &mut self.warnings,
                &self.secp,
            )?;
            if self.outputs[idx].is_change {
                self.num_change_outputs += 1;
            }
        }

        self.total_value_out = Some(total_out);

        // check fee is reasonable
        let per_fee = if total_out == 0 {
            100.0
        } else {
            let fee = match self.calculate_fee() {
                Some(f) => f,
                None => return Ok(()),
            };
            check!(fee >= 0, "Outputs worth more than inputs!");
            fee as f64 * 100.0 / total_out as f64
        };

        let fee_limit = self.settings.fee_limit;
        if fee_limit != -1 && per_fee >= fee_limit as f64 {
            fatal!(
                "Network fee bigger than {}% of total amount (it is {:.0}%).",
                fee_limit, per_fee
            );
        }
        if per_fee >= 5.0 {
            self.warnings.push(Warning::new(
                "Big Fee",
                format!("Network fee is more than 5% of total value ({:.1}%).", per_fee),
            ));
        }

        self.consolidation_tx = self.num_change_outputs == self.num_outputs;

        self.consider_dangerous_change();

        Ok(())
    }

    /// Are all the inputs (now) signed?
    pub fn is_complete(&self) -> bool {
        for (i, inp) in self.inputs.iter().enumerate() {
            if inp.is_multisig {
                // we can't combine or finalize multisig
                return false;
            }
            let signed = self.presigned_inputs.contains(&i)
                || inp.added_sig.is_some()
                || inp.taproot_key_sig.is_some();
            if !signed {
                return false;
            }
        }
        true
    }

    /// Re-emits the PSBT, including any signatures we added.
    pub fn serialize<W: Write>(&mut self, out: &mut W) -> Result<()> {
        out.write_all(b"psbt\xff")?;

        // original unsigned txn, unchanged
        kv::write_kv(out, &mut self.fd, PSBT_GLOBAL_UNSIGNED_TX, &[], &Value::Span(self.txn))?;

        for gx in &self.xpubs {
            kv::write_kv(
                out,
                &mut self.fd,
                PSBT_GLOBAL_XPUB,
                &gx.xfp_path,
                &Value::Bytes(gx.xpub.clone()),
            )?;
        }

        for (key, val) in &self.unknown {
            kv::write_kv(out, &mut self.fd, key[0], &key[1..], &Value::Span(*val))?;
        }

        out.write_all(&[0x00])?;

        for inp in &self.inputs {
            inp.serialize(out, &mut self.fd)?;
            out.write_all(&[0x00])?;
        }

        for outp in &self.outputs {
            outp.serialize(out, &mut self.fd)?;
            out.write_all(&[0x00])?;
        }

        Ok(())
    }

    /// Streams out the finalized transaction with signatures applied
    /// and returns its TXID.
    ///
    /// Refuses incomplete PSBTs; multisig inputs can never be
    /// finalized here (combining is someone else's job).
    pub fn finalize<W: Read + Write + Seek>(&mut self, out: &mut W) -> Result<Txid> {
        check!(self.is_complete(), "PSBT is not complete");

        out.write_all(&self.txn_version.to_le_bytes())?;

        // witness data is needed if the original had some, or we made
        // any segwit signature
        let needs_witness = self.had_witness || self.inputs.iter().any(|i| i.is_segwit);

        if needs_witness {
            out.write_all(&[0x00, 0x01])?;
        }

        let body_start = out.stream_position()?;

        out.write_all(&compact_size(self.num_inputs as u64))?;
        let mut pos = self.vin_start;
        for i in 0..self.num_inputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let mut txi = read_tx_in(&mut self.fd)?;
            pos = self.fd.stream_position()?;

            let inp = &self.inputs[i];
            if inp.is_segwit {
                if inp.is_p2sh {
                    // p2sh-wrapped segwit still shows the redeem script
                    let script_sig = match &inp.script_sig {
                        Some(s) => s,
                        None => fatal!("No redeem script on input #{}", i),
                    };
                    txi.script_sig = ScriptBuf::from_bytes(push_data(script_sig));
                } else {
                    // major win for segwit: no redeem script bloat
                    txi.script_sig = ScriptBuf::new();
                }
                // actual signature goes in the witness data area
            } else {
                let (pubkey, der_sig) = match &inp.added_sig {
                    Some(s) => s,
                    None => fatal!("No signature on input #{}", i),
                };
                check!(!inp.is_multisig, "Multisig PSBT combine not supported");

                let mut s = push_data(der_sig);
                s.extend_from_slice(&push_data(pubkey));
                txi.script_sig = ScriptBuf::from_bytes(s);
            }

            out.write_all(&consensus_serialize(&txi))?;
        }

        out.write_all(&compact_size(self.num_outputs as u64))?;
        let mut pos = self.vout_start;
        for _ in 0..self.num_outputs {
            self.fd.seek(SeekFrom::Start(pos))?;
            let txo = read_tx_out(&mut self.fd)?;
            pos = self.fd.stream_position()?;
            out.write_all(&consensus_serialize(&txo))?;
        }

        let body_end = out.stream_position()?;

        if needs_witness {
            // preserve witnesses that were given, add ours
            let mut wit_pos = self.wit_start;
            for i in 0..self.num_inputs {
                let mut wit = match wit_pos {
                    Some(p) => {
                        self.fd.seek(SeekFrom::Start(p))?;
                        let w = read_witness(&mut self.fd)?;
                        wit_pos = Some(self.fd.stream_position()?);
                        w
                    }
                    None => Witness::new(),
                };

                let tap_sig: Option<Vec<u8>> = match &self.inputs[i].taproot_key_sig {
                    Some(Value::Bytes(b)) => Some(b.clone()),
                    Some(Value::Span(s)) => Some(read_span(&mut self.fd, *s)?),
                    None => None,
                };

                let inp = &self.inputs[i];
                if inp.is_segwit && (inp.added_sig.is_some() || tap_sig.is_some()) {
                    check!(wit.is_empty(), "replacing non-empty?");
                    check!(!inp.is_multisig, "Multisig PSBT combine not supported");

                    if let Some(sig) = tap_sig {
                        // segwit v1 (taproot); 65 bytes iff sighash is
                        // not DEFAULT
                        check!(sig.len() == 64 || sig.len() == 65, "bad taproot key sig");
                        wit = Witness::from_slice(&[&sig[..]]);
                    } else {
                        // segwit v0
                        let (pubkey, der_sig) = inp.added_sig.as_ref().unwrap();
                        check!(
                            pubkey.len() == 33 && (pubkey[0] == 0x02 || pubkey[0] == 0x03),
                            "bad v0 pubkey"
                        );
                        wit = Witness::from_slice(&[&der_sig[..], &pubkey[..]]);
                    }
                }

                out.write_all(&consensus_serialize(&wit))?;
            }
        }

        out.write_all(&self.lock_time.to_le_bytes())?;

        let total = out.stream_position()?;
        let txid = calc_txid(
            out,
            Span { pos: 0, len: total },
            Some(Span { pos: body_start, len: body_end - body_start }),
        )?;

        Ok(txid)
    }
}

/// Renders a set of indices as a tidy, ordered list.
fn seq_to_str(seq: &[usize]) -> String {
    let mut sorted: Vec<usize> = seq.to_vec();
    sorted.sort_unstable();
    sorted.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}
