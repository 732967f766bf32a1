// SPDX-License-Identifier: CC0-1.0

//! The actual signing pass.
//!
//! By the time this runs the transaction has been approved: every
//! input has a resolved UTXO and signing key, and every change output
//! has passed the script checks. One last defense remains here: change
//! output key paths are re-derived against the seed before any
//! signature is made, because that check catches bad actors rather
//! than bugs.

use std::io::{Read, Seek};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Message;
use bitcoin::taproot::{TapNodeHash, TapTweakHash};
use bitcoin::EcdsaSighashType;

use crate::error::{Error, Result};
use crate::input::RequiredKey;
use crate::keystore::{DerivedNode, SensitiveValues};
use crate::kv::Value;
use crate::psbt::Psbt;
use crate::sighash::SIGHASH_DEFAULT;
use crate::stream::read_span;

/// What one input needs signed, gathered before any hashing starts.
struct SigningPlan {
    key: Vec<u8>,
    node: DerivedNode,
    schnorr: bool,
    /// Script-path spend: the (single) leaf script and its version.
    tapleaf: Option<(Vec<u8>, u8)>,
    merkle_root: Option<[u8; 32]>,
    is_segwit: bool,
    is_taproot: bool,
    amount: u64,
    script_code: Option<Vec<u8>>,
    sighash: u32,
}

impl<F: Read + Seek> Psbt<F> {
    /// Signs every input we hold a key for, adding the results to the
    /// per-input state. Returns how many signatures were produced.
    ///
    /// Re-signing an already-signed input is a no-op, so calling this
    /// twice changes nothing.
    pub fn sign(&mut self, sv: &mut dyn SensitiveValues) -> Result<usize> {
        // Double check the change outputs. Slow, but it detects bad
        // actors, not bugs or mistakes.
        self.check_change_outputs(sv)?;

        let mut sigs = 0;
        for idx in 0..self.num_inputs {
            let plan = match self.plan_input(idx, sv)? {
                Some(p) => p,
                None => continue,
            };

            let digest: [u8; 32] = if sv.deltamode() {
                // Current user is a thug with a slightly-wrong PIN. We
                // could sign properly, but instead silently corrupt
                // the digest; signatures come out provably invalid.
                let mut d = [0u8; 32];
                for (i, b) in d.iter_mut().enumerate() {
                    *b = i as u8;
                }
                d
            } else if !plan.is_segwit {
                self.make_txn_sighash(idx, plan.sighash)?.to_byte_array()
            } else if !plan.is_taproot {
                let script_code = match &plan.script_code {
                    Some(sc) => sc,
                    None => fatal!("need scriptCode here"),
                };
                self.make_txn_segwit_sighash(idx, plan.amount, script_code, plan.sighash)?
                    .to_byte_array()
            } else if let Some((script, leaf_ver)) = &plan.tapleaf {
                self.make_txn_taproot_sighash(idx, plan.sighash, Some((script.as_slice(), *leaf_ver)))?
                    .to_byte_array()
            } else {
                self.make_txn_taproot_sighash(idx, plan.sighash, None)?.to_byte_array()
            };

            self.sign_one(idx, plan, digest)?;
            sigs += 1;
        }

        Ok(sigs)
    }

    /// Re-derives the claimed pubkey of every change output from the
    /// seed. A path that does not lead to the claimed key is fraud.
    fn check_change_outputs(&mut self, sv: &mut dyn SensitiveValues) -> Result<()> {
        let my_xfp = self.settings.xfp;

        for out_idx in 0..self.outputs.len() {
            if !self.outputs[out_idx].is_change {
                continue;
            }

            let mut good = 0;
            for (pubkey, keypath) in &self.outputs[out_idx].subpaths {
                // for multisig there are N paths and exactly one is our
                // key; single-signer should always be our XFP
                if keypath.xfp != my_xfp {
                    continue;
                }
                let node = sv.derive_path(&keypath.derivation_path())?;
                if pubkey[..] == node.pubkey()[..] {
                    good += 1;
                }
            }
            for (xonly, tap) in &self.outputs[out_idx].taproot_subpaths {
                if tap.origin.xfp != my_xfp {
                    continue;
                }
                let node = sv.derive_path(&tap.origin.derivation_path())?;
                if xonly[..] == node.xonly_pubkey()[..] {
                    good += 1;
                }
            }

            if good == 0 {
                return Err(Error::fraud(
                    out_idx,
                    "Deception regarding change output. \
                     BIP-32 path doesn't match actual address.",
                ));
            }
        }

        Ok(())
    }

    /// Decides whether input `idx` gets a signature this pass and, if
    /// so, derives the node and collects everything hashing will need.
    fn plan_input(
        &mut self,
        idx: usize,
        sv: &mut dyn SensitiveValues,
    ) -> Result<Option<SigningPlan>> {
        let merkle_root: Option<[u8; 32]> = match self.inputs[idx].taproot_merkle_root {
            Some(span) => {
                let v = read_span(&mut self.fd, span)?;
                let mut h = [0u8; 32];
                h.copy_from_slice(&v);
                Some(h)
            }
            None => None,
        };

        let inp = &self.inputs[idx];

        if !inp.has_utxo() {
            // maybe they didn't provide the UTXO
            return Ok(None);
        }
        if inp.fully_signed {
            // for multisig it's possible another sig could be added,
            // but in other cases no more signatures are possible
            return Ok(None);
        }
        if inp.added_sig.is_some() || inp.taproot_key_sig.is_some() {
            // already signed by us; re-signing is a no-op
            return Ok(None);
        }

        let required = match &inp.required_key {
            Some(r) => r,
            // we don't know the key for this input
            None => return Ok(None),
        };

        let sighash = inp.effective_sighash();
        let is_taproot = !inp.taproot_subpaths.is_empty();

        let plan = if inp.is_multisig || inp.tapscript {
            // consider a set of possible keys, since an xfp may not be
            // unique among the cosigners
            let candidates: Vec<Vec<u8>> = match required {
                RequiredKey::Multi(set) => set.iter().cloned().collect(),
                RequiredKey::Single(k) => vec![k.clone()],
            };

            let mut found = None;
            for key in candidates {
                let path = if inp.tapscript {
                    inp.taproot_subpaths[&key].origin.derivation_path()
                } else {
                    inp.subpaths[&key].derivation_path()
                };
                let node = sv.derive_path(&path)?;

                // expensive test, but works, and important
                let pubkey = node.pubkey();
                if pubkey[..] == key[..] {
                    found = Some((key, node, None));
                    break;
                }
                if key.len() == 32 && pubkey[1..] == key[..] {
                    // find the (single, already verified) leaf script
                    // this key appears in
                    let mut leaf = None;
                    for ((script, leaf_ver), _blocks) in &inp.taproot_scripts {
                        if script.windows(32).any(|w| w == &key[..]) {
                            leaf = Some((script.clone(), *leaf_ver));
                            break;
                        }
                    }
                    found = Some((key, node, leaf));
                    break;
                }
            }

            let (key, node, tapleaf) = match found {
                Some(f) => f,
                None => fatal!("Input #{} needs pubkey I dont have", idx),
            };

            SigningPlan {
                schnorr: inp.tapscript,
                is_segwit: inp.is_segwit,
                is_taproot,
                amount: inp.amount,
                script_code: inp.script_code.clone(),
                sighash,
                merkle_root,
                key,
                node,
                tapleaf,
            }
        } else {
            // single pubkey <=> single key
            let key = match required {
                RequiredKey::Single(k) => k.clone(),
                RequiredKey::Multi(_) => fatal!("Input #{} needs pubkey I dont have", idx),
            };

            let (node, pu, schnorr) = if let Some(keypath) =
                self.inputs[idx].subpaths.get(&key).filter(|k| k.xfp == self.settings.xfp)
            {
                let node = sv.derive_path(&keypath.derivation_path())?;
                let pu = node.pubkey().to_vec();
                (node, pu, false)
            } else if let Some(tap) = self.inputs[idx]
                .taproot_subpaths
                .get(&key)
                .filter(|t| t.origin.xfp == self.settings.xfp)
            {
                let node = sv.derive_path(&tap.origin.derivation_path())?;
                let pu = node.xonly_pubkey().to_vec();
                (node, pu, true)
            } else {
                // we don't have the key for this subkey
                return Ok(None);
            };

            check!(pu[..] == key[..], "Path led to wrong pubkey for input#{}", idx);

            SigningPlan {
                schnorr,
                is_segwit: self.inputs[idx].is_segwit,
                is_taproot,
                amount: self.inputs[idx].amount,
                script_code: self.inputs[idx].script_code.clone(),
                sighash,
                merkle_root,
                key,
                node,
                tapleaf: None,
            }
        };

        Ok(Some(plan))
    }

    /// Produces and stores the signature for one planned input.
    fn sign_one(&mut self, idx: usize, plan: SigningPlan, digest: [u8; 32]) -> Result<()> {
        let msg = Message::from_digest(digest);

        if plan.schnorr {
            if plan.tapleaf.is_some() {
                // tapscript: keys are not tweaked, sign with the key
                // exactly as it appears in the script
                let sig = self.secp.sign_schnorr_no_aux_rand(&msg, plan.node.keypair());
                let mut bytes = sig.as_ref().to_vec();
                if plan.sighash != SIGHASH_DEFAULT {
                    bytes.push(plan.sighash as u8);
                }
                // single-leaf tree: the leaf hash is the merkle root,
                // already verified against the registered wallet
                let leaf_hash = match plan.merkle_root {
                    Some(h) => h,
                    None => fatal!("Merkle root not defined"),
                };
                self.inputs[idx]
                    .taproot_script_sigs
                    .insert((plan.key, leaf_hash), Value::Bytes(bytes));
            } else {
                // BIP-341: if no script path is required, the output
                // key commits to an unspendable script path; when a
                // script path exists but the internal key is ours, the
                // merkle root joins the tweak.
                let (internal_key, _parity) = plan.node.keypair().x_only_public_key();
                let tweak = TapTweakHash::from_key_and_tweak(
                    internal_key,
                    plan.merkle_root.map(TapNodeHash::from_byte_array),
                );
                let mut tweaked = match plan
                    .node
                    .keypair()
                    .add_xonly_tweak(&self.secp, &tweak.to_scalar())
                {
                    Ok(kp) => kp,
                    Err(_) => fatal!("tweak failed"),
                };

                let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
                tweaked.non_secure_erase();

                let mut bytes = sig.as_ref().to_vec();
                // in the common SIGHASH_DEFAULT case the sighash byte
                // MUST be omitted, giving a 64-byte signature
                if plan.sighash != SIGHASH_DEFAULT {
                    bytes.push(plan.sighash as u8);
                }
                self.inputs[idx].taproot_key_sig = Some(Value::Bytes(bytes));
            }
        } else {
            let sighash_type = match EcdsaSighashType::from_standard(plan.sighash) {
                Ok(t) => t,
                Err(_) => fatal!("Unsupported sighash flag 0x{:x}", plan.sighash),
            };

            // Low-R grinding: a shorter DER encoding saves miner fees
            // and blends in with Bitcoin Core signatures, which do the
            // same. DER stays within 71 bytes including sighash byte.
            let secret = plan.node.secret_key();
            let signature = self.secp.sign_ecdsa_low_r(&msg, &secret);

            let der = bitcoin::ecdsa::Signature { signature, sighash_type }.to_vec();
            self.inputs[idx].added_sig = Some((plan.key, der));
        }

        Ok(())
    }
}
