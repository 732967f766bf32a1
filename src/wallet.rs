// SPDX-License-Identifier: CC0-1.0

//! Interface to the multisig wallet registry.
//!
//! The registry itself lives outside this crate (it owns persistent
//! storage and the user-approval UX); the signing core only consumes
//! it through these traits. During one signing operation at most one
//! wallet is active.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::keypath::{Keypath, TapKeypath};

/// One `PSBT_GLOBAL_XPUB` record: raw key source bytes and the
/// serialized xpub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalXpub {
    /// `xfp || path` words, exactly as found in the record key.
    pub xfp_path: Vec<u8>,
    /// The extended public key, BIP-32 serialization.
    pub xpub: Vec<u8>,
}

/// A registered multisig wallet the device already knows about (or has
/// just agreed to import).
pub trait MultisigWallet {
    /// Signatures required.
    fn m(&self) -> usize;
    /// Total cosigners.
    fn n(&self) -> usize;

    /// Human-readable wallet name, for approval screens.
    fn name(&self) -> &str;

    /// Confirms this wallet matches the given M/N and set of
    /// fingerprint+path tuples; anything else is fatal.
    fn assert_matching(&self, m: usize, n: usize, xfp_paths: &[Vec<u32>]) -> Result<()>;

    /// Reconstructs the redeem/witness script from registered xpubs and
    /// the PSBT's derivation records and verifies `script` equals it
    /// byte for byte (BIP-45/BIP-67 ordering rules included).
    fn validate_script(&self, script: &[u8], subpaths: &BTreeMap<Vec<u8>, Keypath>) -> Result<()>;

    /// Checks `PSBT_GLOBAL_XPUB` records against the stored wallet
    /// (chain codes in particular). Any mismatch is a fraud attempt.
    fn validate_psbt_xpubs(&self, xpubs: &[GlobalXpub]) -> Result<()>;

    /// Returns the registered taproot internal key for this wallet,
    /// derived along the path the PSBT's records claim.
    fn validate_tr_internal_key(
        &self,
        taproot_subpaths: &BTreeMap<Vec<u8>, TapKeypath>,
    ) -> Result<[u8; 32]>;

    /// Rebuilds the single `multi_a` leaf script from registered keys.
    fn make_multisig_tr(
        &self,
        taproot_subpaths: &BTreeMap<Vec<u8>, TapKeypath>,
    ) -> Result<Vec<u8>>;
}

/// The device's registry of multisig wallets.
pub trait MultisigRegistry {
    /// Wallets whose cosigner fingerprint+path set matches.
    fn find_candidates(&self, xfp_paths: &[Vec<u32>]) -> Vec<Arc<dyn MultisigWallet>>;

    /// Exact lookup by M, N and fingerprint+path set.
    fn find_match(
        &self,
        m: usize,
        n: usize,
        xfp_paths: &[Vec<u32>],
    ) -> Option<Arc<dyn MultisigWallet>>;

    /// Builds a wallet proposal out of the PSBT's global xpubs.
    ///
    /// Returns the proposal and whether interactive approval is still
    /// required before it may be used.
    fn import_from_psbt(
        &self,
        m: usize,
        n: usize,
        xpubs: &[GlobalXpub],
    ) -> Result<(Arc<dyn MultisigWallet>, bool)>;

    /// Asks the user to approve importing `wallet`. Refusal aborts the
    /// signing operation.
    fn approve_import(&self, wallet: &dyn MultisigWallet) -> bool;

    /// True when multisig validation has been switched off by the user.
    /// We then refuse to treat anything as change rather than hide an
    /// output we cannot prove is ours.
    fn checks_disabled(&self) -> bool { false }
}

/// Registry for devices with no multisig wallets enrolled.
///
/// Never matches, never imports; any multisig PSBT fails with `Unknown
/// multisig wallet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMultisig;

impl MultisigRegistry for NoMultisig {
    fn find_candidates(&self, _xfp_paths: &[Vec<u32>]) -> Vec<Arc<dyn MultisigWallet>> {
        Vec::new()
    }

    fn find_match(
        &self,
        _m: usize,
        _n: usize,
        _xfp_paths: &[Vec<u32>],
    ) -> Option<Arc<dyn MultisigWallet>> {
        None
    }

    fn import_from_psbt(
        &self,
        _m: usize,
        _n: usize,
        _xpubs: &[GlobalXpub],
    ) -> Result<(Arc<dyn MultisigWallet>, bool)> {
        fatal!("Unknown multisig wallet")
    }

    fn approve_import(&self, _wallet: &dyn MultisigWallet) -> bool { false }
}
