// SPDX-License-Identifier: CC0-1.0

//! Hardware-wallet signing core for Partially Signed Bitcoin
//! Transactions.
//!
//! PSBT container format as defined in [BIP-174], taproot fields per
//! [BIP-371]. The PSBT arrives from an untrusted host, so every field
//! is treated as potentially hostile: UTXOs are cross-checked against
//! outpoints, claimed change outputs are re-derived and compared byte
//! for byte, and multisig details must match an enrolled wallet.
//!
//! Parsing is stream-oriented: the container holds `(offset, length)`
//! references into the backing stream and re-reads values in small
//! chunks, because the target device has kilobytes of RAM, not
//! megabytes.
//!
//! [BIP-174]: <https://github.com/bitcoin/bips/blob/master/bip-0174.mediawiki>
//! [BIP-371]: <https://github.com/bitcoin/bips/blob/master/bip-0371.mediawiki>

// Coding conventions.
#![warn(missing_docs)]
#![doc(test(attr(warn(unused))))]
// Exclude lints we don't think are valuable.
#![allow(clippy::manual_range_contains)] // More readable than clippy's format.

/// Re-export of the `rust-bitcoin` crate.
pub extern crate bitcoin;

#[macro_use]
mod macros;

mod error;
mod input;
mod keypath;
mod keystore;
mod kv;
mod output;
mod policy;
mod psbt;
mod script;
mod sighash;
mod signer;
mod stream;
mod transaction;
mod wallet;

#[rustfmt::skip]                // Keep public exports separate.
#[doc(inline)]
pub use self::{
    error::{Error, Result},
    input::InputProxy,
    keypath::{Keypath, TapKeypath},
    keystore::{DerivedNode, SensitiveValues},
    output::OutputProxy,
    psbt::Psbt,
    wallet::{GlobalXpub, MultisigRegistry, MultisigWallet, NoMultisig},
};

/// Most cosigners a multisig wallet (and therefore a PSBT) can carry.
pub const MAX_SIGNERS: usize = 15;

/// Max miner's fee, as percentage of output value, that we will sign
/// without an explicit setting. Amounts over 5% warn regardless.
pub const DEFAULT_MAX_FEE_PERCENTAGE: i32 = 10;

/// Device settings the signing core consults.
#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Our master key fingerprint, LE word as used on the wire.
    pub xfp: u32,
    /// Fee limit as a percentage of total output value; -1 disables.
    pub fee_limit: i32,
    /// True when the user has allowed risky sighash values.
    pub sighshchk: bool,
    /// True when running under HSM policy (no interactive enrolls).
    pub hsm_active: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            xfp: 0,
            fee_limit: DEFAULT_MAX_FEE_PERCENTAGE,
            sighshchk: false,
            hsm_active: false,
        }
    }
}

impl Settings {
    /// Settings for a device with the given master fingerprint.
    pub fn with_xfp(xfp: u32) -> Self { Settings { xfp, ..Default::default() } }
}

/// A non-fatal observation made while working through the PSBT.
///
/// Warnings are rendered for user confirmation before the signer runs;
/// they never stop the operation by themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Short tag, e.g. `Zero XFP`.
    pub title: String,
    /// Full explanation shown to the user.
    pub message: String,
}

impl Warning {
    pub(crate) fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Warning { title: title.into(), message: message.into() }
    }
}
