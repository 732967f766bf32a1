// SPDX-License-Identifier: CC0-1.0

//! Interface to the master-seed store.
//!
//! The seed never enters this crate. The signer asks the store for
//! BIP-32 nodes by derivation path, uses them, and drops them; a
//! dropped node erases its key material. Implementations are expected
//! to hold the seed only for the duration of one signing operation
//! (scoped acquisition) and wipe it on every exit path.

use bitcoin::bip32::DerivationPath;
use bitcoin::secp256k1::{Keypair, PublicKey, SecretKey, XOnlyPublicKey};

use crate::error::Result;

/// Scoped access to derived signing keys.
pub trait SensitiveValues {
    /// Derives the BIP-32 node at `path` below the master key.
    fn derive_path(&mut self, path: &DerivationPath) -> Result<DerivedNode>;

    /// True when the duress wallet is active: signatures must be
    /// produced but provably invalid.
    fn deltamode(&self) -> bool { false }
}

/// A derived private/public key pair.
///
/// Wraps the secp keypair so the secret is erased when the node goes
/// out of scope, whichever way it leaves.
pub struct DerivedNode {
    keypair: Keypair,
}

impl DerivedNode {
    /// Wraps a freshly derived keypair.
    pub fn new(keypair: Keypair) -> Self { DerivedNode { keypair } }

    /// Compressed SEC1 public key bytes.
    pub fn pubkey(&self) -> [u8; 33] { PublicKey::from_keypair(&self.keypair).serialize() }

    /// X-only public key bytes.
    pub fn xonly_pubkey(&self) -> [u8; 32] {
        XOnlyPublicKey::from_keypair(&self.keypair).0.serialize()
    }

    pub(crate) fn keypair(&self) -> &Keypair { &self.keypair }

    pub(crate) fn secret_key(&self) -> SecretKey { self.keypair.secret_key() }
}

impl Drop for DerivedNode {
    fn drop(&mut self) { self.keypair.non_secure_erase(); }
}
