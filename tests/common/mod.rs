// SPDX-License-Identifier: CC0-1.0

//! Shared helpers for the end-to-end signing scenarios: a bare-bones
//! PSBT composer (mirroring what a host wallet would produce), a
//! deterministic seed, and an in-memory multisig registry.

#![allow(dead_code)] // not every test file uses every helper

use std::collections::BTreeMap;
use std::sync::Arc;

use psbt_signer::bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use psbt_signer::bitcoin::consensus::encode::serialize;
use psbt_signer::bitcoin::hashes::{hash160, sha256, Hash};
use psbt_signer::bitcoin::key::TapTweak;
use psbt_signer::bitcoin::secp256k1::{All, Secp256k1, XOnlyPublicKey};
use psbt_signer::bitcoin::taproot::{LeafVersion, TapLeafHash, TapNodeHash};
use psbt_signer::bitcoin::{
    absolute, transaction, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use psbt_signer::{
    DerivedNode, Error, GlobalXpub, Keypath, MultisigRegistry, MultisigWallet, Result,
    SensitiveValues, TapKeypath,
};

pub const HARD: u32 = 0x8000_0000;

// key types used by the composer
pub const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
pub const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
pub const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
pub const PSBT_IN_SIGHASH_TYPE: u8 = 0x03;
pub const PSBT_IN_WITNESS_SCRIPT: u8 = 0x05;
pub const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;
pub const PSBT_IN_TAP_KEY_SIG: u8 = 0x13;
pub const PSBT_IN_TAP_SCRIPT_SIG: u8 = 0x14;
pub const PSBT_IN_TAP_LEAF_SCRIPT: u8 = 0x15;
pub const PSBT_IN_TAP_BIP32_DERIVATION: u8 = 0x16;
pub const PSBT_IN_TAP_INTERNAL_KEY: u8 = 0x17;
pub const PSBT_IN_TAP_MERKLE_ROOT: u8 = 0x18;
pub const PSBT_OUT_BIP32_DERIVATION: u8 = 0x02;
pub const PSBT_OUT_TAP_BIP32_DERIVATION: u8 = 0x07;

pub fn compact_size(n: u64) -> Vec<u8> {
    let mut v = Vec::new();
    if n < 0xfd {
        v.push(n as u8);
    } else if n <= 0xffff {
        v.push(0xfd);
        v.extend_from_slice(&(n as u16).to_le_bytes());
    } else {
        v.push(0xfe);
        v.extend_from_slice(&(n as u32).to_le_bytes());
    }
    v
}

/// Builds PSBT files record by record, the way a host wallet would.
pub struct PsbtBuilder {
    pub tx: Transaction,
    globals: Vec<u8>,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
}

impl PsbtBuilder {
    pub fn new(tx: Transaction) -> Self {
        let inputs = vec![Vec::new(); tx.input.len()];
        let outputs = vec![Vec::new(); tx.output.len()];
        PsbtBuilder { tx, globals: Vec::new(), inputs, outputs }
    }

    fn record(buf: &mut Vec<u8>, key_type: u8, key: &[u8], val: &[u8]) {
        buf.extend_from_slice(&compact_size(1 + key.len() as u64));
        buf.push(key_type);
        buf.extend_from_slice(key);
        buf.extend_from_slice(&compact_size(val.len() as u64));
        buf.extend_from_slice(val);
    }

    pub fn global(&mut self, key_type: u8, key: &[u8], val: &[u8]) -> &mut Self {
        Self::record(&mut self.globals, key_type, key, val);
        self
    }

    pub fn input(&mut self, idx: usize, key_type: u8, key: &[u8], val: &[u8]) -> &mut Self {
        Self::record(&mut self.inputs[idx], key_type, key, val);
        self
    }

    pub fn output(&mut self, idx: usize, key_type: u8, key: &[u8], val: &[u8]) -> &mut Self {
        Self::record(&mut self.outputs[idx], key_type, key, val);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut raw = b"psbt\xff".to_vec();
        Self::record(&mut raw, 0x00, &[], &serialize(&self.tx));
        raw.extend_from_slice(&self.globals);
        raw.push(0x00);
        for section in self.inputs.iter().chain(self.outputs.iter()) {
            raw.extend_from_slice(section);
            raw.push(0x00);
        }
        raw
    }
}

/// Encodes `xfp || path` as 32-bit LE words.
pub fn keypath_value(xfp: u32, steps: &[u32]) -> Vec<u8> {
    let mut v = xfp.to_le_bytes().to_vec();
    for s in steps {
        v.extend_from_slice(&s.to_le_bytes());
    }
    v
}

/// Encodes a taproot derivation value: leaf hashes, then the origin.
pub fn tap_keypath_value(leaf_hashes: &[[u8; 32]], xfp: u32, steps: &[u32]) -> Vec<u8> {
    let mut v = compact_size(leaf_hashes.len() as u64);
    for lh in leaf_hashes {
        v.extend_from_slice(lh);
    }
    v.extend_from_slice(&keypath_value(xfp, steps));
    v
}

pub fn p2pkh_script(pubkey: &[u8]) -> ScriptBuf {
    let h = hash160::Hash::hash(pubkey);
    let mut s = vec![0x76, 0xa9, 0x14];
    s.extend_from_slice(&h.to_byte_array());
    s.extend_from_slice(&[0x88, 0xac]);
    ScriptBuf::from_bytes(s)
}

pub fn p2wpkh_script(pubkey: &[u8]) -> ScriptBuf {
    let h = hash160::Hash::hash(pubkey);
    let mut s = vec![0x00, 0x14];
    s.extend_from_slice(&h.to_byte_array());
    ScriptBuf::from_bytes(s)
}

pub fn p2wsh_script(witness_script: &[u8]) -> ScriptBuf {
    let h = sha256::Hash::hash(witness_script);
    let mut s = vec![0x00, 0x20];
    s.extend_from_slice(&h.to_byte_array());
    ScriptBuf::from_bytes(s)
}

pub fn p2tr_script(output_key: &[u8; 32]) -> ScriptBuf {
    let mut s = vec![0x51, 0x20];
    s.extend_from_slice(output_key);
    ScriptBuf::from_bytes(s)
}

/// Classic sorted-multisig script: `OP_m <pk>*n OP_n CHECKMULTISIG`.
pub fn multisig_script(m: usize, pubkeys: &[[u8; 33]]) -> Vec<u8> {
    let mut keys = pubkeys.to_vec();
    keys.sort();
    let mut s = vec![0x50 + m as u8];
    for k in &keys {
        s.push(33);
        s.extend_from_slice(k);
    }
    s.push(0x50 + keys.len() as u8);
    s.push(0xae);
    s
}

/// Tapscript `multi_a`: `<pk> CHECKSIG (<pk> CHECKSIGADD)* OP_m NUMEQUAL`.
pub fn multi_a_script(m: usize, xonly_keys: &[[u8; 32]]) -> Vec<u8> {
    let mut keys = xonly_keys.to_vec();
    keys.sort();
    let mut s = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        s.push(32);
        s.extend_from_slice(k);
        s.push(if i == 0 { 0xac } else { 0xba });
    }
    s.push(0x50 + m as u8);
    s.push(0x9c);
    s
}

pub fn steps_to_path(steps: &[u32]) -> DerivationPath {
    DerivationPath::from(steps.iter().map(|&n| ChildNumber::from(n)).collect::<Vec<_>>())
}

/// A deterministic master seed plus the scoped-derivation interface
/// the signer expects.
pub struct TestSeed {
    pub master: Xpriv,
    pub secp: Secp256k1<All>,
    pub deltamode: bool,
}

impl TestSeed {
    pub fn from_bytes(seed: &[u8]) -> Self {
        let master = Xpriv::new_master(Network::Bitcoin, seed).unwrap();
        TestSeed { master, secp: Secp256k1::new(), deltamode: false }
    }

    pub fn new() -> Self { Self::from_bytes(&[0x5a; 32]) }

    pub fn xfp(&self) -> u32 {
        let fp = Xpub::from_priv(&self.secp, &self.master).fingerprint();
        u32::from_le_bytes(fp.to_bytes())
    }

    pub fn xpub_at(&self, steps: &[u32]) -> Xpub {
        let xpriv = self.master.derive_priv(&self.secp, &steps_to_path(steps)).unwrap();
        Xpub::from_priv(&self.secp, &xpriv)
    }

    pub fn pubkey_at(&self, steps: &[u32]) -> [u8; 33] {
        self.xpub_at(steps).public_key.serialize()
    }

    pub fn xonly_at(&self, steps: &[u32]) -> [u8; 32] {
        let (xonly, _) = self.xpub_at(steps).public_key.x_only_public_key();
        xonly.serialize()
    }
}

impl SensitiveValues for TestSeed {
    fn derive_path(&mut self, path: &DerivationPath) -> Result<DerivedNode> {
        let node = self
            .master
            .derive_priv(&self.secp, path)
            .map_err(|e| Error::Fatal(format!("derivation failed: {}", e)))?;
        Ok(DerivedNode::new(node.to_keypair(&self.secp)))
    }

    fn deltamode(&self) -> bool { self.deltamode }
}

/// The BIP-341 "nothing up my sleeve" point, as the unspendable
/// internal key for tapscript wallets.
pub fn nums_point() -> [u8; 32] {
    let mut k = [0u8; 32];
    let hex = "50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";
    for (i, byte) in k.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
    }
    k
}

/// Computes the BIP-341 output key for an internal key and optional
/// merkle root, using rust-bitcoin (independent of the crate code).
pub fn output_key(internal: &[u8; 32], merkle_root: Option<[u8; 32]>) -> [u8; 32] {
    let secp = Secp256k1::new();
    let key = XOnlyPublicKey::from_slice(internal).unwrap();
    let (out, _) = key.tap_tweak(&secp, merkle_root.map(TapNodeHash::from_byte_array));
    out.serialize()
}

pub fn tap_leaf_hash(script: &[u8]) -> [u8; 32] {
    TapLeafHash::from_script(
        psbt_signer::bitcoin::Script::from_bytes(script),
        LeafVersion::TapScript,
    )
    .to_byte_array()
}

/// One registered multisig wallet backed by cosigner xpubs.
pub struct TestWallet {
    pub name: String,
    pub m: usize,
    pub n: usize,
    /// (xfp word, account path, account xpub) per cosigner.
    pub cosigners: Vec<(u32, Vec<u32>, Xpub)>,
    pub internal_key: Option<[u8; 32]>,
    pub secp: Secp256k1<All>,
}

impl TestWallet {
    fn derive_cosigner_key(&self, keypath: &Keypath) -> Result<[u8; 33]> {
        for (xfp, account, xpub) in &self.cosigners {
            if *xfp != keypath.xfp || keypath.steps.len() < account.len() {
                continue;
            }
            if &keypath.steps[..account.len()] != account.as_slice() {
                continue;
            }
            let suffix = steps_to_path(&keypath.steps[account.len()..]);
            let child = xpub
                .derive_pub(&self.secp, &suffix)
                .map_err(|e| Error::Fatal(format!("derivation failed: {}", e)))?;
            return Ok(child.public_key.serialize());
        }
        Err(Error::Fatal("unknown cosigner".to_string()))
    }
}

impl MultisigWallet for TestWallet {
    fn m(&self) -> usize { self.m }
    fn n(&self) -> usize { self.n }
    fn name(&self) -> &str { &self.name }

    fn assert_matching(&self, m: usize, n: usize, xfp_paths: &[Vec<u32>]) -> Result<()> {
        if m != self.m || n != self.n {
            return Err(Error::Fatal("M/N mismatch".to_string()));
        }
        for path in xfp_paths {
            if !self.cosigners.iter().any(|(xfp, _, _)| *xfp == path[0]) {
                return Err(Error::Fatal("cosigner fingerprint mismatch".to_string()));
            }
        }
        Ok(())
    }

    fn validate_script(&self, script: &[u8], subpaths: &BTreeMap<Vec<u8>, Keypath>) -> Result<()> {
        let mut keys = Vec::new();
        for (claimed, keypath) in subpaths {
            let derived = self.derive_cosigner_key(keypath)?;
            if claimed[..] != derived[..] {
                return Err(Error::Fatal("pubkey does not derive from cosigner".to_string()));
            }
            keys.push(derived);
        }
        if keys.len() != self.n {
            return Err(Error::Fatal("wrong number of cosigner keys".to_string()));
        }
        let expect = multisig_script(self.m, &keys);
        if expect[..] != script[..] {
            return Err(Error::Fatal("script does not match registered wallet".to_string()));
        }
        Ok(())
    }

    fn validate_psbt_xpubs(&self, xpubs: &[GlobalXpub]) -> Result<()> {
        for gx in xpubs {
            let xpub = Xpub::decode(&gx.xpub)
                .map_err(|e| Error::Fatal(format!("bad xpub: {}", e)))?;
            if !self.cosigners.iter().any(|(_, _, x)| *x == xpub) {
                return Err(Error::Fatal("xpub not part of this wallet".to_string()));
            }
        }
        Ok(())
    }

    fn validate_tr_internal_key(
        &self,
        _taproot_subpaths: &BTreeMap<Vec<u8>, TapKeypath>,
    ) -> Result<[u8; 32]> {
        match self.internal_key {
            Some(k) => Ok(k),
            None => Err(Error::Fatal("no internal key registered".to_string())),
        }
    }

    fn make_multisig_tr(
        &self,
        taproot_subpaths: &BTreeMap<Vec<u8>, TapKeypath>,
    ) -> Result<Vec<u8>> {
        let mut keys = Vec::new();
        for (xonly, tap) in taproot_subpaths {
            if tap.leaf_hashes.is_empty() {
                continue;
            }
            let mut k = [0u8; 32];
            k.copy_from_slice(xonly);
            keys.push(k);
        }
        if keys.len() != self.n {
            return Err(Error::Fatal("wrong number of script keys".to_string()));
        }
        Ok(multi_a_script(self.m, &keys))
    }
}

/// In-memory registry over a fixed set of wallets.
#[derive(Default)]
pub struct TestRegistry {
    pub wallets: Vec<Arc<TestWallet>>,
    pub disabled: bool,
}

impl MultisigRegistry for TestRegistry {
    fn find_candidates(&self, xfp_paths: &[Vec<u32>]) -> Vec<Arc<dyn MultisigWallet>> {
        self.wallets
            .iter()
            .filter(|w| w.assert_matching(w.m, w.n, xfp_paths).is_ok())
            .map(|w| w.clone() as Arc<dyn MultisigWallet>)
            .collect()
    }

    fn find_match(
        &self,
        m: usize,
        n: usize,
        xfp_paths: &[Vec<u32>],
    ) -> Option<Arc<dyn MultisigWallet>> {
        self.wallets
            .iter()
            .find(|w| w.assert_matching(m, n, xfp_paths).is_ok())
            .map(|w| w.clone() as Arc<dyn MultisigWallet>)
    }

    fn import_from_psbt(
        &self,
        _m: usize,
        _n: usize,
        _xpubs: &[GlobalXpub],
    ) -> Result<(Arc<dyn MultisigWallet>, bool)> {
        Err(Error::Fatal("Unknown multisig wallet".to_string()))
    }

    fn approve_import(&self, _wallet: &dyn MultisigWallet) -> bool { false }

    fn checks_disabled(&self) -> bool { self.disabled }
}

/// A one-input unsigned transaction spending `prevout`.
pub fn unsigned_tx(prevout: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prevout,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffffffff),
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// An arbitrary but fixed outpoint.
pub fn dummy_prevout(vout: u32) -> OutPoint {
    OutPoint { txid: Txid::from_byte_array([0x33; 32]), vout }
}
