// SPDX-License-Identifier: CC0-1.0

//! scriptPubKey classification and multisig script disassembly.

use bitcoin::key::TapTweak;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CHECKSIGADD, OP_NUMEQUAL, OP_PUSHNUM_1, OP_PUSHNUM_16,
};
use bitcoin::hashes::Hash;
use bitcoin::script::{Instruction, Script};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::taproot::TapNodeHash;
use bitcoin::XOnlyPublicKey;

use crate::error::Result;
use crate::MAX_SIGNERS;

/// Address family of a scriptPubKey, the way the signing logic wants
/// to see it: segwit v0 programs collapse onto their legacy cousins
/// with `is_segwit` set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddressType {
    P2pk,
    P2pkh,
    P2sh,
    P2tr,
    Unknown,
}

/// Classification of an output script.
#[derive(Debug, Clone)]
pub(crate) struct AddressInfo {
    pub kind: AddressType,
    /// Bare pubkey for p2pk, 20-byte hash for pkh/sh, 32-byte program
    /// for wsh/tr. Empty when unknown.
    pub payload: Vec<u8>,
    pub is_segwit: bool,
}

/// Classifies a scriptPubKey.
pub(crate) fn classify(script: &Script) -> AddressInfo {
    let b = script.as_bytes();

    if script.is_p2pkh() {
        return AddressInfo { kind: AddressType::P2pkh, payload: b[3..23].to_vec(), is_segwit: false };
    }
    if script.is_p2sh() {
        return AddressInfo { kind: AddressType::P2sh, payload: b[2..22].to_vec(), is_segwit: false };
    }
    if script.is_p2wpkh() {
        return AddressInfo { kind: AddressType::P2pkh, payload: b[2..22].to_vec(), is_segwit: true };
    }
    if script.is_p2wsh() {
        return AddressInfo { kind: AddressType::P2sh, payload: b[2..34].to_vec(), is_segwit: true };
    }
    if script.is_p2tr() {
        return AddressInfo { kind: AddressType::P2tr, payload: b[2..34].to_vec(), is_segwit: true };
    }
    if script.is_p2pk() {
        // push of the bare key, then OP_CHECKSIG
        let key_len = b[0] as usize;
        return AddressInfo { kind: AddressType::P2pk, payload: b[1..1 + key_len].to_vec(), is_segwit: false };
    }

    AddressInfo { kind: AddressType::Unknown, payload: Vec::new(), is_segwit: false }
}

fn pushnum(instruction: Option<Instruction>) -> Option<usize> {
    if let Some(Instruction::Op(op)) = instruction {
        let v = op.to_u8();
        if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&v) {
            return Some((v - OP_PUSHNUM_1.to_u8() + 1) as usize);
        }
    }
    None
}

/// Takes apart a classic `OP_m <pk>*n OP_n OP_CHECKMULTISIG` redeem or
/// witness script and returns `(M, N)`.
pub(crate) fn disassemble_multisig_mn(script: &[u8]) -> Result<(usize, usize)> {
    let script = Script::from_bytes(script);
    let mut ins = script.instructions().map(|r| r.ok());

    let m = match pushnum(ins.next().flatten()) {
        Some(m) => m,
        None => fatal!("M value not found in script"),
    };

    let mut n_keys = 0usize;
    let n = loop {
        match ins.next().flatten() {
            Some(Instruction::PushBytes(pk)) => {
                check!(pk.len() == 33, "expected compressed pubkey in script");
                n_keys += 1;
            }
            other => match pushnum(other) {
                Some(n) => break n,
                None => fatal!("N value not found in script"),
            },
        }
    };

    check!(
        matches!(ins.next().flatten(), Some(Instruction::Op(op)) if op == OP_CHECKMULTISIG),
        "expected OP_CHECKMULTISIG"
    );
    check!(ins.next().is_none(), "junk after OP_CHECKMULTISIG");
    check!(n_keys == n, "N does not match key count");
    check!(1 <= m && m <= n && n <= MAX_SIGNERS, "M/N range");

    Ok((m, n))
}

/// Takes apart a tapscript `multi_a` leaf:
/// `<pk> OP_CHECKSIG (<pk> OP_CHECKSIGADD)* OP_m OP_NUMEQUAL`.
pub(crate) fn disassemble_multisig_mn_tr(script: &[u8]) -> Result<(usize, usize)> {
    let script = Script::from_bytes(script);
    let mut ins = script.instructions().map(|r| r.ok());

    let mut n = 0usize;
    let m = loop {
        match ins.next().flatten() {
            Some(Instruction::PushBytes(pk)) => {
                check!(pk.len() == 32, "expected xonly pubkey in script");
                let expect = if n == 0 { OP_CHECKSIG } else { OP_CHECKSIGADD };
                check!(
                    matches!(ins.next().flatten(), Some(Instruction::Op(op)) if op == expect),
                    "expected OP_CHECKSIG/OP_CHECKSIGADD"
                );
                n += 1;
            }
            other => match pushnum(other) {
                Some(m) => break m,
                None => fatal!("M value not found in script"),
            },
        }
    };

    check!(
        matches!(ins.next().flatten(), Some(Instruction::Op(op)) if op == OP_NUMEQUAL),
        "expected OP_NUMEQUAL"
    );
    check!(ins.next().is_none(), "junk after OP_NUMEQUAL");
    check!(1 <= m && m <= n && n <= MAX_SIGNERS, "M/N range");

    Ok((m, n))
}

/// BIP-341 output key: `P + int(tagged_hash("TapTweak", P || h?)) * G`.
///
/// Returns the x-only output key bytes as they appear in a v1 witness
/// program.
pub(crate) fn taptweak(
    secp: &Secp256k1<All>,
    internal_key: &[u8],
    merkle_root: Option<[u8; 32]>,
) -> Result<[u8; 32]> {
    check!(internal_key.len() == 32, "internal key length != 32");
    let internal = match XOnlyPublicKey::from_slice(internal_key) {
        Ok(k) => k,
        Err(_) => fatal!("invalid taproot internal key"),
    };

    let merkle_root = merkle_root.map(TapNodeHash::from_byte_array);
    let (output_key, _parity) = internal.tap_tweak(secp, merkle_root);
    Ok(output_key.serialize())
}
