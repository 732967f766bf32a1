// SPDX-License-Identifier: CC0-1.0

//! Serialization round trips and re-signing idempotence.

mod common;

use std::io::Cursor;

use psbt_signer::bitcoin::consensus::encode::serialize;
use psbt_signer::bitcoin::{Amount, TxOut};
use psbt_signer::{NoMultisig, Psbt, Settings};

use common::*;

const IN_STEPS: [u32; 5] = [84 | HARD, HARD, HARD, 0, 0];

fn sample_raw(seed: &TestSeed) -> Vec<u8> {
    let pubkey = seed.pubkey_at(&IN_STEPS);
    let utxo = TxOut { value: Amount::from_sat(100_000), script_pubkey: p2wpkh_script(&pubkey) };
    let dest =
        TxOut { value: Amount::from_sat(99_000), script_pubkey: p2wpkh_script(&[0x02; 33]) };

    let mut builder = PsbtBuilder::new(unsigned_tx(dummy_prevout(0), vec![dest]));
    builder
        .input(0, PSBT_IN_WITNESS_UTXO, &[], &serialize(&utxo))
        .input(0, PSBT_IN_BIP32_DERIVATION, &pubkey, &keypath_value(seed.xfp(), &IN_STEPS))
        .input(0, PSBT_IN_SIGHASH_TYPE, &[], &1u32.to_le_bytes())
        // unknown records must survive the trip untouched
        .input(0, 0xef, &[0xaa, 0xbb], &[1, 2, 3])
        .output(0, 0xee, &[], &[9, 9]);
    builder.global(0xfa, &[0x01], &[0x55; 7]);
    builder.build()
}

#[test]
fn serialize_is_stable_without_validation() {
    let seed = TestSeed::new();
    let raw = sample_raw(&seed);

    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(seed.xfp())).unwrap();
    let mut first = Vec::new();
    psbt.serialize(&mut first).unwrap();

    let mut psbt2 =
        Psbt::read_psbt(Cursor::new(first.clone()), Settings::with_xfp(seed.xfp())).unwrap();
    let mut second = Vec::new();
    psbt2.serialize(&mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn serialize_is_stable_after_validation() {
    let seed = TestSeed::new();
    let raw = sample_raw(&seed);

    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(seed.xfp())).unwrap();
    psbt.evaluate(&NoMultisig).unwrap();
    let mut first = Vec::new();
    psbt.serialize(&mut first).unwrap();

    let mut psbt2 =
        Psbt::read_psbt(Cursor::new(first.clone()), Settings::with_xfp(seed.xfp())).unwrap();
    let mut second = Vec::new();
    psbt2.serialize(&mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn signing_twice_changes_nothing() {
    let mut seed = TestSeed::new();
    let raw = sample_raw(&seed);

    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(seed.xfp())).unwrap();
    psbt.evaluate(&NoMultisig).unwrap();

    assert_eq!(psbt.sign(&mut seed).unwrap(), 1);
    let mut first = Vec::new();
    psbt.serialize(&mut first).unwrap();

    // second pass adds no signatures and produces identical bytes
    assert_eq!(psbt.sign(&mut seed).unwrap(), 0);
    let mut second = Vec::new();
    psbt.serialize(&mut second).unwrap();

    assert_eq!(first, second);
}
