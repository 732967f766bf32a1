// SPDX-License-Identifier: CC0-1.0

//! Change recognition and the fraud checks around it.

mod common;

use std::io::Cursor;

use psbt_signer::bitcoin::consensus::encode::serialize;
use psbt_signer::bitcoin::{Amount, TxOut};
use psbt_signer::{Error, NoMultisig, Psbt, Settings};

use common::*;

const IN_STEPS: [u32; 5] = [84 | HARD, HARD, HARD, 0, 0];
const CHANGE_STEPS: [u32; 5] = [84 | HARD, HARD, HARD, 1, 0];

/// One input of ours, one change output, one foreign output. The
/// change scriptPubKey can be perturbed by the caller.
fn change_psbt(tweak_change_script: bool, change_steps: &[u32]) -> (Vec<u8>, u32) {
    let seed = TestSeed::new();
    let pubkey = seed.pubkey_at(&IN_STEPS);
    let change_pubkey = seed.pubkey_at(change_steps);

    let utxo = TxOut { value: Amount::from_sat(100_000), script_pubkey: p2wpkh_script(&pubkey) };

    let mut change_script = p2wpkh_script(&change_pubkey).to_bytes();
    if tweak_change_script {
        // attacker bumps one byte of the hash: money goes elsewhere
        change_script[10] ^= 0x01;
    }
    let change = TxOut {
        value: Amount::from_sat(40_000),
        script_pubkey: psbt_signer::bitcoin::ScriptBuf::from_bytes(change_script),
    };
    let foreign =
        TxOut { value: Amount::from_sat(59_000), script_pubkey: p2wpkh_script(&[0x02; 33]) };

    let mut builder = PsbtBuilder::new(unsigned_tx(dummy_prevout(0), vec![change, foreign]));
    builder
        .input(0, PSBT_IN_WITNESS_UTXO, &[], &serialize(&utxo))
        .input(0, PSBT_IN_BIP32_DERIVATION, &pubkey, &keypath_value(seed.xfp(), &IN_STEPS))
        .output(
            0,
            PSBT_OUT_BIP32_DERIVATION,
            &change_pubkey,
            &keypath_value(seed.xfp(), change_steps),
        );

    (builder.build(), seed.xfp())
}

#[test]
fn change_is_recognized() {
    let (raw, xfp) = change_psbt(false, &CHANGE_STEPS);
    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(xfp)).unwrap();
    psbt.evaluate(&NoMultisig).unwrap();

    assert!(psbt.outputs[0].is_change());
    assert!(!psbt.outputs[1].is_change());
    assert!(!psbt.is_consolidation());

    // the user is only "spending" the foreign output plus fee
    assert_eq!(psbt.total_value_out(), Some(99_000));
    assert_eq!(psbt.calculate_fee(), Some(1_000));
    assert!(psbt.warnings().is_empty());
}

#[test]
fn fraudulent_change_is_fatal() {
    let (raw, xfp) = change_psbt(true, &CHANGE_STEPS);
    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(xfp)).unwrap();

    match psbt.evaluate(&NoMultisig) {
        Err(Error::FraudulentChangeOutput { output_index, reason }) => {
            assert_eq!(output_index, 0);
            assert!(reason.contains("fraudulent"), "{}", reason);
        }
        other => panic!("expected fraud, got {:?}", other.err()),
    }
}

#[test]
fn odd_change_path_only_warns() {
    // change that derives correctly, but to a strange branch
    let odd_steps = [84 | HARD, HARD, HARD, 9, 0];
    let (raw, xfp) = change_psbt(false, &odd_steps);
    let mut psbt = Psbt::read_psbt(Cursor::new(raw), Settings::with_xfp(xfp)).unwrap();
    psbt.evaluate(&NoMultisig).unwrap();

    assert!(psbt.outputs[0].is_change());
    let troublesome: Vec<_> = psbt
        .warnings()
        .iter()
        .filter(|w| w.title == "Troublesome Change Outs")
        .collect();
    assert_eq!(troublesome.len(), 1);
    assert!(troublesome[0].message.contains("2nd last component not 0 or 1"));
}

#[test]
fn change_key_must_rederive_at_signing_time() {
    // correct script for the claimed key, but the path leads to a
    // different key entirely; the pre-sign check must catch it
    let seed = TestSeed::new();
    let pubkey = seed.pubkey_at(&IN_STEPS);
    let change_pubkey = seed.pubkey_at(&CHANGE_STEPS);
    let wrong_steps = [84 | HARD, HARD, HARD, 1, 77];

    let utxo = TxOut { value: Amount::from_sat(100_000), script_pubkey: p2wpkh_script(&pubkey) };
    let change =
        TxOut { value: Amount::from_sat(99_000), script_pubkey: p2wpkh_script(&change_pubkey) };

    let mut builder = PsbtBuilder::new(unsigned_tx(dummy_prevout(0), vec![change]));
    builder
        .input(0, PSBT_IN_WITNESS_UTXO, &[], &serialize(&utxo))
        .input(0, PSBT_IN_BIP32_DERIVATION, &pubkey, &keypath_value(seed.xfp(), &IN_STEPS))
        .output(
            0,
            PSBT_OUT_BIP32_DERIVATION,
            &change_pubkey,
            &keypath_value(seed.xfp(), &wrong_steps),
        );

    let mut psbt =
        Psbt::read_psbt(Cursor::new(builder.build()), Settings::with_xfp(seed.xfp())).unwrap();
    // script matches the claimed pubkey, so evaluation passes...
    psbt.evaluate(&NoMultisig).unwrap();
    assert!(psbt.outputs[0].is_change());

    // ...but the signer re-derives and refuses
    let mut seed = TestSeed::new();
    match psbt.sign(&mut seed) {
        Err(Error::FraudulentChangeOutput { output_index, reason }) => {
            assert_eq!(output_index, 0);
            assert!(reason.contains("BIP-32 path"), "{}", reason);
        }
        other => panic!("expected fraud, got {:?}", other.err().map(|e| e.to_string())),
    }
}
