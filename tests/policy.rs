// SPDX-License-Identifier: CC0-1.0

//! Fee and sighash policy enforcement.

mod common;

use std::io::Cursor;

use psbt_signer::bitcoin::consensus::encode::serialize;
use psbt_signer::bitcoin::{Amount, TxOut};
use psbt_signer::{NoMultisig, Psbt, Settings};

use common::*;

const IN_STEPS: [u32; 5] = [84 | HARD, HARD, HARD, 0, 0];
const CHANGE_STEPS: [u32; 5] = [84 | HARD, HARD, HARD, 1, 0];

struct Scenario {
    raw: Vec<u8>,
    xfp: u32,
}

/// Our 100k-sat input paying `out_value` to either change or a foreign
/// key, with an optional explicit sighash on the input.
fn scenario(out_value: u64, to_change: bool, sighash: Option<u32>) -> Scenario {
    let seed = TestSeed::new();
    let pubkey = seed.pubkey_at(&IN_STEPS);
    let change_pubkey = seed.pubkey_at(&CHANGE_STEPS);

    let utxo = TxOut { value: Amount::from_sat(100_000), script_pubkey: p2wpkh_script(&pubkey) };
    let spk = if to_change {
        p2wpkh_script(&change_pubkey)
    } else {
        p2wpkh_script(&[0x02; 33])
    };
    let dest = TxOut { value: Amount::from_sat(out_value), script_pubkey: spk };

    let mut builder = PsbtBuilder::new(unsigned_tx(dummy_prevout(0), vec![dest]));
    builder
        .input(0, PSBT_IN_WITNESS_UTXO, &[], &serialize(&utxo))
        .input(0, PSBT_IN_BIP32_DERIVATION, &pubkey, &keypath_value(seed.xfp(), &IN_STEPS));
    if let Some(sh) = sighash {
        builder.input(0, PSBT_IN_SIGHASH_TYPE, &[], &sh.to_le_bytes());
    }
    if to_change {
        builder.output(
            0,
            PSBT_OUT_BIP32_DERIVATION,
            &change_pubkey,
            &keypath_value(seed.xfp(), &CHANGE_STEPS),
        );
    }

    Scenario { raw: builder.build(), xfp: seed.xfp() }
}

fn evaluate(s: Scenario, settings: Settings) -> psbt_signer::Result<Psbt<Cursor<Vec<u8>>>> {
    let mut psbt = Psbt::read_psbt(Cursor::new(s.raw), settings).unwrap();
    psbt.evaluate(&NoMultisig)?;
    Ok(psbt)
}

#[test]
fn fee_over_limit_is_fatal() {
    let s = scenario(50_000, false, None); // 100% of outputs
    let xfp = s.xfp;
    let err = evaluate(s, Settings::with_xfp(xfp)).err().expect("fee must fail");
    assert!(err.to_string().starts_with("Network fee bigger than 10%"), "{}", err);
}

#[test]
fn big_fee_warns_below_limit() {
    let s = scenario(94_000, false, None); // ~6.4% of outputs
    let xfp = s.xfp;
    let psbt = evaluate(s, Settings::with_xfp(xfp)).unwrap();
    assert!(psbt.warnings().iter().any(|w| w.title == "Big Fee"));
}

#[test]
fn fee_limit_can_be_disabled() {
    let s = scenario(50_000, false, None);
    let settings = Settings { fee_limit: -1, ..Settings::with_xfp(s.xfp) };
    let psbt = evaluate(s, settings).unwrap();
    // still warned, never silent
    assert!(psbt.warnings().iter().any(|w| w.title == "Big Fee"));
}

#[test]
fn consolidation_requires_sighash_all() {
    // everything pays back to ourselves, but with ALL|ANYONECANPAY
    let s = scenario(99_000, true, Some(0x81));
    let xfp = s.xfp;
    let err = evaluate(s, Settings::with_xfp(xfp)).err().expect("must fail");
    assert_eq!(
        err.to_string(),
        "Only sighash ALL is allowed for pure consolidation transactions."
    );
}

#[test]
fn sighash_none_is_blocked() {
    let s = scenario(99_000, false, Some(0x02));
    let xfp = s.xfp;
    let err = evaluate(s, Settings::with_xfp(xfp)).err().expect("must fail");
    assert_eq!(
        err.to_string(),
        "Sighash NONE is not allowed as funds could be going anywhere."
    );
}

#[test]
fn sighash_override_downgrades_to_warning() {
    let s = scenario(99_000, false, Some(0x02));
    let settings = Settings { sighshchk: true, ..Settings::with_xfp(s.xfp) };
    let psbt = evaluate(s, settings).unwrap();
    assert!(psbt
        .warnings()
        .iter()
        .any(|w| w.title == "Danger" && w.message.contains("sighash NONE")));
}

#[test]
fn unknown_sighash_is_fatal() {
    let s = scenario(99_000, false, Some(0x7f));
    let xfp = s.xfp;
    let err = evaluate(s, Settings::with_xfp(xfp)).err().expect("must fail");
    assert!(err.to_string().contains("Unsupported sighash flag 0x7f"), "{}", err);
}
