// SPDX-License-Identifier: CC0-1.0

//! Policy checks that run between validation and signing: risky
//! sighash values and change outputs that stray from the wallet's own
//! derivation pattern.

use std::io::{Read, Seek};

use crate::keypath::{keypath_to_str, HARDENED};
use crate::error::Result;
use crate::psbt::Psbt;
use crate::sighash::{
    ALL_SIGHASH_FLAGS, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_DEFAULT, SIGHASH_NONE,
};
use crate::Warning;

fn hard_bits(path: &[u32]) -> Vec<bool> {
    path.iter().map(|p| p & HARDENED != 0).collect()
}

impl<F: Read + Seek> Psbt<F> {
    /// Checks sighash flags are legal, useful and safe. Warns about
    /// risks when the user has enabled special sighash values.
    pub fn consider_dangerous_sighash(&mut self) -> Result<()> {
        let mut sh_unusual = false;
        let mut none_sh = false;

        for input in &self.inputs {
            // only inputs that we will eventually sign
            if input.num_our_keys() == 0 {
                continue;
            }
            if let Some(sighash) = input.sighash {
                // all inputs MUST have a sighash we are able to sign
                check!(
                    ALL_SIGHASH_FLAGS.contains(&sighash),
                    "Unsupported sighash flag 0x{:x}", sighash
                );

                if sighash != SIGHASH_ALL && sighash != SIGHASH_DEFAULT {
                    sh_unusual = true;
                }
                if sighash == SIGHASH_NONE || sighash == SIGHASH_NONE | SIGHASH_ANYONECANPAY {
                    none_sh = true;
                }
            }
        }

        if sh_unusual && !self.settings.sighshchk {
            if self.consolidation_tx {
                // policy: pure consolidations must be all sighash ALL
                fatal!("Only sighash ALL is allowed for pure consolidation transactions.");
            }
            if none_sh {
                fatal!("Sighash NONE is not allowed as funds could be going anywhere.");
            }
        }

        if none_sh {
            self.warnings.push(Warning::new(
                "Danger",
                "Destination address can be changed after signing (sighash NONE).",
            ));
        } else if sh_unusual {
            self.warnings.push(Warning::new(
                "Caution",
                "Some inputs have unusual SIGHASH values not used in typical cases.",
            ));
        }

        Ok(())
    }

    /// Change outputs need to look like they go back to the same
    /// wallet the inputs came from: shared path prefix, identical
    /// hardening pattern, change branch in {0,1}, and an index within
    /// a reasonable gap of what the inputs use. Outliers only warn.
    pub(crate) fn consider_dangerous_change(&mut self) {
        let my_xfp = self.settings.xfp;

        let mut in_paths: Vec<Vec<u32>> = Vec::new();
        for inp in &self.inputs {
            if inp.fully_signed || inp.required_key.is_none() {
                continue;
            }
            for keypath in inp.subpaths.values() {
                if keypath.xfp == my_xfp {
                    in_paths.push(keypath.steps.clone());
                }
            }
            for tap in inp.taproot_subpaths.values() {
                if tap.origin.xfp == my_xfp {
                    in_paths.push(tap.origin.steps.clone());
                }
            }
        }

        if in_paths.is_empty() {
            // we aren't adding any signatures? warned about elsewhere
            return;
        }

        let shortest = in_paths.iter().map(Vec::len).min().unwrap();
        let longest = in_paths.iter().map(Vec::len).max().unwrap();
        if shortest != longest || shortest <= 2 {
            // no shared input path length; they are probably doing
            // weird stuff, so leave them alone
            return;
        }

        // assumption: common wallets modulate only the last two
        // components, m/.../change/index with change in {0,1} and the
        // index increasing slowly over the wallet's lifetime
        let path_len = shortest;
        let path_prefix = &in_paths[0][..path_len - 2];
        let idx_max = in_paths.iter().map(|p| p[p.len() - 1] & !HARDENED).max().unwrap() + 200;
        let hard_pattern = hard_bits(&in_paths[0]);

        let check_output_path = |path: &[u32]| -> Option<String> {
            if path.len() != path_len {
                Some(format!("has wrong path length ({} not {})", path.len(), path_len))
            } else if hard_bits(path) != hard_pattern {
                Some("has different hardening pattern".to_string())
            } else if &path[..path_prefix.len()] != path_prefix {
                Some("goes to diff path prefix".to_string())
            } else if (path[path.len() - 2] & !HARDENED) > 1 {
                Some("2nd last component not 0 or 1".to_string())
            } else if (path[path.len() - 1] & !HARDENED) > idx_max {
                Some("last component beyond reasonable gap".to_string())
            } else {
                None
            }
        };

        let problem = |nout: usize, iss: &str, path: &[u32]| -> String {
            format!(
                "Output#{}: {}: {} not {}/{{0~1}}{}/{{0~{}}}{} expected",
                nout,
                iss,
                keypath_to_str(path),
                keypath_to_str(path_prefix),
                if hard_pattern[hard_pattern.len() - 2] { "'" } else { "" },
                idx_max,
                if hard_pattern[hard_pattern.len() - 1] { "'" } else { "" },
            )
        };

        let mut probs = Vec::new();
        for (nout, out) in self.outputs.iter().enumerate() {
            if !out.is_change {
                continue;
            }
            // it's a change output; okay if p2sh change, we're looking
            // at the paths only
            for keypath in out.subpaths.values() {
                if keypath.xfp != my_xfp {
                    // possible in the p2sh case
                    continue;
                }
                if let Some(iss) = check_output_path(&keypath.steps) {
                    probs.push(problem(nout, &iss, &keypath.steps));
                    break;
                }
            }
            for tap in out.taproot_subpaths.values() {
                if tap.origin.xfp != my_xfp {
                    continue;
                }
                if let Some(iss) = check_output_path(&tap.origin.steps) {
                    probs.push(problem(nout, &iss, &tap.origin.steps));
                    break;
                }
            }
        }

        for p in probs {
            self.warnings.push(Warning::new("Troublesome Change Outs", p));
        }
    }
}
