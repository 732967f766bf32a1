// SPDX-License-Identifier: CC0-1.0

//! BIP-32 key origin data as it appears inside PSBT derivation records.
//!
//! Every derivation record is `xfp || path`, a run of 32-bit
//! little-endian words. Taproot records carry a leaf-hash list in
//! front. An XFP of zero is treated as a placeholder for our own master
//! fingerprint and rewritten on the fly (useful when the PSBT was built
//! from a derived XPUB that does not know the true master fingerprint).

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use bitcoin::bip32::{ChildNumber, DerivationPath};

use crate::error::Result;
use crate::stream::{read_span, Span};
use crate::Warning;

/// Hardened-derivation marker bit.
pub(crate) const HARDENED: u32 = 0x8000_0000;

/// Deepest derivation path we are willing to follow.
pub(crate) const MAX_PATH_DEPTH: usize = 12;

/// Formats a master fingerprint the way the device shows it.
pub(crate) fn xfp2str(xfp: u32) -> String { format!("{:08X}", xfp.swap_bytes()) }

/// Formats a raw path (no fingerprint) as `m/84'/0'/0'/0/0`.
pub(crate) fn keypath_to_str(steps: &[u32]) -> String {
    let mut s = String::from("m");
    for step in steps {
        s.push('/');
        s.push_str(&(step & !HARDENED).to_string());
        if step & HARDENED != 0 {
            s.push('\'');
        }
    }
    s
}

/// Checks a derivation record's byte length before decoding it.
///
/// `allow_master` permits a bare fingerprint with no path components,
/// which is only legal for taproot internal keys (unspendable-path
/// convention).
pub(crate) fn validate_subpath_len(len: u64, allow_master: bool) -> Result<()> {
    check!(len % 4 == 0 && len >= 4, "bad key path length");
    let depth = (len / 4 - 1) as usize;
    check!(depth <= MAX_PATH_DEPTH, "key path too deep");
    if !allow_master {
        check!(depth >= 1, "master key path not allowed here");
    }
    Ok(())
}

/// A parsed `(fingerprint, derivation path)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypath {
    /// Master key fingerprint, as the 32-bit LE word from the wire.
    pub xfp: u32,
    /// Path components, hardened bit included.
    pub steps: Vec<u32>,
}

impl Keypath {
    fn from_le_words(raw: &[u8]) -> Self {
        let mut words = raw.chunks_exact(4).map(|c| {
            u32::from_le_bytes([c[0], c[1], c[2], c[3]])
        });
        let xfp = words.next().unwrap_or(0);
        Keypath { xfp, steps: words.collect() }
    }

    /// The path in the form the key derivation oracle expects.
    pub fn derivation_path(&self) -> DerivationPath {
        DerivationPath::from(
            self.steps.iter().map(|&n| ChildNumber::from(n)).collect::<Vec<_>>(),
        )
    }

    /// Hardened/unhardened pattern of the path, for change policy.
    pub(crate) fn hard_bits(&self) -> Vec<bool> {
        self.steps.iter().map(|s| s & HARDENED != 0).collect()
    }

    /// The record as raw words again: `[xfp, step, ...]`.
    pub(crate) fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(1 + self.steps.len());
        words.push(self.xfp);
        words.extend_from_slice(&self.steps);
        words
    }
}

/// A parsed taproot derivation record: leaf hashes plus key origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapKeypath {
    /// Hashes of the script leaves this key appears in. Empty for the
    /// internal key.
    pub leaf_hashes: Vec<[u8; 32]>,
    /// The key origin proper.
    pub origin: Keypath,
}

/// Appends the `Zero XFP` warning, at most once per PSBT.
fn note_zero_xfp(warnings: &mut Vec<Warning>) {
    if !warnings.iter().any(|w| w.title.contains("XFP")) {
        warnings.push(Warning::new(
            "Zero XFP",
            "Assuming XFP of zero should be replaced by correct XFP",
        ));
    }
}

/// Decodes the classic (non-taproot) derivation records of a section.
///
/// Returns the parsed map and how many of the records belong to us.
pub(crate) fn parse_subpaths<F: Read + Seek>(
    fd: &mut F,
    spans: &BTreeMap<Vec<u8>, Span>,
    my_xfp: u32,
    warnings: &mut Vec<Warning>,
) -> Result<(BTreeMap<Vec<u8>, Keypath>, usize)> {
    let mut parsed = BTreeMap::new();
    let mut num_ours = 0;

    for (pubkey, span) in spans {
        check!(pubkey.len() == 33 || pubkey.len() == 65, "hdpath pubkey len");
        if pubkey.len() == 33 {
            check!(pubkey[0] == 0x02 || pubkey[0] == 0x03, "uncompressed pubkey");
        }

        validate_subpath_len(span.len, false)?;
        let raw = read_span(fd, *span)?;
        let mut keypath = Keypath::from_le_words(&raw);

        if keypath.xfp == 0 {
            keypath.xfp = my_xfp;
            note_zero_xfp(warnings);
        }
        if keypath.xfp == my_xfp {
            num_ours += 1;
        }

        parsed.insert(pubkey.clone(), keypath);
    }

    Ok((parsed, num_ours))
}

/// Decodes the taproot derivation records of a section.
pub(crate) fn parse_taproot_subpaths<F: Read + Seek>(
    fd: &mut F,
    spans: &BTreeMap<Vec<u8>, Span>,
    my_xfp: u32,
    warnings: &mut Vec<Warning>,
) -> Result<(BTreeMap<Vec<u8>, TapKeypath>, usize)> {
    let mut parsed = BTreeMap::new();
    let mut num_ours = 0;

    for (xonly, span) in spans {
        check!(xonly.len() == 32, "PSBT_IN_TAP_BIP32_DERIVATION xonly-pubkey length != 32");

        let raw = read_span(fd, *span)?;
        let mut fd2 = std::io::Cursor::new(&raw);
        let leaf_count = crate::stream::read_compact_size_req(&mut fd2)?;
        let mut leaf_hashes = Vec::with_capacity(leaf_count as usize);
        for _ in 0..leaf_count {
            let mut h = [0u8; 32];
            fd2.read_exact(&mut h)?;
            leaf_hashes.push(h);
        }

        // internal key is allowed to come straight from master; an
        // unspendable path can be just a bare xonly pubkey
        let origin_len = raw.len() as u64 - fd2.position();
        validate_subpath_len(origin_len, leaf_hashes.is_empty())?;
        let mut origin = Keypath::from_le_words(&raw[fd2.position() as usize..]);

        if origin.xfp == 0 {
            origin.xfp = my_xfp;
            note_zero_xfp(warnings);
        }
        if origin.xfp == my_xfp {
            num_ours += 1;
        }

        parsed.insert(xonly.clone(), TapKeypath { leaf_hashes, origin });
    }

    Ok((parsed, num_ours))
}
