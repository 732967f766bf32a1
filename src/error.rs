// SPDX-License-Identifier: CC0-1.0

//! Errors surfaced while parsing, validating, or signing a PSBT.
//!
//! Signing is an atomic operation: any error aborts the whole thing and
//! no partial state is written back. Non-fatal observations go into the
//! container's warning list instead (see [`crate::Warning`]).

use core::fmt;
use std::io;

use bitcoin_internals::write_err;

/// Alias for results produced by this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// A hard failure; the signing operation is aborted.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The PSBT is malformed, or a policy check refused to sign it.
    ///
    /// The reason string is rendered directly on the device screen, so
    /// it is short and concrete.
    Fatal(String),

    /// An output claims to be change for this wallet but its script
    /// does not derive from our keys.
    ///
    /// This is never downgraded to a warning and never retried: a
    /// mismatched change script is an attempt to steal the change
    /// amount, not an innocent encoding error.
    FraudulentChangeOutput {
        /// Index of the offending output.
        output_index: usize,
        /// What exactly failed to match.
        reason: String,
    },

    /// Error reading or writing the backing byte stream.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        match *self {
            Fatal(ref reason) => write!(f, "{}", reason),
            FraudulentChangeOutput { output_index, ref reason } =>
                write!(f, "change fraud, output #{}: {}", output_index, reason),
            Io(ref e) => write_err!(f, "stream read/write failed"; e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;

        match *self {
            Io(ref e) => Some(e),
            Fatal(_) | FraudulentChangeOutput { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl Error {
    /// Creates a [`Error::FraudulentChangeOutput`].
    pub(crate) fn fraud(output_index: usize, reason: impl Into<String>) -> Self {
        Error::FraudulentChangeOutput { output_index, reason: reason.into() }
    }
}
