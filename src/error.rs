//! Error Taxonomy
//!
//! Typed errors for the design core. Invariant violations on value types and
//! subprocess failures surface as distinct variants so callers can tell a
//! programmer error from a tool failure.

use thiserror::Error;

/// Errors produced by the primer design core.
#[derive(Debug, Error)]
pub enum Error {
    /// A mapping constructor or operation was given out-of-range coordinates.
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    /// A primer violated a structural invariant.
    #[error("invalid primer: {0}")]
    InvalidPrimer(String),

    /// A primer pair violated a structural invariant.
    #[error("invalid primer pair: {0}")]
    InvalidPrimerPair(String),

    /// A parameter bundle violated `min <= opt <= max`.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The primer picker wrote non-tag lines, closed prematurely, or returned
    /// PRIMER_ERROR.
    #[error("primer3 failed: {message}")]
    Primer3 {
        message: String,
        error_lines: Vec<String>,
        primer3_error: Option<String>,
    },

    /// The aligner returned an out-of-order or malformed record.
    #[error("aligner failed: {0}")]
    Aligner(String),

    /// Stream read/write failure while talking to a subprocess.
    #[error("subprocess I/O: {0}")]
    SubprocessIo(#[from] std::io::Error),

    /// An external tool exceeded its invocation timeout.
    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// A variant source could not be opened or yielded malformed records.
    #[error("variant source: {0}")]
    VariantSource(String),

    /// Reference or variant file access failure from htslib.
    #[error("htslib: {0}")]
    Htslib(#[from] rust_htslib::errors::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
