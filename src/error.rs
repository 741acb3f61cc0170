//! Solver error implementation

use std::io;
use thiserror::Error;

/// Errors produced while parsing a line of disassembly.
///
/// Any probe whose disassembly fails to parse is dropped by the analysis
/// passes; only a parse failure on the seed itself aborts an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The disassembler returned no text, or the text was blank.
    #[error("empty instruction text")]
    Empty,
    /// A predicate guard that isn't `@P<n>`, `@!P<n>` or `@PT`.
    #[error("malformed predicate guard `{0}`")]
    BadPredicate(String),
    /// An operand token matching none of the known operand forms.
    #[error("unknown operand `{0}`")]
    UnknownOperand(String),
    /// A `[`, `c[`, `desc[` or `a[` without a matching close bracket.
    #[error("unbalanced brackets in `{0}`")]
    UnbalancedBrackets(String),
    /// An immediate that is neither integer nor float.
    #[error("malformed immediate `{0}`")]
    BadImmediate(String),
}

/// Errors from the external disassembler process and its cache.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Spawning or waiting on the disassembler, or cache file IO.
    #[error("disassembler io: {0}")]
    Io(#[from] io::Error),
    /// The worker pool could not be constructed.
    #[error("worker pool: {0}")]
    Pool(String),
}

/// Per-seed analysis failure. The pipeline marks the seed failed and moves
/// on; other seeds are unaffected.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The seed's own disassembly does not parse; nothing can be inferred.
    #[error("seed disassembly does not parse: {0}")]
    Seed(#[from] ParseError),
    /// The oracle failed mid-analysis.
    #[error(transparent)]
    Oracle(#[from] OracleError),
    /// A bit span outside the word, or wider than a field can be.
    #[error("bit range {lo}..{hi} out of bounds")]
    BitRange { lo: usize, hi: usize },
}

impl SolverError {
    /// Whether the failure came from the external process rather than the
    /// instruction itself.
    pub const fn is_oracle(&self) -> bool {
        matches!(self, Self::Oracle(_))
    }
}
