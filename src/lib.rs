//! Differential inference of GPU instruction encodings.
//!
//! Given a closed-source disassembler that maps 16-byte instruction words to
//! assembly text, the solver mutates a seed word bit by bit, observes how the
//! disassembly changes, and synthesizes a bit-level specification of the
//! instruction: opcode bits, operand fields, modifier selectors, flags and
//! scheduling metadata.

pub mod analysis;
pub mod bits;
pub mod enumerate;
pub mod error;
pub mod interactions;
pub mod multiset;
pub mod mutation;
pub mod oracle;
pub mod parser;
pub mod pipeline;
pub mod ranges;
pub mod report;
pub mod spec;

pub mod prelude {
    pub use crate::bits::{get_bit_range, set_bit_range, toggle_bit, InstWord, INST_BITS, INST_BYTES};
    pub use crate::error::{OracleError, ParseError, SolverError};
    pub use crate::interactions::{InteractionKind, LiveRangeOracle, LiveRangeReport};
    pub use crate::multiset::TokenMultiset;
    pub use crate::mutation::MutationSet;
    pub use crate::oracle::{Disassembler, Mutation, NvDisasm};
    pub use crate::parser::{Operand, OperandKind, ParsedInstruction, PredicateGuard, RegClass};
    pub use crate::pipeline::{analyze_instruction, solve_isa, SolverOptions};
    pub use crate::ranges::{EncodeParams, EncodingRange, EncodingRangeKind, EncodingRanges};
    pub use crate::spec::{InstructionSpec, IsaSpec};
}
