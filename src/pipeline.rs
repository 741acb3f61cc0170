//! Per-seed analysis pipeline and the multi-seed driver.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::analysis::{
    coalesce_modifiers, disambiguate_flags, disambiguate_operand_flags, extend_modifiers,
    fix_operand_widths, fix_predicate_polarity, run_to_fixed_point, split_modifiers,
};
use crate::bits::{word_to_hex, InstWord};
use crate::enumerate::{enumerate_modifiers, enumerate_operand_modifiers};
use crate::error::{OracleError, SolverError};
use crate::interactions::{operand_interactions, LiveRangeOracle};
use crate::mutation::MutationSet;
use crate::oracle::Disassembler;
use crate::spec::{InstructionSpec, IsaSpec};

/// Bits swept by the single-bit-flip stage; everything above is scheduling
/// metadata with a fixed layout.
pub const MUTATION_END_BIT: usize = 14 * 8 - 2;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub arch_code: u32,
    pub num_parallel: usize,
    /// Only analyze instructions whose key contains this substring.
    pub filter: Option<String>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self { arch_code: 90, num_parallel: 4, filter: None }
    }
}

/// Run the full inference pipeline for one seed.
///
/// Stages are sequential; every probing stage batches its oracle calls. The
/// live-range step is best-effort and never fails the seed.
pub fn analyze_instruction(
    disassembler: &dyn Disassembler,
    seed: &InstWord,
    life_ranges: Option<&dyn LiveRangeOracle>,
    arch_code: u32,
) -> Result<InstructionSpec, SolverError> {
    let seed = disassembler.distill(seed)?;
    let disasm = disassembler.disassemble(&seed)?;
    info!(word = %word_to_hex(&seed), disasm = %disasm, "analyzing instruction");

    let mutations = disassembler.mutate(&seed, MUTATION_END_BIT)?;
    let mut mset = MutationSet::new(seed, disasm.clone(), &mutations)?;

    run_to_fixed_point(|| disambiguate_flags(disassembler, &mut mset))?;
    disambiguate_operand_flags(disassembler, &mut mset)?;
    fix_operand_widths(disassembler, &mut mset)?;
    run_to_fixed_point(|| extend_modifiers(disassembler, &mut mset))?;
    coalesce_modifiers(&mut mset)?;
    run_to_fixed_point(|| split_modifiers(disassembler, &mut mset))?;

    let mut ranges = mset.compute_encoding_ranges()?;
    fix_predicate_polarity(disassembler, &mset, &mut ranges)?;

    let modifiers = enumerate_modifiers(disassembler, &ranges)?;
    let operand_modifiers = enumerate_operand_modifiers(disassembler, &ranges)?;

    let parsed = mset.parsed.clone();
    let mut spec = InstructionSpec::new(disasm, parsed, ranges, modifiers, operand_modifiers);
    if let Some(oracle) = life_ranges {
        spec.operand_interactions = operand_interactions(&spec, oracle, arch_code);
    }
    Ok(spec)
}

/// Analyze every instruction the oracle knows about, sweeping until probing
/// stops surfacing new keys.
///
/// Seeds fan out over a bounded worker pool; a failing seed is marked and
/// skipped on later sweeps without poisoning the rest.
pub fn solve_isa(
    disassembler: &dyn Disassembler,
    life_ranges: Option<&dyn LiveRangeOracle>,
    options: &SolverOptions,
) -> Result<IsaSpec, SolverError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_parallel)
        .build()
        .map_err(|e| OracleError::Pool(e.to_string()))?;

    let mut instructions: BTreeMap<String, InstructionSpec> = BTreeMap::new();
    let mut failed: BTreeSet<String> = BTreeSet::new();

    loop {
        let pending: Vec<(String, InstWord)> = disassembler
            .known_instructions()
            .into_iter()
            .filter(|(key, _)| !instructions.contains_key(key) && !failed.contains(key))
            .filter(|(key, _)| {
                options.filter.as_deref().map_or(true, |needle| key.contains(needle))
            })
            .collect();
        if pending.is_empty() {
            info!("no new instructions discovered, stopping");
            break;
        }
        info!(count = pending.len(), "found instructions to analyze");

        let results: Vec<(String, Result<InstructionSpec, SolverError>)> = pool.install(|| {
            use rayon::prelude::*;
            pending
                .par_iter()
                .map(|(key, word)| {
                    (key.clone(), analyze_instruction(disassembler, word, life_ranges, options.arch_code))
                })
                .collect()
        });

        for (key, result) in results {
            match result {
                Ok(spec) => {
                    instructions.insert(key, spec);
                }
                Err(error) => {
                    warn!(key = %key, %error, "instruction analysis failed");
                    failed.insert(key);
                }
            }
        }
    }

    Ok(IsaSpec { instructions })
}
