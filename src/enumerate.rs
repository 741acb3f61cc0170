//! Enumeration of modifier value spaces.
//!
//! For every selector field the solver substitutes each possible value into
//! the seed, decodes the batch, and names each value by the tokens it adds
//! over a corrected baseline. Fields whose meaning depends on sibling
//! selectors are retried under every combination of the other fields.

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::error::SolverError;
use crate::multiset::{added_tokens, added_tokens_over, join_tokens, TokenMultiset};
use crate::oracle::Disassembler;
use crate::parser::ParsedInstruction;
use crate::ranges::{EncodeParams, EncodingRange, EncodingRangeKind, EncodingRanges};

/// Ordered `(value, name)` rows of one selector field.
pub type ModifierTable = Vec<(u64, String)>;

/// A decoded name the disassembler uses for impossible selector values.
fn is_invalid(name: &str) -> bool {
    name.contains("INVALID") || name.contains("??")
}

/// The correction basis for one field: the value-0 token list minus the
/// tokens the field itself contributes at value 0 (the difference between
/// the value-0 and value-1 decodings). Diffing every value against this
/// basis keeps the field's own value-0 name while stripping the modifiers
/// the rest of the instruction always carries.
fn corrected_basis(first: &[String], second: &[String]) -> TokenMultiset {
    let own_tokens = added_tokens(second, first);
    let mut basis = TokenMultiset::from_tokens(first);
    for token in &own_tokens {
        basis.add(token, -1);
    }
    basis.remove_zeros();
    basis
}

/// Enumerate every instruction-level modifier field of `ranges`.
///
/// Fields that fail to decode at all come back as empty tables; fields
/// producing invalid names under the seed basis fall back to dependent
/// enumeration.
pub fn enumerate_modifiers(
    disassembler: &dyn Disassembler,
    ranges: &EncodingRanges,
) -> Result<Vec<ModifierTable>, SolverError> {
    let modifier_ranges: Vec<EncodingRange> =
        ranges.find(EncodingRangeKind::Modifier).into_iter().cloned().collect();
    let initial = ranges.seed_modifier_values()?;

    let mut result = Vec::with_capacity(modifier_ranges.len());
    for (idx, rng) in modifier_ranges.iter().enumerate() {
        match enumerate_field(disassembler, ranges, &initial, rng, idx)? {
            None => result.push(Vec::new()),
            Some(table) => {
                if table.iter().any(|(_, name)| is_invalid(name)) {
                    warn!(group = ?rng.group_id, "invalid names, switching to dependent enumeration");
                    result.push(enumerate_dependent(disassembler, ranges, &modifier_ranges, idx)?);
                } else {
                    result.push(table);
                }
            }
        }
    }
    Ok(result)
}

/// Sweep one field's value space under fixed sibling values, naming values
/// against the corrected value-0 baseline.
fn enumerate_field(
    disassembler: &dyn Disassembler,
    ranges: &EncodingRanges,
    initial_values: &[u64],
    rng: &EncodingRange,
    idx: usize,
) -> Result<Option<ModifierTable>, SolverError> {
    let operands = vec![0u64; ranges.operand_count()];
    let mut values = initial_values.to_vec();

    let mut words = Vec::with_capacity(1 << rng.length);
    for value in 0..(1u64 << rng.length) {
        values[idx] = value;
        words.push(ranges.encode(&EncodeParams::new(operands.clone(), values.clone()))?);
    }
    let texts = disassembler.disassemble_batch(&words)?;

    let (Ok(first), Ok(second)) = (
        ParsedInstruction::parse(texts.first().map(String::as_str).unwrap_or("")),
        ParsedInstruction::parse(texts.get(1).map(String::as_str).unwrap_or("")),
    ) else {
        return Ok(None);
    };

    let basis = corrected_basis(&first.modifiers, &second.modifiers);

    let mut table = Vec::with_capacity(texts.len());
    for (value, text) in texts.iter().enumerate() {
        let Ok(parsed) = ParsedInstruction::parse(text) else {
            debug!(value, "dropping undecodable modifier value");
            continue;
        };
        let name = join_tokens(&added_tokens_over(&basis, &parsed.modifiers));
        table.push((value as u64, name));
    }
    Ok(Some(table))
}

/// Enumerate a field under every combination of the other modifier fields,
/// taking for each value the first basis that decodes to a valid name.
fn enumerate_dependent(
    disassembler: &dyn Disassembler,
    ranges: &EncodingRanges,
    modifier_ranges: &[EncodingRange],
    idx: usize,
) -> Result<ModifierTable, SolverError> {
    let value_spaces: Vec<Vec<u64>> = modifier_ranges
        .iter()
        .enumerate()
        .map(|(i, rng)| {
            if i == idx {
                vec![0]
            } else {
                (0..(1u64 << rng.length)).collect()
            }
        })
        .collect();

    let mut tables = Vec::new();
    for basis in value_spaces.into_iter().multi_cartesian_product() {
        if let Some(table) =
            enumerate_field(disassembler, ranges, &basis, &modifier_ranges[idx], idx)?
        {
            tables.push(table);
        }
    }

    let mut result = Vec::new();
    for value in 0..(1u64 << modifier_ranges[idx].length) {
        let named = tables.iter().find_map(|table| {
            table
                .iter()
                .find(|(v, name)| *v == value && !is_invalid(name))
                .map(|(_, name)| name.clone())
        });
        if let Some(name) = named {
            result.push((value, name));
        }
    }
    debug!(group = ?modifier_ranges[idx].group_id, rows = result.len(), "dependent enumeration");
    Ok(result)
}

/// The modifier tokens of one flat operand in a decoded probe.
fn operand_modifier_tokens(text: &str, operand_index: usize) -> Option<Vec<String>> {
    let parsed = ParsedInstruction::parse(text).ok()?;
    let operands = parsed.flat_operands();
    operands.get(operand_index).map(|op| op.modifiers.clone())
}

/// Enumerate per-operand modifier selectors under the same protocol as the
/// instruction-level sweep: the baseline is that operand's value-0 token
/// list, corrected by the tokens the field itself contributes at value 0.
pub fn enumerate_operand_modifiers(
    disassembler: &dyn Disassembler,
    ranges: &EncodingRanges,
) -> Result<BTreeMap<usize, ModifierTable>, SolverError> {
    let operands = vec![0u64; ranges.operand_count()];
    let modifier_values = ranges.seed_modifier_values()?;

    let mut result = BTreeMap::new();
    for rng in ranges.find(EncodingRangeKind::OperandModifier) {
        let Some(operand_index) = rng.operand_index else { continue };

        let mut words = Vec::with_capacity(1 << rng.length);
        for value in 0..(1u64 << rng.length) {
            let mut params = EncodeParams::new(operands.clone(), modifier_values.clone());
            params.operand_modifiers.insert(operand_index, value);
            words.push(ranges.encode(&params)?);
        }
        let texts = disassembler.disassemble_batch(&words)?;

        let first = texts
            .first()
            .and_then(|text| operand_modifier_tokens(text, operand_index));
        let second = texts
            .get(1)
            .and_then(|text| operand_modifier_tokens(text, operand_index));
        let (Some(first), Some(second)) = (first, second) else { continue };

        let basis = corrected_basis(&first, &second);

        let mut table = Vec::with_capacity(texts.len());
        for (value, text) in texts.iter().enumerate() {
            let Some(tokens) = operand_modifier_tokens(text, operand_index) else { continue };
            let name = join_tokens(&added_tokens_over(&basis, &tokens));
            table.push((value as u64, name));
        }
        result.insert(operand_index, table);
    }
    Ok(result)
}
