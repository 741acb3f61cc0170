//! Refinement passes over a [`MutationSet`].
//!
//! Each pass issues targeted probes to sharpen the initial per-bit
//! classification and reports whether it changed anything; the driver runs
//! the disambiguation, extension and splitting passes to fixed point.
//! Hypotheses are only ever confirmed by positive evidence: a probe that
//! refuses to disassemble or parse is dropped.

use tracing::{debug, info, warn};

use crate::bits::{set_bit_range, toggle_bit, INST_BITS};
use crate::error::SolverError;
use crate::multiset::{added_tokens, TokenMultiset};
use crate::mutation::MutationSet;
use crate::oracle::Disassembler;
use crate::parser::{ParsedInstruction, RegClass};
use crate::ranges::{EncodingRangeKind, EncodingRanges};

/// Re-run `pass` until it reports no change. Passes only ever convert
/// unknown bits into classified ones, so this terminates.
pub fn run_to_fixed_point<E>(mut pass: impl FnMut() -> Result<bool, E>) -> Result<(), E> {
    while pass()? {}
    Ok(())
}

/// Disambiguate instruction flags from multi-bit modifiers.
///
/// For every flag candidate, flip the flag bit together with an adjacent
/// bit. If the result still parses to the same key but no longer carries
/// the flag's token, the bit was one value of a wider selector: demote it.
pub fn disambiguate_flags(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
) -> Result<bool, SolverError> {
    let mut probes = Vec::new();
    for (&bit, _) in &mset.flag_names {
        if bit + 1 < INST_BITS {
            let mut word = mset.seed;
            toggle_bit(&mut word, bit)?;
            toggle_bit(&mut word, bit + 1)?;
            probes.push((word, bit, bit + 1));
        }
        if bit > 0 && !mset.flag_names.contains_key(&(bit - 1)) {
            let mut word = mset.seed;
            toggle_bit(&mut word, bit)?;
            toggle_bit(&mut word, bit - 1)?;
            probes.push((word, bit, bit - 1));
        }
    }
    if probes.is_empty() {
        return Ok(false);
    }

    let words: Vec<_> = probes.iter().map(|(word, _, _)| *word).collect();
    let texts = disassembler.disassemble_batch(&words)?;

    let mut changed = false;
    for ((_, bit, adj), text) in probes.into_iter().zip(texts) {
        if !mset.flag_names.contains_key(&bit) {
            // Already eliminated by an earlier probe this round.
            continue;
        }
        if text.is_empty() {
            continue;
        }
        let Ok(parsed) = ParsedInstruction::parse(&text) else { continue };
        if parsed.key() != mset.key {
            continue;
        }
        let Some(flag_name) = mset.flag_names.get(&bit).cloned() else { continue };
        if !parsed.modifiers.contains(&flag_name) {
            debug!(bit, adj, flag = %flag_name, "demoting flag to modifier");
            changed = true;
            mset.modifier_bits.insert(adj);
            mset.flag_names.remove(&bit);
            mset.flag_names.remove(&adj);
            mset.reset_modifier_groups();
        }
    }
    Ok(changed)
}

/// Operand-flag variant of [`disambiguate_flags`], comparing the modifier
/// list of the flag's operand instead of the instruction's.
pub fn disambiguate_operand_flags(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
) -> Result<bool, SolverError> {
    let mut probes = Vec::new();
    for (&bit, _) in &mset.operand_flag_names {
        if bit + 1 < INST_BITS {
            let mut word = mset.seed;
            toggle_bit(&mut word, bit)?;
            toggle_bit(&mut word, bit + 1)?;
            probes.push((word, bit, bit + 1));
        }
        if bit > 0 && !mset.operand_flag_names.contains_key(&(bit - 1)) {
            let mut word = mset.seed;
            toggle_bit(&mut word, bit)?;
            toggle_bit(&mut word, bit - 1)?;
            probes.push((word, bit, bit - 1));
        }
    }
    if probes.is_empty() {
        return Ok(false);
    }

    let words: Vec<_> = probes.iter().map(|(word, _, _)| *word).collect();
    let texts = disassembler.disassemble_batch(&words)?;

    let mut changed = false;
    for ((_, bit, adj), text) in probes.into_iter().zip(texts) {
        if !mset.operand_flag_names.contains_key(&bit) {
            continue;
        }
        if text.is_empty() {
            continue;
        }
        let Ok(parsed) = ParsedInstruction::parse(&text) else { continue };
        if parsed.key() != mset.key {
            continue;
        }
        let Some(&operand) = mset.bit_to_operand.get(&bit) else { continue };
        let operands = parsed.flat_operands();
        let Some(mutated) = operands.get(operand) else { continue };
        let Some(flag_name) = mset.operand_flag_names.get(&bit).cloned() else { continue };
        if !mutated.modifiers.contains(&flag_name) {
            debug!(bit, adj, flag = %flag_name, "demoting operand flag");
            changed = true;
            mset.operand_flag_names.remove(&bit);
            mset.operand_flag_names.remove(&adj);
        }
    }
    Ok(changed)
}

/// Try to grow modifier fields by one bit on either side: flip a bit inside
/// the field together with the bit just outside, and claim the outside bit
/// when the two probes decode with different modifiers under the same key.
pub fn extend_modifiers(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
) -> Result<bool, SolverError> {
    let ranges = mset.compute_encoding_ranges()?;
    let modifier_ranges: Vec<(usize, usize)> = ranges
        .find(EncodingRangeKind::Modifier)
        .iter()
        .map(|r| (r.start, r.length))
        .collect();

    let mut changed = false;
    for (start, length) in modifier_ranges {
        if start > 0 {
            changed |= extend_probe(disassembler, mset, start, start - 1)?;
        }
        if start + length < INST_BITS {
            changed |= extend_probe(disassembler, mset, start, start + length)?;
        }
    }
    if changed {
        mset.reset_modifier_groups();
    }
    Ok(changed)
}

fn extend_probe(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
    modifier_bit: usize,
    adj: usize,
) -> Result<bool, SolverError> {
    if mset.flag_names.contains_key(&adj) {
        return Ok(false);
    }

    let mut word = mset.seed;
    toggle_bit(&mut word, modifier_bit)?;
    let inner_text = disassembler.disassemble(&word)?;
    if inner_text.is_empty() {
        return Ok(false);
    }
    let Ok(inner) = ParsedInstruction::parse(&inner_text) else { return Ok(false) };

    toggle_bit(&mut word, adj)?;
    let outer_text = disassembler.disassemble(&word)?;
    if outer_text.is_empty() {
        return Ok(false);
    }
    let Ok(outer) = ParsedInstruction::parse(&outer_text) else { return Ok(false) };

    if outer.key() != inner.key() {
        return Ok(false);
    }
    if outer.modifiers != inner.modifiers {
        let fresh = !mset.modifier_bits.contains(&adj);
        if fresh {
            debug!(adj, modifier_bit, "extending modifier field");
        }
        mset.modifier_bits.insert(adj);
        mset.flag_names.remove(&adj);
        return Ok(fresh);
    }
    Ok(false)
}

/// Absorb short constant gaps between adjacent modifier fields; fragmented
/// selectors otherwise enumerate as two unrelated groups.
pub fn coalesce_modifiers(mset: &mut MutationSet) -> Result<bool, SolverError> {
    let ranges = mset.compute_encoding_ranges()?;
    let list = &ranges.ranges;

    let mut absorbed = Vec::new();
    for window in 0..list.len().saturating_sub(2) {
        let (before, gap, after) = (&list[window], &list[window + 1], &list[window + 2]);
        if before.kind != EncodingRangeKind::Modifier
            || gap.kind != EncodingRangeKind::Constant
            || gap.length > 2
            || after.kind != EncodingRangeKind::Modifier
        {
            continue;
        }
        absorbed.extend(gap.start..gap.end());
    }

    let changed = !absorbed.is_empty();
    for bit in absorbed {
        mset.modifier_bits.insert(bit);
    }
    if changed {
        mset.reset_modifier_groups();
    }
    Ok(changed)
}

/// Split a modifier field at the first internal point that varies
/// independently from the field's first bit. One split per invocation; the
/// fixed-point driver finds the rest.
pub fn split_modifiers(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
) -> Result<bool, SolverError> {
    let ranges = mset.compute_encoding_ranges()?;
    let modifier_ranges: Vec<(usize, usize)> = ranges
        .find(EncodingRangeKind::Modifier)
        .iter()
        .map(|r| (r.start, r.length))
        .collect();

    for (start, length) in modifier_ranges {
        for i in 1..length {
            let independent = split_probe(disassembler, mset, start, start + i)?
                || split_probe(disassembler, mset, start + i - 1, start + i)?;
            if independent {
                info!(start, at = i, "splitting modifier group");
                mset.split_modifier_group(start + i..start + length);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Three probes: seed, seed+`modifier_bit`, seed+`modifier_bit`+`adj`. The
/// split point is independent when the single flip adds exactly one plain
/// token and the double flip keeps that token with the same count while
/// differing from both neighbors.
fn split_probe(
    disassembler: &dyn Disassembler,
    mset: &MutationSet,
    modifier_bit: usize,
    adj: usize,
) -> Result<bool, SolverError> {
    let base = mset.seed;
    let mut single = base;
    toggle_bit(&mut single, modifier_bit)?;
    let mut double = single;
    toggle_bit(&mut double, adj)?;

    let texts = disassembler.disassemble_batch(&[base, single, double])?;
    if texts.iter().any(String::is_empty) {
        return Ok(false);
    }
    let parsed: Vec<ParsedInstruction> = {
        let mut out = Vec::new();
        for text in &texts {
            match ParsedInstruction::parse(text) {
                Ok(p) => out.push(p),
                Err(_) => return Ok(false),
            }
        }
        out
    };
    let (orig, single, double) = (&parsed[0], &parsed[1], &parsed[2]);
    if orig.key() != single.key() || single.key() != double.key() {
        return Ok(false);
    }

    let added = added_tokens(&orig.modifiers, &single.modifiers);
    if added.len() != 1 || added[0].starts_with("INVALID") {
        return Ok(false);
    }
    let token = &added[0];
    if double.modifiers.contains(token)
        && double.modifiers != single.modifiers
        && double.modifiers != orig.modifiers
    {
        let count_single = TokenMultiset::from_tokens(&single.modifiers).count(token);
        let count_double = TokenMultiset::from_tokens(&double.modifiers).count(token);
        return Ok(count_single == count_double);
    }
    Ok(false)
}

/// Probe an operand field with `value`, with the field grown `left_offset`
/// bits to the left, and report the decoded operand value.
fn probe_operand_value(
    disassembler: &dyn Disassembler,
    mset: &MutationSet,
    start: usize,
    length: usize,
    operand_index: usize,
    value: u64,
    left_offset: usize,
) -> Result<Option<i64>, SolverError> {
    let Some(lo) = start.checked_sub(left_offset) else { return Ok(None) };
    let mut word = mset.seed;
    set_bit_range(&mut word, lo, start + length, value)?;
    let text = disassembler.disassemble(&word)?;
    let Ok(parsed) = ParsedInstruction::parse(&text) else { return Ok(None) };
    let operands = parsed.flat_operands();
    Ok(operands.get(operand_index).and_then(|op| op.value()))
}

/// Correct widths, shifts and offsets of integer-immediate and predicate
/// operand fields by numeric probing.
///
/// Encoding 0 and 1 into the field reveals truncation: a decoded delta of
/// `2^k` means the low `k` bits of the value are implicit. Probing single
/// set bits at rising positions then locates the real shift, and a residual
/// that repeats across at least half of the probes is recorded as an
/// additive offset. Any recovered missing bits extend the field leftward.
pub fn fix_operand_widths(
    disassembler: &dyn Disassembler,
    mset: &mut MutationSet,
) -> Result<(), SolverError> {
    let ranges = mset.compute_encoding_ranges()?;
    let operand_shapes: Vec<(bool, bool)> = mset
        .parsed
        .flat_operands()
        .iter()
        .map(|op| (op.is_int_imm(), op.is_register(RegClass::P)))
        .collect();

    let mut seen = std::collections::BTreeSet::new();
    for rng in ranges.find(EncodingRangeKind::Operand) {
        let Some(idx) = rng.operand_index else { continue };
        let Some(&(is_imm, is_pred)) = operand_shapes.get(idx) else { continue };
        if !is_imm && !is_pred {
            continue;
        }
        if (rng.length <= 2 && !is_pred) || seen.contains(&idx) {
            continue;
        }
        seen.insert(idx);

        let val_zero =
            probe_operand_value(disassembler, mset, rng.start, rng.length, idx, 0, 0)?;
        let val_one =
            probe_operand_value(disassembler, mset, rng.start, rng.length, idx, 1, 0)?;
        let (Some(val_zero), Some(val_one)) = (val_zero, val_one) else { continue };

        let diff = if is_pred { (val_one - val_zero).abs() } else { val_one - val_zero };
        if diff < 1 {
            continue;
        }
        let diff = diff as u64;
        if !diff.is_power_of_two() {
            continue;
        }
        let missing = diff.trailing_zeros() as usize;
        if missing < 1 {
            continue;
        }

        let mut shift = 0usize;
        let mut offsets: Vec<i64> = Vec::new();
        let mut failure = false;
        if !is_pred {
            for i in 0..rng.length {
                let encoded = 1u64 << i;
                let decoded = probe_operand_value(
                    disassembler,
                    mset,
                    rng.start,
                    rng.length,
                    idx,
                    encoded,
                    missing,
                )?;
                let Some(decoded) = decoded else {
                    failure = true;
                    break;
                };
                offsets.push(decoded - encoded as i64);
                if decoded == encoded as i64 {
                    info!(key = %mset.key, shift = i, "operand field shift");
                    mset.bit_to_shift.insert(rng.start, i as u32);
                    shift = i;
                    break;
                }
            }
        }
        if failure {
            warn!(key = %mset.key, operand = idx, "operand width probing failed");
            continue;
        }

        let residual = offsets.last().copied();
        let residual_votes =
            residual.map(|r| offsets.iter().filter(|&&o| o == r).count()).unwrap_or(0);
        if offsets.len() >= 8 && residual_votes >= offsets.len() / 2 && residual != Some(0) {
            let offset = residual.unwrap();
            mset.bit_to_offset.insert(rng.start, offset);
            if let Some(pos) = offsets.iter().position(|&o| o == offset) {
                if pos != 0 {
                    mset.bit_to_shift.insert(rng.start, pos as u32);
                    shift = pos;
                    info!(key = %mset.key, shift = pos, "operand field shift with offset");
                }
            }
            info!(key = %mset.key, offset, "operand field offset");
        } else if !offsets.is_empty() && residual != Some(0) {
            warn!(key = %mset.key, operand = idx, "operand field correction failed");
            continue;
        }

        // The remaining missing bits sit to the left of the field.
        let extension = (missing + 1).saturating_sub(shift);
        for i in 1..extension {
            let Some(bit) = rng.start.checked_sub(i) else { break };
            mset.operand_value_bits.insert(bit);
            mset.bit_to_operand.insert(bit, idx);
        }
        if extension > 1 {
            info!(key = %mset.key, operand = idx, by = extension - 1, "extended operand field");
        }
    }
    Ok(())
}

/// Detect inverted predicate-operand fields: encode 1 into the field and
/// mark the range inverse when the disassembler reports predicate 6.
pub fn fix_predicate_polarity(
    disassembler: &dyn Disassembler,
    mset: &MutationSet,
    ranges: &mut EncodingRanges,
) -> Result<(), SolverError> {
    let predicate_operands: Vec<bool> = mset
        .parsed
        .flat_operands()
        .iter()
        .map(|op| op.is_register(RegClass::P))
        .collect();

    for rng in ranges.find_mut(EncodingRangeKind::Operand) {
        let Some(idx) = rng.operand_index else { continue };
        if !predicate_operands.get(idx).copied().unwrap_or(false) {
            continue;
        }
        let mut word = mset.seed;
        set_bit_range(&mut word, rng.start, rng.start + rng.length, 1)?;
        let text = disassembler.disassemble(&word)?;
        let Ok(parsed) = ParsedInstruction::parse(&text) else { continue };
        let decoded = parsed.flat_operands().get(idx).and_then(|op| op.value());
        if decoded == Some(6) {
            info!(key = %mset.key, operand = idx, "inverse predicate field");
            rng.inverse = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_stops_on_false() {
        let mut calls = 0;
        run_to_fixed_point(|| -> Result<bool, SolverError> {
            calls += 1;
            Ok(calls < 3)
        })
        .unwrap();
        assert_eq!(calls, 3);
    }
}
