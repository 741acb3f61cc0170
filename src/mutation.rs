//! Initial per-bit classification of a seed instruction.
//!
//! A [`MutationSet`] holds the evidence gathered from the single-bit-flip
//! sweep and the working per-bit classification the refinement passes keep
//! sharpening. Once the passes settle, [`MutationSet::compute_encoding_ranges`]
//! coalesces the classification into the final range list.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::bits::{get_bit, get_bit_range, InstWord, INST_BITS};
use crate::error::{ParseError, SolverError};
use crate::multiset::analyse_modifiers;
use crate::oracle::Mutation;
use crate::parser::ParsedInstruction;
use crate::ranges::{
    EncodingRange, EncodingRangeKind, EncodingRanges, SCHEDULING_OFFSET, SCHEDULING_SPANS,
};

/// Bits at or below this index belong to the opcode region; instruction
/// modifier inference skips them. A flip there that preserves the key is
/// treated as constant.
pub const OPCODE_LOW_BITS: usize = 12;

/// Per-bit classification state for one seed.
#[derive(Debug, Clone)]
pub struct MutationSet {
    pub seed: InstWord,
    pub disasm: String,
    pub parsed: ParsedInstruction,
    pub key: String,

    pub opcode_bits: BTreeSet<usize>,
    pub operand_value_bits: BTreeSet<usize>,
    pub operand_modifier_bits: BTreeSet<usize>,
    /// Operand-flag candidates: bit to token name.
    pub operand_flag_names: BTreeMap<usize, String>,
    pub modifier_bits: BTreeSet<usize>,
    /// Instruction-flag candidates: bit to token name.
    pub flag_names: BTreeMap<usize, String>,
    pub predicate_bits: BTreeSet<usize>,
    pub bit_to_operand: BTreeMap<usize, usize>,
    /// Recorded by the operand-width pass, keyed by field start bit.
    pub bit_to_shift: BTreeMap<usize, u32>,
    pub bit_to_offset: BTreeMap<usize, i64>,

    modifier_groups: BTreeMap<usize, usize>,
}

impl MutationSet {
    /// Classify every mutation against the parsed seed. Fails only when the
    /// seed itself does not parse.
    pub fn new(seed: InstWord, disasm: String, mutations: &[Mutation]) -> Result<Self, ParseError> {
        let parsed = ParsedInstruction::parse(&disasm)?;
        let key = parsed.key();
        let seed_operands = parsed.flat_operands();

        let mut opcode_bits = BTreeSet::new();
        let mut operand_value_bits = BTreeSet::new();
        let mut operand_modifier_bits = BTreeSet::new();
        let mut operand_flag_names = BTreeMap::new();
        let mut modifier_bits = BTreeSet::new();
        let mut flag_names = BTreeMap::new();
        let mut predicate_bits = BTreeSet::new();
        let mut bit_to_operand = BTreeMap::new();

        for mutation in mutations {
            let text = mutation.text.trim();
            if text.is_empty() {
                // The disassembler refused the flipped word.
                opcode_bits.insert(mutation.bit);
                continue;
            }
            let mutated = match ParsedInstruction::parse(text) {
                Ok(parsed) => parsed,
                Err(error) => {
                    debug!(bit = mutation.bit, %error, text, "dropping unparseable probe");
                    continue;
                }
            };
            if mutated.key() != key {
                opcode_bits.insert(mutation.bit);
                continue;
            }

            if mutated.predicate != parsed.predicate {
                predicate_bits.insert(mutation.bit);
            }

            let mutated_operands = mutated.flat_operands();
            let mut operand_effected = false;
            for (i, (mutated_op, seed_op)) in
                mutated_operands.iter().zip(seed_operands.iter()).enumerate()
            {
                if !mutated_op.compare(seed_op) {
                    operand_value_bits.insert(mutation.bit);
                    bit_to_operand.insert(mutation.bit, i);
                    operand_effected = true;
                } else {
                    let delta = analyse_modifiers(&seed_op.modifiers, &mutated_op.modifiers);
                    if delta.effected {
                        bit_to_operand.insert(mutation.bit, i);
                        operand_modifier_bits.insert(mutation.bit);
                        operand_effected = true;
                    }
                    if let Some(flag) = delta.flag_candidate {
                        operand_flag_names.insert(mutation.bit, flag);
                    }
                }
            }
            if operand_effected {
                continue;
            }

            if mutation.bit > OPCODE_LOW_BITS {
                let delta = analyse_modifiers(&parsed.modifiers, &mutated.modifiers);
                if delta.effected {
                    modifier_bits.insert(mutation.bit);
                }
                if let Some(flag) = delta.flag_candidate {
                    flag_names.insert(mutation.bit, flag);
                }
            }
        }

        Ok(Self {
            seed,
            disasm,
            parsed,
            key,
            opcode_bits,
            operand_value_bits,
            operand_modifier_bits,
            operand_flag_names,
            modifier_bits,
            flag_names,
            predicate_bits,
            bit_to_operand,
            bit_to_shift: BTreeMap::new(),
            bit_to_offset: BTreeMap::new(),
            modifier_groups: BTreeMap::new(),
        })
    }

    /// Drop all group assignments; the next canonicalization rebuilds them.
    pub fn reset_modifier_groups(&mut self) {
        self.modifier_groups.clear();
    }

    pub fn modifier_group(&self, bit: usize) -> Option<usize> {
        self.modifier_groups.get(&bit).copied()
    }

    /// Assign a fresh group to a suffix of modifier bits, splitting it off
    /// from whatever group the bits held before.
    pub fn split_modifier_group(&mut self, bits: impl IntoIterator<Item = usize>) {
        let next = self.modifier_groups.values().copied().max().unwrap_or(0) + 1;
        for bit in bits {
            self.modifier_groups.insert(bit, next);
        }
    }

    /// Give every group-less run of modifier bits a fresh group, then
    /// renumber all groups densely in bit order.
    fn canonicalize_modifier_groups(&mut self) {
        let bits: Vec<usize> = self.modifier_bits.iter().copied().collect();

        let mut fill_mode = false;
        let mut fill_id = 0usize;
        for (i, &bit) in bits.iter().enumerate() {
            if self.modifier_groups.contains_key(&bit) {
                continue;
            }
            // A discontinuity starts a new group.
            if fill_mode && i != 0 && bits[i - 1] != bit - 1 {
                fill_mode = false;
            }
            if !fill_mode {
                fill_id = self.modifier_groups.values().copied().max().unwrap_or(0) + 1;
                fill_mode = true;
            }
            self.modifier_groups.insert(bit, fill_id);
        }

        let mut renumber: BTreeMap<usize, usize> = BTreeMap::new();
        let mut next = 0usize;
        for &bit in &bits {
            let old = self.modifier_groups[&bit];
            let new = *renumber.entry(old).or_insert_with(|| {
                next += 1;
                next
            });
            self.modifier_groups.insert(bit, new);
        }
    }

    /// Coalesce the per-bit classification into ordered ranges covering all
    /// 128 bits.
    pub fn compute_encoding_ranges(&mut self) -> Result<EncodingRanges, SolverError> {
        self.canonicalize_modifier_groups();

        let mut result: Vec<EncodingRange> = Vec::new();
        let mut current: Option<EncodingRange> = None;

        for i in 0..INST_BITS {
            let mut new_range = None;

            if self.modifier_bits.contains(&i) {
                if let Some(name) = self.flag_names.get(&i) {
                    // Flags stand alone no matter what surrounds them.
                    if let Some(range) = current.take() {
                        result.push(range);
                    }
                    let mut flag = EncodingRange::new(EncodingRangeKind::Flag, i, 1);
                    flag.name = Some(name.clone());
                    result.push(flag);
                    continue;
                }
                let mut range = EncodingRange::new(EncodingRangeKind::Modifier, i, 1);
                range.group_id = self.modifier_group(i);
                new_range = Some(range);
            } else if self.predicate_bits.contains(&i) {
                new_range = Some(EncodingRange::new(EncodingRangeKind::Predicate, i, 1));
            } else if self.operand_value_bits.contains(&i) {
                let mut range = EncodingRange::new(EncodingRangeKind::Operand, i, 1);
                range.operand_index = self.bit_to_operand.get(&i).copied();
                new_range = Some(range);
            } else if self.operand_modifier_bits.contains(&i) {
                let operand_index = self.bit_to_operand.get(&i).copied();
                if let Some(name) = self.operand_flag_names.get(&i) {
                    if let Some(range) = current.take() {
                        result.push(range);
                    }
                    let mut flag = EncodingRange::new(EncodingRangeKind::OperandFlag, i, 1);
                    flag.operand_index = operand_index;
                    flag.name = Some(name.clone());
                    result.push(flag);
                    continue;
                }
                let mut range = EncodingRange::new(EncodingRangeKind::OperandModifier, i, 1);
                range.operand_index = operand_index;
                new_range = Some(range);
            }

            // Scheduling spans apply only while the seed carries null
            // scheduling bits there; anything else decays to constant.
            if new_range.is_none() {
                let mut offset = SCHEDULING_OFFSET;
                for (kind, length) in SCHEDULING_SPANS {
                    if i >= offset
                        && i < offset + length
                        && get_bit_range(&self.seed, offset, offset + length)? == 0
                    {
                        new_range = Some(EncodingRange::new(kind, i, 1));
                        break;
                    }
                    offset += length;
                }
            }

            let new_range = new_range.unwrap_or_else(|| {
                let mut range = EncodingRange::new(EncodingRangeKind::Constant, i, 1);
                range.constant = Some(0);
                range
            });

            let extend = current.as_ref().is_some_and(|cur| {
                cur.kind == new_range.kind
                    && cur.operand_index == new_range.operand_index
                    && (new_range.kind != EncodingRangeKind::Constant || i != 64)
                    && (new_range.group_id.is_none() || new_range.group_id == cur.group_id)
            });
            if extend {
                current.as_mut().unwrap().length += 1;
            } else {
                if let Some(range) = current.take() {
                    result.push(range);
                }
                current = Some(new_range);
            }

            let cur = current.as_mut().unwrap();
            if cur.shift.is_none() {
                if let Some(&shift) = self.bit_to_shift.get(&i) {
                    cur.shift = Some(shift);
                }
            }
            if cur.offset.is_none() {
                if let Some(&offset) = self.bit_to_offset.get(&i) {
                    cur.offset = Some(offset);
                }
            }
            if cur.kind == EncodingRangeKind::Constant {
                let bit = u64::from(get_bit(&self.seed, i)?);
                let shifted = bit << (cur.length - 1);
                cur.constant = Some(cur.constant.unwrap_or(0) | shifted);
            }
        }
        if let Some(range) = current.take() {
            result.push(range);
        }

        Ok(EncodingRanges::new(result, self.seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{set_bit_range, INST_BYTES};
    use crate::oracle::Mutation;

    fn mutation(bit: usize, seed: &InstWord, text: &str) -> Mutation {
        let mut word = *seed;
        crate::bits::toggle_bit(&mut word, bit).unwrap();
        Mutation { bit, word, text: text.to_string() }
    }

    fn build(seed: InstWord, disasm: &str, mutations: &[Mutation]) -> MutationSet {
        MutationSet::new(seed, disasm.to_string(), mutations).unwrap()
    }

    #[test]
    fn classifies_opcode_operand_and_flag_bits() {
        let seed = [0u8; INST_BYTES];
        let disasm = "LDG R0, [R2]";
        let mutations = vec![
            mutation(0, &seed, ""),
            mutation(1, &seed, "IMAD R0, R2"),
            mutation(16, &seed, "LDG R1, [R2]"),
            mutation(24, &seed, "LDG R0, [R3]"),
            mutation(40, &seed, "LDG.E R0, [R2]"),
        ];
        let mset = build(seed, disasm, &mutations);
        assert!(mset.opcode_bits.contains(&0));
        assert!(mset.opcode_bits.contains(&1));
        assert!(mset.operand_value_bits.contains(&16));
        assert_eq!(mset.bit_to_operand.get(&16), Some(&0));
        assert_eq!(mset.bit_to_operand.get(&24), Some(&1));
        assert_eq!(mset.flag_names.get(&40).map(String::as_str), Some("E"));
        assert!(mset.modifier_bits.contains(&40));
    }

    #[test]
    fn low_bits_never_become_modifiers() {
        let seed = [0u8; INST_BYTES];
        let mutations = vec![mutation(5, &seed, "NOP.WIDE")];
        let mset = build(seed, "NOP", &mutations);
        assert!(mset.modifier_bits.is_empty());
    }

    #[test]
    fn operand_modifier_bits_record_their_operand() {
        let seed = [0u8; INST_BYTES];
        let mutations = vec![mutation(34, &seed, "LDG R0, [R2.X4]")];
        let mset = build(seed, "LDG R0, [R2]", &mutations);
        assert!(mset.operand_modifier_bits.contains(&34));
        assert_eq!(mset.bit_to_operand.get(&34), Some(&1));
        assert_eq!(mset.operand_flag_names.get(&34).map(String::as_str), Some("X4"));
    }

    #[test]
    fn ranges_partition_all_bits() {
        let seed = [0u8; INST_BYTES];
        let mutations =
            vec![mutation(16, &seed, "MOV R1, 0x0"), mutation(17, &seed, "MOV R2, 0x0")];
        let mut mset = build(seed, "MOV R0, 0x0", &mutations);
        let ranges = mset.compute_encoding_ranges().unwrap();
        let total: usize = ranges.ranges.iter().map(|r| r.length).sum();
        assert_eq!(total, INST_BITS);
        let mut cursor = 0;
        for rng in &ranges.ranges {
            assert_eq!(rng.start, cursor);
            cursor = rng.end();
        }
    }

    #[test]
    fn constants_break_at_bit_64() {
        let seed = [0u8; INST_BYTES];
        let mut mset = build(seed, "NOP", &[]);
        let ranges = mset.compute_encoding_ranges().unwrap();
        assert!(ranges.ranges.iter().any(|r| r.end() == 64));
        assert!(ranges.ranges.iter().any(|r| r.start == 64));
    }

    #[test]
    fn constant_ranges_capture_seed_bits() {
        let mut seed = [0u8; INST_BYTES];
        set_bit_range(&mut seed, 0, 12, 0x7a9).unwrap();
        let mut mset = build(seed, "NOP", &[]);
        let ranges = mset.compute_encoding_ranges().unwrap();
        let first = &ranges.ranges[0];
        assert_eq!(first.kind, EncodingRangeKind::Constant);
        assert_eq!(get_bit_range(&seed, first.start, first.end()).unwrap(), first.constant.unwrap());
    }

    #[test]
    fn scheduling_spans_emerge_when_seed_is_null() {
        let seed = [0u8; INST_BYTES];
        let mut mset = build(seed, "NOP", &[]);
        let ranges = mset.compute_encoding_ranges().unwrap();
        let stall = ranges.find(EncodingRangeKind::StallCycles);
        assert_eq!(stall.len(), 1);
        assert_eq!(stall[0].start, SCHEDULING_OFFSET);
        assert_eq!(stall[0].length, 4);
        assert_eq!(ranges.find(EncodingRangeKind::BarrierMask)[0].length, 6);
    }

    #[test]
    fn nonzero_scheduling_bits_decay_to_constant() {
        let mut seed = [0u8; INST_BYTES];
        set_bit_range(&mut seed, SCHEDULING_OFFSET, SCHEDULING_OFFSET + 4, 0xf).unwrap();
        let mut mset = build(seed, "NOP", &[]);
        let ranges = mset.compute_encoding_ranges().unwrap();
        assert!(ranges.find(EncodingRangeKind::StallCycles).is_empty());
    }

    #[test]
    fn groups_renumber_densely_per_run() {
        let seed = [0u8; INST_BYTES];
        let mut mset = build(seed, "NOP", &[]);
        mset.modifier_bits.extend([20, 21, 30, 31]);
        let ranges = mset.compute_encoding_ranges().unwrap();
        let mods = ranges.find(EncodingRangeKind::Modifier);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].group_id, Some(1));
        assert_eq!(mods[1].group_id, Some(2));
    }

    #[test]
    fn flag_bits_form_standalone_ranges() {
        let seed = [0u8; INST_BYTES];
        let mut mset = build(seed, "NOP", &[]);
        mset.modifier_bits.extend([40, 41, 42]);
        mset.flag_names.insert(41, "E".to_string());
        let ranges = mset.compute_encoding_ranges().unwrap();
        let flags = ranges.find(EncodingRangeKind::Flag);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].start, 41);
        assert_eq!(flags[0].name.as_deref(), Some("E"));
        assert_eq!(ranges.find(EncodingRangeKind::Modifier).len(), 2);
    }
}
