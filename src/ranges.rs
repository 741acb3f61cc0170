//! Encoding ranges: the inferred bit-level layout of one instruction.
//!
//! A range list partitions the 128-bit word into typed fields. The list is
//! ordered by start bit and is the unit the enumeration and encoding stages
//! operate on.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::bits::{get_bit_range, set_bit_range, InstWord, INST_BYTES};
use crate::error::SolverError;

/// First bit of the scheduling/control metadata region.
pub const SCHEDULING_OFFSET: usize = 13 * 8 + 1;

/// Fixed-width scheduling spans, in order from [`SCHEDULING_OFFSET`].
pub const SCHEDULING_SPANS: [(EncodingRangeKind, usize); 6] = [
    (EncodingRangeKind::StallCycles, 4),
    (EncodingRangeKind::YieldFlag, 1),
    (EncodingRangeKind::ReadBarrier, 3),
    (EncodingRangeKind::WriteBarrier, 3),
    (EncodingRangeKind::BarrierMask, 6),
    (EncodingRangeKind::ReuseMask, 4),
];

/// Field type of an [`EncodingRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum EncodingRangeKind {
    /// Fixed bits belonging to the opcode.
    #[serde(rename = "constant")]
    #[strum(serialize = "constant")]
    Constant,
    /// Integer value of one operand.
    #[serde(rename = "operand")]
    #[strum(serialize = "operand")]
    Operand,
    /// Single bit adding a named modifier to one operand.
    #[serde(rename = "operand_flag")]
    #[strum(serialize = "operand_flag")]
    OperandFlag,
    /// Multi-bit selector attached to one operand.
    #[serde(rename = "operand_modifier")]
    #[strum(serialize = "operand_modifier")]
    OperandModifier,
    /// Single bit adding a named modifier to the instruction.
    #[serde(rename = "flag")]
    #[strum(serialize = "flag")]
    Flag,
    /// Multi-bit instruction-level selector; `group_id` partitions
    /// independent sub-selectors.
    #[serde(rename = "modifier")]
    #[strum(serialize = "modifier")]
    Modifier,
    /// The predicate guard field.
    #[serde(rename = "predicate")]
    #[strum(serialize = "predicate")]
    Predicate,
    #[serde(rename = "stall")]
    #[strum(serialize = "stall")]
    StallCycles,
    #[serde(rename = "y")]
    #[strum(serialize = "y")]
    YieldFlag,
    #[serde(rename = "r-bar")]
    #[strum(serialize = "r-bar")]
    ReadBarrier,
    #[serde(rename = "w-bar")]
    #[strum(serialize = "w-bar")]
    WriteBarrier,
    #[serde(rename = "b-mask")]
    #[strum(serialize = "b-mask")]
    BarrierMask,
    #[serde(rename = "reuse")]
    #[strum(serialize = "reuse")]
    ReuseMask,
}

impl EncodingRangeKind {
    pub const fn is_scheduling(self) -> bool {
        matches!(
            self,
            Self::StallCycles
                | Self::YieldFlag
                | Self::ReadBarrier
                | Self::WriteBarrier
                | Self::BarrierMask
                | Self::ReuseMask
        )
    }
}

/// One contiguous typed bit field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingRange {
    #[serde(rename = "type")]
    pub kind: EncodingRangeKind,
    pub start: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<u64>,
    /// Field stores the bitwise complement of the value.
    #[serde(default)]
    pub inverse: bool,
    /// Right-shift applied to the operand value when encoding; the low
    /// `shift` bits of the value are implicit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<u32>,
    /// Bias subtracted from the operand value before encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
}

impl EncodingRange {
    pub fn new(kind: EncodingRangeKind, start: usize, length: usize) -> Self {
        Self {
            kind,
            start,
            length,
            operand_index: None,
            group_id: None,
            name: None,
            constant: None,
            inverse: false,
            shift: None,
            offset: None,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.length
    }

    fn mask(&self) -> u64 {
        if self.length >= 64 {
            u64::MAX
        } else {
            (1u64 << self.length) - 1
        }
    }
}

/// Requested field values for [`EncodingRanges::encode`].
///
/// Defaults match a null-scheduled, unpredicated probe: guard `PT` (7) and
/// stall 15, everything else zero.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Per flat-operand values, indexed like `flat_operands`.
    pub operands: Vec<u64>,
    /// One value per `Modifier` range, in range order.
    pub modifiers: Vec<u64>,
    /// Active instruction flags, by name.
    pub flags: BTreeSet<String>,
    /// Selector value per operand index.
    pub operand_modifiers: BTreeMap<usize, u64>,
    /// Active operand flags, by operand index and name.
    pub operand_flags: BTreeMap<usize, BTreeSet<String>>,
    pub predicate: u64,
    pub stall_cycles: u64,
    pub yield_flag: bool,
    pub read_barrier: u64,
    pub write_barrier: u64,
    pub barrier_mask: u64,
    pub reuse_mask: u64,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            operands: Vec::new(),
            modifiers: Vec::new(),
            flags: BTreeSet::new(),
            operand_modifiers: BTreeMap::new(),
            operand_flags: BTreeMap::new(),
            predicate: 7,
            stall_cycles: 15,
            yield_flag: false,
            read_barrier: 0,
            write_barrier: 0,
            barrier_mask: 0,
            reuse_mask: 0,
        }
    }
}

impl EncodeParams {
    pub fn new(operands: Vec<u64>, modifiers: Vec<u64>) -> Self {
        Self { operands, modifiers, ..Self::default() }
    }
}

/// The ordered range list of one instruction, together with its seed word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingRanges {
    pub ranges: Vec<EncodingRange>,
    #[serde(rename = "inst", with = "crate::bits::hex_word")]
    pub seed: InstWord,
}

impl EncodingRanges {
    pub fn new(ranges: Vec<EncodingRange>, seed: InstWord) -> Self {
        Self { ranges, seed }
    }

    pub fn find(&self, kind: EncodingRangeKind) -> Vec<&EncodingRange> {
        self.ranges.iter().filter(|r| r.kind == kind).collect()
    }

    pub fn find_mut(&mut self, kind: EncodingRangeKind) -> Vec<&mut EncodingRange> {
        self.ranges.iter_mut().filter(|r| r.kind == kind).collect()
    }

    /// Number of distinct flat operands covered by `Operand` ranges.
    pub fn operand_count(&self) -> usize {
        self.find(EncodingRangeKind::Operand)
            .iter()
            .filter_map(|r| r.operand_index)
            .map(|idx| idx + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn modifier_count(&self) -> usize {
        self.find(EncodingRangeKind::Modifier).len()
    }

    /// Names of all instruction-level flags.
    pub fn flags(&self) -> Vec<String> {
        self.find(EncodingRangeKind::Flag)
            .iter()
            .filter_map(|r| r.name.clone())
            .collect()
    }

    /// Seed value of every `Modifier` range, in range order.
    pub fn seed_modifier_values(&self) -> Result<Vec<u64>, SolverError> {
        self.find(EncodingRangeKind::Modifier)
            .iter()
            .map(|r| get_bit_range(&self.seed, r.start, r.end()))
            .collect()
    }

    /// Build an instruction word from field values.
    ///
    /// Zero (and absent) values are skipped entirely, preserving the default
    /// zero bits. When several `Operand` ranges share an operand index, each
    /// successive range takes the value right-shifted by the bits already
    /// written for that operand, so wide values distribute across split
    /// fields.
    pub fn encode(&self, params: &EncodeParams) -> Result<InstWord, SolverError> {
        let mut out = [0u8; INST_BYTES];
        let mut modifier_i = 0usize;
        let mut written: HashMap<usize, usize> = HashMap::new();

        for rng in &self.ranges {
            let value = match rng.kind {
                EncodingRangeKind::Constant => rng.constant,
                EncodingRangeKind::Operand => {
                    let mut value =
                        rng.operand_index.and_then(|idx| params.operands.get(idx)).copied().unwrap_or(0);
                    if let Some(offset) = rng.offset {
                        value = value.wrapping_sub(offset as u64);
                    }
                    if rng.inverse {
                        value ^= rng.mask();
                    }
                    if let Some(shift) = rng.shift {
                        value >>= shift;
                    }
                    Some(value)
                }
                EncodingRangeKind::Modifier => {
                    if modifier_i < params.modifiers.len() {
                        let value = params.modifiers[modifier_i];
                        modifier_i += 1;
                        Some(value)
                    } else {
                        None
                    }
                }
                EncodingRangeKind::Flag => match &rng.name {
                    Some(name) if params.flags.contains(name) => Some(1),
                    _ => None,
                },
                EncodingRangeKind::OperandModifier => {
                    rng.operand_index.and_then(|idx| params.operand_modifiers.get(&idx)).copied()
                }
                EncodingRangeKind::OperandFlag => {
                    let idx = rng.operand_index;
                    match (&rng.name, idx.and_then(|i| params.operand_flags.get(&i))) {
                        (Some(name), Some(set)) => Some(u64::from(set.contains(name))),
                        _ => None,
                    }
                }
                EncodingRangeKind::Predicate => Some(params.predicate),
                EncodingRangeKind::StallCycles => Some(params.stall_cycles),
                EncodingRangeKind::YieldFlag => Some(u64::from(params.yield_flag)),
                EncodingRangeKind::ReadBarrier => Some(params.read_barrier),
                EncodingRangeKind::WriteBarrier => Some(params.write_barrier),
                EncodingRangeKind::BarrierMask => Some(params.barrier_mask),
                EncodingRangeKind::ReuseMask => Some(params.reuse_mask),
            };

            let Some(value) = value else { continue };
            if value == 0 {
                continue;
            }
            let value = if rng.kind == EncodingRangeKind::Operand {
                let idx = rng.operand_index.unwrap_or(0);
                let consumed = written.entry(idx).or_insert(0);
                let shifted = value >> *consumed;
                *consumed += rng.length;
                shifted
            } else {
                value
            };
            set_bit_range(&mut out, rng.start, rng.end(), value)?;
        }
        Ok(out)
    }

    /// Recover operand values from the seed's bit fields, inverting the
    /// per-range transforms the encoder applies.
    pub fn decode_operands(&self) -> Result<Vec<u64>, SolverError> {
        let count = self.operand_count();
        let mut values = vec![0u64; count];
        let mut written = vec![0usize; count];
        let mut shifts = vec![0u32; count];
        let mut offsets = vec![0i64; count];
        for rng in self.find(EncodingRangeKind::Operand) {
            let Some(idx) = rng.operand_index else { continue };
            let mut raw = get_bit_range(&self.seed, rng.start, rng.end())?;
            if rng.inverse {
                raw ^= rng.mask();
            }
            values[idx] |= raw << written[idx];
            written[idx] += rng.length;
            if let Some(shift) = rng.shift {
                shifts[idx] = shift;
            }
            if let Some(offset) = rng.offset {
                offsets[idx] = offset;
            }
        }
        for idx in 0..count {
            values[idx] = (values[idx] << shifts[idx]).wrapping_add(offsets[idx] as u64);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operand_range(start: usize, length: usize, idx: usize) -> EncodingRange {
        let mut rng = EncodingRange::new(EncodingRangeKind::Operand, start, length);
        rng.operand_index = Some(idx);
        rng
    }

    fn constant_range(start: usize, length: usize, constant: u64) -> EncodingRange {
        let mut rng = EncodingRange::new(EncodingRangeKind::Constant, start, length);
        rng.constant = Some(constant);
        rng
    }

    #[test]
    fn encodes_constants_and_operands() {
        let ranges = EncodingRanges::new(
            vec![constant_range(0, 12, 0x5a3), operand_range(16, 8, 0)],
            [0u8; INST_BYTES],
        );
        let word = ranges.encode(&EncodeParams::new(vec![0x42], vec![])).unwrap();
        assert_eq!(get_bit_range(&word, 0, 12).unwrap(), 0x5a3);
        assert_eq!(get_bit_range(&word, 16, 24).unwrap(), 0x42);
    }

    #[test]
    fn split_operand_distributes_across_ranges() {
        // 24-bit value over an 8-bit low field and a 16-bit high field.
        let ranges = EncodingRanges::new(
            vec![operand_range(32, 8, 0), operand_range(48, 16, 0)],
            [0u8; INST_BYTES],
        );
        let word = ranges.encode(&EncodeParams::new(vec![0xabcdef], vec![])).unwrap();
        assert_eq!(get_bit_range(&word, 32, 40).unwrap(), 0xef);
        assert_eq!(get_bit_range(&word, 48, 64).unwrap(), 0xabcd);
    }

    #[test]
    fn operand_index_zero_still_accumulates() {
        // Three ranges of the same operand; the third must shift past the
        // first two even though the index is 0.
        let ranges = EncodingRanges::new(
            vec![operand_range(0, 4, 0), operand_range(8, 4, 0), operand_range(16, 4, 0)],
            [0u8; INST_BYTES],
        );
        let word = ranges.encode(&EncodeParams::new(vec![0xabc], vec![])).unwrap();
        assert_eq!(get_bit_range(&word, 0, 4).unwrap(), 0xc);
        assert_eq!(get_bit_range(&word, 8, 12).unwrap(), 0xb);
        assert_eq!(get_bit_range(&word, 16, 20).unwrap(), 0xa);
    }

    #[test]
    fn operand_transforms_apply_in_order() {
        let mut rng = operand_range(8, 8, 0);
        rng.offset = Some(8);
        rng.shift = Some(2);
        let ranges = EncodingRanges::new(vec![rng], [0u8; INST_BYTES]);
        // (20 - 8) >> 2 == 3
        let word = ranges.encode(&EncodeParams::new(vec![20], vec![])).unwrap();
        assert_eq!(get_bit_range(&word, 8, 16).unwrap(), 3);
        assert_eq!(ranges.decode_operands().unwrap().len(), 1);
    }

    #[test]
    fn inverse_field_stores_complement() {
        let mut rng = operand_range(17, 3, 0);
        rng.inverse = true;
        let ranges = EncodingRanges::new(vec![rng], [0u8; INST_BYTES]);
        let word = ranges.encode(&EncodeParams::new(vec![2], vec![])).unwrap();
        assert_eq!(get_bit_range(&word, 17, 20).unwrap(), 5);
    }

    #[test]
    fn zero_values_write_nothing() {
        let mut flag = EncodingRange::new(EncodingRangeKind::Flag, 40, 1);
        flag.name = Some("E".to_string());
        let ranges =
            EncodingRanges::new(vec![operand_range(16, 8, 0), flag], [0u8; INST_BYTES]);
        let mut params = EncodeParams::new(vec![0], vec![]);
        params.predicate = 0;
        params.stall_cycles = 0;
        let word = ranges.encode(&params).unwrap();
        assert_eq!(word, [0u8; INST_BYTES]);
    }

    #[test]
    fn modifier_values_fill_ranges_in_order() {
        let mut first = EncodingRange::new(EncodingRangeKind::Modifier, 20, 2);
        first.group_id = Some(1);
        let mut second = EncodingRange::new(EncodingRangeKind::Modifier, 30, 3);
        second.group_id = Some(2);
        let ranges = EncodingRanges::new(vec![first, second], [0u8; INST_BYTES]);
        let word = ranges.encode(&EncodeParams::new(vec![], vec![3, 5])).unwrap();
        assert_eq!(get_bit_range(&word, 20, 22).unwrap(), 3);
        assert_eq!(get_bit_range(&word, 30, 33).unwrap(), 5);
    }

    #[test]
    fn flags_write_only_when_named() {
        let mut flag = EncodingRange::new(EncodingRangeKind::Flag, 33, 1);
        flag.name = Some("E".to_string());
        let ranges = EncodingRanges::new(vec![flag], [0u8; INST_BYTES]);
        let mut params = EncodeParams::new(vec![], vec![]);
        params.flags.insert("E".to_string());
        assert_eq!(get_bit_range(&ranges.encode(&params).unwrap(), 33, 34).unwrap(), 1);
        params.flags.clear();
        assert_eq!(get_bit_range(&ranges.encode(&params).unwrap(), 33, 34).unwrap(), 0);
    }

    #[test]
    fn scheduling_fields_come_from_params() {
        let ranges = EncodingRanges::new(
            vec![
                EncodingRange::new(EncodingRangeKind::StallCycles, 105, 4),
                EncodingRange::new(EncodingRangeKind::YieldFlag, 109, 1),
                EncodingRange::new(EncodingRangeKind::BarrierMask, 116, 6),
                EncodingRange::new(EncodingRangeKind::ReuseMask, 122, 4),
            ],
            [0u8; INST_BYTES],
        );
        let mut params = EncodeParams::new(vec![], vec![]);
        params.stall_cycles = 11;
        params.yield_flag = true;
        params.barrier_mask = 0x21;
        params.reuse_mask = 0x9;
        let word = ranges.encode(&params).unwrap();
        assert_eq!(get_bit_range(&word, 105, 109).unwrap(), 11);
        assert_eq!(get_bit_range(&word, 109, 110).unwrap(), 1);
        assert_eq!(get_bit_range(&word, 116, 122).unwrap(), 0x21);
        assert_eq!(get_bit_range(&word, 122, 126).unwrap(), 0x9);
    }

    #[test]
    fn range_json_uses_wire_names() {
        let mut rng = operand_range(16, 8, 2);
        rng.shift = Some(1);
        let json = serde_json::to_value(&rng).unwrap();
        assert_eq!(json["type"], "operand");
        assert_eq!(json["operand_index"], 2);
        assert_eq!(json["shift"], 1);
        let sched = EncodingRange::new(EncodingRangeKind::ReadBarrier, 110, 3);
        assert_eq!(serde_json::to_value(&sched).unwrap()["type"], "r-bar");
    }
}
