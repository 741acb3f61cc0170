//! Final instruction specifications and the modifier-value solver.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bits::InstWord;
use crate::enumerate::ModifierTable;
use crate::error::{OracleError, SolverError};
use crate::interactions::InteractionSummary;
use crate::multiset::TokenMultiset;
use crate::parser::{OperandKind, ParsedInstruction, RegClass};
use crate::ranges::{EncodeParams, EncodingRanges};

/// Canonical register assignment used for the live-range probe, per file:
/// distinct, non-zero values the analyzer can tell apart.
pub type RegisterAssignment = BTreeMap<String, Vec<(usize, u64)>>;

/// The complete inferred specification of one instruction.
///
/// Built once per seed key at the end of the pipeline, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionSpec {
    /// The distilled seed's disassembly.
    pub disasm: String,
    pub parsed: ParsedInstruction,
    pub ranges: EncodingRanges,
    /// One name table per `Modifier` group, in range order.
    pub modifiers: Vec<ModifierTable>,
    /// Name tables of per-operand selectors, by operand index.
    pub operand_modifiers: BTreeMap<usize, ModifierTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand_interactions: Option<InteractionSummary>,
    /// Seed modifiers no enumerated value explains: effectively part of the
    /// mnemonic.
    pub opcode_modis: Vec<String>,
    pub canonical_name: String,
}

impl InstructionSpec {
    pub fn new(
        disasm: String,
        parsed: ParsedInstruction,
        ranges: EncodingRanges,
        modifiers: Vec<ModifierTable>,
        operand_modifiers: BTreeMap<usize, ModifierTable>,
    ) -> Self {
        let mut enumerated: BTreeSet<&str> = BTreeSet::new();
        for table in &modifiers {
            for (_, name) in table {
                enumerated.extend(name.split('.').filter(|t| !t.is_empty()));
            }
        }
        let mut opcode_modis = Vec::new();
        for token in &parsed.modifiers {
            if !enumerated.contains(token.as_str()) && !opcode_modis.contains(token) {
                opcode_modis.push(token.clone());
            }
        }

        let canonical_name = std::iter::once(parsed.base_name.clone())
            .chain(opcode_modis.iter().cloned())
            .collect::<Vec<_>>()
            .join(".");

        Self {
            disasm,
            parsed,
            ranges,
            modifiers,
            operand_modifiers,
            operand_interactions: None,
            opcode_modis,
            canonical_name,
        }
    }

    /// All `(tokens, group, value)` candidates across every name table.
    fn candidates(&self) -> impl Iterator<Item = (Vec<&str>, usize, u64)> {
        self.modifiers.iter().enumerate().flat_map(|(group, table)| {
            table.iter().map(move |(value, name)| {
                let tokens: Vec<&str> = name.split('.').filter(|t| !t.is_empty()).collect();
                (tokens, group, *value)
            })
        })
    }

    /// Greedily pick per-group values whose names sum to `requested`,
    /// returning the values and whatever tokens resolved to flags.
    ///
    /// `None` when some requested token cannot be explained by any group or
    /// flag; the caller decides whether to retry with fewer modifiers.
    pub fn modifier_values(&self, requested: &[String]) -> Option<(Vec<u64>, BTreeSet<String>)> {
        let mut counts = TokenMultiset::from_tokens(requested);
        for token in &self.opcode_modis {
            counts.add(token, -1);
            if counts.count(token) < 0 {
                return None;
            }
        }
        counts.remove_zeros();

        let mut values = vec![0u64; self.modifiers.len()];
        let mut used_groups: BTreeSet<usize> = BTreeSet::new();
        loop {
            let mut best: Option<(usize, u64, Vec<&str>)> = None;
            let mut best_score = 0usize;
            for (tokens, group, value) in self.candidates() {
                if used_groups.contains(&group) {
                    continue;
                }
                let score = score_match(&counts, &tokens);
                if score > best_score {
                    best_score = score;
                    best = Some((group, value, tokens));
                }
            }
            let Some((group, value, tokens)) = best else { break };
            values[group] = value;
            used_groups.insert(group);
            for token in tokens {
                counts.add(token, -1);
            }
            counts.remove_zeros();
            if counts.is_empty() {
                break;
            }
        }

        let flag_names = self.ranges.flags();
        let mut used_flags = BTreeSet::new();
        let leftover: Vec<String> =
            counts.iter().map(|(token, _)| token.to_string()).collect();
        for token in leftover {
            if flag_names.contains(&token) {
                used_flags.insert(token.clone());
                counts.add(&token, -1);
            }
        }
        counts.remove_zeros();

        if !counts.is_empty() {
            warn!(requested = ?requested, unexplained = ?counts, "modifier solve failed");
            return None;
        }

        // Groups nobody asked for default to their empty-named value.
        for (group, table) in self.modifiers.iter().enumerate() {
            if used_groups.contains(&group) {
                continue;
            }
            if let Some((value, _)) = table.iter().find(|(_, name)| name.is_empty()) {
                values[group] = *value;
            }
        }

        Some((values, used_flags))
    }

    /// The least-perturbing valid modifier request: the opcode modifiers
    /// plus, for groups with no empty-named value, their first enumerated
    /// name.
    pub fn minimal_modifiers(&self) -> Vec<String> {
        let mut out = self.opcode_modis.clone();
        for table in &self.modifiers {
            if table.is_empty() {
                continue;
            }
            if table.iter().any(|(_, name)| name.is_empty()) {
                continue;
            }
            out.extend(table[0].1.split('.').filter(|t| !t.is_empty()).map(str::to_string));
        }
        out
    }

    /// Encode with operand values and a textual modifier request. `Ok(None)`
    /// when the request does not solve.
    pub fn encode(
        &self,
        operands: Vec<u64>,
        requested: &[String],
    ) -> Result<Option<InstWord>, SolverError> {
        let Some((values, flags)) = self.modifier_values(requested) else { return Ok(None) };
        let mut params = EncodeParams::new(operands, values);
        params.flags = flags;
        Ok(Some(self.ranges.encode(&params)?))
    }

    /// Encode with canonical register assignments for the live-range probe:
    /// GPRs at 16, 32, 48…; UGPRs at 4, 8, 12…; predicates and uniform
    /// predicates at 2, 4, 6… — unique and non-zero per file. `Ok(None)`
    /// when no valid modifier assignment encodes.
    pub fn canonical_register_encoding(
        &self,
    ) -> Result<Option<(RegisterAssignment, InstWord)>, SolverError> {
        let flat = self.parsed.flat_operands();
        let mut operand_values = vec![0u64; flat.len()];
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        let mut assignment: RegisterAssignment = BTreeMap::new();

        for (i, operand) in flat.iter().enumerate() {
            let OperandKind::Register { class, .. } = &operand.kind else { continue };
            let (file, value) = match class {
                RegClass::R => {
                    let n = counts.entry("GPR").or_insert(0);
                    *n += 1;
                    ("GPR", *n * 16)
                }
                RegClass::UR => {
                    let n = counts.entry("UGPR").or_insert(0);
                    *n += 1;
                    ("UGPR", *n * 4)
                }
                RegClass::P => {
                    let n = counts.entry("PRED").or_insert(0);
                    *n += 1;
                    ("PRED", *n * 2)
                }
                RegClass::UP => {
                    let n = counts.entry("UPRED").or_insert(0);
                    *n += 1;
                    ("UPRED", *n * 2)
                }
            };
            operand_values[i] = value;
            assignment.entry(file.to_string()).or_default().push((i, value));
        }

        let Some((values, flags)) = self.modifier_values(&self.minimal_modifiers()) else {
            return Ok(None);
        };
        let mut params = EncodeParams::new(operand_values, values);
        params.flags = flags;
        params.yield_flag = false;
        params.read_barrier = 0;
        params.write_barrier = 0;
        Ok(Some((assignment, self.ranges.encode(&params)?)))
    }
}

/// Score a candidate by how many requested tokens it consumes; zero when a
/// required token is missing or over-consumed.
fn score_match(counts: &TokenMultiset, tokens: &[&str]) -> usize {
    if tokens.is_empty() {
        return 0;
    }
    let mut scratch = counts.clone();
    for token in tokens {
        if !scratch.contains(token) {
            return 0;
        }
        scratch.add(token, -1);
        if scratch.count(token) < 0 {
            return 0;
        }
    }
    tokens.len()
}

/// All inferred instructions, keyed by instruction key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsaSpec {
    pub instructions: BTreeMap<String, InstructionSpec>,
}

impl IsaSpec {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, OracleError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents).map_err(|e| OracleError::Io(e.into()))
    }

    pub fn to_file(&self, path: &Path) -> Result<(), OracleError> {
        let json = self.to_json().map_err(|e| OracleError::Io(e.into()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Best spec for `target_key` whose opcode modifiers are consumable from
    /// `modifiers`, scored by tokens consumed.
    pub fn find_instruction(
        &self,
        target_key: &str,
        modifiers: &[String],
    ) -> Option<&InstructionSpec> {
        let requested = TokenMultiset::from_tokens(modifiers);

        let mut best: Option<&InstructionSpec> = None;
        let mut best_score = -1i64;
        for spec in self.instructions.values() {
            if spec.parsed.key() != target_key {
                continue;
            }
            let mut remaining = requested.clone();
            let mut matches = true;
            for token in &spec.opcode_modis {
                remaining.add(token, -1);
                if remaining.count(token) < 0 {
                    matches = false;
                    break;
                }
            }
            if !matches {
                continue;
            }
            let score = requested.total() - remaining.total();
            if score > best_score {
                best = Some(spec);
                best_score = score;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::{EncodingRange, EncodingRangeKind};

    fn spec_with_tables(seed_mods: &[&str], tables: Vec<ModifierTable>) -> InstructionSpec {
        let mut text = "FOO".to_string();
        if !seed_mods.is_empty() {
            text = format!("FOO.{}", seed_mods.join("."));
        }
        let parsed = ParsedInstruction::parse(&text).unwrap();
        let mut ranges = Vec::new();
        for (i, table) in tables.iter().enumerate() {
            let bits = table.len().next_power_of_two().trailing_zeros().max(1) as usize;
            let mut rng = EncodingRange::new(EncodingRangeKind::Modifier, 16 + 8 * i, bits);
            rng.group_id = Some(i + 1);
            ranges.push(rng);
        }
        InstructionSpec::new(
            text,
            parsed,
            EncodingRanges::new(ranges, [0u8; 16]),
            tables,
            BTreeMap::new(),
        )
    }

    fn table(rows: &[(u64, &str)]) -> ModifierTable {
        rows.iter().map(|(v, n)| (*v, n.to_string())).collect()
    }

    #[test]
    fn opcode_modis_are_unexplained_seed_tokens() {
        let spec = spec_with_tables(
            &["E", "SYS"],
            vec![table(&[(0, ""), (1, "SYS"), (2, "GPU"), (3, "CTA")])],
        );
        assert_eq!(spec.opcode_modis, vec!["E".to_string()]);
        assert_eq!(spec.canonical_name, "FOO.E");
    }

    #[test]
    fn solver_picks_matching_values() {
        let spec = spec_with_tables(
            &[],
            vec![
                table(&[(0, ""), (1, "RN"), (2, "RZ")]),
                table(&[(0, ""), (1, "SAT")]),
            ],
        );
        let (values, flags) = spec.modifier_values(&["SAT".to_string(), "RZ".to_string()]).unwrap();
        assert_eq!(values, vec![2, 1]);
        assert!(flags.is_empty());
    }

    #[test]
    fn solver_consumes_opcode_modis_first() {
        let spec = spec_with_tables(&["E"], vec![table(&[(0, ""), (1, "SYS")])]);
        let (values, _) = spec.modifier_values(&["E".to_string(), "SYS".to_string()]).unwrap();
        assert_eq!(values, vec![1]);
        assert!(spec.modifier_values(&["SYS".to_string(), "SYS".to_string()]).is_none());
    }

    #[test]
    fn solver_prefers_multi_token_names() {
        let spec = spec_with_tables(
            &[],
            vec![table(&[(0, ""), (1, "A"), (2, "B"), (3, "A.B")])],
        );
        let (values, _) = spec.modifier_values(&["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(values, vec![3]);
    }

    #[test]
    fn unexplained_tokens_fail_the_solve() {
        let spec = spec_with_tables(&[], vec![table(&[(0, ""), (1, "A")])]);
        assert!(spec.modifier_values(&["WAT".to_string()]).is_none());
    }

    #[test]
    fn minimal_modifiers_cover_gapless_groups() {
        let spec = spec_with_tables(
            &["E"],
            vec![
                table(&[(0, "RN"), (1, "RZ")]),
                table(&[(0, ""), (1, "SAT")]),
            ],
        );
        assert_eq!(spec.minimal_modifiers(), vec!["E".to_string(), "RN".to_string()]);
    }

    #[test]
    fn find_instruction_scores_by_consumed_tokens() {
        let plain = spec_with_tables(&[], vec![]);
        let wide = spec_with_tables(&["WIDE"], vec![]);
        let mut isa = IsaSpec::default();
        isa.instructions.insert("a".to_string(), plain);
        isa.instructions.insert("b".to_string(), wide);

        let hit = isa.find_instruction("FOO", &["WIDE".to_string()]).unwrap();
        assert_eq!(hit.opcode_modis, vec!["WIDE".to_string()]);
        let hit = isa.find_instruction("FOO", &[]).unwrap();
        assert!(hit.opcode_modis.is_empty());
        assert!(isa.find_instruction("BAR", &[]).is_none());
    }

    #[test]
    fn spec_json_round_trips() {
        let spec = spec_with_tables(&["E"], vec![table(&[(0, ""), (1, "SYS")])]);
        let json = serde_json::to_string(&spec).unwrap();
        let back: InstructionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.canonical_name, spec.canonical_name);
        assert_eq!(back.modifiers, spec.modifiers);
        assert_eq!(back.ranges, spec.ranges);
    }
}
