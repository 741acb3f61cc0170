//! Operand interaction analysis through the external live-range tool.
//!
//! The solver encodes the instruction with canonical, mutually distinct
//! register assignments, hands the word to the live-range collaborator, and
//! maps the per-register-file interaction spans it reports back onto operand
//! indices.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bits::InstWord;
use crate::error::OracleError;
use crate::spec::InstructionSpec;

/// How an instruction touches a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractionKind {
    #[serde(rename = "READ")]
    Read,
    #[serde(rename = "WRITE")]
    Write,
    #[serde(rename = "READWRITE")]
    ReadWrite,
    /// Alive but neither read nor written; dropped from summaries.
    #[serde(rename = "USED")]
    Used,
}

/// Spans reported per register file: `(start register, kind, slot count)`.
pub type FileInteractions = Vec<(u64, InteractionKind, usize)>;

/// Raw collaborator output, keyed by register file name
/// (`GPR`/`UGPR`/`PRED`/`UPRED`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveRangeReport {
    pub files: BTreeMap<String, FileInteractions>,
}

/// Interaction records mapped onto operand indices, keyed by register file.
pub type InteractionSummary = BTreeMap<String, Vec<(usize, InteractionKind, usize)>>;

/// External live-range collaborator.
pub trait LiveRangeOracle: Send + Sync {
    fn analyse(&self, word: &InstWord, arch_code: u32) -> Result<LiveRangeReport, OracleError>;
}

/// Run the live-range probe for `spec` and fold the report back onto operand
/// indices. `None` when the probe cannot be encoded or the collaborator
/// fails; interaction data is best-effort and never fails a seed.
pub fn operand_interactions(
    spec: &InstructionSpec,
    oracle: &dyn LiveRangeOracle,
    arch_code: u32,
) -> Option<InteractionSummary> {
    let (assignment, word) = match spec.canonical_register_encoding() {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            warn!(name = %spec.canonical_name, "no encodable modifier set for live-range probe");
            return None;
        }
        Err(error) => {
            warn!(name = %spec.canonical_name, %error, "live-range probe encoding failed");
            return None;
        }
    };
    let report = match oracle.analyse(&word, arch_code) {
        Ok(report) => report,
        Err(error) => {
            warn!(name = %spec.canonical_name, %error, "live-range analysis failed");
            return None;
        }
    };

    let mut summary = InteractionSummary::new();
    for (file, spans) in report.files {
        let Some(assigned) = assignment.get(&file) else { continue };
        let register_to_operand: HashMap<u64, usize> =
            assigned.iter().map(|(operand, register)| (*register, *operand)).collect();
        let records = summary.entry(file).or_default();
        for (start, kind, slots) in spans {
            if kind == InteractionKind::Used {
                continue;
            }
            if let Some(&operand) = register_to_operand.get(&start) {
                records.push((operand, kind, slots));
            }
        }
    }
    Some(summary)
}

/// Process adapter running `nvdisasm --print-life-ranges` and reading its
/// columnar report: a header row of register names, then marker rows
/// (`^` read, `v` write, `x` read+write, `:` alive) aligned under them.
pub struct NvdisasmLifeRanges {
    arch: String,
    nvdisasm: PathBuf,
    scratch_counter: AtomicU64,
}

impl NvdisasmLifeRanges {
    pub fn new(arch: impl Into<String>, nvdisasm: impl Into<PathBuf>) -> Self {
        Self { arch: arch.into(), nvdisasm: nvdisasm.into(), scratch_counter: AtomicU64::new(0) }
    }
}

impl LiveRangeOracle for NvdisasmLifeRanges {
    fn analyse(&self, word: &InstWord, _arch_code: u32) -> Result<LiveRangeReport, OracleError> {
        let scratch = std::env::temp_dir().join(format!(
            "sass-solver-lr-{}-{}.bin",
            std::process::id(),
            self.scratch_counter.fetch_add(1, Ordering::Relaxed),
        ));
        fs::write(&scratch, word)?;
        let output = Command::new(&self.nvdisasm)
            .arg("--binary")
            .arg(&self.arch)
            .arg("--print-life-ranges")
            .arg(&scratch)
            .output();
        let _ = fs::remove_file(&scratch);
        let output = output?;
        if !output.status.success() {
            return Ok(LiveRangeReport::default());
        }
        Ok(parse_life_ranges(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn register_file(token: &str) -> Option<(&'static str, u64)> {
    for (prefix, file) in [("UR", "UGPR"), ("UP", "UPRED"), ("R", "GPR"), ("P", "PRED")] {
        if let Some(rest) = token.strip_prefix(prefix) {
            if let Ok(index) = rest.parse::<u64>() {
                return Some((file, index));
            }
        }
    }
    None
}

fn parse_life_ranges(raw: &str) -> LiveRangeReport {
    // (file, register index, column) from the most recent header row.
    let mut columns: Vec<(&'static str, u64, usize)> = Vec::new();
    // (file, register) -> (read, write, alive)
    let mut marks: BTreeMap<(&'static str, u64), (bool, bool, bool)> = BTreeMap::new();

    for line in raw.lines() {
        if line.contains("/*") {
            let chars: Vec<char> = line.chars().collect();
            for &(file, register, column) in &columns {
                let mark = chars.get(column).copied().unwrap_or(' ');
                let entry = marks.entry((file, register)).or_default();
                match mark {
                    '^' => entry.0 = true,
                    'v' => entry.1 = true,
                    'x' => {
                        entry.0 = true;
                        entry.1 = true;
                    }
                    ':' => entry.2 = true,
                    _ => {}
                }
            }
            continue;
        }

        // Anything else may be a header row naming register columns.
        let mut header = Vec::new();
        let mut token_start = None;
        for (i, c) in line.char_indices().chain([(line.len(), ' ')]) {
            if c.is_ascii_alphanumeric() {
                token_start.get_or_insert(i);
                continue;
            }
            if let Some(start) = token_start.take() {
                if let Some((file, register)) = register_file(&line[start..i]) {
                    header.push((file, register, start));
                }
            }
        }
        if !header.is_empty() {
            columns = header;
        }
    }

    // Fold marks into per-file spans, grouping consecutive registers of the
    // same kind into one record with a slot count.
    let mut report = LiveRangeReport::default();
    let mut classified: BTreeMap<&'static str, Vec<(u64, InteractionKind)>> = BTreeMap::new();
    for ((file, register), (read, write, alive)) in marks {
        let kind = match (read, write) {
            (true, true) => InteractionKind::ReadWrite,
            (true, false) => InteractionKind::Read,
            (false, true) => InteractionKind::Write,
            (false, false) if alive => InteractionKind::Used,
            (false, false) => continue,
        };
        classified.entry(file).or_default().push((register, kind));
    }
    for (file, entries) in classified {
        let spans: &mut FileInteractions = report.files.entry(file.to_string()).or_default();
        for (register, kind) in entries {
            match spans.last_mut() {
                Some((start, last_kind, slots))
                    if *last_kind == kind && *start + *slots as u64 == register =>
                {
                    *slots += 1;
                }
                _ => spans.push((register, kind, 1)),
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_marker_columns() {
        let raw = "\
//                                R16 R17  P2\n\
/*0000*/ FOO R16, P2, [R17] ;  // v   ^    ^\n";
        let report = parse_life_ranges(raw);
        assert_eq!(
            report.files["GPR"],
            vec![(16, InteractionKind::Write, 1), (17, InteractionKind::Read, 1)]
        );
        assert_eq!(report.files["PRED"], vec![(2, InteractionKind::Read, 1)]);
    }

    #[test]
    fn consecutive_registers_fold_into_slots() {
        let raw = "\
//                     R16 R17\n\
/*0000*/ BAR ;      // v   v\n";
        let report = parse_life_ranges(raw);
        assert_eq!(report.files["GPR"], vec![(16, InteractionKind::Write, 2)]);
    }

    #[test]
    fn alive_only_registers_are_used() {
        let raw = "\
//                 R4\n\
/*0000*/ BAZ ;  // :\n";
        let report = parse_life_ranges(raw);
        assert_eq!(report.files["GPR"], vec![(4, InteractionKind::Used, 1)]);
    }
}
