//! The disassembler oracle: probe plumbing, process wrapper and cache.
//!
//! The engine treats disassembly as a pure function of the instruction word.
//! [`Disassembler`] is the capability the analysis passes are handed; tests
//! inject a table-driven mock, production injects [`NvDisasm`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::bits::{get_bit, toggle_bit, word_from_hex, word_to_hex, InstWord};
use crate::error::{OracleError, SolverError};
use crate::parser::ParsedInstruction;
use crate::ranges::SCHEDULING_OFFSET;

/// One single-bit-flip probe and its disassembly.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub bit: usize,
    pub word: InstWord,
    pub text: String,
}

/// Capability object over the external disassembler.
///
/// `disassemble` returns the empty string when the disassembler refuses the
/// word; that refusal is evidence, not an error.
pub trait Disassembler: Send + Sync {
    fn disassemble(&self, word: &InstWord) -> Result<String, OracleError>;

    /// Index-aligned batch form; implementations may fan out in parallel but
    /// must preserve input order.
    fn disassemble_batch(&self, words: &[InstWord]) -> Result<Vec<String>, OracleError> {
        words.iter().map(|word| self.disassemble(word)).collect()
    }

    /// Canonicalize a seed: greedily clear every bit outside the scheduling
    /// region whose clearing preserves the instruction key.
    fn distill(&self, word: &InstWord) -> Result<InstWord, SolverError> {
        let base = self.disassemble(word)?;
        let base_key = match ParsedInstruction::parse(&base) {
            Ok(parsed) => parsed.key(),
            // An unparseable seed fails later, on the seed itself.
            Err(_) => return Ok(*word),
        };
        let mut out = *word;
        for bit in (0..SCHEDULING_OFFSET).rev() {
            if !get_bit(&out, bit)? {
                continue;
            }
            toggle_bit(&mut out, bit)?;
            let text = self.disassemble(&out)?;
            let keeps_key = ParsedInstruction::parse(&text)
                .map(|parsed| parsed.key() == base_key)
                .unwrap_or(false);
            if keeps_key {
                debug!(bit, "distill cleared bit");
            } else {
                toggle_bit(&mut out, bit)?;
            }
        }
        Ok(out)
    }

    /// Single-bit flips of bits `0..end_bit`, batch-disassembled.
    fn mutate(&self, word: &InstWord, end_bit: usize) -> Result<Vec<Mutation>, SolverError> {
        let mut words = Vec::with_capacity(end_bit);
        for bit in 0..end_bit {
            let mut flipped = *word;
            toggle_bit(&mut flipped, bit)?;
            words.push(flipped);
        }
        let texts = self.disassemble_batch(&words)?;
        Ok(words
            .into_iter()
            .zip(texts)
            .enumerate()
            .map(|(bit, (word, text))| Mutation { bit, word, text })
            .collect())
    }

    /// Seed discovery: one `(key, word)` per distinct instruction key this
    /// oracle already knows about. The default knows nothing.
    fn known_instructions(&self) -> Vec<(String, InstWord)> {
        Vec::new()
    }
}

/// Process-backed oracle invoking `nvdisasm` on raw 16-byte words, with a
/// persistent answer cache.
pub struct NvDisasm {
    arch: String,
    nvdisasm: PathBuf,
    cache: Mutex<HashMap<InstWord, String>>,
    scratch_counter: AtomicU64,
}

impl NvDisasm {
    pub fn new(arch: impl Into<String>, nvdisasm: impl Into<PathBuf>) -> Self {
        Self {
            arch: arch.into(),
            nvdisasm: nvdisasm.into(),
            cache: Mutex::new(HashMap::new()),
            scratch_counter: AtomicU64::new(0),
        }
    }

    /// Merge `path` into the cache. Returns the number of entries loaded.
    pub fn load_cache(&self, path: &Path) -> Result<usize, OracleError> {
        let contents = fs::read_to_string(path)?;
        let mut cache = self.cache.lock().unwrap();
        let mut loaded = 0usize;
        for line in contents.lines() {
            let (hex, text) = match line.split_once('\t') {
                Some(pair) => pair,
                None => (line, ""),
            };
            match word_from_hex(hex) {
                Some(word) => {
                    cache.insert(word, text.to_string());
                    loaded += 1;
                }
                None => warn!(line, "skipping malformed cache line"),
            }
        }
        info!(loaded, path = %path.display(), "loaded disassembly cache");
        Ok(loaded)
    }

    /// Persist the cache, sorted by word for stable files.
    pub fn dump_cache(&self, path: &Path) -> Result<(), OracleError> {
        let cache = self.cache.lock().unwrap();
        let mut lines: Vec<String> =
            cache.iter().map(|(word, text)| format!("{}\t{}", word_to_hex(word), text)).collect();
        lines.sort();
        fs::write(path, lines.join("\n"))?;
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    fn invoke(&self, word: &InstWord) -> Result<String, OracleError> {
        let scratch = std::env::temp_dir().join(format!(
            "sass-solver-{}-{}.bin",
            std::process::id(),
            self.scratch_counter.fetch_add(1, Ordering::Relaxed),
        ));
        fs::write(&scratch, word)?;
        let output = Command::new(&self.nvdisasm)
            .arg("--binary")
            .arg(&self.arch)
            .arg(&scratch)
            .output();
        let _ = fs::remove_file(&scratch);
        let output = output?;
        if !output.status.success() {
            // The disassembler refused the word.
            return Ok(String::new());
        }
        Ok(clean_disasm_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Disassembler for NvDisasm {
    fn disassemble(&self, word: &InstWord) -> Result<String, OracleError> {
        if let Some(text) = self.cache.lock().unwrap().get(word) {
            return Ok(text.clone());
        }
        let text = self.invoke(word)?;
        self.cache.lock().unwrap().insert(*word, text.clone());
        Ok(text)
    }

    fn disassemble_batch(&self, words: &[InstWord]) -> Result<Vec<String>, OracleError> {
        words.par_iter().map(|word| self.disassemble(word)).collect()
    }

    fn known_instructions(&self) -> Vec<(String, InstWord)> {
        let mut entries: Vec<(InstWord, String)> = {
            let cache = self.cache.lock().unwrap();
            cache.iter().map(|(word, text)| (*word, text.clone())).collect()
        };
        entries.sort();

        let mut uniques: BTreeMap<String, InstWord> = BTreeMap::new();
        for (word, text) in entries {
            let Ok(parsed) = ParsedInstruction::parse(&text) else { continue };
            uniques.entry(parsed.key()).or_insert(word);
        }
        uniques.into_iter().collect()
    }
}

/// Reduce nvdisasm's listing output to the bare instruction text: drop the
/// address column, the encoded-word comment and the trailing semicolon.
fn clean_disasm_output(raw: &str) -> String {
    for line in raw.lines() {
        let Some(pos) = line.find("*/") else { continue };
        let rest = &line[pos + 2..];
        let rest = rest.split("/*").next().unwrap_or(rest);
        let text = rest.trim().trim_end_matches(';').trim_end();
        if !text.is_empty() {
            return text.to_string();
        }
    }
    String::new()
}
