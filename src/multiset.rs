//! Token multisets for diffing modifier lists.
//!
//! Modifier comparison everywhere in the solver is multiset arithmetic:
//! duplicates are significant, and a token that disappears under a mutation
//! is as much a signal as one that appears. Entries keep insertion order so
//! that dot-joined names come out in the order the disassembler printed them.

/// A counted multiset of modifier tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMultiset {
    entries: Vec<(String, i64)>,
}

impl TokenMultiset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for token in tokens {
            set.add(token.as_ref(), 1);
        }
        set
    }

    /// Count for `token`; zero when absent.
    pub fn count(&self, token: &str) -> i64 {
        self.entries
            .iter()
            .find(|(name, _)| name == token)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == token)
    }

    /// Adjust the count for `token`, creating the entry (at the back) when
    /// missing. Entries are kept even at zero until [`remove_zeros`] runs.
    ///
    /// [`remove_zeros`]: TokenMultiset::remove_zeros
    pub fn add(&mut self, token: &str, delta: i64) {
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| name == token) {
            entry.1 += delta;
        } else {
            self.entries.push((token.to_string(), delta));
        }
    }

    /// Subtract another multiset, entry by entry.
    pub fn subtract(&mut self, other: &TokenMultiset) {
        for (token, count) in &other.entries {
            self.add(token, -count);
        }
    }

    /// Drop all zero-count entries.
    pub fn remove_zeros(&mut self) {
        self.entries.retain(|(_, count)| *count != 0);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all counts, negatives included.
    pub fn total(&self) -> i64 {
        self.entries.iter().map(|(_, count)| count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(name, count)| (name.as_str(), *count))
    }

    /// `mutated - original`, in insertion order of `mutated` (tokens present
    /// only in `original` trail with negative counts).
    pub fn difference(original: &[String], mutated: &[String]) -> TokenMultiset {
        let mut diff = TokenMultiset::from_tokens(mutated);
        diff.subtract(&TokenMultiset::from_tokens(original));
        diff
    }

    /// Expand positive-count entries, each repeated by its count.
    pub fn positive_tokens(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (token, count) in &self.entries {
            if token.is_empty() {
                continue;
            }
            for _ in 0..*count {
                out.push(token.clone());
            }
        }
        out
    }
}

/// Tokens of `mutated` beyond `original`, expanded.
pub fn added_tokens(original: &[String], mutated: &[String]) -> Vec<String> {
    TokenMultiset::difference(original, mutated).positive_tokens()
}

/// Tokens of `mutated` beyond a precomputed `basis`, expanded.
pub fn added_tokens_over(basis: &TokenMultiset, mutated: &[String]) -> Vec<String> {
    let mut diff = TokenMultiset::from_tokens(mutated);
    diff.subtract(basis);
    diff.positive_tokens()
}

/// Dot-join a token list; empty input yields the empty name.
pub fn join_tokens(tokens: &[String]) -> String {
    tokens.join(".")
}

/// Outcome of comparing a probe's modifier list against the seed's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierDelta {
    /// Any modifier field was affected by the mutation.
    pub effected: bool,
    /// The single added token, when the bit behaves like a flag. Can be a
    /// false positive; the disambiguation pass corrects those.
    pub flag_candidate: Option<String>,
}

/// Classify a modifier-list mutation per the flag-candidate contract: a
/// candidate exists iff exactly one token gained a single count and none
/// were lost.
pub fn analyse_modifiers(original: &[String], mutated: &[String]) -> ModifierDelta {
    let diff = TokenMultiset::difference(original, mutated);

    let mut flag_candidate = None;
    let mut not_flag = false;
    let mut effected = false;
    for (name, count) in diff.iter() {
        if count == 0 {
            continue;
        }
        effected = true;
        if count <= 0 {
            not_flag = true;
            flag_candidate = None;
            continue;
        }
        if count == 1 && !not_flag {
            if flag_candidate.is_none() {
                flag_candidate = Some(name.to_string());
            } else {
                flag_candidate = None;
                not_flag = true;
            }
        }
    }

    ModifierDelta { effected, flag_candidate }
}
