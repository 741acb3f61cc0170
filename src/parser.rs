//! Parser for one line of disassembled GPU assembly.
//!
//! The grammar is the textual surface of the target disassembler: an
//! optional `@P<n>`/`@!P<n>` predicate guard, a dot-separated opcode with
//! modifier suffix, then comma-separated operands. Operands form a tree:
//! addresses, constant-memory references, descriptors and attribute wrappers
//! carry sub-operands, and leaves carry their own `.modifier` tokens.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Register file tag carried by a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegClass {
    /// General-purpose register `R<n>`; `RZ` is the zero register.
    R,
    /// Uniform register `UR<n>`; `URZ` is the zero register.
    UR,
    /// Predicate `P<n>`; `PT` is the always-true predicate.
    P,
    /// Uniform predicate `UP<n>`; `UPT` is the always-true predicate.
    UP,
}

impl RegClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::R => "R",
            Self::UR => "UR",
            Self::P => "P",
            Self::UP => "UP",
        }
    }

    /// Index the zero/true register of this file decodes to.
    pub const fn null_index(self) -> u64 {
        match self {
            Self::R => 255,
            Self::UR => 63,
            Self::P | Self::UP => 7,
        }
    }
}

/// Operand payload. Composite variants keep their children in
/// [`Operand::sub_operands`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperandKind {
    Register {
        class: RegClass,
        index: u64,
        /// `!P<n>` source predicates.
        negated: bool,
    },
    IntImm {
        value: i64,
    },
    FloatImm {
        /// Kept textual; float immediates only ever need shape and equality.
        text: String,
    },
    /// `[a+b+...]` addressing.
    Address,
    /// `c[bank][offset]` constant memory; `extended` for the `cx` form.
    ConstMem {
        extended: bool,
    },
    /// `desc[..][..]`; `global` for the `gdesc` form.
    Descriptor {
        global: bool,
    },
    /// `a[..]` attribute wrapper.
    Attribute,
}

/// One node of the operand tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    #[serde(flatten)]
    pub kind: OperandKind,
    pub modifiers: Vec<String>,
    pub sub_operands: Vec<Operand>,
}

impl Operand {
    pub fn new(kind: OperandKind) -> Self {
        Self { kind, modifiers: Vec::new(), sub_operands: Vec::new() }
    }

    /// Numeric payload: register index or integer immediate value.
    pub fn value(&self) -> Option<i64> {
        match &self.kind {
            OperandKind::Register { index, .. } => Some(*index as i64),
            OperandKind::IntImm { value } => Some(*value),
            _ => None,
        }
    }

    pub fn is_register(&self, class: RegClass) -> bool {
        matches!(&self.kind, OperandKind::Register { class: c, .. } if *c == class)
    }

    pub fn is_int_imm(&self) -> bool {
        matches!(&self.kind, OperandKind::IntImm { .. })
    }

    /// Value comparison, ignoring attached modifiers.
    pub fn compare(&self, other: &Operand) -> bool {
        self.kind == other.kind
    }

    /// Stable shape signature: classes and nesting, never values.
    pub fn key(&self) -> String {
        match &self.kind {
            OperandKind::Register { class, .. } => class.as_str().to_string(),
            OperandKind::IntImm { .. } => "I".to_string(),
            OperandKind::FloatImm { .. } => "F".to_string(),
            OperandKind::Address => {
                let subs: Vec<String> = self.sub_operands.iter().map(Operand::key).collect();
                format!("[{}]", subs.join("+"))
            }
            OperandKind::ConstMem { extended } => {
                let prefix = if *extended { "cx" } else { "c" };
                let bank = self.sub_operands.first().map(Operand::key).unwrap_or_default();
                let offset = self.sub_operands.get(1).map(Operand::key).unwrap_or_default();
                format!("{}[{}]{}", prefix, bank, offset)
            }
            OperandKind::Descriptor { global } => {
                let prefix = if *global { "gdesc" } else { "desc" };
                let base = self.sub_operands.first().map(Operand::key).unwrap_or_default();
                let rest = self.sub_operands.get(1).map(Operand::key).unwrap_or_default();
                format!("{}[{}]{}", prefix, base, rest)
            }
            OperandKind::Attribute => {
                let sub = self.sub_operands.first().map(Operand::key).unwrap_or_default();
                format!("a{}", sub)
            }
        }
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Operand>) {
        if self.sub_operands.is_empty() {
            out.push(self);
        } else {
            for sub in &self.sub_operands {
                sub.collect_leaves(out);
            }
        }
    }
}

/// `@P<n>` / `@!P<n>` guard in front of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateGuard {
    pub index: u64,
    pub negated: bool,
}

/// A fully parsed instruction line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedInstruction {
    pub base_name: String,
    pub modifiers: Vec<String>,
    pub predicate: Option<PredicateGuard>,
    pub operands: Vec<Operand>,
}

impl ParsedInstruction {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut text = text.trim();
        if let Some(stripped) = text.strip_suffix(';') {
            text = stripped.trim_end();
        }
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut predicate = None;
        if text.starts_with('@') {
            let (guard, rest) = match text.split_once(char::is_whitespace) {
                Some(pair) => pair,
                None => return Err(ParseError::BadPredicate(text.to_string())),
            };
            predicate = Some(parse_predicate(guard)?);
            text = rest.trim_start();
        }

        let (opcode, rest) = match text.split_once(char::is_whitespace) {
            Some((opcode, rest)) => (opcode, rest.trim()),
            None => (text, ""),
        };
        let mut parts = opcode.split('.');
        let base_name = parts.next().unwrap_or_default().to_string();
        if base_name.is_empty() {
            return Err(ParseError::Empty);
        }
        let modifiers: Vec<String> =
            parts.filter(|part| !part.is_empty()).map(str::to_string).collect();

        let mut operands = Vec::new();
        if !rest.is_empty() {
            for token in split_top_level(rest, ',') {
                operands.push(parse_operand(token.trim())?);
            }
        }

        Ok(Self { base_name, modifiers, predicate, operands })
    }

    /// Leaf operands, left to right, in pre-order.
    pub fn flat_operands(&self) -> Vec<&Operand> {
        let mut out = Vec::new();
        for op in &self.operands {
            op.collect_leaves(&mut out);
        }
        out
    }

    /// Stable identifier of the instruction's shape: base name plus operand
    /// signatures. Register numbers, immediate values and modifiers do not
    /// participate.
    pub fn key(&self) -> String {
        if self.operands.is_empty() {
            return self.base_name.clone();
        }
        let keys: Vec<String> = self.operands.iter().map(Operand::key).collect();
        format!("{} {}", self.base_name, keys.join(", "))
    }
}

fn parse_predicate(token: &str) -> Result<PredicateGuard, ParseError> {
    let body = token.strip_prefix('@').unwrap_or(token);
    let (negated, body) = match body.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, body),
    };
    let index = match body.strip_prefix('P') {
        Some("T") => 7,
        Some(digits) => digits
            .parse::<u64>()
            .map_err(|_| ParseError::BadPredicate(token.to_string()))?,
        None => return Err(ParseError::BadPredicate(token.to_string())),
    };
    Ok(PredicateGuard { index, negated })
}

/// Split at `sep`, ignoring separators nested inside brackets.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out
}

/// Take a leading `[...]` group, returning the interior and the remainder.
fn take_bracketed(text: &str) -> Result<(&str, &str), ParseError> {
    debug_assert!(text.starts_with('['));
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&text[1..i], &text[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(ParseError::UnbalancedBrackets(text.to_string()))
}

/// Parse a trailing `.mod.mod` suffix into a modifier list; anything other
/// than dot-separated tokens is an error.
fn parse_trailing_modifiers(rest: &str, whole: &str) -> Result<Vec<String>, ParseError> {
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    match rest.strip_prefix('.') {
        Some(mods) => Ok(mods.split('.').filter(|m| !m.is_empty()).map(str::to_string).collect()),
        None => Err(ParseError::UnknownOperand(whole.to_string())),
    }
}

fn parse_operand(token: &str) -> Result<Operand, ParseError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ParseError::UnknownOperand(token.to_string()));
    }

    if token.starts_with('[') {
        return parse_address(token);
    }
    if token.starts_with("c[") || token.starts_with("cx[") {
        return parse_const_mem(token);
    }
    if token.starts_with("desc[") || token.starts_with("gdesc[") {
        return parse_descriptor(token);
    }
    if token.starts_with("a[") {
        let mut op = Operand::new(OperandKind::Attribute);
        let (address, rest) = parse_address_split(&token[1..])?;
        op.sub_operands.push(address);
        op.modifiers = parse_trailing_modifiers(rest, token)?;
        return Ok(op);
    }
    if let Some(reg) = parse_register(token) {
        return Ok(reg);
    }
    parse_immediate(token)
}

fn parse_address(token: &str) -> Result<Operand, ParseError> {
    let (address, rest) = parse_address_split(token)?;
    let mut address = address;
    address.modifiers = parse_trailing_modifiers(rest, token)?;
    Ok(address)
}

/// Parse a `[a+b+...]` group into an address node, returning trailing text.
fn parse_address_split(token: &str) -> Result<(Operand, &str), ParseError> {
    let (inner, rest) = take_bracketed(token)?;
    let mut op = Operand::new(OperandKind::Address);
    for part in split_top_level(inner, '+') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        op.sub_operands.push(parse_operand(part)?);
    }
    Ok((op, rest))
}

fn parse_const_mem(token: &str) -> Result<Operand, ParseError> {
    let extended = token.starts_with("cx[");
    let body = &token[if extended { 2 } else { 1 }..];
    let (bank_text, rest) = take_bracketed(body)?;
    let bank = parse_operand(bank_text.trim())?;
    if !rest.starts_with('[') {
        return Err(ParseError::UnknownOperand(token.to_string()));
    }
    let (offset, rest) = parse_address_split(rest)?;
    let mut op = Operand::new(OperandKind::ConstMem { extended });
    op.sub_operands.push(bank);
    op.sub_operands.push(offset);
    op.modifiers = parse_trailing_modifiers(rest, token)?;
    Ok(op)
}

fn parse_descriptor(token: &str) -> Result<Operand, ParseError> {
    let global = token.starts_with('g');
    let body = &token[if global { 5 } else { 4 }..];
    let (base_text, rest) = take_bracketed(body)?;
    let mut op = Operand::new(OperandKind::Descriptor { global });
    op.sub_operands.push(parse_operand(base_text.trim())?);
    let rest = if rest.starts_with('[') {
        let (address, rest) = parse_address_split(rest)?;
        op.sub_operands.push(address);
        rest
    } else {
        rest
    };
    op.modifiers = parse_trailing_modifiers(rest, token)?;
    Ok(op)
}

fn parse_register(token: &str) -> Option<Operand> {
    let (negated, body) = match token.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    // Longest prefixes first, so `URZ` never reads as `R`.
    for (prefix, class) in
        [("UR", RegClass::UR), ("UP", RegClass::UP), ("R", RegClass::R), ("P", RegClass::P)]
    {
        let Some(rest) = body.strip_prefix(prefix) else { continue };
        let mut parts = rest.split('.');
        let index_token = parts.next()?;
        let index = match (index_token, class) {
            ("Z", RegClass::R | RegClass::UR) => class.null_index(),
            ("T", RegClass::P | RegClass::UP) => class.null_index(),
            _ => index_token.parse::<u64>().ok()?,
        };
        let mut op = Operand::new(OperandKind::Register { class, index, negated });
        op.modifiers = parts.filter(|m| !m.is_empty()).map(str::to_string).collect();
        return Some(op);
    }
    None
}

fn parse_int(token: &str) -> Option<i64> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()? as i64
    } else if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
        body.parse::<i64>().ok()?
    } else {
        return None;
    };
    Some(if negative { -value } else { value })
}

fn parse_immediate(token: &str) -> Result<Operand, ParseError> {
    if let Some(value) = parse_int(token) {
        return Ok(Operand::new(OperandKind::IntImm { value }));
    }
    let looks_float = token.parse::<f64>().is_ok()
        || token.contains("INF")
        || token.contains("NAN")
        || token.contains("QNAN");
    if looks_float {
        return Ok(Operand::new(OperandKind::FloatImm { text: token.to_string() }));
    }
    if token.bytes().next().map_or(false, |b| b.is_ascii_digit() || b == b'-' || b == b'+') {
        return Err(ParseError::BadImmediate(token.to_string()));
    }
    Err(ParseError::UnknownOperand(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_instruction() {
        let inst = ParsedInstruction::parse("IADD3 R4, R0, R1, RZ ;").unwrap();
        assert_eq!(inst.base_name, "IADD3");
        assert!(inst.modifiers.is_empty());
        assert_eq!(inst.predicate, None);
        assert_eq!(inst.operands.len(), 4);
        assert_eq!(inst.operands[3].value(), Some(255));
        assert_eq!(inst.key(), "IADD3 R, R, R, R");
    }

    #[test]
    fn parses_predicate_guard_and_modifiers() {
        let inst = ParsedInstruction::parse("@!P1 LDG.E.SYS R0, [R2]").unwrap();
        assert_eq!(inst.predicate, Some(PredicateGuard { index: 1, negated: true }));
        assert_eq!(inst.modifiers, vec!["E".to_string(), "SYS".to_string()]);
        assert_eq!(inst.key(), "LDG R, [R]");
    }

    #[test]
    fn guard_pt_parses_as_seven() {
        let inst = ParsedInstruction::parse("@PT NOP").unwrap();
        assert_eq!(inst.predicate, Some(PredicateGuard { index: 7, negated: false }));
        assert_eq!(inst.key(), "NOP");
    }

    #[test]
    fn key_ignores_values_and_modifiers() {
        let a = ParsedInstruction::parse("LDG.E R0, [R2+0x10]").unwrap();
        let b = ParsedInstruction::parse("LDG R8, [R4+0x100]").unwrap();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn flat_operands_are_preorder_leaves() {
        let inst = ParsedInstruction::parse("LDG R0, [R2+UR4+0x10]").unwrap();
        let flat = inst.flat_operands();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0].value(), Some(0));
        assert_eq!(flat[1].value(), Some(2));
        assert_eq!(flat[2].value(), Some(4));
        assert_eq!(flat[3].value(), Some(0x10));
    }

    #[test]
    fn parses_constant_memory() {
        let inst = ParsedInstruction::parse("MOV R1, c[0x0][0x28]").unwrap();
        assert_eq!(inst.key(), "MOV R, c[I][I]");
        let flat = inst.flat_operands();
        assert_eq!(flat[1].value(), Some(0));
        assert_eq!(flat[2].value(), Some(0x28));
    }

    #[test]
    fn parses_descriptor_and_attribute() {
        let desc = ParsedInstruction::parse("LDG.E R0, desc[UR4][R2+0x0]").unwrap();
        assert_eq!(desc.key(), "LDG R, desc[UR][R+I]");
        let attr = ParsedInstruction::parse("ALD R0, a[0x88]").unwrap();
        assert_eq!(attr.key(), "ALD R, a[I]");
    }

    #[test]
    fn register_modifiers_stay_on_the_leaf() {
        let inst = ParsedInstruction::parse("LDG R0, [R2.X4+0x10]").unwrap();
        let flat = inst.flat_operands();
        assert_eq!(flat[1].modifiers, vec!["X4".to_string()]);
    }

    #[test]
    fn negated_source_predicate_differs_by_value() {
        let plain = ParsedInstruction::parse("SEL R0, R1, R2, P3").unwrap();
        let negated = ParsedInstruction::parse("SEL R0, R1, R2, !P3").unwrap();
        assert_eq!(plain.key(), negated.key());
        let a = plain.flat_operands();
        let b = negated.flat_operands();
        assert!(!a[3].compare(b[3]));
    }

    #[test]
    fn parses_float_and_negative_immediates() {
        let inst = ParsedInstruction::parse("FADD R0, R1, 0.5").unwrap();
        assert_eq!(inst.key(), "FADD R, R, F");
        let inst = ParsedInstruction::parse("IADD3 R0, R1, -0x8, RZ").unwrap();
        assert_eq!(inst.flat_operands()[2].value(), Some(-8));
        let inst = ParsedInstruction::parse("FMUL R0, R1, +INF").unwrap();
        assert_eq!(inst.key(), "FMUL R, R, F");
    }

    #[test]
    fn rejects_garbage() {
        assert!(ParsedInstruction::parse("").is_err());
        assert!(ParsedInstruction::parse("   ;").is_err());
        assert!(ParsedInstruction::parse("LDG R0, [R2").is_err());
        assert!(ParsedInstruction::parse("MOV R0, ~wat").is_err());
    }

    #[test]
    fn json_shape_survives_round_trip() {
        let inst = ParsedInstruction::parse("@P0 LDG.E R0, [R2.X4+0x10]").unwrap();
        let json = serde_json::to_string(&inst).unwrap();
        let back: ParsedInstruction = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }
}
