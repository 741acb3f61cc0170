//! HTML reports: per-opcode pages with bit tables and modifier tables.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use itertools::Itertools;

use crate::interactions::InteractionKind;
use crate::parser::{Operand, OperandKind, ParsedInstruction};
use crate::ranges::{EncodingRange, EncodingRangeKind, EncodingRanges};
use crate::spec::{InstructionSpec, IsaSpec};

const OPERAND_COLORS: [&str; 10] = [
    "#FE8386", "#F5B7DC", "#BF91F3", "#C9F3FF", "#FBDA73", "#72fc44", "#4e56fc", "#fc9b14",
    "#fc556e", "#256336",
];

const PAGE_HEADER: &str = r#"
<style>
    .instviz { border-collapse: collapse; margin: 10px 0; }
    .instviz td {
        border: 1px solid #777;
        padding: 3px 5px;
        font-family: monospace;
        text-align: center;
    }
    .instviz tr.smoll td { font-size: 8px; padding: 1px; border: none; color: #999; }
    .instviz td.vertical { writing-mode: vertical-rl; }
    .instruction-desc {
        font-weight: bold;
        padding: 5px;
        margin-top: 15px;
        margin-bottom: 15px;
    }
    .flat-operand-section {
        padding: 2px;
        margin: 2px;
        border-radius: 5px;
    }
</style>
"#;

/// Minimal `<table>` builder; every page piece below funnels through it.
struct TableBuilder {
    out: String,
}

impl TableBuilder {
    fn new() -> Self {
        Self { out: String::from("<table class=\"instviz\">") }
    }

    fn tbody_start(&mut self) {
        self.out.push_str("<tbody>");
    }

    fn tbody_end(&mut self) {
        self.out.push_str("</tbody>");
    }

    fn tr_start(&mut self, class: Option<&str>) {
        match class {
            Some(class) => self.out.push_str(&format!("<tr class=\"{}\">", class)),
            None => self.out.push_str("<tr>"),
        }
    }

    fn tr_end(&mut self) {
        self.out.push_str("</tr>");
    }

    fn push(&mut self, text: &str, colspan: usize, bg: Option<&str>, vertical: bool) {
        let mut cell = String::from("<td");
        if colspan != 1 {
            cell.push_str(&format!(" colspan=\"{}\"", colspan));
        }
        if vertical {
            cell.push_str(" class=\"vertical\"");
        }
        if let Some(bg) = bg {
            cell.push_str(&format!(" style=\"background-color:{}\"", bg));
        }
        cell.push('>');
        cell.push_str(text);
        cell.push_str("</td>");
        self.out.push_str(&cell);
    }

    fn finish(mut self) -> String {
        self.out.push_str("</table>");
        self.out
    }
}

fn operand_color(flat_index: usize) -> &'static str {
    OPERAND_COLORS[flat_index % OPERAND_COLORS.len()]
}

/// Colored operand signature next to the canonical name.
fn instruction_desc(parsed: &ParsedInstruction, full_name: &str) -> String {
    let mut out = String::from("<div class=\"instruction-desc\">");
    out.push_str(&format!("<span class=\"base-name\">{}</span>", full_name));
    out.push_str("<span class=\"operands\"> &nbsp; ");
    let mut flat_index = 0usize;
    for (i, operand) in parsed.operands.iter().enumerate() {
        if i != 0 {
            out.push(',');
        }
        out.push(' ');
        visit_operand(operand, &mut flat_index, &mut out);
    }
    out.push_str("</span></div>");
    out
}

fn leaf_section(label: &str, flat_index: &mut usize, out: &mut String) {
    out.push_str(&format!(
        "<span class='flat-operand-section' style='background-color:{}'>{}</span>",
        operand_color(*flat_index),
        label,
    ));
    *flat_index += 1;
}

fn visit_operand(operand: &Operand, flat_index: &mut usize, out: &mut String) {
    match &operand.kind {
        OperandKind::Register { class, .. } => leaf_section(class.as_str(), flat_index, out),
        OperandKind::IntImm { .. } => leaf_section("INT_IMM", flat_index, out),
        OperandKind::FloatImm { .. } => leaf_section("FIMM", flat_index, out),
        OperandKind::Address => {
            out.push('[');
            for (i, sub) in operand.sub_operands.iter().enumerate() {
                if i != 0 {
                    out.push('+');
                }
                visit_operand(sub, flat_index, out);
            }
            out.push(']');
        }
        OperandKind::ConstMem { extended } => {
            out.push_str(if *extended { "cx" } else { "c" });
            out.push('[');
            if let Some(bank) = operand.sub_operands.first() {
                visit_operand(bank, flat_index, out);
            }
            out.push(']');
            if let Some(offset) = operand.sub_operands.get(1) {
                visit_operand(offset, flat_index, out);
            }
        }
        OperandKind::Descriptor { global } => {
            out.push_str(if *global { "gdesc[" } else { "desc[" });
            if let Some(base) = operand.sub_operands.first() {
                visit_operand(base, flat_index, out);
            }
            out.push(']');
            if let Some(rest) = operand.sub_operands.get(1) {
                visit_operand(rest, flat_index, out);
            }
        }
        OperandKind::Attribute => {
            out.push('a');
            if let Some(sub) = operand.sub_operands.first() {
                visit_operand(sub, flat_index, out);
            }
        }
    }
}

fn bit_index_row(builder: &mut TableBuilder) {
    builder.tr_start(Some("smoll"));
    for i in 0..64 {
        builder.push(&(i % 8).to_string(), 1, None, false);
    }
    builder.tr_end();
}

fn range_label(range: &EncodingRange) -> String {
    if let Some(name) = &range.name {
        return name.clone();
    }
    match range.kind {
        EncodingRangeKind::Operand => {
            format!("operand {}", range.operand_index.unwrap_or_default())
        }
        EncodingRangeKind::Modifier | EncodingRangeKind::OperandModifier => match range.group_id {
            Some(group) => format!("modi {}", group),
            None => "modi".to_string(),
        },
        kind => kind.to_string(),
    }
}

/// Two-row bit table of the encoding; constants render as reversed binary,
/// one cell per bit, and ranges crossing bit 64 split over the rows.
fn bit_table(ranges: &EncodingRanges) -> String {
    let mut builder = TableBuilder::new();
    builder.tbody_start();
    bit_index_row(&mut builder);

    let mut current_length = 0usize;
    builder.tr_start(None);
    for range in &ranges.ranges {
        if current_length == 64 {
            builder.tr_end();
            bit_index_row(&mut builder);
            builder.tr_start(None);
        }

        let bg = range.operand_index.map(operand_color);
        let vertical = matches!(
            range.kind,
            EncodingRangeKind::Flag | EncodingRangeKind::OperandFlag
        );

        if range.kind == EncodingRangeKind::Constant {
            let bits = format!(
                "{:0width$b}",
                range.constant.unwrap_or_default(),
                width = range.length
            );
            for c in bits.chars().rev() {
                builder.push(&c.to_string(), 1, bg, vertical);
            }
            current_length += range.length;
            continue;
        }

        let label = range_label(range);
        let mut length = range.length;
        if current_length < 64 && current_length + length > 64 {
            let head = 64 - current_length;
            builder.push(&label, head, bg, vertical);
            builder.tr_end();
            bit_index_row(&mut builder);
            builder.tr_start(None);
            length -= head;
        }
        builder.push(&label, length, bg, vertical);
        current_length += range.length;
    }
    builder.tr_end();
    builder.tbody_end();
    builder.finish()
}

fn modifier_table(title: &str, rows: &[(u64, String)], length: usize) -> String {
    let mut out = format!("<p>{}", title);
    let mut builder = TableBuilder::new();
    builder.tbody_start();
    for (value, name) in rows {
        builder.tr_start(None);
        builder.push(&format!("{:0width$b}", value, width = length), 1, None, false);
        builder.push(name, 1, None, false);
        builder.tr_end();
    }
    builder.tbody_end();
    out.push_str(&builder.finish());
    out.push_str("</p>");
    out
}

fn interaction_name(kind: InteractionKind) -> &'static str {
    match kind {
        InteractionKind::Read => "READ",
        InteractionKind::Write => "WRITE",
        InteractionKind::ReadWrite => "READ_WRITE",
        InteractionKind::Used => "USED",
    }
}

/// The full report section for one instruction.
pub fn instruction_html(spec: &InstructionSpec) -> String {
    let mut out = instruction_desc(&spec.parsed, &spec.canonical_name);

    if let Some(interactions) = &spec.operand_interactions {
        let mut records: Vec<(usize, InteractionKind, usize)> =
            interactions.values().flatten().copied().collect();
        records.sort_by_key(|(operand, _, _)| *operand);
        for (operand, kind, slots) in records {
            out.push_str(&format!(
                "<span class=\"flat-operand-section\" style=\"background-color:{}\">{} ({} slots)</span>",
                operand_color(operand),
                interaction_name(kind),
                slots,
            ));
        }
    }

    out.push_str(&format!("<p> distilled: {}</p>", spec.disasm));
    out.push_str(&format!("<p> key: {}</p>", spec.parsed.key()));
    out.push_str(&bit_table(&spec.ranges));

    let modifier_ranges = spec.ranges.find(EncodingRangeKind::Modifier);
    for (i, rows) in spec.modifiers.iter().enumerate() {
        let length = modifier_ranges.get(i).map(|r| r.length).unwrap_or(1);
        out.push_str(&modifier_table(&format!("Modifier Group {}", i + 1), rows, length));
    }

    let operand_modifier_ranges: BTreeMap<usize, &EncodingRange> = spec
        .ranges
        .find(EncodingRangeKind::OperandModifier)
        .into_iter()
        .filter_map(|r| r.operand_index.map(|idx| (idx, r)))
        .collect();
    for (operand, rows) in &spec.operand_modifiers {
        let length = operand_modifier_ranges.get(operand).map(|r| r.length).unwrap_or(1);
        out.push_str(&modifier_table(
            &format!("Operand {} operand modifiers", operand),
            rows,
            length,
        ));
    }
    out
}

/// Write per-opcode pages and the index into `dir`.
pub fn write_reports(dir: &Path, isa: &IsaSpec, arch: &str) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut by_base: BTreeMap<&str, Vec<&InstructionSpec>> = BTreeMap::new();
    for spec in isa.instructions.values() {
        by_base.entry(spec.parsed.base_name.as_str()).or_default().push(spec);
    }

    for (base, specs) in &by_base {
        let mut page = String::from(PAGE_HEADER);
        for spec in specs {
            page.push_str(&instruction_html(spec));
        }
        fs::write(dir.join(format!("{}.html", base)), page)?;
    }

    let index = format!(
        "<h1> {} Instruction Set Architecture</h1>\n{}",
        arch,
        by_base
            .keys()
            .map(|base| format!("<a href=\"{base}.html\">{base}</a><br>", base = base))
            .join("\n"),
    );
    fs::write(dir.join("index.html"), index)?;
    Ok(())
}
