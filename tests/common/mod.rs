//! Table-driven mock oracle: a small synthetic ISA with known encodings.
//!
//! Each instruction declares its defined field spans and a render function;
//! any probe setting a bit outside the defined spans is refused, the way a
//! real disassembler rejects illegal encodings. Scheduling bits are ignored.

use sass_solver::bits::{get_bit_range, set_bit_range, toggle_bit, InstWord};
use sass_solver::error::OracleError;
use sass_solver::oracle::Disassembler;
use sass_solver::parser::ParsedInstruction;

const OPCODE_BITS: usize = 12;
const SCHEDULING_START: usize = 104;

type Render = fn(&InstWord) -> String;

struct SynthInst {
    opcode: u64,
    /// Defined `(lo, len)` spans beyond the opcode; everything else refuses.
    fields: &'static [(usize, usize)],
    /// Bits set in the canonical seed besides the opcode.
    seed_bits: &'static [usize],
    render: Render,
}

fn fld(word: &InstWord, lo: usize, len: usize) -> u64 {
    get_bit_range(word, lo, lo + len).unwrap()
}

fn r(n: u64) -> String {
    if n == 255 {
        "RZ".to_string()
    } else {
        format!("R{}", n)
    }
}

fn ur(n: u64) -> String {
    if n == 63 {
        "URZ".to_string()
    } else {
        format!("UR{}", n)
    }
}

fn p(n: u64) -> String {
    if n == 7 {
        "PT".to_string()
    } else {
        format!("P{}", n)
    }
}

fn render_iadd3(w: &InstWord) -> String {
    const MODS: [&str; 4] = ["", ".X", ".XL", ".XH"];
    format!(
        "IADD3{} {}, {}, {}, {}",
        MODS[fld(w, 50, 2) as usize],
        r(fld(w, 16, 8)),
        r(fld(w, 24, 8)),
        r(fld(w, 32, 8)),
        r(fld(w, 40, 8)),
    )
}

fn render_mov(w: &InstWord) -> String {
    format!("MOV {}, 0x{:x}", r(fld(w, 16, 8)), fld(w, 40, 32))
}

fn render_ldg(w: &InstWord) -> String {
    const ADDR_MODS: [&str; 4] = ["", ".X4", ".X8", ".X16"];
    let e = if fld(w, 33, 1) == 1 { ".E" } else { "" };
    format!(
        "LDG{} {}, [{}{}]",
        e,
        r(fld(w, 16, 8)),
        r(fld(w, 24, 8)),
        ADDR_MODS[fld(w, 34, 2) as usize],
    )
}

fn render_nop(w: &InstWord) -> String {
    let guard = fld(w, 12, 3);
    if guard == 7 {
        "@PT NOP".to_string()
    } else {
        format!("@P{} NOP", guard)
    }
}

fn render_fadd(w: &InstWord) -> String {
    const HALF: [&str; 4] = ["", ".H", ".HH", ".HHH"];
    let half = fld(w, 40, 2);
    let round = match fld(w, 46, 2) {
        0 => "",
        1 => ".RN",
        2 => ".RZ",
        _ if half == 1 => ".RP",
        _ => ".INVALIDB",
    };
    format!(
        "FADD{}{} {}, {}",
        HALF[half as usize],
        round,
        r(fld(w, 16, 8)),
        r(fld(w, 24, 8)),
    )
}

fn render_imad(w: &InstWord) -> String {
    let imm = fld(w, 32, 8) | (fld(w, 48, 16) << 8);
    format!("IMAD {}, {}, 0x{:x}", r(fld(w, 16, 8)), r(fld(w, 24, 8)), imm)
}

fn render_cross(w: &InstWord) -> String {
    const MODS: [&str; 8] = ["", ".M1", ".M2", ".M3", ".M4", ".M5", ".M6", ".M7"];
    format!("CROSS{} {}", MODS[fld(w, 62, 3) as usize], r(fld(w, 16, 8)))
}

fn render_splt(w: &InstWord) -> String {
    const LO: [&str; 4] = ["", ".A1", ".A2", ".A3"];
    const HI: [&str; 4] = ["", ".B1", ".B2", ".B3"];
    format!(
        "SPLT{}{} {}",
        LO[fld(w, 44, 2) as usize],
        HI[fld(w, 46, 2) as usize],
        r(fld(w, 16, 8)),
    )
}

fn render_isetp(w: &InstWord) -> String {
    let index = !fld(w, 17, 3) & 7;
    format!("ISETP {}, {}", p(index), r(fld(w, 24, 8)))
}

fn render_shf(w: &InstWord) -> String {
    format!("SHF {}, 0x{:x}", r(fld(w, 16, 8)), fld(w, 80, 8) << 2)
}

fn render_atom(w: &InstWord) -> String {
    format!("ATOM {}, 0x{:x}", r(fld(w, 16, 8)), (fld(w, 88, 8) << 2) + 8)
}

fn render_stg(w: &InstWord) -> String {
    // The address register always carries a width selector; the zero value
    // is a real name, not the empty selector.
    const WIDTHS: [&str; 4] = [".U8", ".U16", ".U32", ".U64"];
    format!(
        "STG [{}{}], {}",
        r(fld(w, 16, 8)),
        WIDTHS[fld(w, 34, 2) as usize],
        r(fld(w, 24, 8)),
    )
}

fn render_uldc(w: &InstWord) -> String {
    let imm = fld(w, 76, 12);
    let base = ur(fld(w, 24, 6));
    let addr =
        if imm == 0 { format!("[{}]", base) } else { format!("[{}+0x{:x}]", base, imm) };
    format!("ULDC {}, {}", ur(fld(w, 16, 6)), addr)
}

const INSTRUCTIONS: &[SynthInst] = &[
    SynthInst {
        opcode: 0x210,
        fields: &[(16, 8), (24, 8), (32, 8), (40, 8), (50, 2)],
        seed_bits: &[],
        render: render_iadd3,
    },
    SynthInst { opcode: 0x202, fields: &[(16, 8), (40, 32)], seed_bits: &[], render: render_mov },
    SynthInst {
        opcode: 0x381,
        fields: &[(16, 8), (24, 8), (33, 1), (34, 2)],
        seed_bits: &[],
        render: render_ldg,
    },
    SynthInst { opcode: 0x118, fields: &[(12, 3)], seed_bits: &[], render: render_nop },
    SynthInst {
        opcode: 0x259,
        fields: &[(16, 8), (24, 8), (40, 2), (46, 2)],
        seed_bits: &[],
        render: render_fadd,
    },
    SynthInst {
        opcode: 0x224,
        fields: &[(16, 8), (24, 8), (32, 8), (48, 16)],
        seed_bits: &[],
        render: render_imad,
    },
    SynthInst { opcode: 0x3c1, fields: &[(16, 8), (62, 3)], seed_bits: &[], render: render_cross },
    SynthInst { opcode: 0x155, fields: &[(16, 8), (44, 4)], seed_bits: &[], render: render_splt },
    SynthInst { opcode: 0x20c, fields: &[(17, 3), (24, 8)], seed_bits: &[], render: render_isetp },
    // The low two bits of the SHF/ATOM immediates exist in the word but are
    // implicit in the decoded value.
    SynthInst { opcode: 0x19f, fields: &[(16, 8), (78, 10)], seed_bits: &[], render: render_shf },
    SynthInst { opcode: 0x2a2, fields: &[(16, 8), (86, 10)], seed_bits: &[], render: render_atom },
    SynthInst {
        opcode: 0x30b,
        fields: &[(16, 6), (24, 6), (76, 12)],
        seed_bits: &[76],
        render: render_uldc,
    },
    SynthInst {
        opcode: 0x386,
        fields: &[(16, 8), (24, 8), (34, 2)],
        seed_bits: &[],
        render: render_stg,
    },
];

/// Mock [`Disassembler`] decoding by table lookup.
pub struct TableDisassembler;

impl TableDisassembler {
    pub fn new() -> Self {
        Self
    }

    /// The canonical seed word of an instruction, by base name.
    pub fn seed_for(&self, name: &str) -> InstWord {
        for inst in INSTRUCTIONS {
            let seed = seed_word(inst);
            let parsed = ParsedInstruction::parse(&(inst.render)(&seed)).unwrap();
            if parsed.base_name == name {
                return seed;
            }
        }
        panic!("no synthetic instruction named {}", name);
    }

    fn decode(&self, word: &InstWord) -> String {
        let opcode = get_bit_range(word, 0, OPCODE_BITS).unwrap();
        let Some(inst) = INSTRUCTIONS.iter().find(|i| i.opcode == opcode) else {
            return String::new();
        };
        for bit in OPCODE_BITS..SCHEDULING_START {
            let defined = inst
                .fields
                .iter()
                .any(|&(lo, len)| bit >= lo && bit < lo + len);
            if !defined && get_bit_range(word, bit, bit + 1).unwrap() == 1 {
                // Illegal encoding.
                return String::new();
            }
        }
        (inst.render)(word)
    }
}

fn seed_word(inst: &SynthInst) -> InstWord {
    let mut word = [0u8; 16];
    set_bit_range(&mut word, 0, OPCODE_BITS, inst.opcode).unwrap();
    for &bit in inst.seed_bits {
        toggle_bit(&mut word, bit).unwrap();
    }
    word
}

impl Disassembler for TableDisassembler {
    fn disassemble(&self, word: &InstWord) -> Result<String, OracleError> {
        Ok(self.decode(word))
    }

    fn known_instructions(&self) -> Vec<(String, InstWord)> {
        INSTRUCTIONS
            .iter()
            .map(|inst| {
                let seed = seed_word(inst);
                let key = ParsedInstruction::parse(&(inst.render)(&seed)).unwrap().key();
                (key, seed)
            })
            .collect()
    }
}
