//! x86-64 register name table.

/// Operand width a register name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Qword,
}

/// A resolved register reference: its encoding index (0-15, before REX
/// extension splits into a 3-bit field + REX bit), width, and whether
/// referencing it at all *requires* a REX prefix even with no extended
/// bits set (true only for `%spl`/`%bpl`/`%sil`/`%dil`, which would
/// otherwise collide with the legacy `%ah`/`%ch`/`%dh`/`%bh` encodings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub index: u8,
    pub width: Width,
    pub rex_required: bool,
}

impl Reg {
    pub fn low3(&self) -> u8 {
        self.index & 0x7
    }

    pub fn needs_rex_bit(&self) -> bool {
        self.index >= 8
    }
}

const QWORD_NAMES: &[&str] = &[
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const BYTE_LOW_NAMES: &[&str] = &["al", "cl", "dl", "bl"];
const BYTE_REX_NAMES: &[&str] = &["spl", "bpl", "sil", "dil"];
const BYTE_EXT_NAMES: &[&str] = &[
    "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];

pub fn parse(name: &str) -> Option<Reg> {
    if let Some(index) = QWORD_NAMES.iter().position(|n| *n == name) {
        return Some(Reg {
            index: index as u8,
            width: Width::Qword,
            rex_required: false,
        });
    }
    if let Some(index) = BYTE_LOW_NAMES.iter().position(|n| *n == name) {
        return Some(Reg {
            index: index as u8,
            width: Width::Byte,
            rex_required: false,
        });
    }
    if let Some(index) = BYTE_REX_NAMES.iter().position(|n| *n == name) {
        return Some(Reg {
            index: (4 + index) as u8,
            width: Width::Byte,
            rex_required: true,
        });
    }
    if let Some(index) = BYTE_EXT_NAMES.iter().position(|n| *n == name) {
        return Some(Reg {
            index: (8 + index) as u8,
            width: Width::Byte,
            rex_required: true,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qword_and_byte_regs() {
        assert_eq!(
            parse("rax"),
            Some(Reg {
                index: 0,
                width: Width::Qword,
                rex_required: false
            })
        );
        assert_eq!(
            parse("dl"),
            Some(Reg {
                index: 2,
                width: Width::Byte,
                rex_required: false
            })
        );
        assert_eq!(parse("r12"), Some(Reg { index: 12, width: Width::Qword, rex_required: false }));
    }

    #[test]
    fn unknown_register_is_none() {
        assert_eq!(parse("zmm0"), None);
    }
}
