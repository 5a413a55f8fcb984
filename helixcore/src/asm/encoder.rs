//! x86-64 instruction encoder. Covers exactly the mnemonic and
//! addressing-mode surface the C front end's codegen and `printf` runtime
//! emit, plus the hand-written assembly scenarios exercised in the
//! integration tests: `mov`/`movb`/`movzbq`, `lea`, `add`, `sub`, `imul`,
//! `div`, `idiv`, `cqo`, `push`, `pop`, `neg`, `inc`, `dec`, `xor`, `test`,
//! `cmp`, `setcc` (`e`, `ne`, `l`, `le`, `g`, `ge`), `jmp`, `jcc` (`e`, `ne`,
//! `z`, `ns`), `call`, `ret`, `syscall`.

use super::ast::{Mem, Operand};
use super::registers::{Reg, Width};
use crate::error::{Error, Result};

/// One instruction's machine code plus any relocations it needs, expressed
/// as offsets relative to the start of `bytes` (the caller rebases them to
/// the section once it knows where this instruction landed).
pub struct Encoded {
    pub bytes: Vec<u8>,
    /// (offset_in_bytes, size, pc_relative, symbol, addend)
    pub relocs: Vec<(usize, u8, bool, String, i64)>,
}

impl Encoded {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            relocs: Vec::new(),
        }
    }
}

struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
    force: bool,
}

impl Rex {
    fn byte(&self) -> Option<u8> {
        if !(self.w || self.r || self.x || self.b || self.force) {
            return None;
        }
        Some(
            0x40 | ((self.w as u8) << 3)
                | ((self.r as u8) << 2)
                | ((self.x as u8) << 1)
                | (self.b as u8),
        )
    }
}

/// ModRM + SIB + displacement bytes for a register/memory operand, plus any
/// relocation the displacement field needs (RIP-relative symbols).
struct ModRmEncoding {
    modrm: u8,
    extra: Vec<u8>,
    rex_x: bool,
    rex_b: bool,
    reloc: Option<(usize, u8, bool, String, i64)>,
}

fn encode_mem(reg_field: u8, mem: &Mem) -> ModRmEncoding {
    if let Some(sym) = &mem.rip_symbol {
        let modrm = (0b00 << 6) | (reg_field << 3) | 0b101;
        // Relocation offset is relative to the start of this instruction's
        // byte buffer; the caller fills it in once `extra`'s position
        // within `bytes` is known, so we record it as "at the start of
        // `extra`" and let the caller add the running length.
        return ModRmEncoding {
            modrm,
            extra: vec![0, 0, 0, 0],
            rex_x: false,
            rex_b: false,
            reloc: Some((usize::MAX, 4, true, sym.clone(), mem.disp)),
        };
    }

    let base = mem.base.expect("memory operand with no base and no rip symbol");
    if let Some((index, scale)) = &mem.index {
        let scale_bits = match scale {
            1 => 0u8,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => 0,
        };
        let (modbits, disp_bytes) = disp_mode(mem.disp, base.low3());
        let modrm = (modbits << 6) | (reg_field << 3) | 0b100;
        let sib = (scale_bits << 6) | (index.low3() << 3) | base.low3();
        let mut extra = vec![sib];
        extra.extend(disp_bytes);
        return ModRmEncoding {
            modrm,
            extra,
            rex_x: index.needs_rex_bit(),
            rex_b: base.needs_rex_bit(),
            reloc: None,
        };
    }

    if base.low3() == 0b100 {
        // %rsp/%r12 as a base always needs a SIB byte with no index.
        let (modbits, disp_bytes) = disp_mode(mem.disp, base.low3());
        let modrm = (modbits << 6) | (reg_field << 3) | 0b100;
        let sib = (0b100 << 3) | base.low3();
        let mut extra = vec![sib];
        extra.extend(disp_bytes);
        return ModRmEncoding {
            modrm,
            extra,
            rex_x: false,
            rex_b: base.needs_rex_bit(),
            reloc: None,
        };
    }

    let (modbits, disp_bytes) = disp_mode(mem.disp, base.low3());
    let modrm = (modbits << 6) | (reg_field << 3) | base.low3();
    ModRmEncoding {
        modrm,
        extra: disp_bytes,
        rex_x: false,
        rex_b: base.needs_rex_bit(),
        reloc: None,
    }
}

fn disp_mode(disp: i64, base_low3: u8) -> (u8, Vec<u8>) {
    if disp == 0 && base_low3 != 0b101 {
        (0b00, vec![])
    } else if let Ok(d8) = i8::try_from(disp) {
        (0b01, vec![d8 as u8])
    } else {
        (0b10, (disp as i32).to_le_bytes().to_vec())
    }
}

fn reg_reg_modrm(reg_field_reg: u8, rm_reg: u8) -> u8 {
    0b11_000_000 | (reg_field_reg << 3) | rm_reg
}

fn push_reloc(enc: &mut Encoded, base_offset: usize, r: (usize, u8, bool, String, i64)) {
    let (_, size, pc_relative, symbol, addend) = r;
    enc.relocs.push((base_offset, size, pc_relative, symbol, addend));
}

fn finish_with_mem(mut bytes: Vec<u8>, mem_enc: ModRmEncoding) -> Encoded {
    let reloc_offset = bytes.len();
    bytes.push(mem_enc.modrm);
    bytes.extend(mem_enc.extra);
    let mut enc = Encoded::new(bytes);
    if let Some(r) = mem_enc.reloc {
        push_reloc(&mut enc, reloc_offset + 1, r);
    }
    enc
}

fn reg_operand(op: &Operand) -> Option<Reg> {
    match op {
        Operand::Reg(r) => Some(*r),
        _ => None,
    }
}

/// Encodes `reg OP r/m` forms shared by `mov`/`add`/`sub`/`xor`/`cmp`/`test`/
/// `movzbq`/`imul`: reg-to-reg uses modrm with both fields set to
/// registers; reg-to-mem routes through `encode_mem`. `opcode` may be one
/// or two bytes (two bytes for the `0F xx`-escaped forms).
fn encode_reg_rm(opcode: &[u8], reg: Reg, rm: &Operand, width: Width) -> Encoded {
    let w = matches!(width, Width::Qword);
    match rm {
        Operand::Reg(rm_reg) => {
            let rex = Rex {
                w,
                r: reg.needs_rex_bit(),
                x: false,
                b: rm_reg.needs_rex_bit(),
                force: reg.rex_required || rm_reg.rex_required,
            };
            let modrm = reg_reg_modrm(reg.low3(), rm_reg.low3());
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.extend_from_slice(opcode);
            bytes.push(modrm);
            Encoded::new(bytes)
        }
        Operand::Mem(mem) => {
            let mem_enc = encode_mem(reg.low3(), mem);
            let rex = Rex {
                w,
                r: reg.needs_rex_bit(),
                x: mem_enc.rex_x,
                b: mem_enc.rex_b,
                force: reg.rex_required,
            };
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.extend_from_slice(opcode);
            finish_with_mem(bytes, mem_enc)
        }
        _ => panic!("encode_reg_rm called with non register/memory operand"),
    }
}

fn encode_single_rm(opcode: u8, digit: u8, rm: &Operand, w: bool) -> Encoded {
    match rm {
        Operand::Reg(reg) => {
            let rex = Rex {
                w,
                r: false,
                x: false,
                b: reg.needs_rex_bit(),
                force: reg.rex_required,
            };
            let modrm = reg_reg_modrm(digit, reg.low3());
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.push(opcode);
            bytes.push(modrm);
            Encoded::new(bytes)
        }
        Operand::Mem(mem) => {
            let mem_enc = encode_mem(digit, mem);
            let rex = Rex {
                w,
                r: false,
                x: mem_enc.rex_x,
                b: mem_enc.rex_b,
                force: false,
            };
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.push(opcode);
            finish_with_mem(bytes, mem_enc)
        }
        _ => panic!("encode_single_rm called with non register/memory operand"),
    }
}

fn jcc_opcode(variant: &str) -> Option<u16> {
    Some(match variant {
        "e" | "z" => 0x0f84,
        "ne" | "nz" => 0x0f85,
        "ns" => 0x0f89,
        _ => return None,
    })
}

fn setcc_opcode(variant: &str) -> Option<u8> {
    Some(match variant {
        "e" => 0x94,
        "ne" => 0x95,
        "l" => 0x9c,
        "le" => 0x9e,
        "g" => 0x9f,
        "ge" => 0x9d,
        _ => return None,
    })
}

/// Splits a mnemonic like `movq`/`setle`/`jne` into its base name and suffix
/// (size suffix for most instructions, condition-code suffix for `setcc`
/// and `jcc`).
fn split_mnemonic<'a>(m: &'a str, bases: &[&str]) -> Option<(&'a str, &'a str)> {
    for base in bases {
        if let Some(rest) = m.strip_prefix(base) {
            return Some((base, rest));
        }
    }
    None
}

pub fn encode(mnemonic: &str, operands: &[Operand]) -> Result<Encoded> {
    let m = mnemonic;
    match m {
        "ret" => return Ok(Encoded::new(vec![0xc3])),
        "syscall" => return Ok(Encoded::new(vec![0x0f, 0x05])),
        "cqo" => return Ok(Encoded::new(vec![0x48, 0x99])),
        _ => {}
    }

    if let Some((_, cc)) = split_mnemonic(m, &["jmp"]) {
        if cc.is_empty() {
            let Operand::Symbol(sym) = &operands[0] else {
                return Err(Error::HostUnsupported("jmp requires a label operand".into()));
            };
            let mut enc = Encoded::new(vec![0xe9, 0, 0, 0, 0]);
            enc.relocs.push((1, 4, true, sym.clone(), 0));
            return Ok(enc);
        }
    }
    if let Some(rest) = m.strip_prefix('j') {
        if let Some(opcode) = jcc_opcode(rest) {
            let Operand::Symbol(sym) = &operands[0] else {
                return Err(Error::HostUnsupported(format!("{m} requires a label operand")));
            };
            let mut bytes = opcode.to_be_bytes().to_vec();
            bytes.extend([0, 0, 0, 0]);
            let mut enc = Encoded::new(bytes);
            enc.relocs.push((2, 4, true, sym.clone(), 0));
            return Ok(enc);
        }
    }
    if m == "call" {
        let Operand::Symbol(sym) = &operands[0] else {
            return Err(Error::HostUnsupported("call requires a label operand".into()));
        };
        let mut enc = Encoded::new(vec![0xe8, 0, 0, 0, 0]);
        enc.relocs.push((1, 4, true, sym.clone(), 0));
        return Ok(enc);
    }
    if let Some(rest) = m.strip_prefix("set") {
        if let Some(opcode) = setcc_opcode(rest) {
            let reg = reg_operand(&operands[0])
                .ok_or_else(|| Error::HostUnsupported(format!("{m} requires a register operand")))?;
            let rex = Rex {
                w: false,
                r: false,
                x: false,
                b: reg.needs_rex_bit(),
                force: reg.rex_required,
            };
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.push(0x0f);
            bytes.push(opcode);
            bytes.push(reg_reg_modrm(0, reg.low3()));
            return Ok(Encoded::new(bytes));
        }
    }

    if let Some(("push", _)) = split_mnemonic(m, &["push"]) {
        let reg = reg_operand(&operands[0])
            .ok_or_else(|| Error::HostUnsupported("push requires a register operand".into()))?;
        let mut bytes = Vec::new();
        if reg.needs_rex_bit() {
            bytes.push(0x41);
        }
        bytes.push(0x50 + reg.low3());
        return Ok(Encoded::new(bytes));
    }
    if let Some(("pop", _)) = split_mnemonic(m, &["pop"]) {
        let reg = reg_operand(&operands[0])
            .ok_or_else(|| Error::HostUnsupported("pop requires a register operand".into()))?;
        let mut bytes = Vec::new();
        if reg.needs_rex_bit() {
            bytes.push(0x41);
        }
        bytes.push(0x58 + reg.low3());
        return Ok(Encoded::new(bytes));
    }

    if m == "movzbq" {
        let src = &operands[0];
        let dst = reg_operand(&operands[1])
            .ok_or_else(|| Error::HostUnsupported("movzbq destination must be a register".into()))?;
        return Ok(encode_reg_rm(&[0x0f, 0xb6], dst, src, Width::Qword));
    }

    if let Some((_, suffix)) = split_mnemonic(m, &["mov", "lea", "add", "sub", "imul", "neg", "inc", "dec", "xor", "test", "cmp", "idiv", "div"]) {
        let width = match suffix {
            "q" => Width::Qword,
            "b" => Width::Byte,
            "" => Width::Qword,
            _ => return Err(Error::HostUnsupported(format!("unsupported size suffix in '{m}'"))),
        };
        return encode_sized(m.trim_end_matches(suffix), width, operands);
    }

    Err(Error::HostUnsupported(format!("unsupported mnemonic '{m}'")))
}

fn encode_sized(base: &str, width: Width, operands: &[Operand]) -> Result<Encoded> {
    let w = matches!(width, Width::Qword);
    match base {
        "mov" => {
            if operands.len() != 2 {
                return Err(Error::HostUnsupported("mov requires two operands".into()));
            }
            match (&operands[0], &operands[1]) {
                (Operand::Imm(v), Operand::Reg(dst)) if w => {
                    let mut bytes = Vec::new();
                    let rex = Rex { w: true, r: false, x: false, b: dst.needs_rex_bit(), force: false };
                    if let Some(b) = rex.byte() {
                        bytes.push(b);
                    }
                    bytes.push(0xb8 + dst.low3());
                    bytes.extend(v.to_le_bytes());
                    Ok(Encoded::new(bytes))
                }
                (Operand::Imm(v), Operand::Mem(mem)) => {
                    let opcode = 0xc7;
                    let mem_enc = encode_mem(0, mem);
                    let rex = Rex { w, r: false, x: mem_enc.rex_x, b: mem_enc.rex_b, force: false };
                    let mut bytes = Vec::new();
                    if let Some(b) = rex.byte() {
                        bytes.push(b);
                    }
                    bytes.push(opcode);
                    let mut enc = finish_with_mem(bytes, mem_enc);
                    enc.bytes.extend((*v as i32).to_le_bytes());
                    Ok(enc)
                }
                (Operand::Reg(src), Operand::Reg(dst)) => {
                    let opcode = if matches!(width, Width::Byte) { 0x88 } else { 0x89 };
                    Ok(encode_reg_rm(&[opcode], *src, &Operand::Reg(*dst), width))
                }
                (Operand::Reg(src), Operand::Mem(_)) => {
                    let opcode = if matches!(width, Width::Byte) { 0x88 } else { 0x89 };
                    Ok(encode_reg_rm(&[opcode], *src, &operands[1], width))
                }
                (Operand::Mem(_), Operand::Reg(dst)) => {
                    let opcode = if matches!(width, Width::Byte) { 0x8a } else { 0x8b };
                    Ok(encode_reg_rm(&[opcode], *dst, &operands[0], width))
                }
                _ => Err(Error::HostUnsupported("unsupported mov operand combination".into())),
            }
        }
        "lea" => {
            let Operand::Mem(_) = &operands[0] else {
                return Err(Error::HostUnsupported("lea source must be memory".into()));
            };
            let dst = reg_operand(&operands[1])
                .ok_or_else(|| Error::HostUnsupported("lea destination must be a register".into()))?;
            Ok(encode_reg_rm(&[0x8d], dst, &operands[0], Width::Qword))
        }
        "add" | "sub" | "xor" | "cmp" => {
            let digit = match base {
                "add" => 0u8,
                "xor" => 6,
                "sub" => 5,
                "cmp" => 7,
                _ => unreachable!(),
            };
            match (&operands[0], &operands[1]) {
                (Operand::Reg(src), dst @ (Operand::Reg(_) | Operand::Mem(_))) => {
                    let opcode = match base {
                        "add" => 0x01,
                        "sub" => 0x29,
                        "xor" => 0x31,
                        "cmp" => 0x39,
                        _ => unreachable!(),
                    };
                    Ok(encode_reg_rm(&[opcode], *src, dst, width))
                }
                (Operand::Imm(v), dst @ (Operand::Reg(_) | Operand::Mem(_))) => {
                    encode_imm_group1(digit, *v, dst, width)
                }
                _ => Err(Error::HostUnsupported(format!("unsupported {base} operand combination"))),
            }
        }
        "test" => match (&operands[0], &operands[1]) {
            (Operand::Reg(a), Operand::Reg(b)) => {
                let opcode = if matches!(width, Width::Byte) { 0x84 } else { 0x85 };
                Ok(encode_reg_rm(&[opcode], *a, &Operand::Reg(*b), width))
            }
            (Operand::Reg(a), Operand::Mem(_)) => {
                let opcode = if matches!(width, Width::Byte) { 0x84 } else { 0x85 };
                Ok(encode_reg_rm(&[opcode], *a, &operands[1], width))
            }
            _ => Err(Error::HostUnsupported("unsupported test operand combination".into())),
        },
        "imul" => {
            let src = &operands[0];
            let dst = reg_operand(&operands[1])
                .ok_or_else(|| Error::HostUnsupported("imul destination must be a register".into()))?;
            Ok(encode_reg_rm(&[0x0f, 0xaf], dst, src, width))
        }
        "div" => Ok(encode_single_rm(0xf7, 6, &operands[0], w)),
        "idiv" => Ok(encode_single_rm(0xf7, 7, &operands[0], w)),
        "neg" => Ok(encode_single_rm(0xf7, 3, &operands[0], w)),
        "inc" => Ok(encode_single_rm(0xff, 0, &operands[0], w)),
        "dec" => Ok(encode_single_rm(0xff, 1, &operands[0], w)),
        other => Err(Error::HostUnsupported(format!("unsupported mnemonic base '{other}'"))),
    }
}

fn encode_imm_group1(digit: u8, v: i64, dst: &Operand, width: Width) -> Result<Encoded> {
    let w = matches!(width, Width::Qword);
    match dst {
        Operand::Reg(reg) => {
            let rex = Rex { w, r: false, x: false, b: reg.needs_rex_bit(), force: reg.rex_required };
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.push(0x81);
            bytes.push(reg_reg_modrm(digit, reg.low3()));
            bytes.extend((v as i32).to_le_bytes());
            Ok(Encoded::new(bytes))
        }
        Operand::Mem(mem) => {
            let mem_enc = encode_mem(digit, mem);
            let rex = Rex { w, r: false, x: mem_enc.rex_x, b: mem_enc.rex_b, force: false };
            let mut bytes = Vec::new();
            if let Some(b) = rex.byte() {
                bytes.push(b);
            }
            bytes.push(0x81);
            let mut enc = finish_with_mem(bytes, mem_enc);
            enc.bytes.extend((v as i32).to_le_bytes());
            Ok(enc)
        }
        _ => Err(Error::HostUnsupported("unsupported immediate destination".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::registers;

    fn reg(name: &str) -> Operand {
        Operand::Reg(registers::parse(name).unwrap())
    }

    #[test]
    fn encodes_mov_reg_reg() {
        let enc = encode("movq", &[reg("rsp"), reg("rbp")]).unwrap();
        assert_eq!(enc.bytes, vec![0x48, 0x89, 0xe5]);
    }

    #[test]
    fn encodes_mov_imm_reg() {
        let enc = encode("movq", &[Operand::Imm(1), reg("rax")]).unwrap();
        assert_eq!(enc.bytes[0], 0x48);
        assert_eq!(enc.bytes[1], 0xb8);
    }

    #[test]
    fn encodes_ret_and_syscall() {
        assert_eq!(encode("ret", &[]).unwrap().bytes, vec![0xc3]);
        assert_eq!(encode("syscall", &[]).unwrap().bytes, vec![0x0f, 0x05]);
    }

    #[test]
    fn encodes_push_with_rex() {
        let enc = encode("pushq", &[reg("r12")]).unwrap();
        assert_eq!(enc.bytes, vec![0x41, 0x54]);
    }

    #[test]
    fn jmp_emits_relocation() {
        let enc = encode("jmp", &[Operand::Symbol(".L.end".into())]).unwrap();
        assert_eq!(enc.bytes[0], 0xe9);
        assert_eq!(enc.relocs.len(), 1);
        assert_eq!(enc.relocs[0].3, ".L.end");
    }
}
