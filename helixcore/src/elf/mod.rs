//! ET_EXEC ELF64 image writer: one PT_LOAD segment, little-endian, with a
//! fixed 120-byte header+program-header prologue immediately followed by
//! `.text` then `.data`. `.bss` occupies no file bytes; the loader zero-
//! fills it up to `p_memsz`.

use std::collections::BTreeMap;

use crate::asm::{AssembledProgram, Section};
use crate::error::{Error, Result};

const BASE_VA: u64 = 0x400000;
const HEADER_LEN: u64 = 120;
const TEXT_VA: u64 = BASE_VA + 0x78;

/// Resolves a symbol to its virtual address once section lengths are
/// known. Used by the orchestrator to turn source-map labels into
/// addresses comparable against a faulting `rip`.
pub fn resolve_va(program: &AssembledProgram, symbol: &str) -> Option<u64> {
    let sym = program.symbols.get(symbol)?;
    let text_len = program.text.len() as u64;
    let data_len = program.data.len() as u64;
    Some(section_va(sym.section, text_len, data_len) + sym.offset as u64)
}

fn section_va(section: Section, text_len: u64, data_len: u64) -> u64 {
    match section {
        Section::Text => TEXT_VA,
        Section::Data => TEXT_VA + text_len,
        Section::Bss => TEXT_VA + text_len + data_len,
    }
}

/// Links an assembled program into a bootable ELF64 ET_EXEC image.
/// `entry_symbol` must resolve to a label in `.text`.
pub fn link(program: &AssembledProgram, entry_symbol: &str) -> Result<Vec<u8>> {
    let entry = program
        .symbols
        .get(entry_symbol)
        .ok_or_else(|| Error::UndefinedSymbol {
            symbol: entry_symbol.to_string(),
        })?;
    if entry.section != Section::Text {
        return Err(Error::UndefinedSymbol {
            symbol: entry_symbol.to_string(),
        });
    }

    let mut text = program.text.clone();
    let mut data = program.data.clone();
    let text_len = text.len() as u64;
    let data_len = data.len() as u64;

    patch_relocations(program, &mut text, &mut data, text_len, data_len)?;

    let entry_va = TEXT_VA + entry.offset as u64;
    let filesz = HEADER_LEN + text_len + data_len;
    let memsz = filesz + program.bss_size as u64;

    let mut image = Vec::with_capacity(filesz as usize);
    image.extend_from_slice(&[
        0x7f, 0x45, 0x4c, 0x46, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ]);
    image.extend_from_slice(&0x0002u16.to_le_bytes()); // e_type: ET_EXEC
    image.extend_from_slice(&0x003eu16.to_le_bytes()); // e_machine: EM_X86_64
    image.extend_from_slice(&1u32.to_le_bytes()); // e_version
    image.extend_from_slice(&entry_va.to_le_bytes()); // e_entry
    image.extend_from_slice(&0x40u64.to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(image.len(), 64);

    image.extend_from_slice(&1u32.to_le_bytes()); // p_type: PT_LOAD
    image.extend_from_slice(&7u32.to_le_bytes()); // p_flags: R|W|X
    image.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    image.extend_from_slice(&BASE_VA.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&BASE_VA.to_le_bytes()); // p_paddr
    image.extend_from_slice(&filesz.to_le_bytes()); // p_filesz
    image.extend_from_slice(&memsz.to_le_bytes()); // p_memsz
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
    debug_assert_eq!(image.len(), HEADER_LEN as usize);

    image.append(&mut text);
    image.append(&mut data);
    Ok(image)
}

fn patch_relocations(
    program: &AssembledProgram,
    text: &mut [u8],
    data: &mut [u8],
    text_len: u64,
    data_len: u64,
) -> Result<()> {
    let symbols: &BTreeMap<_, _> = &program.symbols;
    for reloc in &program.relocations {
        let Some(target) = symbols.get(&reloc.symbol) else {
            continue;
        };
        let target_va = section_va(target.section, text_len, data_len) + target.offset as u64;
        let value: i64 = if reloc.pc_relative {
            let source_va = section_va(reloc.section, text_len, data_len) + reloc.offset as u64;
            target_va as i64 - (source_va as i64 + 4)
        } else {
            target_va as i64 + reloc.addend
        };

        let buf = match reloc.section {
            Section::Text => &mut *text,
            Section::Data => &mut *data,
            Section::Bss => continue,
        };

        match reloc.size {
            4 => {
                let v32 = i32::try_from(value).map_err(|_| Error::RelocationOverflow {
                    section: format!("{:?}", reloc.section),
                    offset: reloc.offset,
                    size: 4,
                    value,
                })?;
                buf[reloc.offset..reloc.offset + 4].copy_from_slice(&v32.to_le_bytes());
            }
            8 => {
                buf[reloc.offset..reloc.offset + 8].copy_from_slice(&value.to_le_bytes());
            }
            other => {
                return Err(Error::RelocationOverflow {
                    section: format!("{:?}", reloc.section),
                    offset: reloc.offset,
                    size: other,
                    value,
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    #[test]
    fn produces_bit_exact_header_for_minimal_program() {
        let prog = assemble("_start:\n    movq $60, %rax\n    movq $0, %rdi\n    syscall\n").unwrap();
        let image = link(&prog, "_start").unwrap();
        assert_eq!(&image[0..4], &[0x7f, 0x45, 0x4c, 0x46]);
        assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2);
        assert_eq!(u16::from_le_bytes([image[18], image[19]]), 0x3e);
        let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
        assert_eq!(entry, 0x400078);
        assert_eq!(image.len(), 120 + prog.text.len() + prog.data.len());
    }

    #[test]
    fn resolves_rip_relative_string_reference() {
        let prog = assemble(
            ".text\n_start:\n    leaq .L.str.0(%rip), %rsi\n    movq $60, %rax\n    movq $0, %rdi\n    syscall\n.data\n.L.str.0:\n    .asciz \"hi\"\n",
        )
        .unwrap();
        let image = link(&prog, "_start").unwrap();
        assert_eq!(image.len(), 120 + prog.text.len() + prog.data.len());
    }

    #[test]
    fn missing_entry_symbol_is_an_error() {
        let prog = assemble("foo:\n    ret\n").unwrap();
        assert!(link(&prog, "_start").is_err());
    }
}
