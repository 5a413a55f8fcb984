//! AT&T/GAS assembler. Lexes and parses assembly text into statements,
//! then walks them once, emitting bytes into `.text`/`.data` (and counting
//! `.bss` size) and recording a relocation for every operand whose value
//! depends on a symbol's eventual virtual address. The ELF writer performs
//! the second pass: once section virtual addresses are fixed, it patches
//! every recorded relocation in place.

mod ast;
mod encoder;
mod lexer;
mod parser;
mod reloc;
mod registers;

pub use ast::{DirectiveArg, Mem, Operand, Stmt};
pub use reloc::{Relocation, Section};

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRef {
    pub section: Section,
    pub offset: usize,
}

pub struct AssembledProgram {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub bss_size: usize,
    pub symbols: BTreeMap<String, SymbolRef>,
    pub relocations: Vec<Relocation>,
}

struct Assembler {
    text: Vec<u8>,
    data: Vec<u8>,
    bss_size: usize,
    section: Section,
    symbols: BTreeMap<String, SymbolRef>,
    equs: BTreeMap<String, i64>,
    relocations: Vec<Relocation>,
}

impl Assembler {
    fn new() -> Self {
        Self {
            text: Vec::new(),
            data: Vec::new(),
            bss_size: 0,
            section: Section::Text,
            symbols: BTreeMap::new(),
            equs: BTreeMap::new(),
            relocations: Vec::new(),
        }
    }

    fn current_offset(&self) -> usize {
        match self.section {
            Section::Text => self.text.len(),
            Section::Data => self.data.len(),
            Section::Bss => self.bss_size,
        }
    }

    fn collect_equs(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let Stmt::Directive { name, args, .. } = stmt {
                if name == "equ" || name == "set" {
                    if let [DirectiveArg::Ident(sym), DirectiveArg::Int(v)] = args.as_slice() {
                        self.equs.insert(sym.clone(), *v);
                    }
                }
            }
        }
    }

    fn resolve_imm_symbol(&self, name: &str) -> Option<i64> {
        self.equs.get(name).copied()
    }

    /// Walks every statement, accumulating syntax issues instead of
    /// aborting on the first bad directive/instruction — mirrors the
    /// lexer/parser's own `Vec<SyntaxIssue>` accumulation so a single
    /// assemble call reports every problem in the source, not just the
    /// first one encountered.
    fn run(&mut self, stmts: &[Stmt]) -> Result<()> {
        self.collect_equs(stmts);
        let mut issues = Vec::new();
        for stmt in stmts {
            match self.emit_stmt(stmt) {
                Ok(()) => {}
                Err(Error::Syntax { issues: mut these }) => issues.append(&mut these),
                Err(other) => return Err(other),
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::syntax(issues))
        }
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Label(name) => {
                self.symbols.insert(
                    name.clone(),
                    SymbolRef {
                        section: self.section,
                        offset: self.current_offset(),
                    },
                );
                Ok(())
            }
            Stmt::Directive { name, args, pos } => self.emit_directive(name, args, *pos),
            Stmt::Instr {
                mnemonic,
                operands,
                pos,
            } => self.emit_instr(mnemonic, operands, *pos),
        }
    }

    fn emit_directive(
        &mut self,
        name: &str,
        args: &[DirectiveArg],
        pos: lexer::Position,
    ) -> Result<()> {
        match name {
            "text" => self.section = Section::Text,
            "data" => self.section = Section::Data,
            "bss" => self.section = Section::Bss,
            "global" | "globl" => {}
            "equ" | "set" => {}
            "ascii" => {
                for arg in args {
                    if let DirectiveArg::Str(bytes) = arg {
                        self.push_bytes(bytes);
                    }
                }
            }
            "asciz" | "string" => {
                for arg in args {
                    if let DirectiveArg::Str(bytes) = arg {
                        self.push_bytes(bytes);
                        self.push_bytes(&[0]);
                    }
                }
            }
            "byte" => {
                for arg in args {
                    if let DirectiveArg::Int(v) = arg {
                        self.push_bytes(&[*v as u8]);
                    }
                }
            }
            "quad" => {
                for arg in args {
                    match arg {
                        DirectiveArg::Int(v) => self.push_bytes(&v.to_le_bytes()),
                        DirectiveArg::Ident(sym) => {
                            let offset = self.current_offset();
                            self.push_bytes(&[0u8; 8]);
                            self.relocations.push(Relocation::new(
                                self.section,
                                offset,
                                8,
                                false,
                                sym.clone(),
                                0,
                            ));
                        }
                        DirectiveArg::Str(_) => {}
                    }
                }
            }
            "zero" => {
                if let Some(DirectiveArg::Int(n)) = args.first() {
                    self.push_bytes(&vec![0u8; (*n).max(0) as usize]);
                }
            }
            other => {
                return Err(Error::syntax(vec![crate::error::SyntaxIssue::new(
                    pos.line,
                    pos.col,
                    format!("unsupported directive '.{other}'"),
                )]))
            }
        }
        Ok(())
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        match self.section {
            Section::Text => self.text.extend_from_slice(bytes),
            Section::Data => self.data.extend_from_slice(bytes),
            Section::Bss => self.bss_size += bytes.len(),
        }
    }

    fn emit_instr(&mut self, mnemonic: &str, operands: &[Operand], pos: lexer::Position) -> Result<()> {
        if self.section == Section::Bss {
            return Err(Error::syntax(vec![crate::error::SyntaxIssue::new(
                pos.line,
                pos.col,
                "instructions are not permitted in .bss",
            )]));
        }
        let resolved: Vec<Operand> = operands
            .iter()
            .map(|op| match op {
                Operand::Symbol(name) => match self.resolve_imm_symbol(name) {
                    Some(v) => Operand::Imm(v),
                    None => Operand::Symbol(name.clone()),
                },
                other => other.clone(),
            })
            .collect();
        let encoded = encoder::encode(mnemonic, &resolved).map_err(|e| match e {
            Error::HostUnsupported(msg) => Error::syntax(vec![crate::error::SyntaxIssue::new(
                pos.line,
                pos.col,
                msg,
            )]),
            other => other,
        })?;
        let base_offset = self.current_offset();
        self.push_bytes(&encoded.bytes);
        for (local_offset, size, pc_relative, symbol, addend) in encoded.relocs {
            self.relocations.push(Relocation::new(
                self.section,
                base_offset + local_offset,
                size,
                pc_relative,
                symbol,
                addend,
            ));
        }
        Ok(())
    }
}

/// Assembles AT&T/GAS source text into section byte buffers, a symbol
/// table, and a relocation list. Relocations are left unresolved: the ELF
/// writer patches them once section virtual addresses are fixed.
pub fn assemble(source: &str) -> Result<AssembledProgram> {
    let tokens = lexer::lex(source).map_err(Error::syntax)?;
    let stmts = parser::parse(tokens).map_err(Error::syntax)?;
    let mut asm = Assembler::new();
    asm.run(&stmts)?;
    Ok(AssembledProgram {
        text: asm.text,
        data: asm.data,
        bss_size: asm.bss_size,
        symbols: asm.symbols,
        relocations: asm.relocations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_minimal_exit_program() {
        let prog = assemble(
            "_start:\n    movq $60, %rax\n    movq $0, %rdi\n    syscall\n",
        )
        .unwrap();
        assert!(prog.symbols.contains_key("_start"));
        assert!(!prog.text.is_empty());
        assert!(prog.relocations.is_empty());
    }

    #[test]
    fn assembles_data_section_string() {
        let prog = assemble(".data\n.L.str.0:\n    .ascii \"hi\\n\"\n").unwrap();
        assert_eq!(prog.data, b"hi\n");
        assert_eq!(
            prog.symbols.get(".L.str.0"),
            Some(&SymbolRef {
                section: Section::Data,
                offset: 0
            })
        );
    }

    #[test]
    fn rip_relative_lea_emits_relocation() {
        let prog = assemble(
            ".text\n_start:\n    leaq .L.str.0(%rip), %rax\n.data\n.L.str.0:\n    .ascii \"x\"\n",
        )
        .unwrap();
        assert_eq!(prog.relocations.len(), 1);
        assert!(prog.relocations[0].pc_relative);
        assert_eq!(prog.relocations[0].symbol, ".L.str.0");
    }

    #[test]
    fn equ_constant_becomes_immediate() {
        let prog = assemble(".equ SYS_EXIT, 60\n_start:\n    movq $SYS_EXIT, %rax\n").unwrap();
        assert!(prog.relocations.is_empty());
        assert!(prog.text.windows(2).any(|w| w == [0xb8 & 0xff, 60]) || prog.text.contains(&60));
    }

    #[test]
    fn unresolved_symbol_on_call_is_a_relocation_not_an_error() {
        let prog = assemble("_start:\n    call __printf\n    ret\n").unwrap();
        assert_eq!(prog.relocations.len(), 1);
        assert_eq!(prog.relocations[0].symbol, "__printf");
    }
}
