//! Parsed-statement and operand types shared between the parser and the
//! encoder.

use super::lexer::Position;
use super::registers::Reg;

#[derive(Debug, Clone)]
pub struct Mem {
    pub disp: i64,
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    /// Set for `sym(%rip)` and for a bare `sym` operand, which this
    /// assembler treats as implicitly RIP-relative: 64-bit mode has no
    /// true `mod=00` absolute-disp32 addressing, so a label used as a
    /// direct memory operand can only ever mean "relative to the next
    /// instruction" in practice.
    pub rip_symbol: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(Mem),
    /// A bare label used as a jump/call target, or as a `$symbol` immediate.
    Symbol(String),
}

#[derive(Debug, Clone)]
pub enum DirectiveArg {
    Str(Vec<u8>),
    Ident(String),
    Int(i64),
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Label(String),
    Directive {
        name: String,
        args: Vec<DirectiveArg>,
        pos: Position,
    },
    Instr {
        mnemonic: String,
        operands: Vec<Operand>,
        pos: Position,
    },
}
