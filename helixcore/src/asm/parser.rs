//! Pass-one statement parser: turns the token stream into a flat list of
//! labels, directives, and instructions. Does not resolve symbols or
//! compute addresses — that happens while the encoder walks this list and
//! lays out sections.

use super::ast::{DirectiveArg, Mem, Operand, Stmt};
use super::lexer::{Position, Token, TokenKind};
use super::registers;
use crate::error::SyntaxIssue;

struct Cursor {
    tokens: Vec<Token>,
    idx: usize,
}

impl Cursor {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, idx: 0 }
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.idx.min(self.tokens.len() - 1)].kind
    }

    fn pos(&self) -> Position {
        self.tokens[self.idx.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> TokenKind {
        let tok = self.tokens[self.idx.min(self.tokens.len() - 1)].kind.clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }
}

pub fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>, Vec<SyntaxIssue>> {
    let mut c = Cursor::new(tokens);
    let mut stmts = Vec::new();
    let mut issues = Vec::new();
    c.skip_newlines();
    while !c.at_eof() {
        match parse_line(&mut c) {
            Ok(mut line_stmts) => stmts.append(&mut line_stmts),
            Err(issue) => {
                issues.push(issue);
                while !matches!(c.peek(), TokenKind::Newline | TokenKind::Eof) {
                    c.advance();
                }
            }
        }
        c.skip_newlines();
    }
    if issues.is_empty() {
        Ok(stmts)
    } else {
        Err(issues)
    }
}

fn parse_line(c: &mut Cursor) -> Result<Vec<Stmt>, SyntaxIssue> {
    let mut out = Vec::new();
    loop {
        match c.peek().clone() {
            TokenKind::Label(name) => {
                c.advance();
                out.push(Stmt::Label(name));
            }
            TokenKind::Directive(name) => {
                let pos = c.pos();
                c.advance();
                let args = parse_directive_args(c)?;
                out.push(Stmt::Directive { name, args, pos });
                return Ok(out);
            }
            TokenKind::Ident(mnemonic) => {
                let pos = c.pos();
                c.advance();
                let operands = parse_operands(c)?;
                out.push(Stmt::Instr {
                    mnemonic,
                    operands,
                    pos,
                });
                return Ok(out);
            }
            TokenKind::Newline | TokenKind::Eof => return Ok(out),
            other => {
                return Err(SyntaxIssue::new(
                    c.pos().line,
                    c.pos().col,
                    format!("unexpected token at start of line: {other:?}"),
                ))
            }
        }
    }
}

fn parse_directive_args(c: &mut Cursor) -> Result<Vec<DirectiveArg>, SyntaxIssue> {
    let mut args = Vec::new();
    loop {
        match c.peek().clone() {
            TokenKind::Newline | TokenKind::Eof => break,
            TokenKind::StringLit(bytes) => {
                c.advance();
                args.push(DirectiveArg::Str(bytes));
            }
            TokenKind::Ident(name) => {
                c.advance();
                args.push(DirectiveArg::Ident(name));
            }
            TokenKind::Directive(name) => {
                c.advance();
                args.push(DirectiveArg::Ident(name));
            }
            TokenKind::Integer(v) => {
                c.advance();
                args.push(DirectiveArg::Int(v));
            }
            TokenKind::Punct(',') => {
                c.advance();
            }
            other => {
                return Err(SyntaxIssue::new(
                    c.pos().line,
                    c.pos().col,
                    format!("unexpected token in directive argument list: {other:?}"),
                ))
            }
        }
    }
    Ok(args)
}

fn parse_operands(c: &mut Cursor) -> Result<Vec<Operand>, SyntaxIssue> {
    let mut ops = Vec::new();
    if matches!(c.peek(), TokenKind::Newline | TokenKind::Eof) {
        return Ok(ops);
    }
    loop {
        ops.push(parse_operand(c)?);
        if matches!(c.peek(), TokenKind::Punct(',')) {
            c.advance();
            continue;
        }
        break;
    }
    Ok(ops)
}

fn parse_operand(c: &mut Cursor) -> Result<Operand, SyntaxIssue> {
    match c.peek().clone() {
        TokenKind::Register(name) => {
            let pos = c.pos();
            c.advance();
            let reg = registers::parse(&name).ok_or_else(|| {
                SyntaxIssue::new(pos.line, pos.col, format!("unknown register %{name}"))
            })?;
            Ok(Operand::Reg(reg))
        }
        TokenKind::Punct('$') => {
            c.advance();
            match c.peek().clone() {
                TokenKind::Integer(v) => {
                    c.advance();
                    Ok(Operand::Imm(v))
                }
                TokenKind::Ident(name) | TokenKind::Directive(name) => {
                    c.advance();
                    Ok(Operand::Symbol(name))
                }
                other => Err(SyntaxIssue::new(
                    c.pos().line,
                    c.pos().col,
                    format!("expected immediate after '$', found {other:?}"),
                )),
            }
        }
        TokenKind::Integer(v) => {
            c.advance();
            parse_mem_suffix(c, v)
        }
        TokenKind::Punct('(') => parse_mem_suffix(c, 0),
        TokenKind::Ident(name) | TokenKind::Directive(name) => {
            c.advance();
            if matches!(c.peek(), TokenKind::Punct('(')) {
                parse_mem_with_symbol(c, name)
            } else {
                Ok(Operand::Symbol(name))
            }
        }
        other => Err(SyntaxIssue::new(
            c.pos().line,
            c.pos().col,
            format!("unexpected token in operand position: {other:?}"),
        )),
    }
}

fn parse_mem_suffix(c: &mut Cursor, disp: i64) -> Result<Operand, SyntaxIssue> {
    parse_mem_body(c, disp, None)
}

fn parse_mem_with_symbol(c: &mut Cursor, symbol: String) -> Result<Operand, SyntaxIssue> {
    parse_mem_body(c, 0, Some(symbol))
}

fn parse_mem_body(
    c: &mut Cursor,
    disp: i64,
    symbol: Option<String>,
) -> Result<Operand, SyntaxIssue> {
    if !matches!(c.peek(), TokenKind::Punct('(')) {
        return Err(SyntaxIssue::new(
            c.pos().line,
            c.pos().col,
            "expected '(' in memory operand",
        ));
    }
    c.advance();
    let mut saw_rip = false;
    let base = parse_opt_register(c, &mut saw_rip)?;
    let mut index = None;
    if matches!(c.peek(), TokenKind::Punct(',')) {
        c.advance();
        let idx_reg = parse_register(c)?;
        let mut scale = 1u8;
        if matches!(c.peek(), TokenKind::Punct(',')) {
            c.advance();
            if let TokenKind::Integer(v) = c.peek().clone() {
                c.advance();
                scale = v as u8;
            }
        }
        index = Some((idx_reg, scale));
    }
    if !matches!(c.peek(), TokenKind::Punct(')')) {
        return Err(SyntaxIssue::new(
            c.pos().line,
            c.pos().col,
            "expected ')' closing memory operand",
        ));
    }
    c.advance();
    Ok(Operand::Mem(Mem {
        disp,
        base,
        index,
        rip_symbol: if saw_rip { symbol } else { None },
    }))
}

fn parse_opt_register(
    c: &mut Cursor,
    saw_rip: &mut bool,
) -> Result<Option<super::registers::Reg>, SyntaxIssue> {
    if let TokenKind::Register(name) = c.peek().clone() {
        c.advance();
        if name == "rip" {
            *saw_rip = true;
            return Ok(None);
        }
        let reg = registers::parse(&name).ok_or_else(|| {
            SyntaxIssue::new(c.pos().line, c.pos().col, format!("unknown register %{name}"))
        })?;
        return Ok(Some(reg));
    }
    Ok(None)
}

fn parse_register(c: &mut Cursor) -> Result<super::registers::Reg, SyntaxIssue> {
    if let TokenKind::Register(name) = c.peek().clone() {
        c.advance();
        return registers::parse(&name).ok_or_else(|| {
            SyntaxIssue::new(c.pos().line, c.pos().col, format!("unknown register %{name}"))
        });
    }
    Err(SyntaxIssue::new(c.pos().line, c.pos().col, "expected a register"))
}
