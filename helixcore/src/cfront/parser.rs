//! Recursive-descent parser implementing the C-subset grammar.
//!
//! Bundles the token cursor as a `ParserState` passed by mutable reference
//! rather than methods on a
//! struct that owns the tokens — the distinction matters once codegen needs
//! its own, differently-scoped mutable state (see `codegen::CodegenState`).

use super::ast::{BinOp, Expr, Stmt};
use super::lexer::{Position, Token, TokenKind};
use crate::error::SyntaxIssue;

struct ParserState {
    tokens: Vec<Token>,
    cursor: usize,
    issues: Vec<SyntaxIssue>,
}

impl ParserState {
    fn peek(&self) -> &Token {
        &self.tokens[self.cursor]
    }

    fn pos(&self) -> Position {
        self.peek().pos
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.cursor].clone();
        if self.cursor + 1 < self.tokens.len() {
            self.cursor += 1;
        }
        tok
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Identifier(id) if id == name)
    }

    fn is_punct(&self, lexeme: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Punct(p) if *p == lexeme)
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.is_ident(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, lexeme: &str) -> bool {
        if self.is_punct(lexeme) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, lexeme: &str) {
        if !self.eat_punct(lexeme) {
            let pos = self.pos();
            self.issues
                .push(SyntaxIssue::new(pos.line, pos.col, format!("expected '{lexeme}'")));
        }
    }

    fn expect_identifier(&mut self) -> String {
        if let TokenKind::Identifier(name) = self.peek().kind.clone() {
            self.advance();
            name
        } else {
            let pos = self.pos();
            self.issues
                .push(SyntaxIssue::new(pos.line, pos.col, "expected identifier"));
            String::new()
        }
    }
}

/// Parses a fully-lexed token stream into a flat program body — every
/// accepted program executes as if it were the body of `_start`.
pub fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>, Vec<SyntaxIssue>> {
    let mut state = ParserState {
        tokens,
        cursor: 0,
        issues: Vec::new(),
    };
    let mut program = Vec::new();
    while !state.at_eof() {
        program.push(top_stmt(&mut state));
    }
    if state.issues.is_empty() {
        Ok(program)
    } else {
        Err(state.issues)
    }
}

/// `top_stmt := func_header | stmt`. A `func_header` is recognized by the
/// `"int" IDENT "("` lookahead and consumed without producing a node.
fn top_stmt(state: &mut ParserState) -> Stmt {
    if is_func_header(state) {
        consume_func_header(state);
        return Stmt::Nop;
    }
    stmt(state)
}

fn is_func_header(state: &ParserState) -> bool {
    if !state.is_ident("int") {
        return false;
    }
    let save = state.cursor;
    let mut probe = ParserState {
        tokens: state.tokens.clone(),
        cursor: save,
        issues: Vec::new(),
    };
    probe.advance(); // "int"
    if !matches!(probe.peek().kind, TokenKind::Identifier(_)) {
        return false;
    }
    probe.advance();
    probe.is_punct("(")
}

fn consume_func_header(state: &mut ParserState) {
    state.eat_ident("int");
    state.expect_identifier();
    state.expect_punct("(");
    state.eat_ident("void");
    state.expect_punct(")");
}

fn stmt(state: &mut ParserState) -> Stmt {
    let pos = state.pos();
    if state.eat_ident("if") {
        state.expect_punct("(");
        let cond = expr(state);
        state.expect_punct(")");
        let then_branch = Box::new(stmt(state));
        let else_branch = if state.eat_ident("else") {
            Some(Box::new(stmt(state)))
        } else {
            None
        };
        return Stmt::If {
            cond,
            then_branch,
            else_branch,
            pos,
        };
    }
    if state.eat_ident("while") {
        state.expect_punct("(");
        let cond = expr(state);
        state.expect_punct(")");
        let body = Box::new(stmt(state));
        return Stmt::While { cond, body, pos };
    }
    if state.eat_punct("{") {
        let mut stmts = Vec::new();
        while !state.is_punct("}") && !state.at_eof() {
            stmts.push(stmt(state));
        }
        state.expect_punct("}");
        return Stmt::Block { stmts, pos };
    }
    if state.is_ident("int") {
        state.advance();
        while state.eat_punct("*") {}
        let name = state.expect_identifier();
        let init = if state.eat_punct("=") { Some(expr(state)) } else { None };
        state.expect_punct(";");
        return Stmt::Decl { name, init, pos };
    }
    if state.eat_ident("return") {
        let value = expr(state);
        state.expect_punct(";");
        return Stmt::Return { value, pos };
    }
    let value = expr(state);
    state.expect_punct(";");
    Stmt::Expr { expr: value, pos }
}

fn expr(state: &mut ParserState) -> Expr {
    assign(state)
}

/// `assign := equality [ "=" assign ]` — the lhs must be a `var`.
fn assign(state: &mut ParserState) -> Expr {
    let pos = state.pos();
    let lhs = equality(state);
    if state.eat_punct("=") {
        let value = Box::new(assign(state));
        if let Expr::Var { name, .. } = lhs {
            return Expr::Assign { name, value, pos };
        }
        state
            .issues
            .push(SyntaxIssue::new(pos.line, pos.col, "left-hand side of assignment must be a variable"));
        return Expr::Assign {
            name: String::new(),
            value,
            pos,
        };
    }
    lhs
}

fn equality(state: &mut ParserState) -> Expr {
    let mut lhs = relational(state);
    loop {
        let op = if state.is_punct("==") {
            BinOp::Eq
        } else if state.is_punct("!=") {
            BinOp::Ne
        } else {
            break;
        };
        let pos = state.pos();
        state.advance();
        let rhs = relational(state);
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        };
    }
    lhs
}

fn relational(state: &mut ParserState) -> Expr {
    let mut lhs = add(state);
    loop {
        let op = if state.is_punct("<=") {
            BinOp::Le
        } else if state.is_punct(">=") {
            BinOp::Ge
        } else if state.is_punct("<") {
            BinOp::Lt
        } else if state.is_punct(">") {
            BinOp::Gt
        } else {
            break;
        };
        let pos = state.pos();
        state.advance();
        let rhs = add(state);
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        };
    }
    lhs
}

fn add(state: &mut ParserState) -> Expr {
    let mut lhs = mul(state);
    loop {
        let op = if state.is_punct("+") {
            BinOp::Add
        } else if state.is_punct("-") {
            BinOp::Sub
        } else {
            break;
        };
        let pos = state.pos();
        state.advance();
        let rhs = mul(state);
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        };
    }
    lhs
}

fn mul(state: &mut ParserState) -> Expr {
    let mut lhs = unary(state);
    loop {
        let op = if state.is_punct("*") {
            BinOp::Mul
        } else if state.is_punct("/") {
            BinOp::Div
        } else {
            break;
        };
        let pos = state.pos();
        state.advance();
        let rhs = unary(state);
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        };
    }
    lhs
}

/// `unary := ("+"|"-") primary | primary`. Unary minus desugars to `0 - x`
/// so codegen only ever has to handle the binary form.
fn unary(state: &mut ParserState) -> Expr {
    let pos = state.pos();
    if state.eat_punct("-") {
        let operand = primary(state);
        return Expr::Binary {
            op: BinOp::Sub,
            lhs: Box::new(Expr::Num { value: 0, pos }),
            rhs: Box::new(operand),
            pos,
        };
    }
    if state.eat_punct("+") {
        return primary(state);
    }
    primary(state)
}

fn primary(state: &mut ParserState) -> Expr {
    let pos = state.pos();
    match state.peek().kind.clone() {
        TokenKind::Integer(value) => {
            state.advance();
            Expr::Num { value, pos }
        }
        TokenKind::StringLit(raw) => {
            state.advance();
            Expr::Str { raw, pos }
        }
        TokenKind::Identifier(name) => {
            state.advance();
            if state.eat_punct("(") {
                let mut args = Vec::new();
                if !state.is_punct(")") {
                    args.push(expr(state));
                    while state.eat_punct(",") {
                        args.push(expr(state));
                    }
                }
                state.expect_punct(")");
                Expr::Call { name, args, pos }
            } else {
                Expr::Var { name, pos }
            }
        }
        TokenKind::Punct("(") => {
            state.advance();
            let inner = expr(state);
            state.expect_punct(")");
            inner
        }
        _ => {
            state
                .issues
                .push(SyntaxIssue::new(pos.line, pos.col, "expected expression"));
            state.advance();
            Expr::Num { value: 0, pos }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfront::lexer::lex;

    fn parse_ok(src: &str) -> Vec<Stmt> {
        parse(lex(src).unwrap()).unwrap()
    }

    #[test]
    fn func_header_produces_no_node() {
        let stmts = parse_ok("int main(void) { return 0; }");
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], Stmt::Nop));
        assert!(matches!(stmts[1], Stmt::Block { .. }));
    }

    #[test]
    fn while_and_assignment() {
        let stmts = parse_ok("int i = 0; while (i < 3) { i = i + 1; }");
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], Stmt::Decl { .. }));
        assert!(matches!(stmts[1], Stmt::While { .. }));
    }

    #[test]
    fn precedence_mul_over_add() {
        let stmts = parse_ok("int c = 1 + 2 * 3;");
        if let Stmt::Decl {
            init: Some(Expr::Binary { op, rhs, .. }),
            ..
        } = &stmts[0]
        {
            assert_eq!(*op, BinOp::Add);
            assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
        } else {
            panic!("unexpected AST shape");
        }
    }

    #[test]
    fn bad_assignment_target_reports_issue() {
        let tokens = lex("1 = 2;").unwrap();
        assert!(parse(tokens).is_err());
    }
}
