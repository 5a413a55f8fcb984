//! Code generator: walks the AST and emits AT&T/GAS text via a stack-machine
//! discipline. Owns its own `CodegenState` — the string
//! pool, source map, and label counter — kept separate from the parser's
//! `ParserState`.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::ast::{BinOp, Expr, Stmt};
use super::printf_stub::PRINTF_STUB;
use super::{CompileOutput, SourceMapEntry};
use crate::error::{Error, Result};

/// Insertion-ordered string pool, deduplicated by the *raw quoted* literal.
#[derive(Default)]
struct StringPool {
    order: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringPool {
    fn intern(&mut self, raw: &str) -> String {
        if let Some(&n) = self.index.get(raw) {
            return format!(".L.str.{n}");
        }
        let n = self.order.len();
        self.order.push(raw.to_string());
        self.index.insert(raw.to_string(), n);
        format!(".L.str.{n}")
    }
}

struct CodegenState {
    locals: HashMap<String, i64>,
    next_slot: i64,
    label_counter: u32,
    strings: StringPool,
    source_map: Vec<SourceMapEntry>,
    body: String,
}

impl CodegenState {
    fn new() -> Self {
        Self {
            locals: HashMap::new(),
            next_slot: 0,
            label_counter: 0,
            strings: StringPool::default(),
            source_map: Vec::new(),
            body: String::new(),
        }
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!(".L.{prefix}.{n}")
    }

    fn emit(&mut self, line: &str) {
        if line.ends_with(':') {
            writeln!(self.body, "{line}").unwrap();
        } else {
            writeln!(self.body, "    {line}").unwrap();
        }
    }

    /// Declaration-order local slot assignment, growing downward from
    /// `-8(%rbp)`. The same name seen twice reuses its original slot — this
    /// grammar has no nested scoping, so re-declaration is just reuse.
    fn declare(&mut self, name: &str) -> i64 {
        if let Some(&offset) = self.locals.get(name) {
            return offset;
        }
        self.next_slot -= 8;
        self.locals.insert(name.to_string(), self.next_slot);
        self.next_slot
    }

    fn offset_of(&self, name: &str) -> Result<i64> {
        self.locals
            .get(name)
            .copied()
            .ok_or_else(|| Error::HostUnsupported(format!("use of undeclared variable '{name}'")))
    }

    fn frame_size(&self) -> i64 {
        let raw = -self.next_slot;
        (raw + 15) & !15
    }
}

/// Pre-pass: walks the full statement tree and assigns a frame slot to
/// every declaration, in textual order, before any code is emitted. The
/// parser and lexer still make a single pass over the source; this is a
/// second pass purely over the already-built AST, the same shape chibicc-
/// style single-binary C compilers use to size the stack frame up front.
fn collect_decls(state: &mut CodegenState, stmts: &[Stmt]) {
    for stmt in stmts {
        match stmt {
            Stmt::Decl { name, .. } => {
                state.declare(name);
            }
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_decls(state, std::slice::from_ref(then_branch));
                if let Some(else_branch) = else_branch {
                    collect_decls(state, std::slice::from_ref(else_branch));
                }
            }
            Stmt::While { body, .. } => collect_decls(state, std::slice::from_ref(body)),
            Stmt::Block { stmts, .. } => collect_decls(state, stmts),
            Stmt::Return { .. } | Stmt::Expr { .. } | Stmt::Nop => {}
        }
    }
}

pub fn generate(program: &[Stmt]) -> Result<CompileOutput> {
    let mut state = CodegenState::new();
    collect_decls(&mut state, program);
    for stmt in program {
        gen_stmt(&mut state, stmt)?;
    }

    let frame_size = state.frame_size();
    let mut asm = String::new();
    writeln!(asm, ".text").unwrap();
    writeln!(asm, ".global _start").unwrap();
    writeln!(asm, "_start:").unwrap();
    writeln!(asm, "    pushq %rbp").unwrap();
    writeln!(asm, "    movq %rsp, %rbp").unwrap();
    if frame_size > 0 {
        writeln!(asm, "    subq ${frame_size}, %rsp").unwrap();
    }
    asm.push_str(&state.body);
    writeln!(asm, ".L.exit:").unwrap();
    writeln!(asm, "    movq %rbp, %rsp").unwrap();
    writeln!(asm, "    popq %rbp").unwrap();
    writeln!(asm, "    movq $60, %rax").unwrap();
    writeln!(asm, "    xorq %rdi, %rdi").unwrap();
    writeln!(asm, "    syscall").unwrap();
    asm.push_str(PRINTF_STUB);

    if !state.strings.order.is_empty() {
        writeln!(asm, ".data").unwrap();
        for (n, raw) in state.strings.order.iter().enumerate() {
            writeln!(asm, ".L.str.{n}:").unwrap();
            writeln!(asm, "    .ascii {raw}").unwrap();
        }
    }

    Ok(CompileOutput {
        assembly: asm,
        source_map: state.source_map,
    })
}

/// Emits one top-level statement, recording a source-map entry at a fresh
/// label placed immediately before its code.
fn gen_stmt(state: &mut CodegenState, stmt: &Stmt) -> Result<()> {
    let pos = stmt.pos();
    let label = state.fresh_label("stmt");
    state.emit(&format!("{label}:"));
    state.source_map.push(SourceMapEntry {
        label: label.clone(),
        line: pos.line,
        col: pos.col,
    });
    gen_stmt_body(state, stmt)
}

fn gen_stmt_body(state: &mut CodegenState, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::If {
            cond,
            then_branch,
            else_branch,
            ..
        } => {
            let else_label = state.fresh_label("else");
            let end_label = state.fresh_label("end");
            gen_expr(state, cond)?;
            state.emit("popq %rax");
            state.emit("cmpq $0, %rax");
            state.emit(&format!("je {else_label}"));
            gen_stmt_body(state, then_branch)?;
            state.emit(&format!("jmp {end_label}"));
            state.emit(&format!("{else_label}:"));
            if let Some(else_branch) = else_branch {
                gen_stmt_body(state, else_branch)?;
            }
            state.emit(&format!("{end_label}:"));
            Ok(())
        }
        Stmt::While { cond, body, .. } => {
            let begin_label = state.fresh_label("begin");
            let end_label = state.fresh_label("end");
            state.emit(&format!("{begin_label}:"));
            gen_expr(state, cond)?;
            state.emit("popq %rax");
            state.emit("cmpq $0, %rax");
            state.emit(&format!("je {end_label}"));
            gen_stmt_body(state, body)?;
            state.emit(&format!("jmp {begin_label}"));
            state.emit(&format!("{end_label}:"));
            Ok(())
        }
        Stmt::Block { stmts, .. } => {
            for inner in stmts {
                gen_stmt_body(state, inner)?;
            }
            Ok(())
        }
        Stmt::Decl { name, init, .. } => {
            let offset = state.declare(name);
            if let Some(init) = init {
                gen_expr(state, init)?;
                state.emit("popq %rax");
                state.emit(&format!("movq %rax, {offset}(%rbp)"));
            }
            Ok(())
        }
        Stmt::Return { value, .. } => {
            gen_expr(state, value)?;
            state.emit("popq %rax");
            state.emit("jmp .L.exit");
            Ok(())
        }
        Stmt::Expr { expr, .. } => {
            gen_expr(state, expr)?;
            state.emit("popq %rax");
            Ok(())
        }
        Stmt::Nop => Ok(()),
    }
}

/// Every expression leaves its result on top of the machine stack.
fn gen_expr(state: &mut CodegenState, expr: &Expr) -> Result<()> {
    match expr {
        Expr::Num { value, .. } => {
            state.emit(&format!("movq ${value}, %rax"));
            state.emit("pushq %rax");
            Ok(())
        }
        Expr::Str { raw, .. } => {
            let label = state.strings.intern(raw);
            state.emit(&format!("leaq {label}(%rip), %rax"));
            state.emit("pushq %rax");
            Ok(())
        }
        Expr::Var { name, .. } => {
            let offset = state.offset_of(name)?;
            state.emit(&format!("movq {offset}(%rbp), %rax"));
            state.emit("pushq %rax");
            Ok(())
        }
        Expr::Assign { name, value, .. } => {
            let offset = state.offset_of(name).or_else(|_| {
                // Declared implicitly by assignment is not valid C, but the
                // grammar allows `assign` on any identifier syntactically;
                // surface it the same way an undeclared read would.
                Err(Error::HostUnsupported(format!(
                    "assignment to undeclared variable '{name}'"
                )))
            })?;
            gen_expr(state, value)?;
            state.emit("popq %rax");
            state.emit(&format!("movq %rax, {offset}(%rbp)"));
            state.emit("pushq %rax");
            Ok(())
        }
        Expr::Binary { op, lhs, rhs, .. } => {
            gen_expr(state, lhs)?;
            gen_expr(state, rhs)?;
            state.emit("popq %rdi");
            state.emit("popq %rax");
            match op {
                BinOp::Add => state.emit("addq %rdi, %rax"),
                BinOp::Sub => state.emit("subq %rdi, %rax"),
                BinOp::Mul => state.emit("imulq %rdi, %rax"),
                BinOp::Div => {
                    state.emit("cqo");
                    state.emit("idivq %rdi");
                }
                BinOp::Eq => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("sete %al");
                    state.emit("movzbq %al, %rax");
                }
                BinOp::Ne => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("setne %al");
                    state.emit("movzbq %al, %rax");
                }
                BinOp::Lt => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("setl %al");
                    state.emit("movzbq %al, %rax");
                }
                BinOp::Le => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("setle %al");
                    state.emit("movzbq %al, %rax");
                }
                BinOp::Gt => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("setg %al");
                    state.emit("movzbq %al, %rax");
                }
                BinOp::Ge => {
                    state.emit("cmpq %rdi, %rax");
                    state.emit("setge %al");
                    state.emit("movzbq %al, %rax");
                }
            }
            state.emit("pushq %rax");
            Ok(())
        }
        Expr::Call { name, args, .. } => gen_call(state, name, args),
    }
}

/// Only `printf` is a supported callee; anything else is a
/// `Non-goals`-listed feature (no user function definitions exist to call).
fn gen_call(state: &mut CodegenState, name: &str, args: &[Expr]) -> Result<()> {
    if name != "printf" {
        return Err(Error::HostUnsupported(format!(
            "call to undefined function '{name}'"
        )));
    }
    match args {
        [fmt] => {
            gen_printf_arg_rdi(state, fmt)?;
            state.emit("xorq %rsi, %rsi");
        }
        [fmt, value] => {
            gen_expr(state, value)?;
            state.emit("popq %rsi");
            gen_printf_arg_rdi(state, fmt)?;
        }
        _ => {
            return Err(Error::HostUnsupported(
                "printf supports at most a format string and one integer argument".into(),
            ));
        }
    }
    state.emit("xorq %rax, %rax");
    state.emit("call __printf");
    state.emit("pushq %rax");
    Ok(())
}

fn gen_printf_arg_rdi(state: &mut CodegenState, fmt: &Expr) -> Result<()> {
    if let Expr::Str { raw, .. } = fmt {
        let label = state.strings.intern(raw);
        state.emit(&format!("leaq {label}(%rip), %rdi"));
        Ok(())
    } else {
        gen_expr(state, fmt)?;
        state.emit("popq %rdi");
        Ok(())
    }
}
