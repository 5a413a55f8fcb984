//! Ties the front ends, assembler, ELF writer, adapter, and emulator
//! together into the single `run()` entry point the host binary drives.

use std::time::Instant;

use log::warn;

use crate::adapter::Adapter;
use crate::asm::{self, AssembledProgram};
use crate::cfront;
use crate::elf;
use crate::emulator::{Emulator, Registers};
use crate::error::{Error, Result};

/// Which front end to run the source text through before assembling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Asm,
}

/// The general-purpose registers captured at stop, each formatted as a
/// lower-case `0x`-prefixed, zero-padded 16 hex digit string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub rax: String,
    pub rbx: String,
    pub rcx: String,
    pub rdx: String,
    pub rsi: String,
    pub rdi: String,
    pub rsp: String,
    pub rbp: String,
    pub rip: String,
}

fn hex(v: u64) -> String {
    format!("{v:#018x}")
}

impl RegisterSnapshot {
    fn from_registers(regs: &Registers) -> Self {
        Self {
            rax: hex(regs.gpr[crate::emulator::REG_RAX]),
            rbx: hex(regs.gpr[crate::emulator::REG_RBX]),
            rcx: hex(regs.gpr[crate::emulator::REG_RCX]),
            rdx: hex(regs.gpr[crate::emulator::REG_RDX]),
            rsi: hex(regs.gpr[crate::emulator::REG_RSI]),
            rdi: hex(regs.gpr[crate::emulator::REG_RDI]),
            rsp: hex(regs.gpr[crate::emulator::REG_RSP]),
            rbp: hex(regs.gpr[crate::emulator::REG_RBP]),
            rip: hex(regs.rip),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: u8,
    pub wall_ms: u64,
    pub instruction_count: u64,
    pub registers: RegisterSnapshot,
}

/// One resolved `(address, line, col)` triple, sorted by address, used to
/// annotate a guest fault with the source location that emitted the
/// faulting instruction.
struct ResolvedSourceMap(Vec<(u64, usize, usize)>);

impl ResolvedSourceMap {
    fn build(entries: &[cfront::SourceMapEntry], program: &AssembledProgram) -> Self {
        let mut resolved: Vec<(u64, usize, usize)> = entries
            .iter()
            .filter_map(|e| elf::resolve_va(program, &e.label).map(|va| (va, e.line, e.col)))
            .collect();
        resolved.sort_by_key(|(va, ..)| *va);
        Self(resolved)
    }

    /// Binary search for the entry with the greatest address `<= target`.
    fn lookup(&self, target: u64) -> Option<(usize, usize)> {
        match self.0.binary_search_by_key(&target, |(va, ..)| *va) {
            Ok(idx) => Some((self.0[idx].1, self.0[idx].2)),
            Err(0) => None,
            Err(idx) => Some((self.0[idx - 1].1, self.0[idx - 1].2)),
        }
    }
}

/// Drives one compile-assemble-link-execute cycle. Reused across runs: the
/// adapter's FD table and heap are reset at the start of every `run`.
pub struct Orchestrator {
    adapter: Adapter,
}

impl Orchestrator {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Requests that the next dispatched syscall short-circuit the guest
    /// to `exit(130)` instead of running to completion.
    pub fn request_stop(&mut self) {
        self.adapter.request_stop();
    }

    pub fn set_stdin(&mut self, bytes: Vec<u8>) {
        self.adapter.set_stdin(bytes);
    }

    /// Compiles/assembles `source`, links it, and runs it to completion
    /// using emulator backend `E`.
    pub fn run<E: Emulator>(&mut self, language: Language, source: &str) -> Result<RunResult> {
        self.adapter.reset();

        let (assembly, source_map) = match language {
            Language::C => {
                let out = cfront::compile(source)?;
                (out.assembly, out.source_map)
            }
            Language::Asm => (source.to_string(), Vec::new()),
        };

        let program = asm::assemble(&assembly)?;
        let image = elf::link(&program, "_start")?;

        let mut emulator = E::from_binary(&image)?;
        emulator.init_stack_program_start(&["/bin/program"], &["PATH=/bin"])?;

        let started = Instant::now();
        let outcome = emulator.run(&mut self.adapter);
        let wall_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(run_outcome) => Ok(RunResult {
                exit_code: run_outcome.exit_code,
                wall_ms,
                instruction_count: run_outcome.instruction_count,
                registers: RegisterSnapshot::from_registers(&run_outcome.registers),
            }),
            Err(Error::GuestFault {
                address,
                message,
                location,
            }) => {
                let resolved = location.or_else(|| {
                    ResolvedSourceMap::build(&source_map, &program).lookup(address)
                });
                warn!("run stopped by guest fault at {address:#018x}: {message}");
                Err(Error::GuestFault {
                    address,
                    message,
                    location: resolved,
                })
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::mock::MockEmulator;
    use crate::hostfs::FileStore;

    #[test]
    fn runs_asm_source_to_exit_code() {
        let adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut orch = Orchestrator::new(adapter);
        let result = orch
            .run::<MockEmulator>(Language::Asm, "_start:\n    movq $7, %rdi\n    movq $60, %rax\n    syscall\n")
            .unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[test]
    fn runs_c_source_and_reports_stdout() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let captured = Rc::new(RefCell::new(String::new()));
        let captured_clone = captured.clone();
        let adapter = Adapter::new(
            FileStore::new(),
            move |s: &str| captured_clone.borrow_mut().push_str(s),
            |_| {},
        );
        let mut orch = Orchestrator::new(adapter);
        let result = orch
            .run::<MockEmulator>(Language::C, "int main(void) { printf(\"hi %d\\n\", 5); return 0; }")
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(*captured.borrow(), "hi 5\n");
    }

    #[test]
    fn cancellation_forces_exit_130() {
        let adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut orch = Orchestrator::new(adapter);
        orch.request_stop();
        let result = orch
            .run::<MockEmulator>(Language::Asm, "_start:\n    movq $0, %rax\n    syscall\n")
            .unwrap();
        assert_eq!(result.exit_code, 130);
    }
}
