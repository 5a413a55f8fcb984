//! HelixCore: a C-subset compiler, AT&T/GAS assembler, static ELF64 linker,
//! and Linux user-mode x86-64 emulator adapter, wired together behind one
//! `Orchestrator::run` entry point.

pub mod adapter;
pub mod asm;
pub mod cfront;
pub mod elf;
pub mod emulator;
pub mod error;
pub mod hostfs;
pub mod orchestrator;

pub use adapter::Adapter;
pub use error::{Error, Result, SyntaxIssue};
pub use orchestrator::{Language, Orchestrator, RegisterSnapshot, RunResult};
