//! HelixCore CLI
//!
//! Host-side driver: reads a C or ASM source file, runs it through
//! `helixcore::Orchestrator`, streams guest stdout/stderr to the real
//! terminal, and prints the run summary.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use helixcore::adapter::Adapter;
use helixcore::emulator::unicorn_backend::UnicornEmulator;
use helixcore::hostfs::FileStore;
use helixcore::orchestrator::Language as OrchLanguage;
use helixcore::Orchestrator;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Language {
    C,
    Asm,
}

impl From<Language> for OrchLanguage {
    fn from(lang: Language) -> Self {
        match lang {
            Language::C => OrchLanguage::C,
            Language::Asm => OrchLanguage::Asm,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "helixcore-cli")]
#[command(about = "Compiles/assembles and runs a HelixCore program")]
struct Args {
    /// Source language of the input file
    #[arg(long, value_enum)]
    lang: Language,

    /// Source file to compile/assemble and run
    source: PathBuf,

    /// Write the assembled ELF64 image to this path before running it
    #[arg(long)]
    dump_elf: Option<PathBuf>,

    /// Feed this file's bytes to the guest's fd 0 instead of an empty stream
    #[arg(long)]
    stdin_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let source = fs::read_to_string(&args.source)
        .with_context(|| format!("reading source file {}", args.source.display()))?;

    if let Some(dump_path) = &args.dump_elf {
        let assembly = match args.lang {
            Language::C => helixcore::cfront::compile(&source)?.assembly,
            Language::Asm => source.clone(),
        };
        let program = helixcore::asm::assemble(&assembly)?;
        let image = helixcore::elf::link(&program, "_start")?;
        fs::write(dump_path, &image)
            .with_context(|| format!("writing ELF image to {}", dump_path.display()))?;
        log::info!("wrote {} bytes to {}", image.len(), dump_path.display());
    }

    let adapter = Adapter::new(
        FileStore::new(),
        |s: &str| print!("{s}"),
        |s: &str| eprint!("{s}"),
    );
    let mut orchestrator = Orchestrator::new(adapter);

    if let Some(stdin_path) = &args.stdin_file {
        let bytes = fs::read(stdin_path)
            .with_context(|| format!("reading stdin file {}", stdin_path.display()))?;
        orchestrator.set_stdin(bytes);
    }

    let result = orchestrator.run::<UnicornEmulator>(args.lang.into(), &source)?;

    log::info!(
        "exit_code={} wall_ms={} instructions={} rip={}",
        result.exit_code,
        result.wall_ms,
        result.instruction_count,
        result.registers.rip,
    );

    std::process::exit(result.exit_code as i32);
}
