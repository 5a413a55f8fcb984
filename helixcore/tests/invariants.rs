//! Cross-cutting invariants, round-trips, and boundary behaviors that don't
//! belong to any single scenario: heap bookkeeping, FD allocation, ELF
//! bit-exactness, relocation math, source-map ordering, and the C/ASM
//! cross-path agreement the orchestrator's fault-resolution path depends on.

use std::cell::RefCell;
use std::rc::Rc;

use helixcore::adapter::Adapter;
use helixcore::asm;
use helixcore::elf;
use helixcore::emulator::mock::MockEmulator;
use helixcore::emulator::{GuestMemory, HookOutcome, Registers, SyscallHook};
use helixcore::hostfs::FileStore;
use helixcore::orchestrator::{Language, Orchestrator};

const HEAP_BASE: u64 = 0x800000;
const HEAP_CAP: u64 = 16 * 1024 * 1024;

struct FakeMem {
    bytes: std::collections::BTreeMap<u64, u8>,
}

impl FakeMem {
    fn new() -> Self {
        Self { bytes: std::collections::BTreeMap::new() }
    }
}

impl GuestMemory for FakeMem {
    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64).map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0)).collect()
    }
    fn write(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }
    fn resize_section(&mut self, _name: &str, _base: u64, _new_len: usize) -> helixcore::Result<()> {
        Ok(())
    }
    fn init_zero_anywhere(&mut self, _len: usize) -> helixcore::Result<u64> {
        Ok(0x7f0000000000)
    }
    fn mem_prot(&mut self, _addr: u64, _len: usize, _prot: u64) -> helixcore::Result<()> {
        Ok(())
    }
}

fn regs_with(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> Registers {
    let mut r = Registers::default();
    r.gpr[helixcore::emulator::REG_RAX] = rax;
    r.gpr[helixcore::emulator::REG_RDI] = rdi;
    r.gpr[helixcore::emulator::REG_RSI] = rsi;
    r.gpr[helixcore::emulator::REG_RDX] = rdx;
    r
}

#[test]
fn brk_zero_reports_heap_base_without_mapping() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    let mut regs = regs_with(12, 0, 0, 0);
    let outcome = adapter.on_syscall(&mut regs, &mut mem);
    assert_eq!(outcome, HookOutcome::Commit(HEAP_BASE));
}

#[test]
fn brk_at_current_break_is_a_no_op() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    let mut first = regs_with(12, HEAP_BASE, 0, 0);
    let outcome = adapter.on_syscall(&mut first, &mut mem);
    assert_eq!(outcome, HookOutcome::Commit(HEAP_BASE));
}

#[test]
fn brk_at_cap_boundary_is_rejected_one_byte_short_is_accepted() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();

    let mut at_cap = regs_with(12, HEAP_BASE + HEAP_CAP, 0, 0);
    let rejected = adapter.on_syscall(&mut at_cap, &mut mem);
    assert_eq!(rejected, HookOutcome::Commit(HEAP_BASE));

    let mut under_cap = regs_with(12, HEAP_BASE + HEAP_CAP - 1, 0, 0);
    let accepted = adapter.on_syscall(&mut under_cap, &mut mem);
    assert_eq!(accepted, HookOutcome::Commit(HEAP_BASE + HEAP_CAP - 1));
}

#[test]
fn open_on_missing_path_returns_negative_enoent() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    mem.write(0x2000, b"/nonexistent\0");
    let mut regs = regs_with(2, 0x2000, 0, 0);
    let outcome = adapter.on_syscall(&mut regs, &mut mem);
    assert_eq!(outcome, HookOutcome::Commit(0xFFFF_FFFF_FFFF_FFFE));
}

#[test]
fn read_on_closed_fd_returns_negative_ebadf() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    let mut close_regs = regs_with(3, 2, 0, 0);
    adapter.on_syscall(&mut close_regs, &mut mem);
    let mut read_regs = regs_with(0, 2, 0x3000, 8);
    let outcome = adapter.on_syscall(&mut read_regs, &mut mem);
    assert_eq!(outcome, HookOutcome::Commit(0xFFFF_FFFF_FFFF_FFF7));
}

#[test]
fn unknown_syscall_reports_negative_enosys() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    let mut regs = regs_with(999, 0, 0, 0);
    let outcome = adapter.on_syscall(&mut regs, &mut mem);
    assert_eq!(outcome, HookOutcome::Commit(0xFFFF_FFFF_FFFF_FFDA));
}

#[test]
fn fd_allocation_is_monotonic_and_never_reused() {
    let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
    let mut mem = FakeMem::new();
    mem.write(0x4000, b"/etc/hostname\0");

    let mut open_a = regs_with(2, 0x4000, 0, 0);
    let fd_a = adapter.on_syscall(&mut open_a, &mut mem);
    let HookOutcome::Commit(fd_a) = fd_a else { panic!("expected commit") };
    assert_eq!(fd_a, 3);

    let mut close_a = regs_with(3, fd_a, 0, 0);
    adapter.on_syscall(&mut close_a, &mut mem);

    let mut open_b = regs_with(2, 0x4000, 0, 0);
    let fd_b = adapter.on_syscall(&mut open_b, &mut mem);
    let HookOutcome::Commit(fd_b) = fd_b else { panic!("expected commit") };
    assert_eq!(fd_b, 4, "a closed fd must never be handed back out");
}

#[test]
fn elf_image_is_bit_exact_et_exec() {
    let prog = asm::assemble("_start:\n    movq $60, %rax\n    movq $0, %rdi\n    syscall\n").unwrap();
    let image = elf::link(&prog, "_start").unwrap();

    assert_eq!(&image[0..4], &[0x7f, 0x45, 0x4c, 0x46], "ELF magic");
    assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2, "e_type must be ET_EXEC");
    assert_eq!(u16::from_le_bytes([image[18], image[19]]), 0x3e, "e_machine must be EM_X86_64");

    let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
    assert!((0x400000..0x500000).contains(&entry), "entry point must land inside the mapped image");
    assert_eq!(image.len(), 120 + prog.text.len() + prog.data.len());
}

#[test]
fn relocation_patch_value_matches_target_minus_source_formula() {
    let prog = asm::assemble(
        ".text\n_start:\n    leaq .L.str.0(%rip), %rsi\n    movq $60, %rax\n    movq $0, %rdi\n    syscall\n.data\n.L.str.0:\n    .asciz \"hi\"\n",
    )
    .unwrap();
    let image = elf::link(&prog, "_start").unwrap();

    let data_va = elf::resolve_va(&prog, ".L.str.0").unwrap();
    let text_len = prog.text.len();
    // leaq encodes rel32 at text offset (instruction length - 4); search the
    // patched bytes for the little-endian displacement that, added to the
    // address of the byte after it, reproduces the resolved data address.
    let text_bytes = &image[120..120 + text_len];
    let mut found = false;
    for window_start in 0..text_bytes.len().saturating_sub(4) {
        let disp = i32::from_le_bytes(text_bytes[window_start..window_start + 4].try_into().unwrap());
        let rip_after = 0x400078u64 + (window_start as u64) + 4;
        if (rip_after as i64 + disp as i64) as u64 == data_va {
            found = true;
            break;
        }
    }
    assert!(found, "no rel32 displacement in .text resolves to the interned string's address");
}

#[test]
fn c_source_map_entries_resolve_in_nondecreasing_address_order() {
    let output = helixcore::cfront::compile(
        "int main(){int i=0;while(i<3){printf(\"%d\\n\",i);i=i+1;}return 0;}",
    )
    .unwrap();
    let program = asm::assemble(&output.assembly).unwrap();

    let vas: Vec<u64> = output
        .source_map
        .iter()
        .filter_map(|e| elf::resolve_va(&program, &e.label))
        .collect();
    assert!(!vas.is_empty(), "a multi-statement program must produce source map entries");
    assert!(vas.windows(2).all(|w| w[0] <= w[1]), "source map entries must resolve in nondecreasing address order");
}

#[test]
fn c_frontend_assembly_always_reassembles() {
    let programs = [
        "int main(){int a=1;return 0;}",
        "int main(){int a=1;int b=2;if(a<b)printf(\"y\\n\");return 0;}",
        "int main(){int i=0;while(i<5){i=i+1;}return 0;}",
        "int main(){printf(\"%d\\n\", 0-3);return 0;}",
    ];
    for source in programs {
        let output = helixcore::cfront::compile(source).unwrap();
        asm::assemble(&output.assembly)
            .unwrap_or_else(|e| panic!("assembly emitted for {source:?} failed to reassemble: {e}"));
    }
}

#[test]
fn write_then_sink_concatenation_is_byte_exact() {
    let captured = Rc::new(RefCell::new(Vec::<u8>::new()));
    let captured_clone = captured.clone();
    let mut adapter = Adapter::new(
        FileStore::new(),
        move |s: &str| captured_clone.borrow_mut().extend_from_slice(s.as_bytes()),
        |_| {},
    );
    let mut mem = FakeMem::new();
    mem.write(0x5000, b"abc");
    let mut first = regs_with(1, 1, 0x5000, 3);
    adapter.on_syscall(&mut first, &mut mem);
    mem.write(0x5100, b"def");
    let mut second = regs_with(1, 1, 0x5100, 3);
    adapter.on_syscall(&mut second, &mut mem);
    assert_eq!(*captured.borrow(), b"abcdef");
}

#[test]
fn c_and_asm_paths_produce_identical_exit_code_and_stdout() {
    let c_source = "int main(){int a=6;int b=7;printf(\"%d\\n\",a*b);return 0;}";

    let run_once = |language: Language, source: &str| {
        let stdout = Rc::new(RefCell::new(String::new()));
        let stdout_clone = stdout.clone();
        let adapter = Adapter::new(FileStore::new(), move |s: &str| stdout_clone.borrow_mut().push_str(s), |_| {});
        let mut orch = Orchestrator::new(adapter);
        let result = orch.run::<MockEmulator>(language, source).unwrap();
        (result.exit_code, stdout.borrow().clone())
    };

    let (c_exit, c_stdout) = run_once(Language::C, c_source);
    let assembly = helixcore::cfront::compile(c_source).unwrap().assembly;
    let (asm_exit, asm_stdout) = run_once(Language::Asm, &assembly);

    assert_eq!(c_exit, asm_exit);
    assert_eq!(c_stdout, asm_stdout);
}
