//! Emulator host adapter: the syscall hook the orchestrator installs before
//! driving a guest program. Owns the FD table, the heap/program-break state
//! machine, and the stdout/stderr sinks; resets all of it at the start of
//! every `run()`.

use std::collections::BTreeMap;

use log::trace;

use crate::emulator::{
    GuestMemory, HookOutcome, Registers, SyscallHook, REG_RAX, REG_RDI, REG_RDX, REG_RSI,
};
use crate::hostfs::FileStore;

const HEAP_BASE: u64 = 0x800000;
const HEAP_CAP: u64 = 16 * 1024 * 1024;
const HEAP_PAGE: u64 = 4096;
const MAP_ANONYMOUS: u64 = 0x20;
const CANCEL_EXIT_CODE: u8 = 130;

const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;
const SYS_OPEN: u64 = 2;
const SYS_CLOSE: u64 = 3;
const SYS_STAT: u64 = 4;
const SYS_FSTAT: u64 = 5;
const SYS_MMAP: u64 = 9;
const SYS_BRK: u64 = 12;
const SYS_EXIT: u64 = 60;
const SYS_EXIT_GROUP: u64 = 231;

const EIO: i64 = 5;
const ENOENT: i64 = 2;
const EBADF: i64 = 9;
const EINVAL: i64 = 22;
const ENOSYS: i64 = 38;

fn neg_errno(errno: i64) -> u64 {
    (-errno) as u64
}

#[derive(Debug, Clone)]
enum FdKind {
    Stdin,
    Stdout,
    Stderr,
    File { path: String },
}

struct FdEntry {
    kind: FdKind,
    offset: usize,
}

/// Syscall dispatch table plus the state it's closed over: FD table, heap
/// break, and the stdout/stderr sinks. One instance is reused across runs;
/// `reset` re-initializes everything `run()` is documented to reset.
pub struct Adapter {
    files: FileStore,
    stdin: Vec<u8>,
    fds: BTreeMap<i64, FdEntry>,
    next_fd: i64,
    program_break: u64,
    heap_mapped: bool,
    stop_requested: bool,
    on_stdout: Box<dyn FnMut(&str)>,
    on_stderr: Box<dyn FnMut(&str)>,
}

impl Adapter {
    pub fn new(
        files: FileStore,
        on_stdout: impl FnMut(&str) + 'static,
        on_stderr: impl FnMut(&str) + 'static,
    ) -> Self {
        let mut adapter = Self {
            files,
            stdin: Vec::new(),
            fds: BTreeMap::new(),
            next_fd: 3,
            program_break: HEAP_BASE,
            heap_mapped: false,
            stop_requested: false,
            on_stdout: Box::new(on_stdout),
            on_stderr: Box::new(on_stderr),
        };
        adapter.reset();
        adapter
    }

    /// Feeds `bytes` to the guest's fd 0 for the next run.
    pub fn set_stdin(&mut self, bytes: Vec<u8>) {
        self.stdin = bytes;
    }

    /// Re-installs descriptors 0/1/2, clears every other FD, and resets the
    /// heap state. Called once per `run()` entry.
    pub fn reset(&mut self) {
        self.fds.clear();
        self.fds.insert(0, FdEntry { kind: FdKind::Stdin, offset: 0 });
        self.fds.insert(1, FdEntry { kind: FdKind::Stdout, offset: 0 });
        self.fds.insert(2, FdEntry { kind: FdKind::Stderr, offset: 0 });
        self.next_fd = 3;
        self.program_break = HEAP_BASE;
        self.heap_mapped = false;
    }

    /// Causes the next dispatched syscall to short-circuit to `exit(130)`
    /// regardless of which syscall it is.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn alloc_fd(&mut self, kind: FdKind) -> i64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, FdEntry { kind, offset: 0 });
        fd
    }

    fn do_read(&mut self, fd: i64, buf: u64, len: usize, mem: &mut dyn GuestMemory) -> u64 {
        let Some(entry) = self.fds.get_mut(&fd) else {
            return neg_errno(EBADF);
        };
        match &entry.kind {
            FdKind::Stdin => {
                let start = entry.offset.min(self.stdin.len());
                let end = (start + len).min(self.stdin.len());
                let slice = self.stdin[start..end].to_vec();
                entry.offset = end;
                mem.write(buf, &slice);
                slice.len() as u64
            }
            FdKind::Stdout | FdKind::Stderr => neg_errno(EBADF),
            FdKind::File { path } => {
                let path = path.clone();
                let Some(contents) = self.files.read(&path) else {
                    return neg_errno(EIO);
                };
                let start = entry.offset.min(contents.len());
                let end = (start + len).min(contents.len());
                let slice = contents[start..end].to_vec();
                entry.offset = end;
                mem.write(buf, &slice);
                slice.len() as u64
            }
        }
    }

    fn do_write(&mut self, fd: i64, buf: u64, len: usize, mem: &mut dyn GuestMemory) -> u64 {
        let Some(entry) = self.fds.get_mut(&fd) else {
            return neg_errno(EBADF);
        };
        let bytes = mem.read(buf, len);
        match &entry.kind {
            FdKind::Stdout => {
                (self.on_stdout)(&String::from_utf8_lossy(&bytes));
                len as u64
            }
            FdKind::Stderr => {
                (self.on_stderr)(&String::from_utf8_lossy(&bytes));
                len as u64
            }
            FdKind::Stdin => neg_errno(EBADF),
            FdKind::File { path } => {
                let path = path.clone();
                let n = self.files.write_at(&path, entry.offset, &bytes);
                entry.offset += n;
                n as u64
            }
        }
    }

    fn do_open(&mut self, path_ptr: u64, mem: &dyn GuestMemory) -> u64 {
        let path = read_cstring(mem, path_ptr);
        if self.files.read(&path).is_none() {
            return neg_errno(ENOENT);
        }
        self.alloc_fd(FdKind::File { path }) as u64
    }

    fn do_close(&mut self, fd: i64) -> u64 {
        if self.fds.remove(&fd).is_some() {
            0
        } else {
            neg_errno(EBADF)
        }
    }

    fn write_stat_buf(&self, size: usize, buf: u64, mem: &mut dyn GuestMemory) -> u64 {
        mem.write(buf + 16, &0o100755u32.to_le_bytes());
        mem.write(buf + 48, &(size as u64).to_le_bytes());
        0
    }

    fn do_stat(&self, path_ptr: u64, buf: u64, mem: &mut dyn GuestMemory) -> u64 {
        let path = read_cstring(mem, path_ptr);
        match self.files.size(&path) {
            Some(size) => self.write_stat_buf(size, buf, mem),
            None => neg_errno(ENOENT),
        }
    }

    fn do_fstat(&self, fd: i64, buf: u64, mem: &mut dyn GuestMemory) -> u64 {
        match self.fds.get(&fd).map(|e| e.kind.clone()) {
            Some(FdKind::File { path }) => match self.files.size(&path) {
                Some(size) => self.write_stat_buf(size, buf, mem),
                None => neg_errno(ENOENT),
            },
            Some(_) | None => neg_errno(EBADF),
        }
    }

    fn do_mmap(&self, len: usize, prot: u64, flags: u64, mem: &mut dyn GuestMemory) -> u64 {
        if flags & MAP_ANONYMOUS == 0 {
            return neg_errno(EINVAL);
        }
        match mem.init_zero_anywhere(len) {
            Ok(addr) => {
                let _ = mem.mem_prot(addr, len, prot);
                addr
            }
            Err(_) => neg_errno(EINVAL),
        }
    }

    fn do_brk(&mut self, addr: u64, mem: &mut dyn GuestMemory) -> u64 {
        if addr == 0 {
            return self.program_break;
        }
        if addr < HEAP_BASE || addr >= HEAP_BASE + HEAP_CAP {
            return self.program_break;
        }
        let covered = (addr - HEAP_BASE).div_ceil(HEAP_PAGE) * HEAP_PAGE;
        if mem.resize_section("heap", HEAP_BASE, covered as usize).is_err() {
            return self.program_break;
        }
        self.heap_mapped = true;
        self.program_break = addr;
        self.program_break
    }
}

fn read_cstring(mem: &dyn GuestMemory, ptr: u64) -> String {
    let mut bytes = Vec::new();
    let mut addr = ptr;
    loop {
        let chunk = mem.read(addr, 1);
        match chunk.first() {
            None | Some(0) => break,
            Some(b) => bytes.push(*b),
        }
        addr += 1;
        if bytes.len() > 4096 {
            break;
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

impl SyscallHook for Adapter {
    fn on_syscall(&mut self, regs: &mut Registers, mem: &mut dyn GuestMemory) -> HookOutcome {
        if self.stop_requested {
            return HookOutcome::Stop(CANCEL_EXIT_CODE);
        }

        let number = regs.gpr[REG_RAX];
        trace!("syscall dispatch: rax={number}");

        let result = match number {
            SYS_READ => {
                let fd = regs.gpr[REG_RDI] as i64;
                let buf = regs.gpr[REG_RSI];
                let len = regs.gpr[REG_RDX] as usize;
                self.do_read(fd, buf, len, mem)
            }
            SYS_WRITE => {
                let fd = regs.gpr[REG_RDI] as i64;
                let buf = regs.gpr[REG_RSI];
                let len = regs.gpr[REG_RDX] as usize;
                self.do_write(fd, buf, len, mem)
            }
            SYS_OPEN => self.do_open(regs.gpr[REG_RDI], mem),
            SYS_CLOSE => self.do_close(regs.gpr[REG_RDI] as i64),
            SYS_STAT => self.do_stat(regs.gpr[REG_RDI], regs.gpr[REG_RSI], mem),
            SYS_FSTAT => self.do_fstat(regs.gpr[REG_RDI] as i64, regs.gpr[REG_RSI], mem),
            SYS_MMAP => {
                let len = regs.gpr[REG_RSI] as usize;
                let prot = regs.gpr[REG_RDX];
                let flags = regs.gpr[10];
                self.do_mmap(len, prot, flags, mem)
            }
            SYS_BRK => self.do_brk(regs.gpr[REG_RDI], mem),
            SYS_EXIT | SYS_EXIT_GROUP => {
                let code = (regs.gpr[REG_RDI] & 0xff) as u8;
                return HookOutcome::Stop(code);
            }
            _ => neg_errno(ENOSYS),
        };
        HookOutcome::Commit(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct FakeMem {
        bytes: BTreeMap<u64, u8>,
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
        fn resize_section(&mut self, _name: &str, _base: u64, _new_len: usize) -> crate::error::Result<()> {
            Ok(())
        }
        fn init_zero_anywhere(&mut self, _len: usize) -> crate::error::Result<u64> {
            Ok(0x7f0000000000)
        }
        fn mem_prot(&mut self, _addr: u64, _len: usize, _prot: u64) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn regs_with(rax: u64, rdi: u64, rsi: u64, rdx: u64) -> Registers {
        let mut r = Registers::default();
        r.gpr[REG_RAX] = rax;
        r.gpr[REG_RDI] = rdi;
        r.gpr[REG_RSI] = rsi;
        r.gpr[REG_RDX] = rdx;
        r
    }

    #[test]
    fn exit_stops_with_masked_code() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(60, 300, 0, 0);
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Stop((300u64 & 0xff) as u8));
    }

    #[test]
    fn write_to_stdout_invokes_sink_with_exact_bytes() {
        let captured = Rc::new(RefCell::new(String::new()));
        let captured_clone = captured.clone();
        let mut adapter = Adapter::new(FileStore::new(), move |s: &str| captured_clone.borrow_mut().push_str(s), |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        mem.write(0x1000, b"hi\n");
        let mut regs = regs_with(1, 1, 0x1000, 3);
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Commit(3));
        assert_eq!(*captured.borrow(), "hi\n");
    }

    #[test]
    fn read_from_unknown_fd_is_ebadf() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(0, 9, 0x1000, 8);
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Commit(neg_errno(EBADF)));
    }

    #[test]
    fn unknown_syscall_returns_enosys() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(999, 0, 0, 0);
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Commit(neg_errno(ENOSYS)));
    }

    #[test]
    fn brk_grows_program_break_within_cap() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(12, 0, 0, 0);
        let current = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(current, HookOutcome::Commit(HEAP_BASE));

        let mut grow_regs = regs_with(12, HEAP_BASE + 8192, 0, 0);
        let grown = adapter.on_syscall(&mut grow_regs, &mut mem);
        assert_eq!(grown, HookOutcome::Commit(HEAP_BASE + 8192));

        let mut out_of_range = regs_with(12, HEAP_BASE + HEAP_CAP + 1, 0, 0);
        let unchanged = adapter.on_syscall(&mut out_of_range, &mut mem);
        assert_eq!(unchanged, HookOutcome::Commit(HEAP_BASE + 8192));
    }

    #[test]
    fn mmap_forwards_prot_and_returns_mapped_address() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(9, 0, 4096, 0x3); // SYS_MMAP, len=4096, prot=RW
        regs.gpr[10] = MAP_ANONYMOUS;
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Commit(0x7f0000000000));
    }

    #[test]
    fn request_stop_short_circuits_next_syscall() {
        let mut adapter = Adapter::new(FileStore::new(), |_| {}, |_| {});
        adapter.request_stop();
        let mut mem = FakeMem { bytes: BTreeMap::new() };
        let mut regs = regs_with(0, 0, 0, 0);
        let outcome = adapter.on_syscall(&mut regs, &mut mem);
        assert_eq!(outcome, HookOutcome::Stop(130));
    }
}
