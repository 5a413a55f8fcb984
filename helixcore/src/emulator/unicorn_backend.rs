//! `Emulator` backed by `unicorn-engine`, the real execution path used
//! outside tests. Maps the loaded image at its fixed load address, a
//! guard-free flat stack below it, and tracks heap/mmap regions as
//! separately-mapped pages so `mem_resize_section`/`mem_init_zero_anywhere`
//! can grow or add regions without disturbing what is already mapped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use unicorn_engine::unicorn_const::{Arch, Mode, Permission};
use unicorn_engine::{RegisterX86, Unicorn};

use super::{Emulator, GuestMemory, HookOutcome, Registers, RunOutcome, SyscallHook};
use crate::error::{Error, Result};

const PAGE: u64 = 0x1000;
const IMAGE_BASE: u64 = 0x400000;
const STACK_BASE: u64 = 0x7fff_fffd_e000;
const STACK_SIZE: u64 = 0x20000;
const ANON_BASE: u64 = 0x7f00_0000_0000;

fn page_align_up(v: u64) -> u64 {
    (v + PAGE - 1) & !(PAGE - 1)
}

const GPR_REGS: [RegisterX86; 16] = [
    RegisterX86::RAX,
    RegisterX86::RCX,
    RegisterX86::RDX,
    RegisterX86::RBX,
    RegisterX86::RSP,
    RegisterX86::RBP,
    RegisterX86::RSI,
    RegisterX86::RDI,
    RegisterX86::R8,
    RegisterX86::R9,
    RegisterX86::R10,
    RegisterX86::R11,
    RegisterX86::R12,
    RegisterX86::R13,
    RegisterX86::R14,
    RegisterX86::R15,
];

/// State the syscall hook needs to mutate but cannot reach through `self`,
/// since unicorn's hook closure only captures what it's given at
/// installation time. Shared via `Rc<RefCell<_>>` with the owning
/// `UnicornEmulator`.
struct EmuState {
    named_regions: BTreeMap<String, (u64, u64)>,
    next_anon: u64,
    stop_code: Option<u8>,
}

fn resize_section(
    uc: &mut Unicorn<'_, ()>,
    state: &RefCell<EmuState>,
    name: &str,
    base: u64,
    new_len: usize,
) -> Result<()> {
    let new_len = new_len as u64;
    let (prev_base, prev_len) = state
        .borrow()
        .named_regions
        .get(name)
        .copied()
        .unwrap_or((base, 0));
    let prev_mapped = page_align_up(prev_len);
    let new_mapped = page_align_up(new_len);
    if prev_len == 0 {
        uc.mem_map(base, new_mapped.max(PAGE) as usize, Permission::READ | Permission::WRITE)
            .map_err(|e| Error::HostUnsupported(format!("mapping {name} failed: {e:?}")))?;
    } else if new_mapped > prev_mapped {
        uc.mem_map(
            prev_base + prev_mapped,
            (new_mapped - prev_mapped) as usize,
            Permission::READ | Permission::WRITE,
        )
        .map_err(|e| Error::HostUnsupported(format!("growing {name} failed: {e:?}")))?;
    }
    state
        .borrow_mut()
        .named_regions
        .insert(name.to_string(), (base, new_len));
    Ok(())
}

fn init_zero_anywhere(uc: &mut Unicorn<'_, ()>, state: &RefCell<EmuState>, len: usize) -> Result<u64> {
    let mapped = page_align_up(len as u64).max(PAGE);
    let addr = state.borrow().next_anon;
    uc.mem_map(addr, mapped as usize, Permission::READ | Permission::WRITE)
        .map_err(|e| Error::HostUnsupported(format!("anonymous mmap failed: {e:?}")))?;
    state.borrow_mut().next_anon += mapped;
    Ok(addr)
}

/// Translates Linux `PROT_*` bits (`READ`=1, `WRITE`=2, `EXEC`=4) into
/// unicorn's `Permission` flags.
fn to_permission(prot: u64) -> Permission {
    let mut perm = Permission::NONE;
    if prot & 0x1 != 0 {
        perm |= Permission::READ;
    }
    if prot & 0x2 != 0 {
        perm |= Permission::WRITE;
    }
    if prot & 0x4 != 0 {
        perm |= Permission::EXEC;
    }
    perm
}

fn set_protection(uc: &mut Unicorn<'_, ()>, addr: u64, len: usize, prot: u64) -> Result<()> {
    uc.mem_protect(addr, len, to_permission(prot))
        .map_err(|e| Error::HostUnsupported(format!("mem_protect failed: {e:?}")))
}

pub struct UnicornEmulator {
    uc: Unicorn<'static, ()>,
    image_len: u64,
    state: Rc<RefCell<EmuState>>,
}

impl GuestMemory for UnicornEmulator {
    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        self.uc.mem_read_as_vec(addr, len).unwrap_or_else(|_| vec![0; len])
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) {
        let _ = self.uc.mem_write(addr, bytes);
    }

    fn resize_section(&mut self, name: &str, base: u64, new_len: usize) -> Result<()> {
        resize_section(&mut self.uc, &self.state, name, base, new_len)
    }

    fn init_zero_anywhere(&mut self, len: usize) -> Result<u64> {
        init_zero_anywhere(&mut self.uc, &self.state, len)
    }

    fn mem_prot(&mut self, addr: u64, len: usize, prot: u64) -> Result<()> {
        set_protection(&mut self.uc, addr, len, prot)
    }
}

impl Emulator for UnicornEmulator {
    fn from_binary(elf_bytes: &[u8]) -> Result<Self> {
        let mut uc = Unicorn::new(Arch::X86, Mode::MODE_64)
            .map_err(|e| Error::HostUnsupported(format!("unicorn init failed: {e:?}")))?;

        let mapped_len = page_align_up(elf_bytes.len() as u64);
        uc.mem_map(IMAGE_BASE, mapped_len as usize, Permission::ALL)
            .map_err(|e| Error::HostUnsupported(format!("mapping image failed: {e:?}")))?;
        uc.mem_write(IMAGE_BASE, elf_bytes)
            .map_err(|e| Error::HostUnsupported(format!("loading image failed: {e:?}")))?;

        uc.mem_map(STACK_BASE, STACK_SIZE as usize, Permission::READ | Permission::WRITE)
            .map_err(|e| Error::HostUnsupported(format!("mapping stack failed: {e:?}")))?;

        let entry = u64::from_le_bytes(elf_bytes[24..32].try_into().unwrap());
        uc.reg_write(RegisterX86::RIP, entry)
            .map_err(|e| Error::HostUnsupported(format!("setting rip failed: {e:?}")))?;

        Ok(Self {
            uc,
            image_len: elf_bytes.len() as u64,
            state: Rc::new(RefCell::new(EmuState {
                named_regions: BTreeMap::new(),
                next_anon: ANON_BASE,
                stop_code: None,
            })),
        })
    }

    fn init_stack_program_start(&mut self, argv: &[&str], envp: &[&str]) -> Result<()> {
        let mut sp = STACK_BASE + STACK_SIZE - 0x1000;
        let mut argv_ptrs = Vec::new();
        for s in argv.iter().rev() {
            let bytes = s.as_bytes();
            sp -= bytes.len() as u64 + 1;
            self.write(sp, bytes);
            self.write(sp + bytes.len() as u64, &[0]);
            argv_ptrs.push(sp);
        }
        argv_ptrs.reverse();
        let mut envp_ptrs = Vec::new();
        for s in envp.iter().rev() {
            let bytes = s.as_bytes();
            sp -= bytes.len() as u64 + 1;
            self.write(sp, bytes);
            self.write(sp + bytes.len() as u64, &[0]);
            envp_ptrs.push(sp);
        }
        envp_ptrs.reverse();
        sp &= !0xf;

        let mut push = |emu: &mut Self, sp: &mut u64, v: u64| {
            *sp -= 8;
            emu.write(*sp, &v.to_le_bytes());
        };
        push(self, &mut sp, 0);
        push(self, &mut sp, 0); // AT_NULL
        push(self, &mut sp, 0); // envp terminator
        for p in envp_ptrs.iter().rev() {
            push(self, &mut sp, *p);
        }
        push(self, &mut sp, 0); // argv terminator
        for p in argv_ptrs.iter().rev() {
            push(self, &mut sp, *p);
        }
        push(self, &mut sp, argv_ptrs.len() as u64);

        self.uc
            .reg_write(RegisterX86::RSP, sp)
            .map_err(|e| Error::HostUnsupported(format!("setting rsp failed: {e:?}")))?;
        Ok(())
    }

    fn reg_read_64(&self, index: usize) -> u64 {
        self.uc.reg_read(GPR_REGS[index]).unwrap_or(0)
    }

    fn reg_write_64(&mut self, index: usize, value: u64) {
        let _ = self.uc.reg_write(GPR_REGS[index], value);
    }

    fn rip(&self) -> u64 {
        self.uc.reg_read(RegisterX86::RIP).unwrap_or(0)
    }

    fn mem_read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        self.read(addr, len)
    }

    fn mem_write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        self.write(addr, bytes)
    }

    fn mem_resize_section(&mut self, name: &str, base: u64, new_len: usize) -> Result<()> {
        GuestMemory::resize_section(self, name, base, new_len)
    }

    fn mem_init_zero_anywhere(&mut self, len: usize) -> Result<u64> {
        GuestMemory::init_zero_anywhere(self, len)
    }

    fn mem_prot(&mut self, addr: u64, len: usize, prot: u64) -> Result<()> {
        GuestMemory::mem_prot(self, addr, len, prot)
    }

    fn run(&mut self, hook: &mut dyn SyscallHook) -> Result<RunOutcome> {
        // unicorn_engine's hook closures must be `'static`, so `hook` (a
        // caller-owned `&mut dyn SyscallHook` scoped to this call) is
        // threaded through as a raw pointer. Safe because `run` never
        // returns while the hook is installed and reachable.
        let hook_ptr: *mut dyn SyscallHook = hook;
        let state_for_hook = self.state.clone();

        self.uc
            .add_insn_sys_hook(
                unicorn_engine::InsnSysX86::SYSCALL,
                1,
                0,
                move |uc: &mut Unicorn<'_, ()>, _user_data: &mut ()| {
                    let mut regs = Registers {
                        gpr: std::array::from_fn(|i| uc.reg_read(GPR_REGS[i]).unwrap_or(0)),
                        rip: uc.reg_read(RegisterX86::RIP).unwrap_or(0),
                    };

                    struct UcMem<'a, 'b> {
                        uc: &'a mut Unicorn<'b, ()>,
                        state: &'a Rc<RefCell<EmuState>>,
                    }
                    impl GuestMemory for UcMem<'_, '_> {
                        fn read(&self, addr: u64, len: usize) -> Vec<u8> {
                            self.uc.mem_read_as_vec(addr, len).unwrap_or_else(|_| vec![0; len])
                        }
                        fn write(&mut self, addr: u64, bytes: &[u8]) {
                            let _ = self.uc.mem_write(addr, bytes);
                        }
                        fn resize_section(&mut self, name: &str, base: u64, new_len: usize) -> Result<()> {
                            resize_section(self.uc, self.state, name, base, new_len)
                        }
                        fn init_zero_anywhere(&mut self, len: usize) -> Result<u64> {
                            init_zero_anywhere(self.uc, self.state, len)
                        }
                        fn mem_prot(&mut self, addr: u64, len: usize, prot: u64) -> Result<()> {
                            set_protection(self.uc, addr, len, prot)
                        }
                    }

                    let mut mem = UcMem {
                        uc,
                        state: &state_for_hook,
                    };
                    // SAFETY: `hook_ptr` points at the `&mut dyn SyscallHook`
                    // passed into the enclosing `run` call, which is still
                    // on the stack and not aliased elsewhere: unicorn runs
                    // this hook synchronously on the calling thread, only
                    // while `emu_start` below is executing.
                    let outcome = unsafe { (*hook_ptr).on_syscall(&mut regs, &mut mem) };
                    match outcome {
                        HookOutcome::Commit(value) => {
                            for (i, v) in regs.gpr.iter().enumerate() {
                                let _ = uc.reg_write(GPR_REGS[i], *v);
                            }
                            let _ = uc.reg_write(RegisterX86::RAX, value);
                        }
                        HookOutcome::Stop(code) => {
                            state_for_hook.borrow_mut().stop_code = Some(code);
                            let _ = uc.emu_stop();
                        }
                    }
                },
            )
            .map_err(|e| Error::HostUnsupported(format!("installing syscall hook failed: {e:?}")))?;

        self.uc
            .emu_start(self.rip(), 0, 0, 0)
            .map_err(|e| Error::GuestFault {
                address: self.rip(),
                message: format!("emulation fault: {e:?}"),
                location: None,
            })?;

        match self.state.borrow().stop_code {
            Some(code) => Ok(RunOutcome {
                exit_code: code,
                instruction_count: 0,
                registers: Registers {
                    gpr: std::array::from_fn(|i| self.reg_read_64(i)),
                    rip: self.rip(),
                },
            }),
            None => Err(Error::GuestFault {
                address: self.rip(),
                message: "emulation halted without an exit syscall".into(),
                location: None,
            }),
        }
    }
}
