//! Per-architecture register layouts.
//!
//! On an x86_64 host, `PTRACE_GETREGS`/`PTRACE_SETREGS` always return the
//! native `user_regs_struct`, whether the tracee itself is a 64-bit or a
//! 32-bit (ia32 compat) process — the kernel just places the ia32
//! register file into the low 32 bits of the corresponding 64-bit fields
//! (`ebx` into `rbx`, `eip` into `rip`, and so on). `RegisterSnapshot`
//! wraps that one representation and tags it with the mode that was
//! detected at the syscall boundary, so every accessor below dispatches
//! on the tag instead of the caller having to remember which field means
//! what under which ABI.

use libc::user_regs_struct;

/// Two recognized syscall-instruction encodings map to one mode each; a
/// third (the vsyscall back-jump) is also 32-bit but is resolved to the
/// underlying `sysenter` instruction before a snapshot is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureMode {
    X86_32,
    X86_64,
}

/// The two-byte encodings recognized at `IP - 2` when resyncing to a
/// syscall instruction. Values are the little-endian `u16` read starting
/// at the first of the two bytes, matching what a single `PTRACE_PEEKTEXT`
/// word-read yields in its low 16 bits.
pub mod insn {
    pub const INT80: u16 = 0x80cd; // CD 80
    pub const VSYSCALL_BACKJUMP: u16 = 0xf3eb; // EB F3
    pub const SYSENTER: u16 = 0x340f; // 0F 34
    pub const SYSCALL64: u16 = 0x050f; // 0F 05
}

/// A register snapshot tagged with the architecture mode it was read
/// under. Only meaningful for the duration of one engine operation —
/// never stashed away and reused across calls, since the tracee's
/// register file can move on as soon as it's released.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSnapshot {
    mode: ArchitectureMode,
    regs: user_regs_struct,
}

impl RegisterSnapshot {
    pub fn new(mode: ArchitectureMode, regs: user_regs_struct) -> Self {
        RegisterSnapshot { mode, regs }
    }

    pub fn mode(&self) -> ArchitectureMode {
        self.mode
    }

    pub fn raw(&self) -> user_regs_struct {
        self.regs
    }

    pub fn ip(&self) -> u64 {
        self.regs.rip
    }

    pub fn set_ip(&mut self, v: u64) {
        self.regs.rip = v;
    }

    pub fn sp(&self) -> u64 {
        self.regs.rsp
    }

    pub fn set_fp(&mut self, v: u64) {
        self.regs.rbp = v;
    }

    pub fn retval(&self) -> i64 {
        self.regs.rax as i64
    }

    /// Sets the syscall-number register and the first three argument
    /// registers per the calling convention of `self.mode()`: 64-bit
    /// uses rdi/rsi/rdx, 32-bit (ia32 compat, carried in the same
    /// struct) uses rbx/rcx/rdx.
    pub fn set_syscall(&mut self, nr: u64, a1: u64, a2: u64, a3: u64) {
        self.regs.orig_rax = nr;
        self.regs.rax = nr;
        match self.mode {
            ArchitectureMode::X86_64 => {
                self.regs.rdi = a1;
                self.regs.rsi = a2;
                self.regs.rdx = a3;
            }
            ArchitectureMode::X86_32 => {
                self.regs.rbx = a1;
                self.regs.rcx = a2;
                self.regs.rdx = a3;
            }
        }
    }
}
