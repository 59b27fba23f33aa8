//! The tracee control engine (TCE).
//!
//! Attaches to a running process via `ptrace`, injects system calls by
//! rewinding the instruction pointer onto a syscall instruction the
//! target already executed and single-stepping over it, and restores
//! the target's register file so execution resumes as though nothing
//! happened. `mytrace.c`'s `remote_syscall` does exactly this; so does
//! wangbj-systrace's `remote_do_syscall_at` (`src/traced_task.rs`),
//! though the latter targets a fixed trampoline page instead of
//! resyncing to wherever the tracee happened to stop.

use std::cell::Cell;
use std::mem::size_of;

use log::{debug, trace};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::arch::{insn, ArchitectureMode, RegisterSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::staging::StagingBuffer;
use crate::syscall_table::{abi_number, SyscallTag};

const WORD_SIZE: usize = size_of::<i64>();

/// Exclusive debugging ownership of one live process. Move-only:
/// dropping it releases the kernel debugging slot.
pub struct TraceeHandle {
    pid: Pid,
    child_pid: Cell<Option<Pid>>,
    detached: Cell<bool>,
}

impl std::fmt::Debug for TraceeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TraceeHandle {{ pid: {} }}", self.pid)
    }
}

impl TraceeHandle {
    /// Acquires kernel debugging ownership of `pid` and waits for it to
    /// stop. Releases ownership before returning if the post-attach wait
    /// does not report a stop.
    pub fn attach(pid: i32) -> EngineResult<TraceeHandle> {
        let target = Pid::from_raw(pid);
        ptrace::attach(target).map_err(|source| EngineError::AttachDenied { pid, source })?;

        match waitpid(target, None) {
            Ok(WaitStatus::Stopped(_, _)) => {
                debug!("attached to pid {pid}, target stopped");
                Ok(TraceeHandle {
                    pid: target,
                    child_pid: Cell::new(None),
                    detached: Cell::new(false),
                })
            }
            other => {
                let _ = ptrace::detach(target, None);
                Err(EngineError::WaitFailed {
                    pid,
                    detail: format!("{other:?}"),
                })
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// The most recently observed child produced by `fork_tracee`, if any.
    pub fn last_child_pid(&self) -> Option<i32> {
        self.child_pid.get().map(Pid::as_raw)
    }

    /// Releases kernel debugging ownership. Always "succeeds" from the
    /// caller's perspective — there is no meaningful recovery if the
    /// kernel-side release itself fails.
    pub fn detach(self) {
        // Drop does the work; this just gives callers an explicit name.
    }

    fn do_detach(&self) {
        if !self.detached.replace(true) {
            let _ = ptrace::detach(self.pid, None);
        }
    }

    // ---- cross-address-space memory -------------------------------------

    /// Reads `n` bytes starting at `remote_addr`, which need not be
    /// word-aligned, via word-granularity `PTRACE_PEEKTEXT`.
    pub fn read_target(&self, remote_addr: u64, n: usize) -> EngineResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        let mut addr = remote_addr;
        let mut remaining = n;
        while remaining > 0 {
            let aligned = addr & !(WORD_SIZE as u64 - 1);
            let word = peek_word(self.pid, aligned)?;
            let bytes = word.to_ne_bytes();
            let skip = (addr - aligned) as usize;
            let take = (WORD_SIZE - skip).min(remaining);
            out.extend_from_slice(&bytes[skip..skip + take]);
            addr += take as u64;
            remaining -= take;
        }
        Ok(out)
    }

    /// Writes `bytes` at `remote_addr` (need not be word-aligned) via
    /// read-modify-write on whole words so partial-word writes never
    /// clobber adjacent bytes.
    pub fn write_target(&self, remote_addr: u64, bytes: &[u8]) -> EngineResult<()> {
        let mut addr = remote_addr;
        let mut offset = 0usize;
        while offset < bytes.len() {
            let aligned = addr & !(WORD_SIZE as u64 - 1);
            let skip = (addr - aligned) as usize;
            let take = (WORD_SIZE - skip).min(bytes.len() - offset);

            let mut word_bytes = if skip == 0 && take == WORD_SIZE {
                [0u8; WORD_SIZE]
            } else {
                peek_word(self.pid, aligned)?.to_ne_bytes()
            };
            word_bytes[skip..skip + take].copy_from_slice(&bytes[offset..offset + take]);
            poke_word(self.pid, aligned, i64::from_ne_bytes(word_bytes))?;

            addr += take as u64;
            offset += take;
        }
        Ok(())
    }

    // ---- remote syscall injection ----------------------------------------

    /// Causes the target to execute one system call and returns its
    /// result, or `Err(RemoteErrno(n))` if the kernel returned a negative
    /// (errno) value. `Ok(0)` with the handle otherwise unaffected also
    /// covers the case where the target hit an exec or exit event mid-call
    /// instead of completing it normally — callers distinguish by the
    /// handle's subsequent behavior, never by inspecting this return
    /// value alone.
    pub fn remote_syscall(&self, tag: SyscallTag, a1: i64, a2: i64, a3: i64) -> EngineResult<i64> {
        trace!("remote syscall {tag:?}({a1:#x}, {a2:#x}, {a3:#x}) on pid {}", self.pid);

        let (mode, mut snapshot, offset, is_vsyscall) = self.resync_to_syscall()?;
        let saved = snapshot.raw();

        if is_vsyscall {
            // the trampoline calling convention requires this; the
            // rationale isn't documented upstream, but mytrace.c does
            // the same thing and the behavior is preserved here.
            snapshot.set_fp(snapshot.sp());
        }
        snapshot.set_ip(snapshot.ip() - offset as u64);
        let nr = abi_number(mode, tag) as u64;
        snapshot.set_syscall(nr, a1 as u64, a2 as u64, a3 as u64);

        setregs(self.pid, snapshot.raw())?;

        loop {
            step(self.pid, None)?;
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, _)) => {
                    debug!("pid {} exited during remote syscall", self.pid);
                    return Ok(0);
                }
                Ok(WaitStatus::PtraceEvent(_, _, event))
                    if event == ptrace::Event::PTRACE_EVENT_FORK as i32 =>
                {
                    let child = ptrace::getevent(self.pid).map_err(EngineError::from)?;
                    self.child_pid.set(Some(Pid::from_raw(child as i32)));
                    debug!("fork event, child pid {child}");
                    continue;
                }
                Ok(WaitStatus::PtraceEvent(_, _, event))
                    if event == ptrace::Event::PTRACE_EVENT_EXEC as i32
                        || event == ptrace::Event::PTRACE_EVENT_EXIT as i32 =>
                {
                    debug!("exec/exit event, remote syscall result is moot");
                    return Ok(0);
                }
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => break,
                Ok(other) => {
                    trace!("unhandled stop {other:?}, continuing single-step loop");
                    continue;
                }
                Err(e) => return Err(EngineError::from(e)),
            }
        }

        let newregs = getregs(self.pid)?;
        let ret = newregs.rax as i64;
        if ret as u64 > (-4096i64) as u64 {
            let errno = -(ret) as i32;
            setregs(self.pid, saved)?;
            Err(EngineError::RemoteErrno(errno))
        } else {
            setregs(self.pid, saved)?;
            Ok(ret)
        }
    }

    /// Resyncs to a point immediately after a recognized syscall
    /// instruction, returning the detected mode, the register snapshot
    /// at that point, the byte offset from
    /// `ip` back onto the syscall instruction itself, and whether the
    /// vsyscall back-jump (and therefore the `sysenter` rewind below)
    /// was the encoding that matched.
    fn resync_to_syscall(&self) -> EngineResult<(ArchitectureMode, RegisterSnapshot, i64, bool)> {
        loop {
            let regs = getregs(self.pid)?;
            let prefix = peek_word(self.pid, regs.rip - 2)? as u64 & 0xffff;

            if prefix as u16 == insn::SYSCALL64 {
                return Ok((
                    ArchitectureMode::X86_64,
                    RegisterSnapshot::new(ArchitectureMode::X86_64, regs),
                    2,
                    false,
                ));
            }
            if prefix as u16 == insn::INT80 {
                return Ok((
                    ArchitectureMode::X86_32,
                    RegisterSnapshot::new(ArchitectureMode::X86_32, regs),
                    2,
                    false,
                ));
            }
            if prefix as u16 == insn::VSYSCALL_BACKJUMP {
                // Scan backward byte by byte (not word by word) for the
                // `sysenter` encoding: the trampoline's instruction
                // boundaries aren't guaranteed to land on even offsets
                // from the back-jump, so each candidate window must
                // overlap the previous one by one byte, matching
                // mytrace.c's `offset++` (not `offset += 2`) loop.
                let mut offset: i64 = 2;
                loop {
                    let candidate = peek_word(self.pid, regs.rip as u64 - offset as u64)? as u64
                        & 0xffff;
                    if candidate as u16 == insn::SYSENTER {
                        break;
                    }
                    offset += 1;
                }
                return Ok((
                    ArchitectureMode::X86_32,
                    RegisterSnapshot::new(ArchitectureMode::X86_32, regs),
                    offset,
                    true,
                ));
            }

            // Not positioned after a recognized syscall instruction yet:
            // run to the next syscall-stop (entry, then exit) so the
            // target lands immediately after one.
            ptrace::syscall(self.pid, None).map_err(EngineError::from)?;
            waitpid(self.pid, None).map_err(EngineError::from)?;
            ptrace::syscall(self.pid, None).map_err(EngineError::from)?;
            waitpid(self.pid, None).map_err(EngineError::from)?;
        }
    }

    // ---- fork-a-tracee-from-tracee -----------------------------------------

    /// Asks the kernel to report fork events from this target, triggers
    /// a remote `fork`, and waits for the child to reach its initial
    /// stop. Both parent and child are stopped, under independent
    /// ownership, when this returns.
    pub fn fork_tracee(&self) -> EngineResult<TraceeHandle> {
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACEFORK)
            .map_err(EngineError::from)?;
        self.remote_syscall(SyscallTag::Fork, 0, 0, 0)?;

        let child = self
            .child_pid
            .take()
            .ok_or_else(|| EngineError::WaitFailed {
                pid: self.pid(),
                detail: "fork event never reported a child pid".into(),
            })?;

        match waitpid(child, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                debug!("child {child} reached its initial stop");
                Ok(TraceeHandle {
                    pid: child,
                    child_pid: Cell::new(None),
                    detached: Cell::new(false),
                })
            }
            other => Err(EngineError::WaitFailed {
                pid: child.as_raw(),
                detail: format!("expected SIGSTOP, got {other:?}"),
            }),
        }
    }

    // ---- high-level remote operations ---------------------------------

    /// Opens `path` in the target with the given `mode` flags, staging
    /// the path string on the target's stack.
    pub fn open(&self, path: &str, mode: i32) -> EngineResult<i64> {
        let regs = getregs(self.pid)?;
        let bytes = cstring_bytes(path);
        let staging = StagingBuffer::acquire(self, regs.rsp, bytes.len())?;
        staging.write(&bytes)?;
        self.remote_syscall(SyscallTag::Open, staging.addr() as i64, mode as i64, 0o755)
    }

    /// Writes `data` to `fd` in the target, staging the buffer on the
    /// target's stack.
    pub fn write(&self, fd: i32, data: &[u8]) -> EngineResult<i64> {
        let regs = getregs(self.pid)?;
        let staging = StagingBuffer::acquire(self, regs.rsp, data.len())?;
        staging.write(data)?;
        self.remote_syscall(
            SyscallTag::Write,
            fd as i64,
            staging.addr() as i64,
            data.len() as i64,
        )
    }

    pub fn close(&self, fd: i32) -> EngineResult<i64> {
        self.remote_syscall(SyscallTag::Close, fd as i64, 0, 0)
    }

    pub fn dup2(&self, oldfd: i32, newfd: i32) -> EngineResult<i64> {
        self.remote_syscall(SyscallTag::Dup2, oldfd as i64, newfd as i64, 0)
    }

    pub fn setpgid(&self, pid: i32, pgid: i32) -> EngineResult<i64> {
        self.remote_syscall(SyscallTag::SetPgid, pid as i64, pgid as i64, 0)
    }

    pub fn setsid(&self) -> EngineResult<i64> {
        self.remote_syscall(SyscallTag::SetSid, 0, 0, 0)
    }

    pub fn kill(&self, pid: i32, sig: i32) -> EngineResult<i64> {
        self.remote_syscall(SyscallTag::Kill, pid as i64, sig as i64, 0)
    }

    /// Asks the target to exit with `status`; enables exit-event
    /// reporting first so the engine cleanly observes the termination.
    /// Callers must not issue further operations on the handle after
    /// this succeeds — behavior from that point on is undefined.
    pub fn exit(&self, status: i32) -> EngineResult<i64> {
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACEEXIT)
            .map_err(EngineError::from)?;
        self.remote_syscall(SyscallTag::Exit, status as i64, 0, 0)
    }

    /// `ioctl(fd, TIOCGPTN, &mut out)`, staging a 4-byte out-parameter.
    pub fn ioctl_tiocgptn(&self, fd: i32) -> EngineResult<i32> {
        let regs = getregs(self.pid)?;
        let staging = StagingBuffer::acquire(self, regs.rsp, size_of::<libc::c_int>())?;
        self.remote_syscall(
            SyscallTag::Ioctl,
            fd as i64,
            libc::TIOCGPTN as i64,
            staging.addr() as i64,
        )?;
        let bytes = staging.read_back(size_of::<libc::c_int>())?;
        Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    /// `ioctl(fd, TCGETS, &mut termios)`.
    pub fn ioctl_tcgets(&self, fd: i32) -> EngineResult<libc::termios> {
        let regs = getregs(self.pid)?;
        let size = size_of::<libc::termios>();
        let staging = StagingBuffer::acquire(self, regs.rsp, size)?;
        self.remote_syscall(
            SyscallTag::Ioctl,
            fd as i64,
            libc::TCGETS as i64,
            staging.addr() as i64,
        )?;
        let bytes = staging.read_back(size)?;
        Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const libc::termios) })
    }

    /// `ioctl(fd, TCSETS, &termios)`.
    pub fn ioctl_tcsets(&self, fd: i32, tos: &libc::termios) -> EngineResult<i64> {
        let regs = getregs(self.pid)?;
        let size = size_of::<libc::termios>();
        let staging = StagingBuffer::acquire(self, regs.rsp, size)?;
        let bytes = unsafe {
            std::slice::from_raw_parts((tos as *const libc::termios) as *const u8, size)
        };
        staging.write(bytes)?;
        self.remote_syscall(
            SyscallTag::Ioctl,
            fd as i64,
            libc::TCSETS as i64,
            staging.addr() as i64,
        )
    }

    /// `ioctl(fd, TIOCSCTTY, 0)`; enables exit-event reporting in case
    /// the call causes the target to terminate.
    pub fn sctty(&self, fd: i32) -> EngineResult<i64> {
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACEEXIT)
            .map_err(EngineError::from)?;
        self.remote_syscall(SyscallTag::Ioctl, fd as i64, libc::TIOCSCTTY as i64, 0)
    }

    /// Replaces the target's image with `command`, argv `[command,
    /// NULL]`, and the target's own environment read verbatim from
    /// `/proc/<pid>/environ`. The layout mirrors `mytrace_exec` byte for
    /// byte: command string, then argv pointers, then the verbatim
    /// environ block, then envp pointers.
    pub fn exec(&self, command: &str) -> EngineResult<i64> {
        ptrace::setoptions(self.pid, ptrace::Options::PTRACE_O_TRACEEXEC)
            .map_err(EngineError::from)?;

        let regs = getregs(self.pid)?;
        let env = read_environ(self.pid())?;

        let command_bytes = cstring_bytes(command);
        let ptr_size = size_of::<u64>() as u64;

        let mut cursor = regs.rsp;
        let command_addr = cursor;
        self.write_target(cursor, &command_bytes)?;
        cursor += command_bytes.len() as u64;

        let argv_addr = cursor;
        self.write_target(cursor, &command_addr.to_ne_bytes())?;
        cursor += ptr_size;
        self.write_target(cursor, &0u64.to_ne_bytes())?;
        cursor += ptr_size;

        let env_addr = cursor;
        self.write_target(cursor, &env)?;
        cursor += env.len() as u64;

        let envp_addr = cursor;
        for entry_offset in split_nul_terminated_offsets(&env) {
            let ptr = env_addr + entry_offset as u64;
            self.write_target(cursor, &ptr.to_ne_bytes())?;
            cursor += ptr_size;
        }
        self.write_target(cursor, &0u64.to_ne_bytes())?;

        self.remote_syscall(
            SyscallTag::Execve,
            command_addr as i64,
            argv_addr as i64,
            envp_addr as i64,
        )
    }
}

impl Drop for TraceeHandle {
    fn drop(&mut self) {
        self.do_detach();
    }
}

fn cstring_bytes(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

/// Offsets (into `env`) of the start of each NUL-terminated string.
fn split_nul_terminated_offsets(env: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut i = 0;
    while i < env.len() {
        offsets.push(i);
        while i < env.len() && env[i] != 0 {
            i += 1;
        }
        i += 1; // past the NUL
    }
    offsets
}

/// Reads `/proc/<pid>/environ` directly (from the engine side, not
/// through the remote syscall machinery), growing the buffer until a
/// read comes back short of the buffer size.
fn read_environ(pid: i32) -> EngineResult<Vec<u8>> {
    use std::io::Read;

    let path = format!("/proc/{pid}/environ");
    let mut size = 16 * 1024;
    loop {
        let mut file = std::fs::File::open(&path).map_err(|source| EngineError::EnvReadFailed {
            pid,
            source,
        })?;
        let mut buf = vec![0u8; size];
        let n = file
            .read(&mut buf)
            .map_err(|source| EngineError::EnvReadFailed { pid, source })?;
        if n < size {
            buf.truncate(n);
            return Ok(buf);
        }
        size *= 2;
    }
}

fn peek_word(pid: Pid, addr: u64) -> EngineResult<i64> {
    ptrace::read(pid, addr as ptrace::AddressType).map_err(|source| EngineError::PeekFailed {
        pid: pid.as_raw(),
        addr,
        n: WORD_SIZE,
        source,
    })
}

fn poke_word(pid: Pid, addr: u64, value: i64) -> EngineResult<()> {
    ptrace::write(pid, addr as ptrace::AddressType, value as *mut libc::c_void).map_err(|source| {
        EngineError::PokeFailed {
            pid: pid.as_raw(),
            addr,
            n: WORD_SIZE,
            source,
        }
    })
}

fn getregs(pid: Pid) -> EngineResult<libc::user_regs_struct> {
    ptrace::getregs(pid).map_err(EngineError::from)
}

fn setregs(pid: Pid, regs: libc::user_regs_struct) -> EngineResult<()> {
    ptrace::setregs(pid, regs).map_err(EngineError::from)
}

fn step(pid: Pid, sig: Option<Signal>) -> EngineResult<()> {
    ptrace::step(pid, sig).map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_terminated_offsets_split_correctly() {
        let env = b"FOO=1\0BAR=2\0".to_vec();
        let offsets = split_nul_terminated_offsets(&env);
        assert_eq!(offsets, vec![0, 6]);
    }
}
