//! Error taxonomy for the tracee control engine and the PTY inspector.
//!
//! The engine never retries a failed operation and never papers over a
//! kernel-reported error; every failure surfaces unchanged to its caller,
//! tagged with enough context (pid, address, errno) to act on.

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by the tracee control engine (TCE).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ptrace attach to pid {pid} was denied: {source}")]
    AttachDenied { pid: i32, source: Errno },

    #[error("wait after attach/step on pid {pid} did not produce the expected stop: {detail}")]
    WaitFailed { pid: i32, detail: String },

    #[error("peek of {n} byte(s) at {addr:#x} in pid {pid} failed: {source}")]
    PeekFailed {
        pid: i32,
        addr: u64,
        n: usize,
        source: Errno,
    },

    #[error("poke of {n} byte(s) at {addr:#x} in pid {pid} failed: {source}")]
    PokeFailed {
        pid: i32,
        addr: u64,
        n: usize,
        source: Errno,
    },

    #[error("unknown remote syscall tag {0:?}")]
    UnknownSyscall(crate::syscall_table::SyscallTag),

    #[error("remote syscall returned errno {0}")]
    RemoteErrno(i32),

    #[error("reading /proc/{pid}/environ failed: {source}")]
    EnvReadFailed {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Nix(#[from] Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the PTY inspector on top of the engine.
#[derive(Debug, Error)]
pub enum InspectorError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("fd {fd} of pid {pid} does not refer to a pty multiplexer")]
    NotAPty { pid: i32, fd: i32 },

    #[error("TIOCGPTN on fd {fd} of pid {pid} failed with errno {errno}")]
    IoctlFailed { pid: i32, fd: i32, errno: i32 },

    #[error("procfs access for pid {pid} failed: {source}")]
    Procfs {
        pid: i32,
        #[source]
        source: procfs::ProcError,
    },
}

pub type InspectorResult<T> = Result<T, InspectorError>;

/// Errors raised by the command-line shell.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("usage: ptmx_resolve <pid> [<fd>]")]
    UsageError,

    #[error(transparent)]
    Inspector(#[from] InspectorError),
}
