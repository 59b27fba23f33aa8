//! The logical-to-ABI syscall number tables.
//!
//! Grounded directly in `mytrace.c`: the amd64 build there keeps a
//! `syscalls32[]` array "from unistd_32.h on an amd64 system" alongside
//! the native `syscalls64[]`/`SYS_*` array, indexed by the same logical
//! tag order. We keep that same pairing instead of trying to derive ia32
//! numbers from the `libc` crate, which (compiled for an x86_64 target)
//! does not expose them.

use crate::arch::ArchitectureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyscallTag {
    Open,
    Close,
    Write,
    Dup2,
    SetPgid,
    SetSid,
    Kill,
    Fork,
    Exit,
    Execve,
    Ioctl,
}

impl SyscallTag {
    const COUNT: usize = 11;

    const ALL: [SyscallTag; Self::COUNT] = [
        SyscallTag::Open,
        SyscallTag::Close,
        SyscallTag::Write,
        SyscallTag::Dup2,
        SyscallTag::SetPgid,
        SyscallTag::SetSid,
        SyscallTag::Kill,
        SyscallTag::Fork,
        SyscallTag::Exit,
        SyscallTag::Execve,
        SyscallTag::Ioctl,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

// Indexed in the same logical order as `SyscallTag::ALL`.
const X86_64_NUMBERS: [i64; SyscallTag::COUNT] = [
    libc::SYS_open,
    libc::SYS_close,
    libc::SYS_write,
    libc::SYS_dup2,
    libc::SYS_setpgid,
    libc::SYS_setsid,
    libc::SYS_kill,
    libc::SYS_fork,
    libc::SYS_exit,
    libc::SYS_execve,
    libc::SYS_ioctl,
];

// ia32 (unistd_32.h) ABI numbers; see comment above. `open=5, close=6,
// write=4, dup2=63, setpgid=57, setsid=66, kill=37, fork=2, exit=1,
// execve=11, ioctl=54`.
const X86_32_NUMBERS: [i64; SyscallTag::COUNT] = [5, 6, 4, 63, 57, 66, 37, 2, 1, 11, 54];

/// Returns the ABI syscall number for `tag` under `mode`. The two
/// backing arrays must have identical length and logical ordering;
/// `SyscallTag::COUNT` enforces that by construction rather than by
/// convention.
pub fn abi_number(mode: ArchitectureMode, tag: SyscallTag) -> i64 {
    let table = match mode {
        ArchitectureMode::X86_64 => &X86_64_NUMBERS,
        ArchitectureMode::X86_32 => &X86_32_NUMBERS,
    };
    table[tag.index()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_have_matching_length_and_order() {
        assert_eq!(X86_64_NUMBERS.len(), X86_32_NUMBERS.len());
        assert_eq!(X86_64_NUMBERS.len(), SyscallTag::ALL.len());
    }

    #[test]
    fn every_tag_resolves_in_both_modes() {
        for tag in SyscallTag::ALL {
            let _ = abi_number(ArchitectureMode::X86_64, tag);
            let _ = abi_number(ArchitectureMode::X86_32, tag);
        }
    }
}
