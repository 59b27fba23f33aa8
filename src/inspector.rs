//! The PTY inspector (PI).
//!
//! Sits on the tracee control engine: walks a target's open file
//! descriptors via procfs, filters for the ones that plausibly refer to
//! the PTY multiplexer device, and asks a forked sacrificial child to
//! run `TIOCGPTN` against each on the parent's behalf. Grounded in
//! `ptsname_proxy.c`'s `ptsname_by_fd` and `ptsname_list_all`.

use log::warn;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use procfs::process::{FDTarget, Process};

use crate::engine::TraceeHandle;
use crate::error::{EngineError, InspectorError, InspectorResult};

/// Kernel's own cap on live PTY pairs, carried over from `ptsname_proxy.c`'s
/// `MAX_PTYS` ("reasonable for most realistic scenarios and the kernel
/// default").
const MAX_PTYS: usize = 4096;

const PTY_MULTIPLEXER_PATH: &str = "/dev/ptmx";

/// One candidate descriptor discovered while walking `/proc/<pid>/fd`.
#[derive(Debug, Clone)]
pub struct DescriptorCandidate {
    pub fd: i32,
    pub linkname: String,
    pub is_plausible_pty: bool,
}

impl DescriptorCandidate {
    fn new(fd: i32, linkname: String) -> Self {
        // ptsname_proxy.c checks `strstr("/dev/ptmx", linkname)`, which
        // searches the literal path for the link text — backwards from
        // the evident intent. The correct direction asks whether the
        // link text contains the multiplexer path.
        let is_plausible_pty = !linkname.is_empty() && linkname.contains(PTY_MULTIPLEXER_PATH);
        DescriptorCandidate {
            fd,
            linkname,
            is_plausible_pty,
        }
    }
}

/// Result of `ptsname_by_fd`.
#[derive(Debug, Clone, Copy)]
pub struct SingleResult {
    pub pid: i32,
    pub fd: i32,
    pub pts_index: i32,
}

/// One entry of a `ptsname_list_all` result.
#[derive(Debug, Clone, Copy)]
pub struct ListEntry {
    pub pid: i32,
    pub pts_index: i32,
}

/// Resolves the `/dev/pts` subordinate index behind a single file
/// descriptor of a running process.
pub fn ptsname_by_fd(pid: i32, target_fd: i32) -> InspectorResult<SingleResult> {
    let (parent, child) = attach_and_fork(pid)?;

    let result = (|| {
        let candidate = list_fd_candidates(pid)?
            .into_iter()
            .find(|c| c.fd == target_fd);

        match candidate {
            Some(c) if c.is_plausible_pty => {
                let pts_index = tiocgptn(&child, pid, target_fd)?;
                Ok(SingleResult {
                    pid,
                    fd: target_fd,
                    pts_index,
                })
            }
            _ => Err(InspectorError::NotAPty { pid, fd: target_fd }),
        }
    })();

    wrap_up(parent, child, pid);
    result
}

/// Resolves the `/dev/pts` subordinate index behind every multiplexer
/// descriptor of a running process. Entries are returned
/// highest-index-first, as in the original.
pub fn ptsname_list_all(pid: i32) -> InspectorResult<Vec<ListEntry>> {
    let (parent, child) = attach_and_fork(pid)?;

    let result = (|| {
        let candidates = list_fd_candidates(pid)?;
        let mut discovered = Vec::new();

        for candidate in candidates {
            if discovered.len() >= MAX_PTYS {
                break;
            }
            if !candidate.is_plausible_pty {
                continue;
            }
            match tiocgptn(&child, pid, candidate.fd) {
                Ok(pts_index) => discovered.push(ListEntry { pid, pts_index }),
                Err(e) => warn!("TIOCGPTN on fd {} of pid {pid} failed: {e}", candidate.fd),
            }
        }

        Ok(discovered)
    })();

    wrap_up(parent, child, pid);
    result.map(|mut v| {
        v.reverse();
        v
    })
}

/// Attaches to `pid` and immediately forks a sacrificial child tracee
/// that will carry out the actual `TIOCGPTN` calls, so the parent's own
/// state is unaffected if the injected call has side effects.
fn attach_and_fork(pid: i32) -> InspectorResult<(TraceeHandle, TraceeHandle)> {
    let parent = TraceeHandle::attach(pid)?;
    let child = parent.fork_tracee()?;
    Ok((parent, child))
}

/// Every exit path, success or failure, funnels through here: both
/// handles drop (releasing their debugging slots), then the parent pid
/// is reaped. The original's `goto wrap_up` skipped this on some
/// early-failure paths; every caller here reaches it unconditionally.
fn wrap_up(parent: TraceeHandle, child: TraceeHandle, pid: i32) {
    drop(child);
    drop(parent);
    let _ = waitpid(Pid::from_raw(pid), None);
}

fn list_fd_candidates(pid: i32) -> InspectorResult<Vec<DescriptorCandidate>> {
    let proc = Process::new(pid).map_err(|source| InspectorError::Procfs { pid, source })?;
    let fds = proc.fd().map_err(|source| InspectorError::Procfs { pid, source })?;

    let mut candidates = Vec::new();
    for info in fds {
        if let FDTarget::Path(path) = &info.target {
            candidates.push(DescriptorCandidate::new(
                info.fd,
                path.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(candidates)
}

/// Runs `TIOCGPTN` via `child` and narrows a negative-errno result down
/// to the inspector-level `IoctlFailed` variant instead of letting it
/// surface as an opaque wrapped engine error.
fn tiocgptn(child: &TraceeHandle, pid: i32, fd: i32) -> InspectorResult<i32> {
    child.ioctl_tiocgptn(fd).map_err(|e| match e {
        EngineError::RemoteErrno(errno) => InspectorError::IoctlFailed { pid, fd, errno },
        other => InspectorError::Engine(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplexer_path_match_is_direction_corrected() {
        let c = DescriptorCandidate::new(3, "/dev/ptmx".to_string());
        assert!(c.is_plausible_pty);

        let c = DescriptorCandidate::new(3, "/dev/null".to_string());
        assert!(!c.is_plausible_pty);

        let c = DescriptorCandidate::new(3, String::new());
        assert!(!c.is_plausible_pty);
    }
}
