//! Scoped stack staging.
//!
//! Every high-level remote operation that needs an in/out buffer in the
//! target's address space follows the same save/write/restore sequence.
//! Factoring it into one RAII guard means a staged call cannot forget to
//! restore the bytes it borrowed, including when the call in between
//! returns an error — `Drop` runs regardless.

use crate::engine::TraceeHandle;
use crate::error::EngineResult;

/// Borrows `len` bytes of the tracee's stack starting at `addr`,
/// remembering the original contents so they can be written back.
pub struct StagingBuffer<'a> {
    handle: &'a TraceeHandle,
    addr: u64,
    saved: Vec<u8>,
}

impl<'a> StagingBuffer<'a> {
    /// Saves the `len` bytes at `addr` (the tracee's current stack
    /// pointer, by convention) before they get overwritten.
    pub fn acquire(handle: &'a TraceeHandle, addr: u64, len: usize) -> EngineResult<Self> {
        let saved = handle.read_target(addr, len)?;
        Ok(StagingBuffer {
            handle,
            addr,
            saved,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Overwrites the staged region with `bytes` (must not exceed the
    /// acquired length).
    pub fn write(&self, bytes: &[u8]) -> EngineResult<()> {
        debug_assert!(bytes.len() <= self.saved.len());
        self.handle.write_target(self.addr, bytes)
    }

    /// Reads `len` bytes back out of the staged region (used after a
    /// call to retrieve an out-parameter, e.g. `TIOCGPTN`'s integer).
    pub fn read_back(&self, len: usize) -> EngineResult<Vec<u8>> {
        self.handle.read_target(self.addr, len)
    }
}

impl<'a> Drop for StagingBuffer<'a> {
    fn drop(&mut self) {
        // Best-effort: a failing restore here means the target's memory
        // is already indeterminate; there is nothing further to do from
        // a destructor.
        let _ = self.handle.write_target(self.addr, &self.saved);
    }
}
