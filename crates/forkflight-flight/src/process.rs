//! Process identity for transport handles
//!
//! A transport created before `fork()` still looks usable in the child: the
//! descriptors are inherited, but the runtime threads driving them are not,
//! and the parent keeps reading the same socket. Handles record the id of
//! the process that created them and refuse to run anywhere else.

use crate::error::ListingError;

/// Id of the process that created a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pid: u32,
}

impl ProcessIdentity {
    /// Identity of the calling process
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the calling process is the one this identity was taken in
    pub fn is_current(&self) -> bool {
        self.pid == std::process::id()
    }

    /// Fail with `StaleConnectionError` when called from another process
    pub fn check(&self) -> Result<(), ListingError> {
        let current = std::process::id();
        if self.pid == current {
            Ok(())
        } else {
            Err(ListingError::StaleConnectionError {
                owner: self.pid,
                current,
            })
        }
    }
}
