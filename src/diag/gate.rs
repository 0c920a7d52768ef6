use crate::error::{GmdError, GmdResult};
use crate::mem::Pid;
use std::sync::Arc;

/// Identity of the caller opening a diagnostic view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub pid: Pid,
    pub uid: u32,
}

impl Identity {
    #[must_use]
    pub const fn new(pid: Pid, uid: u32) -> Self {
        Self { pid, uid }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Current identity of a process that owns directory entries.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub pid: Pid,
    pub uid: u32,
    pub comm: String,
}

/// Resolves process identities and decides read permission.
///
/// `resolve` returns `None` once the process has exited; an exited owner
/// always denies. `may_read` implements the platform policy for reading
/// another task's private state (self, or a privileged inspector).
pub trait TaskResolver: Send + Sync {
    fn resolve(&self, pid: Pid) -> Option<ResolvedTask>;

    fn may_read(&self, requester: &Identity, task: &ResolvedTask) -> bool;
}

/// Decides whether a requesting identity may view a process's entries.
/// Every diagnostic read fill passes through here before producing any
/// output.
pub struct AccessGate {
    resolver: Arc<dyn TaskResolver>,
}

impl AccessGate {
    #[must_use]
    pub fn new(resolver: Arc<dyn TaskResolver>) -> Self {
        Self { resolver }
    }

    /// # Errors
    ///
    /// Returns [`GmdError::PermissionDenied`] when the owning process has
    /// exited or the requester may not read its state. Either way the
    /// caller must produce no output.
    pub fn check(&self, owner: Pid, requester: &Identity) -> GmdResult<()> {
        let task = self
            .resolver
            .resolve(owner)
            .ok_or(GmdError::PermissionDenied(owner))?;

        if !self.resolver.may_read(requester, &task) {
            return Err(GmdError::PermissionDenied(owner));
        }
        Ok(())
    }
}
