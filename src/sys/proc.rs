use crate::diag::gate::{Identity, ResolvedTask, TaskResolver};
use crate::mem::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Resolves task identities from `/proc/<pid>/status`.
///
/// Read permission follows the usual introspection policy: a task may
/// read itself, a task may read tasks running under the same uid, and
/// root may read anything.
pub struct ProcTaskResolver;

impl ProcTaskResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcTaskResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskResolver for ProcTaskResolver {
    fn resolve(&self, pid: Pid) -> Option<ResolvedTask> {
        let file = File::open(format!("/proc/{pid}/status")).ok()?;
        let reader = BufReader::new(file);

        let mut comm = String::new();
        let mut uid = None;

        for line in reader.lines().map_while(Result::ok) {
            if let Some(rest) = line.strip_prefix("Name:") {
                comm = rest.trim().to_owned();
            } else if let Some(rest) = line.strip_prefix("Uid:") {
                // Real uid is the first of the four columns.
                uid = rest.split_whitespace().next().and_then(|v| v.parse().ok());
            }
        }

        Some(ResolvedTask {
            pid,
            uid: uid?,
            comm,
        })
    }

    fn may_read(&self, requester: &Identity, task: &ResolvedTask) -> bool {
        requester.is_root() || requester.pid == task.pid || requester.uid == task.uid
    }
}

/// The identity of the calling process, for opening views on its own
/// behalf.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn current_identity() -> Identity {
    // Both calls are infallible on Linux.
    let (pid, uid) = unsafe { (libc::getpid(), libc::geteuid()) };
    Identity::new(pid as Pid, uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_own_process() {
        let resolver = ProcTaskResolver::new();
        let me = current_identity();

        let task = resolver.resolve(me.pid).expect("own pid must resolve");
        assert_eq!(task.pid, me.pid);
        assert!(!task.comm.is_empty());
    }

    #[test]
    fn test_self_read_is_allowed() {
        let resolver = ProcTaskResolver::new();
        let me = current_identity();
        let task = resolver.resolve(me.pid).unwrap();
        assert!(resolver.may_read(&me, &task));
    }

    #[test]
    fn test_exited_pid_does_not_resolve() {
        let resolver = ProcTaskResolver::new();
        // Pid 0 has no /proc entry.
        assert!(resolver.resolve(0).is_none());
    }

    #[test]
    fn test_foreign_uid_is_denied() {
        let resolver = ProcTaskResolver::new();
        let task = ResolvedTask {
            pid: 1,
            uid: 1000,
            comm: String::from("app"),
        };
        assert!(!resolver.may_read(&Identity::new(2, 2000), &task));
        assert!(resolver.may_read(&Identity::new(2, 0), &task));
    }
}
