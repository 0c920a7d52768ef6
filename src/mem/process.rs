use crate::diag::fs::{DirHandle, FileHandle};
use crate::error::{GmdError, GmdResult};
use crate::mem::entry::{EntryDescriptor, MemEntry};
use crate::mem::registry::EntryRegistry;
use crate::mem::{EntryId, Pid};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Per-process state: the entry registry plus the process's diagnostics
/// directory handle (absent when directory creation failed and the
/// feature degraded).
pub struct ProcessRecord {
    pid: Pid,
    registry: Arc<EntryRegistry>,
    diag_dir: Mutex<Option<DirHandle>>,
    diag_files: Mutex<Vec<FileHandle>>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            registry: Arc::new(EntryRegistry::new(pid)),
            diag_dir: Mutex::new(None),
            diag_files: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EntryRegistry> {
        &self.registry
    }

    /// Registers a new allocation and returns the stored entry with its
    /// fresh id assigned.
    pub fn register(&self, desc: EntryDescriptor) -> Arc<MemEntry> {
        self.registry.insert(desc)
    }

    /// Starts teardown of one entry: unlinks the id and drops the owning
    /// reference. The entry is finalized once in-flight viewers drain.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::EntryNotFound`] when the id is not registered.
    pub fn unregister(&self, id: EntryId) -> GmdResult<()> {
        let entry = self
            .registry
            .remove(id)
            .ok_or(GmdError::EntryNotFound(id))?;
        entry.release();
        Ok(())
    }

    /// Tears down every entry and removes the process's diagnostics
    /// directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory mutex is poisoned.
    pub fn close(&self) {
        for entry in self.registry.drain() {
            entry.release();
        }
        self.diag_files.lock().unwrap().clear();
        drop(self.diag_dir.lock().unwrap().take());
    }

    pub(crate) fn attach_diag_dir(&self, dir: DirHandle) {
        *self.diag_dir.lock().unwrap() = Some(dir);
    }

    pub(crate) fn attach_diag_file(&self, file: FileHandle) {
        self.diag_files.lock().unwrap().push(file);
    }

    /// Runs `f` with the diagnostics directory handle, or returns `None`
    /// when the directory is absent.
    pub(crate) fn with_diag_dir<R>(&self, f: impl FnOnce(&DirHandle) -> R) -> Option<R> {
        self.diag_dir.lock().unwrap().as_ref().map(f)
    }
}

/// All processes currently known to the directory, keyed by pid.
pub struct ProcessTable {
    inner: Mutex<BTreeMap<Pid, Arc<ProcessRecord>>>,
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// # Panics
    ///
    /// Panics if the table mutex is poisoned.
    #[must_use]
    pub fn find(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.inner.lock().unwrap().get(&pid).cloned()
    }

    /// # Panics
    ///
    /// Panics if the table mutex is poisoned.
    pub(crate) fn insert(&self, record: &Arc<ProcessRecord>) {
        self.inner
            .lock()
            .unwrap()
            .insert(record.pid(), Arc::clone(record));
    }

    /// # Panics
    ///
    /// Panics if the table mutex is poisoned.
    pub(crate) fn remove(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.inner.lock().unwrap().remove(&pid)
    }

    /// Pids currently registered, ascending.
    ///
    /// # Panics
    ///
    /// Panics if the table mutex is poisoned.
    #[must_use]
    pub fn pids(&self) -> Vec<Pid> {
        self.inner.lock().unwrap().keys().copied().collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
