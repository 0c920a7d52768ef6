use crate::device::Device;
use crate::diag::fs::{DiagFs, DirHandle, FileHandle};
use crate::diag::gate::{AccessGate, Identity, TaskResolver};
use crate::diag::render::{DefaultClassifier, MemClassifier};
use crate::diag::seq::SeqReader;
use crate::diag::views::{GlobalPtSource, MemEntrySeq, ProcessMemSeq, SparseMemSeq, ViewContext};
use crate::error::{GmdError, GmdResult};
use crate::mem::entry::{EntryDescriptor, MemEntry};
use crate::mem::flags::MemFlags;
use crate::mem::process::{ProcessRecord, ProcessTable};
use crate::mem::{EntryId, MappedPage, PageHandle, PageMapper, Pid, UserMemType};
use crate::sys::proc::ProcTaskResolver;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

// Default mapper when the embedder wires no page-mapping subsystem:
// every map attempt fails, so page dumps render empty. The diagnostic
// surface stays up either way.
struct NullMapper;

impl PageMapper for NullMapper {
    fn map(&self, _page: PageHandle) -> Option<MappedPage> {
        None
    }

    fn unmap(&self, _mapping: MappedPage) {}
}

/// Configures and constructs a [`DiagCore`].
pub struct DiagCoreBuilder {
    resolver: Option<Arc<dyn TaskResolver>>,
    classifier: Arc<dyn MemClassifier>,
    mapper: Arc<dyn PageMapper>,
    globals: Option<Arc<dyn GlobalPtSource>>,
}

impl DiagCoreBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolver: None,
            classifier: Arc::new(DefaultClassifier),
            mapper: Arc::new(NullMapper),
            globals: None,
        }
    }

    /// Task-identity resolver backing the access gate. Defaults to the
    /// /proc-based resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn TaskResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Classifier for usage labels and dma-buf surface counts.
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn MemClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Page-mapping subsystem used by per-entry dumps.
    #[must_use]
    pub fn mapper(mut self, mapper: Arc<dyn PageMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Global page-table printer. The `globals` view only exists when a
    /// source is configured.
    #[must_use]
    pub fn globals(mut self, source: Arc<dyn GlobalPtSource>) -> Self {
        self.globals = Some(source);
        self
    }

    #[must_use]
    pub fn build(self) -> DiagCore {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(ProcTaskResolver::new()));

        let core = DiagCore {
            fs: Arc::new(DiagFs::new()),
            gate: Arc::new(AccessGate::new(resolver)),
            classifier: self.classifier,
            mapper: self.mapper,
            processes: ProcessTable::new(),
            strict_memory: Arc::new(AtomicBool::new(false)),
            restrict_addresses: Arc::new(AtomicBool::new(false)),
            nodes: Mutex::new(Vec::new()),
            dirs: Mutex::new(Vec::new()),
            proc_dir: Mutex::new(None),
        };
        core.init_tree(self.globals);
        core
    }
}

impl Default for DiagCoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn upgrade(core: &std::sync::Weak<DiagCore>) -> GmdResult<Arc<DiagCore>> {
    core.upgrade()
        .ok_or_else(|| GmdError::General(String::from("diagnostics core is shut down")))
}

/// The diagnostics runtime: the in-process tree, the global toggles, and
/// registration entry points for processes, memory entries and devices.
///
/// Construction wires the fixed part of the tree (`debug/strict_memory`
/// and, when a source is configured, `globals`). Per-process and
/// per-entry nodes come and go with [`open_process`] /
/// [`register_entry`] and disappear on the owning object's teardown.
/// Setup failures are warned about once and degrade to the node being
/// absent; they never propagate to the caller.
///
/// [`open_process`]: DiagCore::open_process
/// [`register_entry`]: DiagCore::register_entry
pub struct DiagCore {
    fs: Arc<DiagFs>,
    gate: Arc<AccessGate>,
    classifier: Arc<dyn MemClassifier>,
    mapper: Arc<dyn PageMapper>,
    processes: ProcessTable,
    strict_memory: Arc<AtomicBool>,
    restrict_addresses: Arc<AtomicBool>,
    // Fixed tree nodes, dropped on shutdown.
    nodes: Mutex<Vec<FileHandle>>,
    dirs: Mutex<Vec<DirHandle>>,
    proc_dir: Mutex<Option<DirHandle>>,
}

impl DiagCore {
    #[must_use]
    pub fn builder() -> DiagCoreBuilder {
        DiagCoreBuilder::new()
    }

    fn init_tree(&self, globals: Option<Arc<dyn GlobalPtSource>>) {
        let root = self.fs.root();

        match self.fs.create_dir(&root, "proc") {
            Ok(dir) => *self.proc_dir.lock().unwrap() = Some(dir),
            Err(e) => warn!("unable to create process diagnostics dir: {e}"),
        }

        match self.fs.create_dir(&root, "debug") {
            Ok(debug_dir) => {
                let strict = Arc::clone(&self.strict_memory);
                let stored = Arc::clone(&self.strict_memory);
                match self.fs.create_attr(
                    &debug_dir,
                    "strict_memory",
                    move || u64::from(strict.load(Ordering::Relaxed)),
                    move |v| stored.store(v != 0, Ordering::Relaxed),
                ) {
                    Ok(attr) => self.nodes.lock().unwrap().push(attr),
                    Err(e) => warn!("unable to create strict_memory attribute: {e}"),
                }
                self.dirs.lock().unwrap().push(debug_dir);
            }
            Err(e) => warn!("unable to create debug dir: {e}"),
        }

        if let Some(source) = globals {
            match self.fs.create_file(&root, "globals", move |_identity| {
                let mut out = String::new();
                source.render_global_entries(&mut out);
                Ok(Box::new(io::Cursor::new(out.into_bytes())) as Box<dyn Read + Send>)
            }) {
                Ok(file) => self.nodes.lock().unwrap().push(file),
                Err(e) => warn!("unable to create globals view: {e}"),
            }
        }
    }

    fn view_ctx(&self, requester: &Identity) -> ViewContext {
        ViewContext {
            gate: Arc::clone(&self.gate),
            classifier: Arc::clone(&self.classifier),
            mapper: Arc::clone(&self.mapper),
            requester: requester.clone(),
            restrict_addresses: Arc::clone(&self.restrict_addresses),
        }
    }

    /// The diagnostics tree itself, for opening and listing views.
    #[must_use]
    pub fn fs(&self) -> &DiagFs {
        &self.fs
    }

    /// Reads a whole view into a string on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// Propagates open and read failures, including access denials.
    pub fn read_to_string(&self, path: &str, requester: &Identity) -> GmdResult<String> {
        self.fs.read_to_string(path, requester)
    }

    /// Registers a process with the directory, creating its `proc/<pid>`
    /// diagnostics nodes. Returns the existing record when the pid is
    /// already known. Node-creation failures warn and leave the process
    /// without diagnostics; they are not fatal to the process itself.
    pub fn open_process(self: &Arc<Self>, pid: Pid) -> Arc<ProcessRecord> {
        if let Some(existing) = self.processes.find(pid) {
            return existing;
        }

        let record = Arc::new(ProcessRecord::new(pid));
        self.processes.insert(&record);
        self.init_process_nodes(&record);
        record
    }

    fn init_process_nodes(self: &Arc<Self>, record: &Arc<ProcessRecord>) {
        let proc_dir = self.proc_dir.lock().unwrap();
        let Some(proc_dir) = proc_dir.as_ref() else {
            return;
        };

        let pid = record.pid();
        let dir = match self.fs.create_dir(proc_dir, &pid.to_string()) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("unable to create diagnostics dir for process {pid}: {e}");
                return;
            }
        };

        // Views hold the core weakly; a node outliving the core would
        // otherwise keep it (and the whole tree) alive through its own
        // open closure.
        let core = Arc::downgrade(self);
        let mem_record = Arc::clone(record);
        match self.fs.create_file(&dir, "mem", move |identity| {
            let core = upgrade(&core)?;
            let seq = ProcessMemSeq::new(core.view_ctx(identity), Arc::clone(&mem_record));
            Ok(Box::new(SeqReader::new(seq)) as Box<dyn Read + Send>)
        }) {
            Ok(file) => record.attach_diag_file(file),
            Err(e) => warn!("unable to create 'mem' view for process {pid}: {e}"),
        }

        let core = Arc::downgrade(self);
        let sparse_record = Arc::clone(record);
        match self.fs.create_file(&dir, "sparse_mem", move |identity| {
            let core = upgrade(&core)?;
            let seq = SparseMemSeq::new(core.view_ctx(identity), Arc::clone(&sparse_record));
            Ok(Box::new(SeqReader::new(seq)) as Box<dyn Read + Send>)
        }) {
            Ok(file) => record.attach_diag_file(file),
            Err(e) => warn!("unable to create 'sparse_mem' view for process {pid}: {e}"),
        }

        record.attach_diag_dir(dir);
    }

    /// Removes a process: tears down all its entries and removes its
    /// diagnostics nodes.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::ProcessNotFound`] for unknown pids.
    pub fn close_process(&self, pid: Pid) -> GmdResult<()> {
        let record = self
            .processes
            .remove(pid)
            .ok_or(GmdError::ProcessNotFound(pid))?;
        record.close();
        Ok(())
    }

    #[must_use]
    pub fn find_process(&self, pid: Pid) -> Option<Arc<ProcessRecord>> {
        self.processes.find(pid)
    }

    /// Registers an allocation with a process and creates its per-entry
    /// dump view. Imported, sparse-virtual, secure and pageless entries
    /// get no view; their contents are not dumpable.
    pub fn register_entry(
        self: &Arc<Self>,
        record: &Arc<ProcessRecord>,
        desc: EntryDescriptor,
    ) -> Arc<MemEntry> {
        let blocked = desc.mem_type != UserMemType::Native
            || desc
                .flags
                .intersects(MemFlags::SPARSE_VIRT | MemFlags::SECURE)
            || desc.pages.is_empty();

        let entry = record.register(desc);
        if blocked {
            return entry;
        }

        let core = Arc::downgrade(self);
        let view_entry = Arc::clone(&entry);
        let created = record.with_diag_dir(|dir| {
            self.fs.create_file(dir, &entry.id().to_string(), move |identity| {
                let core = upgrade(&core)?;
                let seq = MemEntrySeq::new(core.view_ctx(identity), Arc::clone(&view_entry));
                Ok(Box::new(SeqReader::new(seq)) as Box<dyn Read + Send>)
            })
        });

        match created {
            Some(Ok(file)) => entry.attach_diag_node(file),
            Some(Err(e)) => warn!(
                "unable to create view for entry {}:{}: {e}",
                record.pid(),
                entry.id()
            ),
            // The process has no diagnostics dir; nothing to attach to.
            None => {}
        }
        entry
    }

    /// Starts teardown of one entry. Its dump view disappears once
    /// in-flight viewers drain.
    ///
    /// # Errors
    ///
    /// Returns [`GmdError::EntryNotFound`] when the id is not registered
    /// with this process.
    pub fn unregister_entry(&self, record: &ProcessRecord, id: EntryId) -> GmdResult<()> {
        record.unregister(id)
    }

    /// Registers a device's diagnostics nodes:
    /// `<name>/snapshot/break_debug`.
    pub fn register_device(&self, device: &Arc<Device>) {
        let root = self.fs.root();
        let dir = match self.fs.create_dir(&root, device.name()) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("unable to create diagnostics dir for device {}: {e}", device.name());
                return;
            }
        };

        let snapshot = match self.fs.create_dir(&dir, "snapshot") {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("unable to create snapshot dir for device {}: {e}", device.name());
                return;
            }
        };

        let get_device = Arc::clone(device);
        let set_device = Arc::clone(device);
        match self.fs.create_attr(
            &snapshot,
            "break_debug",
            move || u64::from(get_device.breakpoint_enabled()),
            move |v| set_device.set_breakpoint(v != 0),
        ) {
            Ok(attr) => device.attach_diag_nodes(dir, snapshot, attr),
            Err(e) => warn!(
                "unable to create break_debug attribute for device {}: {e}",
                device.name()
            ),
        }
    }

    /// The strict-allocation-retry policy toggle, mirrored by the
    /// `debug/strict_memory` attribute.
    #[must_use]
    pub fn strict_memory(&self) -> bool {
        self.strict_memory.load(Ordering::Relaxed)
    }

    pub fn set_strict_memory(&self, strict: bool) {
        self.strict_memory.store(strict, Ordering::Relaxed);
    }

    /// Whether listing rows and dump offsets hide real addresses.
    #[must_use]
    pub fn restrict_addresses(&self) -> bool {
        self.restrict_addresses.load(Ordering::Relaxed)
    }

    pub fn set_restrict_addresses(&self, restrict: bool) {
        self.restrict_addresses.store(restrict, Ordering::Relaxed);
    }

    /// Tears down the whole diagnostics tree: every process is closed and
    /// the fixed nodes are removed.
    pub fn shutdown(&self) {
        for pid in self.processes.pids() {
            if let Some(record) = self.processes.remove(pid) {
                record.close();
            }
        }
        self.nodes.lock().unwrap().clear();
        self.dirs.lock().unwrap().clear();
        drop(self.proc_dir.lock().unwrap().take());
    }
}
