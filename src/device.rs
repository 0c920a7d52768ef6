use crate::diag::fs::{DirHandle, FileHandle};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A debug register block acquired from the platform.
#[derive(Debug, Clone, Copy)]
pub struct DebugRegs {
    pub base: u64,
    pub len: usize,
}

/// Acquires the hardware debug register block backing the breakpoint
/// feature. Probed lazily, once, on the first enable.
pub trait DebugRegProbe: Send + Sync {
    fn acquire(&self) -> Option<DebugRegs>;
}

// Probe lifecycle; a failed probe is remembered and never retried.
enum ProbeState {
    NotTried,
    Acquired(DebugRegs),
    Failed,
}

// Diagnostics nodes owned by the device, removed on close.
struct DeviceNodes {
    _dir: DirHandle,
    _snapshot: DirHandle,
    _attr: FileHandle,
}

/// One GPU device as the diagnostics layer sees it: a name, the
/// breakpoint toggle, and the lazily probed debug register block.
pub struct Device {
    name: String,
    probe: Box<dyn DebugRegProbe>,
    breakpoint: AtomicBool,
    regs: Mutex<ProbeState>,
    diag_nodes: Mutex<Option<DeviceNodes>>,
}

impl Device {
    #[must_use]
    pub fn new(name: impl Into<String>, probe: Box<dyn DebugRegProbe>) -> Self {
        Self {
            name: name.into(),
            probe,
            breakpoint: AtomicBool::new(false),
            regs: Mutex::new(ProbeState::NotTried),
            diag_nodes: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flips the hardware breakpoint feature. The first enable probes for
    /// the debug register block; a failed probe warns once and the toggle
    /// still tracks the requested state.
    ///
    /// # Panics
    ///
    /// Panics if the probe mutex is poisoned.
    pub fn set_breakpoint(&self, enabled: bool) {
        if enabled {
            let mut regs = self.regs.lock().unwrap();
            if matches!(*regs, ProbeState::NotTried) {
                *regs = match self.probe.acquire() {
                    Some(block) => ProbeState::Acquired(block),
                    None => {
                        warn!("debug register probe failed for device {}", self.name);
                        ProbeState::Failed
                    }
                };
            }
        }
        self.breakpoint.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn breakpoint_enabled(&self) -> bool {
        self.breakpoint.load(Ordering::Relaxed)
    }

    /// The acquired debug register block, if the probe has run and
    /// succeeded.
    ///
    /// # Panics
    ///
    /// Panics if the probe mutex is poisoned.
    #[must_use]
    pub fn debug_regs(&self) -> Option<DebugRegs> {
        match *self.regs.lock().unwrap() {
            ProbeState::Acquired(block) => Some(block),
            _ => None,
        }
    }

    pub(crate) fn attach_diag_nodes(&self, dir: DirHandle, snapshot: DirHandle, attr: FileHandle) {
        *self.diag_nodes.lock().unwrap() = Some(DeviceNodes {
            _dir: dir,
            _snapshot: snapshot,
            _attr: attr,
        });
    }

    /// Removes the device's diagnostics nodes.
    ///
    /// # Panics
    ///
    /// Panics if the node mutex is poisoned.
    pub fn close(&self) {
        drop(self.diag_nodes.lock().unwrap().take());
    }
}
