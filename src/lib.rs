//! GPU memory-entry diagnostics: a per-process registry of
//! reference-counted memory entries, browsable through restartable
//! read-only views.
//!
//! The crate centers on three pieces:
//!
//! - [`mem`]: the entry registry, the refcounted entry lifecycle, and the
//!   position-indexed enumeration cursor that tolerates concurrent
//!   insertion and removal.
//! - [`diag`]: the in-process diagnostics tree (`proc/<pid>/mem`,
//!   `proc/<pid>/sparse_mem`, per-entry hex dumps, global toggles), with
//!   every read passing an access-control gate.
//! - [`sys`]: default collaborators for Linux: `/proc`-based task
//!   resolution and an anonymous-RAM page pool.
//!
//! Collaborating subsystems plug in through traits:
//! [`TaskResolver`](diag::TaskResolver), [`PageMapper`](mem::PageMapper),
//! [`MemClassifier`](diag::MemClassifier) and
//! [`GlobalPtSource`](diag::GlobalPtSource).

pub mod device;
pub mod diag;
pub mod error;
pub mod mem;
pub mod sys;
pub mod utils;

pub use device::{DebugRegProbe, DebugRegs, Device};
pub use diag::{DiagCore, DiagCoreBuilder, Identity};
pub use error::{GmdError, GmdResult};
pub use mem::{EntryDescriptor, EntryId, MemEntry, PageHandle, Pid};
