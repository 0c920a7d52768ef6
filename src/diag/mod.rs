pub mod core;
pub mod fs;
pub mod gate;
pub mod render;
pub mod seq;
pub mod views;

// Re-export the user-facing surface for easy access
pub use self::core::{DiagCore, DiagCoreBuilder};
pub use fs::{DiagFs, DirHandle, FileHandle};
pub use gate::{AccessGate, Identity, ResolvedTask, TaskResolver};
pub use render::{DefaultClassifier, MemClassifier, SurfaceCounts};
pub use seq::{SeqReader, SeqSource};
pub use views::{GlobalPtSource, dump_page};
