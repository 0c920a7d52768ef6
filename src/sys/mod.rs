pub mod proc;
pub mod rampages;

pub use proc::ProcTaskResolver;
pub use rampages::RamPagePool;
