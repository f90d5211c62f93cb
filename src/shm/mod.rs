//! Shared-memory plumbing between the producer and encoder processes.

#[cfg(not(unix))]
compile_error!("cubestream shared memory requires a unix target");

pub mod arena;
pub mod process;
pub mod signal;

pub use arena::{Arena, ArenaKind, ArenaValue, Offset, default_shm_dir};
pub use process::{LivenessMonitor, ProcessLock};
pub use signal::{SharedSignal, SignalGuard, WaitOutcome};
