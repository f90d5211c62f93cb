//! Client side: decoded face frames back into complete stereo cubemaps.

pub mod engine;
pub mod handoff;
pub mod policy;

pub use engine::{AssemblyStats, CubemapAssemblyEngine, FrameOutcome};
pub use handoff::{CubemapConsumer, DeliveryHandoff, Handoff, SourceInfo};
pub use policy::{AssemblyOpts, CoveragePolicy, SyncKeyPolicy};
