pub mod observer;
pub mod stats;

pub use observer::{NaluEvent, NullObserver, PipelineObserver};
pub use stats::{StatsCollector, StatsReporter, StatsSummary};
