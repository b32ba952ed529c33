pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod optim;
pub mod sampling;
pub mod scheduler;
pub mod train;

pub use checkpoint::{resume_from, CheckpointManager};
pub use config::{OptimizerKind, RunConfig, SchedulerKind};
pub use dataset::{Batch, BatchSource, FormulaDataset};
pub use error::{Result, TrainError};
pub use metrics::{JsonlSink, MetricSink};
pub use optim::OptimizationDriver;
pub use sampling::{SampleReport, SamplingMonitor};
pub use scheduler::LrSchedule;
pub use train::{EpochPhase, RunSummary, Trainer};
