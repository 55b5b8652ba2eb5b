pub mod config;
pub mod constraints;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod pipeline;
pub mod schedule;

// Re-exports: the entry point and the types every caller needs
pub use config::{HardwareConfig, SchedulerConfig, SchedulingType};
pub use constraints::KernelConstraints;
pub use error::ScheduleError;
pub use ir::{Graph, NodeId, Trace};
pub use schedule::{schedule_graph, LoopDecision, LoopReport, ScheduleReport, SkipReason};
