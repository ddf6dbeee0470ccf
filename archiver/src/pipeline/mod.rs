//! Archive pipeline orchestration.
//!
//! - `task`: action kinds, handler registry, task errors
//! - `policy`: retry policy per task class
//! - `executor`: task status state machine around one action
//! - `graph`: declarative VOD/Live graphs and their interpreter
//! - `live`: live capture stop coordination
//! - `compensation`: rollback when a live channel has no stream
//! - `completion`: processing flags and the completion notification
//! - `orchestrator`: the job-level service

pub mod compensation;
pub mod completion;
pub mod executor;
pub mod graph;
pub mod live;
pub mod orchestrator;
pub mod policy;
pub mod task;

pub use compensation::{CompensationHandler, CompensationReport};
pub use completion::{CompletionDetector, CompletionState};
pub use executor::{TaskExecutor, TaskRun};
pub use graph::{GraphRunner, Stage, TaskNode, live_graph, vod_graph};
pub use live::{CaptureRegistry, CaptureState, LiveCoordinator};
pub use orchestrator::{ArchiveService, ServiceDeps, VideoRef};
pub use policy::{PolicyTable, RetryPolicy, TaskClass};
pub use task::{ActionHandler, ActionKind, ActionRegistry, ArchiveTarget, TaskError};
