//! Durable-execution substrate.
//!
//! The pipeline never schedules work itself: it asks a [`Substrate`] to start
//! sub-executions, run actions under a retry policy, and deliver named
//! signals between executions. [`LocalSubstrate`] is the in-process
//! implementation backed by tokio and the `execution_signals` table.

pub mod local;

pub use local::LocalSubstrate;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::pipeline::policy::RetryPolicy;
use crate::pipeline::TaskError;
use crate::Result;

/// Named signal channels between live sub-executions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SignalChannel {
    /// Live video download was admitted; chat capture may start.
    StartCapture,
    /// Chat capture finished; chat archive may start.
    ContinueArchive,
}

impl SignalChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartCapture => "start-capture",
            Self::ContinueArchive => "continue-archive",
        }
    }
}

/// Admission-control queues. Each has its own concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerQueue {
    Archive,
    VideoDownload,
    VideoConvert,
    ChatDownload,
    ChatRender,
    /// Live video capture; a permit is held for the whole broadcast.
    Live,
    /// Live chat capture. Kept apart from `Live` so a started capture is
    /// never queued behind the broadcasts it runs alongside.
    LiveChat,
}

/// The execution a piece of graph code is running in.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub execution_id: String,
    /// Cancelled when this execution or any ancestor is terminated.
    pub cancel: CancellationToken,
}

impl ExecutionScope {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Addressable handle of a started sub-execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
}

impl ExecutionHandle {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

/// Body of a sub-execution.
pub type ExecutionBody = Box<dyn FnOnce(ExecutionScope) -> BoxFuture<'static, Result<()>> + Send>;

/// Box a closure as an [`ExecutionBody`].
pub fn execution_body<F, Fut>(f: F) -> ExecutionBody
where
    F: FnOnce(ExecutionScope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |scope| f(scope).boxed())
}

/// Request to start a sub-execution.
pub struct SubExecution {
    /// Stable id. Starting an id that is still running returns its handle.
    pub execution_id: String,
    /// Parent scope; the child is cancelled with it.
    pub parent: Option<ExecutionScope>,
    pub body: ExecutionBody,
}

/// Why a sub-execution failed, in a form every waiter can own.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub message: String,
    /// Set when the failure came from a task, so callers can inspect it.
    pub task: Option<TaskError>,
}

impl From<ExecutionFailure> for crate::Error {
    fn from(failure: ExecutionFailure) -> Self {
        match failure.task {
            Some(task) => crate::Error::Task(task),
            None => crate::Error::Substrate(failure.message),
        }
    }
}

/// Final state of a sub-execution.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed,
    Failed(ExecutionFailure),
    Terminated { reason: String },
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed(failure) => Err(failure.into()),
            Self::Terminated { reason } => Err(crate::Error::Cancelled(reason)),
        }
    }
}

/// Error returned by a single action attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    /// Network or process hiccup. Retried.
    #[error("{0}")]
    Transient(String),

    /// Malformed input or missing file. Not retried.
    #[error("{0}")]
    Permanent(String),

    /// The channel has nothing to capture. Triggers compensation.
    #[error("no playable stream found for channel {channel}")]
    NoStream { channel: String },

    /// Attempt exceeded its start-to-close timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// No heartbeat within the heartbeat timeout.
    #[error("no heartbeat for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The owning execution was terminated.
    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn no_stream(channel: impl Into<String>) -> Self {
        Self::NoStream {
            channel: channel.into(),
        }
    }

    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::HeartbeatTimeout(_)
        )
    }
}

impl From<crate::Error> for ActionError {
    fn from(err: crate::Error) -> Self {
        use crate::Error;
        match err {
            Error::Validation(_)
            | Error::NotFound { .. }
            | Error::Configuration(_)
            | Error::Serialization(_)
            | Error::InvalidStateTransition { .. } => Self::Permanent(err.to_string()),
            Error::Task(task) => task.source,
            Error::Cancelled(_) => Self::Cancelled,
            Error::Io(source) => source.into(),
            Error::IoPath { ref source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                Self::Permanent(err.to_string())
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ActionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::Permanent(err.to_string())
            }
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// Per-attempt context handed to an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub activity_id: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Cancelled when the attempt times out or the execution is terminated.
    pub cancel: CancellationToken,
}

/// A retryable unit of work.
pub type ActionFn =
    Arc<dyn Fn(ActionContext) -> BoxFuture<'static, std::result::Result<(), ActionError>> + Send + Sync>;

/// Wrap a closure as an [`ActionFn`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Request to run an action under a retry policy.
pub struct ActionRequest {
    /// Unique per task run; heartbeats are keyed by it.
    pub activity_id: String,
    pub queue: WorkerQueue,
    pub policy: RetryPolicy,
    pub action: ActionFn,
    /// Fired once, when the first attempt is admitted by its queue.
    pub admitted: Option<oneshot::Sender<()>>,
}

/// Result of running an action to completion or exhaustion.
#[derive(Debug)]
pub struct ActionReport {
    pub attempts: u32,
    pub result: std::result::Result<(), ActionError>,
}

/// Observable substrate events, kept for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEvent {
    ExecutionStarted,
    ExecutionFinished { outcome: String },
    ExecutionTerminated { reason: String },
    ActionAdmitted { activity_id: String, attempt: u32 },
    ActionFinished { activity_id: String, attempts: u32, ok: bool },
    RetryScheduled { activity_id: String, attempt: u32, delay: Duration },
    SignalSent { channel: SignalChannel },
    SignalReceived { channel: SignalChannel },
}

/// One journal line.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Epoch milliseconds.
    pub at: i64,
    pub execution_id: String,
    pub event: JournalEvent,
}

/// Durable-execution substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Start a sub-execution, or return the handle of the running one with
    /// the same id.
    async fn start_sub_execution(&self, request: SubExecution) -> Result<ExecutionHandle>;

    /// Run an action, suspending the caller until it succeeds, fails
    /// permanently, exhausts its policy, or the scope is cancelled.
    async fn execute_action(&self, scope: &ExecutionScope, request: ActionRequest) -> ActionReport;

    /// Record a liveness ping for a running action.
    async fn heartbeat(&self, activity_id: &str, message: &str);

    /// Deliver a durable signal to an execution.
    async fn signal_external(
        &self,
        target: &ExecutionHandle,
        channel: SignalChannel,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Block until `channel` has been signalled to this scope's execution.
    ///
    /// There is no timeout. Returns `Error::Cancelled` if the scope is
    /// terminated first.
    async fn receive_signal(
        &self,
        scope: &ExecutionScope,
        channel: SignalChannel,
    ) -> Result<serde_json::Value>;

    /// Cancel an execution and its children. Returns false if it is not
    /// running in this process.
    async fn terminate(&self, execution_id: &str, reason: &str) -> Result<bool>;

    /// Wait for an execution to finish.
    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionOutcome>;

    /// Snapshot of recent substrate events.
    fn journal(&self) -> Vec<JournalEntry>;
}
