//! Task executor.
//!
//! Wraps one action with the task status state machine: skip if already
//! done, mark RUNNING, run through the substrate under the class's retry
//! policy, then record SUCCESS or FAILED. A live capture found RUNNING was
//! interrupted and is settled from its partial output instead of rerun.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::database::models::TaskStatus;
use crate::database::repositories::ArchiveRepository;
use crate::notification::{ArchiveEvent, NotificationService};
use crate::pipeline::completion::CompletionDetector;
use crate::pipeline::policy::PolicyTable;
use crate::pipeline::task::{ActionKind, ActionRegistry, ArchiveTarget, TaskError};
use crate::substrate::{ActionError, ActionRequest, ExecutionScope, Substrate, action_fn};
use crate::{Error, Result};

/// One task invocation inside a graph.
pub struct TaskRun<'a> {
    pub scope: &'a ExecutionScope,
    pub target: &'a ArchiveTarget,
    pub kind: ActionKind,
    /// Whether the task's status column is read and written. Untracked runs
    /// (the delayed live thumbnail refresh) only execute the action.
    pub tracked: bool,
    /// Fired when the first attempt is admitted.
    pub admitted: Option<oneshot::Sender<()>>,
}

pub struct TaskExecutor {
    archives: Arc<dyn ArchiveRepository>,
    substrate: Arc<dyn Substrate>,
    registry: ActionRegistry,
    policies: PolicyTable,
    heartbeat_interval: Duration,
    completion: Arc<CompletionDetector>,
    notifications: NotificationService,
}

impl TaskExecutor {
    pub fn new(
        archives: Arc<dyn ArchiveRepository>,
        substrate: Arc<dyn Substrate>,
        registry: ActionRegistry,
        policies: PolicyTable,
        heartbeat_interval: Duration,
        completion: Arc<CompletionDetector>,
        notifications: NotificationService,
    ) -> Self {
        Self {
            archives,
            substrate,
            registry,
            policies,
            heartbeat_interval,
            completion,
            notifications,
        }
    }

    pub async fn run(&self, run: TaskRun<'_>) -> Result<()> {
        let TaskRun {
            scope,
            target,
            mut kind,
            tracked,
            admitted,
        } = run;
        let task = kind.task();
        let archive_id = target.archive_id.as_str();
        let fail = |attempts, source| Error::Task(TaskError::new(task, attempts, source));

        if tracked {
            let Some(record) = self.archives.find(archive_id).await? else {
                warn!(archive_id, %task, "Archive record gone, not running task");
                return Err(fail(0, ActionError::Cancelled));
            };
            match record.status(task) {
                TaskStatus::Success => {
                    debug!(archive_id, %task, "Task already succeeded, skipping");
                    return Ok(());
                }
                TaskStatus::Failed => {
                    return Err(fail(
                        0,
                        ActionError::permanent("task previously failed; reset it to retry"),
                    ));
                }
                TaskStatus::Running => {
                    if let Some(finish) = kind.on_interrupted() {
                        info!(
                            archive_id,
                            %task,
                            interrupted = %kind,
                            action = %finish,
                            "Task was interrupted, keeping its partial output"
                        );
                        kind = finish;
                    }
                }
                TaskStatus::Pending => {}
            }
            if !self
                .archives
                .transition_task(archive_id, task, TaskStatus::Running)
                .await?
            {
                warn!(archive_id, %task, "Could not mark task running");
                return Err(fail(0, ActionError::Cancelled));
            }
        }

        let Some(handler) = self.registry.get(kind) else {
            let err = ActionError::permanent(format!("no handler registered for {kind}"));
            self.record_failure(target, kind, tracked, 0, &err).await;
            return Err(fail(0, err));
        };

        let policy = self.policies.for_class(kind.class()).clone();
        let heartbeat_every = policy.heartbeat_timeout.map(|_| self.heartbeat_interval);
        let action = {
            let substrate = self.substrate.clone();
            let target = target.clone();
            action_fn(move |ctx| {
                let handler = handler.clone();
                let substrate = substrate.clone();
                let target = target.clone();
                async move {
                    let activity_id = ctx.activity_id.clone();
                    let work = handler.run(ctx, &target);
                    let Some(every) = heartbeat_every else {
                        return work.await;
                    };
                    tokio::pin!(work);
                    let mut ticker = tokio::time::interval(every);
                    loop {
                        tokio::select! {
                            result = &mut work => return result,
                            _ = ticker.tick() => substrate.heartbeat(&activity_id, "running").await,
                        }
                    }
                }
            })
        };

        info!(archive_id, %task, action = %kind, "Task started");
        let report = self
            .substrate
            .execute_action(
                scope,
                ActionRequest {
                    activity_id: format!("{archive_id}/{kind}/{}", uuid::Uuid::new_v4()),
                    queue: kind.queue(),
                    policy,
                    action,
                    admitted,
                },
            )
            .await;

        match report.result {
            Ok(()) => {
                info!(archive_id, %task, attempts = report.attempts, "Task succeeded");
                if tracked {
                    self.archives
                        .transition_task(archive_id, task, TaskStatus::Success)
                        .await?;
                    if let Err(e) = self.completion.evaluate(archive_id).await {
                        warn!(archive_id, error = %e, "Completion check failed");
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.record_failure(target, kind, tracked, report.attempts, &err)
                    .await;
                Err(fail(report.attempts, err))
            }
        }
    }

    async fn record_failure(
        &self,
        target: &ArchiveTarget,
        kind: ActionKind,
        tracked: bool,
        attempts: u32,
        err: &ActionError,
    ) {
        let task = kind.task();
        let archive_id = target.archive_id.as_str();

        if matches!(err, ActionError::Cancelled) {
            // Left RUNNING so a resume picks the task up again.
            debug!(archive_id, %task, "Task cancelled");
            return;
        }

        if tracked
            && let Err(e) = self
                .archives
                .transition_task(archive_id, task, TaskStatus::Failed)
                .await
        {
            warn!(archive_id, %task, error = %e, "Failed to mark task failed");
        }

        if let ActionError::NoStream { channel } = err {
            info!(archive_id, %task, channel = %channel, "No playable stream");
            return;
        }

        warn!(archive_id, %task, attempts, error = %err, "Task failed");
        self.notifications
            .notify(ArchiveEvent::TaskFailed {
                archive_id: target.archive_id.clone(),
                vod_id: target.vod_id.clone(),
                task,
                attempts,
                error_message: err.to_string(),
                timestamp: Utc::now(),
            })
            .await;
    }
}
