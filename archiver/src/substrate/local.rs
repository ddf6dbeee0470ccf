//! In-process substrate.
//!
//! Sub-executions are tokio tasks with a cancellation token each; children
//! hold child tokens so termination cascades. Actions pass through one
//! semaphore per [`WorkerQueue`]. Signals are written to the
//! `execution_signals` table before waiters are woken, so a receiver that
//! starts late (or after a restart) still observes them.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ActionContext, ActionError, ActionReport, ActionRequest, ExecutionFailure, ExecutionHandle,
    ExecutionOutcome, ExecutionScope, JournalEntry, JournalEvent, SignalChannel, SubExecution,
    Substrate, WorkerQueue,
};
use crate::config::ConcurrencyConfig;
use crate::database::repositories::SignalRepository;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Maximum journal entries kept in memory.
const JOURNAL_CAP: usize = 4096;

/// How long a finished execution's outcome stays available to `wait`.
const FINISHED_RETENTION: Duration = Duration::from_secs(600);

struct ExecutionEntry {
    cancel: CancellationToken,
    outcome: watch::Sender<Option<ExecutionOutcome>>,
    reason: Mutex<Option<String>>,
}

impl ExecutionEntry {
    fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }
}

#[derive(Clone, Default)]
struct Journal {
    entries: Arc<Mutex<VecDeque<JournalEntry>>>,
}

impl Journal {
    fn push(&self, execution_id: &str, event: JournalEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= JOURNAL_CAP {
            entries.pop_front();
        }
        entries.push_back(JournalEntry {
            at: now_ms(),
            execution_id: execution_id.to_string(),
            event,
        });
    }

    fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

/// Substrate running everything inside this process.
pub struct LocalSubstrate {
    signals: Arc<dyn SignalRepository>,
    queues: HashMap<WorkerQueue, Arc<Semaphore>>,
    executions: Arc<DashMap<String, Arc<ExecutionEntry>>>,
    heartbeats: DashMap<String, Instant>,
    waiters: Arc<DashMap<(String, SignalChannel), Arc<Notify>>>,
    journal: Journal,
    finished_retention: Duration,
}

impl LocalSubstrate {
    pub fn new(signals: Arc<dyn SignalRepository>, concurrency: &ConcurrencyConfig) -> Self {
        let queues = WorkerQueue::iter()
            .map(|queue| {
                let permits = concurrency.limit(queue).max(1);
                (queue, Arc::new(Semaphore::new(permits)))
            })
            .collect();

        Self {
            signals,
            queues,
            executions: Arc::default(),
            heartbeats: DashMap::new(),
            waiters: Arc::default(),
            journal: Journal::default(),
            finished_retention: FINISHED_RETENTION,
        }
    }

    fn waiter(&self, execution_id: &str, channel: SignalChannel) -> Arc<Notify> {
        self.waiters
            .entry((execution_id.to_string(), channel))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Resolves once the activity has gone `timeout` without a heartbeat.
    async fn heartbeat_expired(&self, activity_id: &str, timeout: Option<Duration>) -> Duration {
        let Some(timeout) = timeout else {
            return std::future::pending().await;
        };
        let check_every = (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
        loop {
            sleep(check_every).await;
            let last = self.heartbeats.get(activity_id).map(|beat| *beat);
            if let Some(last) = last
                && last.elapsed() > timeout
            {
                return timeout;
            }
        }
    }

    async fn run_attempt(
        &self,
        scope: &ExecutionScope,
        request: &ActionRequest,
        attempt: u32,
    ) -> std::result::Result<(), ActionError> {
        let attempt_cancel = scope.cancel.child_token();
        let ctx = ActionContext {
            activity_id: request.activity_id.clone(),
            attempt,
            cancel: attempt_cancel.clone(),
        };
        let timeout = request.policy.start_to_close_timeout;
        let action = (request.action)(ctx);

        let result = tokio::select! {
            result = action => result,
            _ = sleep(timeout) => Err(ActionError::Timeout(timeout)),
            expired = self.heartbeat_expired(&request.activity_id, request.policy.heartbeat_timeout) => {
                Err(ActionError::HeartbeatTimeout(expired))
            }
            _ = scope.cancel.cancelled() => Err(ActionError::Cancelled),
        };
        // Anything the attempt spawned must stop with it.
        attempt_cancel.cancel();
        result
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn start_sub_execution(&self, request: SubExecution) -> Result<ExecutionHandle> {
        let SubExecution {
            execution_id,
            parent,
            body,
        } = request;

        if let Some(existing) = self.executions.get(&execution_id)
            && existing.is_running()
        {
            debug!(execution_id = %execution_id, "Sub-execution already running");
            return Ok(ExecutionHandle::new(execution_id));
        }

        let cancel = match &parent {
            Some(parent) => parent.cancel.child_token(),
            None => CancellationToken::new(),
        };
        let (outcome_tx, _) = watch::channel(None);
        let entry = Arc::new(ExecutionEntry {
            cancel: cancel.clone(),
            outcome: outcome_tx,
            reason: Mutex::new(None),
        });
        self.executions.insert(execution_id.clone(), entry.clone());
        self.journal.push(&execution_id, JournalEvent::ExecutionStarted);
        debug!(
            execution_id = %execution_id,
            parent = parent.as_ref().map(|p| p.execution_id.as_str()),
            "Sub-execution started"
        );

        let scope = ExecutionScope {
            execution_id: execution_id.clone(),
            cancel,
        };
        let journal = self.journal.clone();
        let executions = self.executions.clone();
        let waiters = self.waiters.clone();
        let retention = self.finished_retention;
        tokio::spawn(async move {
            let result = body(scope.clone()).await;
            let outcome = if scope.cancel.is_cancelled() {
                let reason = entry
                    .reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "parent terminated".to_string());
                ExecutionOutcome::Terminated { reason }
            } else {
                match result {
                    Ok(()) => ExecutionOutcome::Completed,
                    Err(err) => {
                        let task = match &err {
                            Error::Task(task) => Some(task.clone()),
                            _ => None,
                        };
                        ExecutionOutcome::Failed(ExecutionFailure {
                            message: err.to_string(),
                            task,
                        })
                    }
                }
            };
            debug!(execution_id = %scope.execution_id, ?outcome, "Sub-execution finished");
            journal.push(
                &scope.execution_id,
                JournalEvent::ExecutionFinished {
                    outcome: format!("{outcome:?}"),
                },
            );
            // Cleared before the outcome is visible, so a restart under the
            // same id never loses its fresh waiters.
            waiters.retain(|(id, _), _| *id != scope.execution_id);
            entry.outcome.send_replace(Some(outcome));

            sleep(retention).await;
            executions.remove_if(&scope.execution_id, |_, current| Arc::ptr_eq(current, &entry));
        });

        Ok(ExecutionHandle::new(execution_id))
    }

    async fn execute_action(&self, scope: &ExecutionScope, request: ActionRequest) -> ActionReport {
        let mut request = request;
        let mut admitted = request.admitted.take();
        let semaphore = match self.queues.get(&request.queue) {
            Some(semaphore) => semaphore.clone(),
            None => {
                return ActionReport {
                    attempts: 0,
                    result: Err(ActionError::permanent(format!(
                        "no worker queue {}",
                        request.queue
                    ))),
                };
            }
        };

        let mut attempt = 0u32;
        loop {
            let permit = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => {
                    return ActionReport { attempts: attempt, result: Err(ActionError::Cancelled) };
                }
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                return ActionReport {
                    attempts: attempt,
                    result: Err(ActionError::permanent("worker queue closed")),
                };
            };

            attempt += 1;
            if let Some(tx) = admitted.take() {
                let _ = tx.send(());
            }
            self.journal.push(
                &scope.execution_id,
                JournalEvent::ActionAdmitted {
                    activity_id: request.activity_id.clone(),
                    attempt,
                },
            );
            self.heartbeats
                .insert(request.activity_id.clone(), Instant::now());

            let result = self.run_attempt(scope, &request, attempt).await;

            self.heartbeats.remove(&request.activity_id);
            drop(permit);

            let err = match result {
                Ok(()) => {
                    self.journal.push(
                        &scope.execution_id,
                        JournalEvent::ActionFinished {
                            activity_id: request.activity_id.clone(),
                            attempts: attempt,
                            ok: true,
                        },
                    );
                    return ActionReport {
                        attempts: attempt,
                        result: Ok(()),
                    };
                }
                Err(err) => err,
            };

            if !err.is_retryable() || !request.policy.should_retry(attempt) {
                self.journal.push(
                    &scope.execution_id,
                    JournalEvent::ActionFinished {
                        activity_id: request.activity_id.clone(),
                        attempts: attempt,
                        ok: false,
                    },
                );
                return ActionReport {
                    attempts: attempt,
                    result: Err(err),
                };
            }

            let delay = request.policy.backoff(attempt);
            warn!(
                activity_id = %request.activity_id,
                attempt,
                max_attempts = request.policy.maximum_attempts,
                ?delay,
                error = %err,
                "Action attempt failed, retrying"
            );
            self.journal.push(
                &scope.execution_id,
                JournalEvent::RetryScheduled {
                    activity_id: request.activity_id.clone(),
                    attempt,
                    delay,
                },
            );

            tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => {
                    return ActionReport { attempts: attempt, result: Err(ActionError::Cancelled) };
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn heartbeat(&self, activity_id: &str, message: &str) {
        if let Some(mut last) = self.heartbeats.get_mut(activity_id) {
            *last = Instant::now();
            debug!(activity_id, message, "Heartbeat");
        }
    }

    async fn signal_external(
        &self,
        target: &ExecutionHandle,
        channel: SignalChannel,
        payload: serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::to_string(&payload)?;
        self.signals
            .put(&target.execution_id, channel.as_str(), &payload)
            .await?;
        self.journal
            .push(&target.execution_id, JournalEvent::SignalSent { channel });
        // Receivers register before reading the table, so nobody waiting
        // means nobody to wake.
        if let Some(waiter) = self.waiters.get(&(target.execution_id.clone(), channel)) {
            waiter.notify_waiters();
        }
        info!(execution_id = %target.execution_id, %channel, "Signal sent");
        Ok(())
    }

    async fn receive_signal(
        &self,
        scope: &ExecutionScope,
        channel: SignalChannel,
    ) -> Result<serde_json::Value> {
        let waiter = self.waiter(&scope.execution_id, channel);
        loop {
            let notified = waiter.notified();
            tokio::pin!(notified);
            // Register before reading so a send between the read and the
            // await is not lost.
            notified.as_mut().enable();

            if let Some(payload) = self
                .signals
                .get(&scope.execution_id, channel.as_str())
                .await?
            {
                self.journal.push(
                    &scope.execution_id,
                    JournalEvent::SignalReceived { channel },
                );
                debug!(execution_id = %scope.execution_id, %channel, "Signal received");
                return Ok(serde_json::from_str(&payload)?);
            }

            tokio::select! {
                _ = scope.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "{} terminated while waiting for {channel}",
                        scope.execution_id
                    )));
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn terminate(&self, execution_id: &str, reason: &str) -> Result<bool> {
        let Some(entry) = self.executions.get(execution_id).map(|e| e.clone()) else {
            return Ok(false);
        };
        if !entry.is_running() {
            return Ok(false);
        }
        *entry.reason.lock() = Some(reason.to_string());
        entry.cancel.cancel();
        self.journal.push(
            execution_id,
            JournalEvent::ExecutionTerminated {
                reason: reason.to_string(),
            },
        );
        info!(execution_id, reason, "Execution terminated");
        Ok(true)
    }

    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionOutcome> {
        let entry = self
            .executions
            .get(&handle.execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_found("Execution", &handle.execution_id))?;
        let mut rx = entry.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::substrate("execution outcome channel closed"))?;
        outcome
            .clone()
            .ok_or_else(|| Error::substrate("execution finished without outcome"))
    }

    fn journal(&self) -> Vec<JournalEntry> {
        self.journal.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxSignalRepository;
    use crate::pipeline::policy::RetryPolicy;
    use crate::substrate::{action_fn, execution_body};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn substrate() -> (tempfile::TempDir, LocalSubstrate) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("substrate.db").display());
        let pool = crate::database::init_pool(&url).await.unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        let signals = Arc::new(SqlxSignalRepository::new(pool));
        (dir, LocalSubstrate::new(signals, &ConcurrencyConfig::default()))
    }

    fn quick_policy(maximum_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(5),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(12),
            maximum_attempts,
            start_to_close_timeout: Duration::from_secs(5),
            heartbeat_timeout: None,
        }
    }

    fn scope(id: &str) -> ExecutionScope {
        ExecutionScope {
            execution_id: id.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn transient_errors_exhaust_max_attempts() {
        let (_dir, substrate) = substrate().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let report = substrate
            .execute_action(
                &scope("exec"),
                ActionRequest {
                    activity_id: "always-fails".into(),
                    queue: WorkerQueue::Archive,
                    policy: quick_policy(4),
                    action: action_fn(move |_ctx| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async { Err(ActionError::transient("flaky")) }
                    }),
                    admitted: None,
                },
            )
            .await;

        assert_eq!(report.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(report.result, Err(ActionError::Transient(_))));

        let delays: Vec<Duration> = substrate
            .journal()
            .into_iter()
            .filter_map(|entry| match entry.event {
                JournalEvent::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(12)
            ]
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (_dir, substrate) = substrate().await;
        let report = substrate
            .execute_action(
                &scope("exec"),
                ActionRequest {
                    activity_id: "bad-input".into(),
                    queue: WorkerQueue::Archive,
                    policy: quick_policy(5),
                    action: action_fn(|_ctx| async { Err(ActionError::permanent("bad")) }),
                    admitted: None,
                },
            )
            .await;
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn silent_action_hits_heartbeat_timeout() {
        let (_dir, substrate) = substrate().await;
        let mut policy = quick_policy(1);
        policy.heartbeat_timeout = Some(Duration::from_millis(50));

        let report = substrate
            .execute_action(
                &scope("exec"),
                ActionRequest {
                    activity_id: "hung".into(),
                    queue: WorkerQueue::VideoDownload,
                    policy,
                    action: action_fn(|_ctx| futures::future::pending()),
                    admitted: None,
                },
            )
            .await;
        assert!(matches!(
            report.result,
            Err(ActionError::HeartbeatTimeout(_))
        ));
    }

    #[tokio::test]
    async fn signal_sent_before_receive_is_latched() {
        let (_dir, substrate) = substrate().await;
        let target = ExecutionHandle::new("chat-archive");
        substrate
            .signal_external(
                &target,
                SignalChannel::ContinueArchive,
                serde_json::json!({"ok": true}),
            )
            .await
            .unwrap();

        let payload = substrate
            .receive_signal(&scope("chat-archive"), SignalChannel::ContinueArchive)
            .await
            .unwrap();
        assert_eq!(payload["ok"], true);
    }

    #[tokio::test]
    async fn terminate_cascades_to_children() {
        let (_dir, substrate) = substrate().await;
        let substrate = Arc::new(substrate);
        let (child_tx, child_rx) = tokio::sync::oneshot::channel();

        let inner = substrate.clone();
        let parent = substrate
            .start_sub_execution(SubExecution {
                execution_id: "root".into(),
                parent: None,
                body: execution_body(move |scope| async move {
                    let child = inner
                        .start_sub_execution(SubExecution {
                            execution_id: "root-child".into(),
                            parent: Some(scope.clone()),
                            body: execution_body(|scope| async move {
                                scope.cancel.cancelled().await;
                                Ok(())
                            }),
                        })
                        .await?;
                    let _ = child_tx.send(child);
                    scope.cancel.cancelled().await;
                    Ok(())
                }),
            })
            .await
            .unwrap();

        let child = child_rx.await.unwrap();
        assert!(substrate.terminate("root", "user stop").await.unwrap());

        let outcome = substrate.wait(&parent).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Terminated { ref reason } if reason == "user stop"));
        let outcome = substrate.wait(&child).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Terminated { .. }));
    }

    #[tokio::test]
    async fn finished_executions_are_pruned() {
        let (_dir, mut substrate) = substrate().await;
        substrate.finished_retention = Duration::from_millis(20);
        let substrate = Arc::new(substrate);

        let inner = substrate.clone();
        let handle = substrate
            .start_sub_execution(SubExecution {
                execution_id: "short-lived".into(),
                parent: None,
                body: execution_body(move |scope| async move {
                    inner
                        .receive_signal(&scope, SignalChannel::StartCapture)
                        .await?;
                    Ok(())
                }),
            })
            .await
            .unwrap();
        substrate
            .signal_external(&handle, SignalChannel::StartCapture, serde_json::json!({}))
            .await
            .unwrap();
        assert!(substrate.wait(&handle).await.unwrap().is_completed());
        assert!(substrate.waiters.is_empty());

        substrate
            .signal_external(
                &ExecutionHandle::new("never-started"),
                SignalChannel::ContinueArchive,
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert!(substrate.waiters.is_empty());

        sleep(Duration::from_millis(200)).await;
        assert!(!substrate.executions.contains_key("short-lived"));
    }
}
