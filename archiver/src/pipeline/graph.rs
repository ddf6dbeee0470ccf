//! Declarative task graphs and their interpreter.
//!
//! A graph is a tree of [`Stage`]s built once per job from its options.
//! [`GraphRunner`] walks it inside a substrate execution: tasks go through
//! the [`TaskExecutor`], children and spawned roles become sub-executions,
//! and signal stages use the substrate's named channels.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::database::models::{ArchiveOptions, ExecutionSlot};
use crate::database::repositories::ArchiveRepository;
use crate::pipeline::executor::{TaskExecutor, TaskRun};
use crate::pipeline::task::{ActionKind, ArchiveTarget};
use crate::substrate::{
    ExecutionHandle, ExecutionScope, SignalChannel, SubExecution, Substrate, execution_body,
};
use crate::{Error, Result};

/// One task in a graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub action: ActionKind,
    /// Read and write the task's status column.
    pub tracked: bool,
    /// Signal this role on this channel once the action is admitted.
    pub announce: Option<(ExecutionSlot, SignalChannel)>,
}

impl TaskNode {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            tracked: true,
            announce: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Task(TaskNode),
    /// Run stages in order, stopping at the first error.
    Sequence(Vec<Stage>),
    /// Run stages concurrently. Every branch settles before the first error
    /// (in branch order) is returned.
    Parallel(Vec<Stage>),
    /// Run a stage in a child sub-execution and wait for it.
    Child { name: &'static str, body: Box<Stage> },
    /// Start a stage in a child sub-execution without waiting, recording its
    /// handle on the archive record so other roles can signal it.
    Spawn { slot: ExecutionSlot, body: Box<Stage> },
    /// Wait for a spawned role to finish.
    Join(ExecutionSlot),
    /// Run a stage in the background of the current execution. Its errors
    /// are logged.
    Detached(Box<Stage>),
    Delay(Duration),
    /// Block until the channel is signalled to the current execution.
    AwaitSignal(SignalChannel),
    /// Signal a spawned role. Delivery failure is logged.
    Signal { to: ExecutionSlot, channel: SignalChannel },
}

impl Stage {
    pub fn task(action: ActionKind) -> Self {
        Self::Task(TaskNode::new(action))
    }

    fn untracked(action: ActionKind) -> Self {
        Self::Task(TaskNode {
            tracked: false,
            ..TaskNode::new(action)
        })
    }

    fn child(name: &'static str, body: Stage) -> Self {
        Self::Child {
            name,
            body: Box::new(body),
        }
    }

    fn spawn(slot: ExecutionSlot, body: Stage) -> Self {
        Self::Spawn {
            slot,
            body: Box::new(body),
        }
    }

    /// Every action this stage can run, in declaration order.
    pub fn actions(&self) -> Vec<ActionKind> {
        let mut out = Vec::new();
        self.collect_actions(&mut out);
        out
    }

    fn collect_actions(&self, out: &mut Vec<ActionKind>) {
        match self {
            Self::Task(node) => out.push(node.action),
            Self::Sequence(stages) | Self::Parallel(stages) => {
                stages.iter().for_each(|s| s.collect_actions(out))
            }
            Self::Child { body, .. } | Self::Spawn { body, .. } | Self::Detached(body) => {
                body.collect_actions(out)
            }
            Self::Join(_) | Self::Delay(_) | Self::AwaitSignal(_) | Self::Signal { .. } => {}
        }
    }
}

/// Graph for archiving a finished video.
pub fn vod_graph(options: &ArchiveOptions) -> Stage {
    let video = Stage::child(
        "video",
        Stage::Sequence(vec![
            Stage::task(ActionKind::DownloadVideo),
            Stage::task(ActionKind::ConvertVideo),
            Stage::task(ActionKind::MoveVideo),
        ]),
    );

    let mut archive = vec![video];
    if options.archive_chat {
        let mut chat = vec![Stage::task(ActionKind::DownloadChat)];
        if options.render_chat {
            chat.push(Stage::task(ActionKind::RenderChat));
        }
        chat.push(Stage::task(ActionKind::MoveChat));
        archive.push(Stage::child("chat", Stage::Sequence(chat)));
    }

    Stage::Sequence(vec![
        Stage::task(ActionKind::CreateFolder),
        Stage::Parallel(vec![
            Stage::task(ActionKind::DownloadThumbnails),
            Stage::task(ActionKind::SaveVideoInfo),
        ]),
        Stage::Parallel(archive),
    ])
}

/// Graph for capturing a broadcast while it is live.
///
/// Chat capture and chat archive run as spawned roles ordered by signals:
/// capture starts once the video download is admitted, and the archive
/// starts once capture has finished.
pub fn live_graph(options: &ArchiveOptions, thumbnail_refresh: Duration) -> Stage {
    let mut download = TaskNode::new(ActionKind::DownloadLiveVideo);
    if options.archive_chat {
        download.announce = Some((ExecutionSlot::ChatCapture, SignalChannel::StartCapture));
    }

    let mut stages = vec![
        Stage::task(ActionKind::CreateFolder),
        Stage::Detached(Box::new(Stage::Sequence(vec![
            Stage::task(ActionKind::DownloadLiveThumbnail),
            Stage::Delay(thumbnail_refresh),
            Stage::untracked(ActionKind::DownloadLiveThumbnail),
        ]))),
        Stage::task(ActionKind::SaveLiveVideoInfo),
    ];

    if options.archive_chat {
        stages.push(Stage::spawn(
            ExecutionSlot::ChatCapture,
            Stage::Sequence(vec![
                Stage::AwaitSignal(SignalChannel::StartCapture),
                Stage::task(ActionKind::CaptureLiveChat),
                Stage::Signal {
                    to: ExecutionSlot::ChatArchive,
                    channel: SignalChannel::ContinueArchive,
                },
            ]),
        ));

        let mut chat = vec![
            Stage::AwaitSignal(SignalChannel::ContinueArchive),
            Stage::task(ActionKind::ConvertLiveChat),
        ];
        if options.render_chat {
            chat.push(Stage::task(ActionKind::RenderChat));
        }
        chat.push(Stage::task(ActionKind::MoveChat));
        stages.push(Stage::spawn(ExecutionSlot::ChatArchive, Stage::Sequence(chat)));
    }

    stages.push(Stage::child(
        "video",
        Stage::Sequence(vec![
            Stage::Task(download),
            Stage::task(ActionKind::ConvertVideo),
            Stage::task(ActionKind::MoveVideo),
        ]),
    ));

    if options.archive_chat {
        stages.push(Stage::Join(ExecutionSlot::ChatCapture));
        stages.push(Stage::Join(ExecutionSlot::ChatArchive));
    }

    Stage::Sequence(stages)
}

/// Execution id a role of `archive_id` runs under.
pub fn role_execution_id(archive_id: &str, slot: ExecutionSlot) -> String {
    format!("{archive_id}-{slot}")
}

/// Interprets a [`Stage`] tree for one archive job.
#[derive(Clone)]
pub struct GraphRunner {
    target: ArchiveTarget,
    executor: Arc<TaskExecutor>,
    substrate: Arc<dyn Substrate>,
    archives: Arc<dyn ArchiveRepository>,
}

impl GraphRunner {
    pub fn new(
        target: ArchiveTarget,
        executor: Arc<TaskExecutor>,
        substrate: Arc<dyn Substrate>,
        archives: Arc<dyn ArchiveRepository>,
    ) -> Self {
        Self {
            target,
            executor,
            substrate,
            archives,
        }
    }

    pub fn run<'a>(&'a self, scope: &'a ExecutionScope, stage: &'a Stage) -> BoxFuture<'a, Result<()>> {
        async move {
            match stage {
                Stage::Task(node) => self.run_task(scope, node).await,
                Stage::Sequence(stages) => {
                    for stage in stages {
                        self.run(scope, stage).await?;
                    }
                    Ok(())
                }
                Stage::Parallel(stages) => {
                    let results = join_all(stages.iter().map(|stage| self.run(scope, stage))).await;
                    results.into_iter().collect()
                }
                Stage::Child { name, body } => {
                    let execution_id = format!("{}-{name}", scope.execution_id);
                    let handle = self.start(scope, execution_id, body.as_ref().clone()).await?;
                    self.substrate.wait(&handle).await?.into_result()
                }
                Stage::Spawn { slot, body } => {
                    let execution_id = self.role_handle(*slot).await?.execution_id;
                    self.archives
                        .set_execution_id(&self.target.archive_id, *slot, &execution_id)
                        .await?;
                    self.start(scope, execution_id, body.as_ref().clone()).await?;
                    Ok(())
                }
                Stage::Join(slot) => {
                    let handle = self.role_handle(*slot).await?;
                    debug!(archive_id = %self.target.archive_id, %slot, "Joining role");
                    self.substrate.wait(&handle).await?.into_result()
                }
                Stage::Detached(body) => {
                    let runner = self.clone();
                    let scope = scope.clone();
                    let body = body.as_ref().clone();
                    tokio::spawn(async move {
                        if let Err(e) = runner.run(&scope, &body).await
                            && !e.is_cancelled()
                        {
                            warn!(archive_id = %runner.target.archive_id, error = %e, "Background stage failed");
                        }
                    });
                    Ok(())
                }
                Stage::Delay(duration) => {
                    tokio::select! {
                        _ = scope.cancel.cancelled() => {
                            Err(Error::Cancelled(format!("{} terminated during delay", scope.execution_id)))
                        }
                        _ = tokio::time::sleep(*duration) => Ok(()),
                    }
                }
                Stage::AwaitSignal(channel) => {
                    debug!(execution_id = %scope.execution_id, %channel, "Waiting for signal");
                    self.substrate.receive_signal(scope, *channel).await?;
                    Ok(())
                }
                Stage::Signal { to, channel } => {
                    send_signal(self.substrate.as_ref(), self.archives.as_ref(), &self.target, *to, *channel)
                        .await;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    async fn run_task(&self, scope: &ExecutionScope, node: &TaskNode) -> Result<()> {
        let admitted = node.announce.map(|(slot, channel)| {
            let (tx, rx) = oneshot::channel();
            let substrate = self.substrate.clone();
            let archives = self.archives.clone();
            let target = self.target.clone();
            tokio::spawn(async move {
                // Dropped without firing when the task is skipped or never admitted.
                if rx.await.is_ok() {
                    send_signal(substrate.as_ref(), archives.as_ref(), &target, slot, channel).await;
                }
            });
            tx
        });

        self.executor
            .run(TaskRun {
                scope,
                target: &self.target,
                kind: node.action,
                tracked: node.tracked,
                admitted,
            })
            .await
    }

    async fn start(
        &self,
        scope: &ExecutionScope,
        execution_id: String,
        body: Stage,
    ) -> Result<ExecutionHandle> {
        let runner = self.clone();
        self.substrate
            .start_sub_execution(SubExecution {
                execution_id,
                parent: Some(scope.clone()),
                body: execution_body(move |scope| async move { runner.run(&scope, &body).await }),
            })
            .await
    }

    /// Handle of a role: the recorded one, or the deterministic id for a
    /// role that has not been spawned yet.
    async fn role_handle(&self, slot: ExecutionSlot) -> Result<ExecutionHandle> {
        let record = self.archives.get(&self.target.archive_id).await?;
        let execution_id = record
            .execution_id(slot)
            .map(str::to_string)
            .unwrap_or_else(|| role_execution_id(&self.target.archive_id, slot));
        Ok(ExecutionHandle::new(execution_id))
    }
}

async fn send_signal(
    substrate: &dyn Substrate,
    archives: &dyn ArchiveRepository,
    target: &ArchiveTarget,
    slot: ExecutionSlot,
    channel: SignalChannel,
) {
    let archive_id = target.archive_id.as_str();
    let execution_id = match archives.find(archive_id).await {
        Ok(Some(record)) => match record.execution_id(slot) {
            Some(id) => id.to_string(),
            None => {
                warn!(archive_id, %slot, %channel, "No recorded handle to signal");
                return;
            }
        },
        Ok(None) => {
            debug!(archive_id, %channel, "Archive record gone, not signalling");
            return;
        }
        Err(e) => {
            warn!(archive_id, %channel, error = %e, "Failed to load handle for signal");
            return;
        }
    };

    let payload = serde_json::json!({ "archive_id": archive_id });
    match substrate
        .signal_external(&ExecutionHandle::new(execution_id), channel, payload)
        .await
    {
        Ok(()) => info!(archive_id, %slot, %channel, "Signalled role"),
        Err(e) => warn!(archive_id, %slot, %channel, error = %e, "Signal delivery failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(archive_chat: bool, render_chat: bool) -> ArchiveOptions {
        ArchiveOptions {
            archive_chat,
            render_chat,
            ..Default::default()
        }
    }

    #[test]
    fn vod_graph_without_chat_has_no_chat_actions() {
        let actions = vod_graph(&options(false, true)).actions();
        assert!(!actions.contains(&ActionKind::DownloadChat));
        assert!(!actions.contains(&ActionKind::MoveChat));
        assert_eq!(actions.first(), Some(&ActionKind::CreateFolder));
    }

    #[test]
    fn vod_graph_skips_render_when_disabled() {
        let actions = vod_graph(&options(true, false)).actions();
        assert!(actions.contains(&ActionKind::DownloadChat));
        assert!(!actions.contains(&ActionKind::RenderChat));
    }

    #[test]
    fn live_download_announces_capture_only_with_chat() {
        let find_download = |stage: &Stage| -> Option<TaskNode> {
            fn walk(stage: &Stage) -> Option<TaskNode> {
                match stage {
                    Stage::Task(node) if node.action == ActionKind::DownloadLiveVideo => {
                        Some(node.clone())
                    }
                    Stage::Sequence(s) | Stage::Parallel(s) => s.iter().find_map(walk),
                    Stage::Child { body, .. } | Stage::Spawn { body, .. } | Stage::Detached(body) => {
                        walk(body)
                    }
                    _ => None,
                }
            }
            walk(stage)
        };

        let with_chat = live_graph(&options(true, true), Duration::from_secs(600));
        assert_eq!(
            find_download(&with_chat).and_then(|n| n.announce),
            Some((ExecutionSlot::ChatCapture, SignalChannel::StartCapture))
        );

        let without_chat = live_graph(&options(false, true), Duration::from_secs(600));
        assert_eq!(find_download(&without_chat).and_then(|n| n.announce), None);
        assert!(!without_chat.actions().contains(&ActionKind::CaptureLiveChat));
    }

    #[test]
    fn live_graph_spawns_roles_before_video() {
        let Stage::Sequence(stages) = live_graph(&options(true, true), Duration::from_secs(1)) else {
            panic!("live graph is a sequence");
        };
        let position = |pred: &dyn Fn(&Stage) -> bool| stages.iter().position(|s| pred(s)).unwrap();
        let capture = position(&|s| matches!(s, Stage::Spawn { slot: ExecutionSlot::ChatCapture, .. }));
        let archive = position(&|s| matches!(s, Stage::Spawn { slot: ExecutionSlot::ChatArchive, .. }));
        let video = position(&|s| matches!(s, Stage::Child { name: "video", .. }));
        let join = position(&|s| matches!(s, Stage::Join(ExecutionSlot::ChatArchive)));
        assert!(capture < video && archive < video && video < join);
    }

    #[test]
    fn role_ids_are_stable() {
        assert_eq!(
            role_execution_id("abc", ExecutionSlot::ChatCapture),
            "abc-chat-capture"
        );
    }
}
