use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use tsbridge_api::{MessageBus, Store};

use crate::binding::{Pipeline, PipelineContext, PipelineTask};
use crate::error::EngineError;
use crate::task::{TaskExit, TaskId};

/// How the pipeline set came down.
#[derive(Debug)]
pub struct ShutdownReport {
    /// The first task to terminate.
    pub trigger: TaskId,
    /// How it terminated.
    pub exit: TaskExit,
    /// Every other task, in the order they unwound.
    pub stopped: Vec<(TaskId, TaskExit)>,
}

impl ShutdownReport {
    pub fn is_faulted(&self) -> bool {
        self.exit.is_faulted()
    }

    /// Tasks the supervisor had to cancel.
    pub fn cancelled(&self) -> impl Iterator<Item = &TaskId> {
        self.stopped
            .iter()
            .filter(|(_, exit)| exit.is_cancelled())
            .map(|(id, _)| id)
    }
}

/// Fail-fast supervisor: runs one receiver + writer per binding and tears
/// the whole set down as soon as any task terminates.
pub struct Supervisor {
    pipelines: Vec<Box<dyn Pipeline>>,
}

impl Supervisor {
    pub fn new(pipelines: Vec<Box<dyn Pipeline>>) -> Self {
        Self { pipelines }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Run every pipeline until the first task terminates, then cancel and
    /// wait for the rest.
    ///
    /// Cancelling `shutdown` from outside (e.g. on Ctrl+C) stops the whole set
    /// the same way; the report's trigger then has a `Cancelled` exit.
    pub async fn run(
        self,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn Store>,
        shutdown: CancellationToken,
    ) -> Result<ShutdownReport, EngineError> {
        if self.pipelines.is_empty() {
            return Err(EngineError::NoPipelines);
        }

        let ctx = PipelineContext {
            bus,
            store,
            token: shutdown.child_token(),
        };

        let mut tasks = JoinSet::new();
        for pipeline in self.pipelines {
            tracing::info!(topic = %pipeline.topic(), schema = %pipeline.schema_name(), "starting pipeline");
            for pipeline_task in pipeline.into_tasks(&ctx) {
                tasks.spawn(watch(pipeline_task));
            }
        }
        tracing::info!(tasks = tasks.len(), "pipelines running");

        let Some((trigger, exit)) = next_exit(&mut tasks).await else {
            return Err(EngineError::NoPipelines);
        };
        match &exit {
            TaskExit::Finished => {
                tracing::info!(task = %trigger, "task finished, shutting down pipelines")
            }
            TaskExit::Faulted(e) => {
                tracing::error!(task = %trigger, error = %e, "task faulted, shutting down pipelines")
            }
            TaskExit::Cancelled => tracing::info!(task = %trigger, "shutdown requested"),
        }

        ctx.token.cancel();

        let mut stopped = Vec::with_capacity(tasks.len());
        while let Some((id, exit)) = next_exit(&mut tasks).await {
            match &exit {
                TaskExit::Cancelled => tracing::warn!(task = %id, "task cancelled"),
                TaskExit::Finished => tracing::info!(task = %id, "task finished during shutdown"),
                TaskExit::Faulted(e) => {
                    tracing::warn!(task = %id, error = %e, "task faulted during shutdown")
                }
            }
            stopped.push((id, exit));
        }

        tracing::info!("shutting down");
        Ok(ShutdownReport {
            trigger,
            exit,
            stopped,
        })
    }
}

/// Run a task on its own and pair its exit with its identity. A panic
/// counts as a fault. Dropping the watcher aborts the task.
async fn watch(task: PipelineTask) -> (TaskId, TaskExit) {
    let exit = match AbortOnDropHandle::new(tokio::spawn(task.future)).await {
        Ok(exit) => exit,
        Err(e) if e.is_panic() => TaskExit::Faulted(EngineError::Panicked(e.to_string())),
        Err(_) => TaskExit::Cancelled,
    };
    (task.id, exit)
}

async fn next_exit(tasks: &mut JoinSet<(TaskId, TaskExit)>) -> Option<(TaskId, TaskExit)> {
    loop {
        match tasks.join_next().await? {
            Ok(done) => return Some(done),
            // Watchers only fail when the runtime aborts them.
            Err(e) => tracing::warn!(error = %e, "task watcher lost"),
        }
    }
}
