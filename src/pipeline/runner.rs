//! Pipeline Runner
//!
//! Executes one run of a pipeline, task by task in dependency order, and
//! announces its progress through a [`Broadcaster`]:
//!
//! 1. `execution_start` with the run id
//! 2. per task, inside its dispatch: `executing` naming the task
//! 3. `executing` without a task once every task has finished
//!
//! A failing task aborts the run after an `execution_error` event; the
//! end-of-run signal is then never sent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use serde_json::json;

use super::model::{PipelineDef, TaskDef};
use super::task::run_task;
use crate::error::PipelineError;
use crate::hooks::{
    Broadcaster, DispatchCall, ExecutionTimeHook, HookedBroadcaster, HostCapabilities,
    Installation, InterceptionPoint, EXECUTING_EVENT, RUN_STARTED_EVENT,
};

/// Event sent when a task fails.
pub const EXECUTION_ERROR_EVENT: &str = "execution_error";

/// Event sent after a run completed every task.
pub const EXECUTION_SUCCESS_EVENT: &str = "execution_success";

/// Which task-dispatch signature the runner exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchSignature {
    #[default]
    Current,
    /// Older recursive signature, kept for hooks written against it
    Legacy,
}

impl DispatchSignature {
    fn point(self) -> InterceptionPoint {
        match self {
            Self::Current => InterceptionPoint::Execute,
            Self::Legacy => InterceptionPoint::RecursiveExecute,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub tasks: usize,
    pub elapsed: Duration,
}

/// Sequential pipeline executor.
pub struct Runner {
    pipeline: PipelineDef,
    signature: DispatchSignature,
    working_dir: Option<PathBuf>,
    hook: Option<(Arc<ExecutionTimeHook>, Installation)>,
}

impl Runner {
    pub fn new(pipeline: PipelineDef) -> Self {
        Self {
            pipeline,
            signature: DispatchSignature::Current,
            working_dir: None,
            hook: None,
        }
    }

    /// Selects the dispatch signature offered to hooks.
    pub fn set_dispatch_signature(&mut self, signature: DispatchSignature) {
        self.signature = signature;
    }

    /// Sets the working directory for task commands.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    pub fn pipeline(&self) -> &PipelineDef {
        &self.pipeline
    }

    /// Interception points this runner offers.
    pub fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::new()
            .with(self.signature.point())
            .with(InterceptionPoint::Broadcast)
    }

    /// Registers an execution-time hook on every point this runner offers.
    pub fn register_hook(&mut self, hook: Arc<ExecutionTimeHook>) -> Installation {
        let installation = hook.install(&self.capabilities());
        self.hook = Some((hook, installation.clone()));
        installation
    }

    /// Executes every task once.
    pub fn run(&self, server: &dyn Broadcaster, run_id: &str) -> Result<RunReport, PipelineError> {
        let order = self.pipeline.execution_order()?;
        let start = Instant::now();

        let hooked;
        let channel: &dyn Broadcaster = match &self.hook {
            Some((hook, installation)) if installation.covers(InterceptionPoint::Broadcast) => {
                hooked = HookedBroadcaster::new(server, Arc::clone(hook));
                &hooked
            }
            _ => server,
        };
        let sid = channel.client_id();

        info!("Starting run {} ({} tasks)", run_id, order.len());
        channel.send_sync(RUN_STARTED_EVENT, &json!({ "prompt_id": run_id }), sid.as_deref());

        for task in &order {
            if let Err(e) = self.dispatch(task, channel, run_id) {
                error!("Task '{}' failed: {}", task.id, e);
                channel.send_sync(
                    EXECUTION_ERROR_EVENT,
                    &json!({
                        "prompt_id": run_id,
                        "node_id": task.id,
                        "node_type": task.class_type,
                        "exception_message": e.to_string(),
                    }),
                    sid.as_deref(),
                );
                return Err(e);
            }
        }

        channel.send_sync(
            EXECUTING_EVENT,
            &json!({ "node": null, "prompt_id": run_id }),
            sid.as_deref(),
        );
        channel.send_sync(
            EXECUTION_SUCCESS_EVENT,
            &json!({ "prompt_id": run_id }),
            sid.as_deref(),
        );

        Ok(RunReport {
            run_id: run_id.to_string(),
            tasks: order.len(),
            elapsed: start.elapsed(),
        })
    }

    fn dispatch(
        &self,
        task: &TaskDef,
        channel: &dyn Broadcaster,
        run_id: &str,
    ) -> Result<(), PipelineError> {
        let execute = || {
            channel.send_sync(
                EXECUTING_EVENT,
                &json!({ "node": task.id, "prompt_id": run_id }),
                channel.client_id().as_deref(),
            );
            run_task(task, self.working_dir.as_deref())
        };

        let Some((hook, _)) = &self.hook else {
            return execute();
        };

        match self.signature {
            DispatchSignature::Current => {
                let call = DispatchCall::Execute {
                    graph: &self.pipeline,
                    current_item: &task.id,
                    prompt_id: run_id,
                };
                hook.dispatch(&call, channel, execute)
            }
            DispatchSignature::Legacy => {
                let prompt = self.pipeline.legacy_prompt();
                let call = DispatchCall::RecursiveExecute {
                    prompt: &prompt,
                    current_item: &task.id,
                    prompt_id: run_id,
                };
                hook.dispatch(&call, channel, execute)
            }
        }
    }
}
