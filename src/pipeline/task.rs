//! Task Execution
//!
//! Runs a task's shell command and maps a non-zero exit into a
//! [`PipelineError::TaskFailed`].

use std::path::Path;
use std::process::Command;

use log::{debug, error};

use super::model::TaskDef;
use crate::error::PipelineError;

/// Runs `task.command` with `bash -c`, optionally inside `working_dir`.
pub fn run_task(task: &TaskDef, working_dir: Option<&Path>) -> Result<(), PipelineError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(&task.command);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    let output = cmd.output()?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("Task '{}' output:\n{}", task.id, stdout);
        }
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        error!("stderr:\n{}", stderr);
    }

    Err(PipelineError::TaskFailed {
        task: task.id.clone(),
        reason: match output.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        },
    })
}
