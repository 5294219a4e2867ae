//! Pipeline Definition
//!
//! Tasks, their dependencies and optional instrumentation settings, loaded
//! from YAML.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: thumbnails
//! tasks:
//!   - id: "1"
//!     type: Fetch
//!     command: curl -sO https://example.org/images.tar
//!
//!   - id: "2"
//!     type: Resize
//!     command: ./resize.sh images.tar
//!     depends_on: ["1"]
//!
//! instrumentation:
//!   run_finished: require_destination
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::HookConfig;
use crate::error::PipelineError;
use crate::hooks::TaskGraph;

/// One unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskDef {
    /// Unique task id
    pub id: String,

    /// Task type label shown in reports
    #[serde(rename = "type", alias = "class_type")]
    pub class_type: String,

    /// Shell command run through `bash -c`
    pub command: String,

    /// Ids of tasks that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskDef {
    pub fn new(id: &str, class_type: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            class_type: class_type.to_string(),
            command: command.to_string(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, task_id: &str) -> Self {
        self.depends_on.push(task_id.to_string());
        self
    }
}

/// A whole pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PipelineDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub tasks: Vec<TaskDef>,

    #[serde(default)]
    pub instrumentation: HookConfig,
}

impl PipelineDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task, rejecting duplicate ids.
    pub fn add_task(&mut self, task: TaskDef) -> Result<(), PipelineError> {
        if self.get_task(&task.id).is_some() {
            return Err(PipelineError::DuplicateTask(task.id));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Validates references and returns the tasks in dependency order.
    ///
    /// Uses Kahn's algorithm; ties keep declaration order.
    pub fn execution_order(&self) -> Result<Vec<&TaskDef>, PipelineError> {
        if self.tasks.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PipelineError::DuplicateTask(task.id.clone()));
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in &self.tasks {
            in_degree.insert(&task.id, task.depends_on.len());
            for dependency in &task.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(PipelineError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                dependents.entry(dependency).or_default().push(&task.id);
            }
        }

        let mut queue: VecDeque<&str> = self
            .tasks
            .iter()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.id.as_str())
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(current) = queue.pop_front() {
            order.push(current);

            for &successor in dependents.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(successor);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(PipelineError::CyclicDependency);
        }

        debug!("Execution order: {:?}", order);

        Ok(order
            .into_iter()
            .filter_map(|id| self.get_task(id))
            .collect())
    }

    /// Task map in the shape the deprecated dispatch signature receives.
    pub fn legacy_prompt(&self) -> BTreeMap<String, Value> {
        self.tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    json!({"class_type": t.class_type, "command": t.command}),
                )
            })
            .collect()
    }
}

impl TaskGraph for PipelineDef {
    fn class_type(&self, task_id: &str) -> Option<String> {
        self.get_task(task_id).map(|t| t.class_type.clone())
    }
}

/// Parses a pipeline from YAML text.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDef, PipelineError> {
    let pipeline: PipelineDef = serde_yaml::from_str(yaml)?;
    pipeline.execution_order()?;
    Ok(pipeline)
}

/// Loads and validates a pipeline file.
pub fn load_pipeline(path: &str) -> Result<PipelineDef, PipelineError> {
    info!("Loading pipeline from: {}", path);

    let yaml = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.to_string(),
        source,
    })?;

    let pipeline = parse_pipeline(&yaml)?;
    info!("Pipeline loaded: {} tasks", pipeline.len());
    Ok(pipeline)
}
