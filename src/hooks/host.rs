//! Host Pipeline Interface
//!
//! What the instrumented pipeline has to offer for the hook to attach to:
//! a broadcaster for lifecycle events and one or both task-dispatch
//! signatures. Hosts advertise these through [`HostCapabilities`] and
//! register the hook explicitly instead of having functions rebound.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use super::adapter::ExecutionTimeHook;
use crate::error::InstrumentationError;

/// Event announcing that a run has started.
pub const RUN_STARTED_EVENT: &str = "execution_start";

/// Event announcing the task about to run, or the end of the run when the
/// payload carries no `node`.
pub const EXECUTING_EVENT: &str = "executing";

/// Lifecycle event channel of the host.
pub trait Broadcaster {
    /// Delivers `event` to the subscriber `sid`, or to everyone when `None`.
    fn send_sync(&self, event: &str, data: &Value, sid: Option<&str>);

    /// Destination of the subscriber that submitted the current run.
    fn client_id(&self) -> Option<String>;

    /// Id of the task named by the most recent `executing` event.
    fn last_node_id(&self) -> Option<String>;
}

impl<T: Broadcaster + ?Sized> Broadcaster for &T {
    fn send_sync(&self, event: &str, data: &Value, sid: Option<&str>) {
        (**self).send_sync(event, data, sid)
    }

    fn client_id(&self) -> Option<String> {
        (**self).client_id()
    }

    fn last_node_id(&self) -> Option<String> {
        (**self).last_node_id()
    }
}

/// Task graph handed to the current dispatch signature.
pub trait TaskGraph {
    /// Type label of a task, if the task exists.
    fn class_type(&self, task_id: &str) -> Option<String>;
}

/// Interception points a host may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InterceptionPoint {
    /// Current task-dispatch signature.
    Execute,
    /// Deprecated recursive task-dispatch signature.
    RecursiveExecute,
    /// Lifecycle broadcast.
    Broadcast,
}

/// One task dispatch, in whichever signature the host uses.
///
/// Host-internal arguments (caches, executed set, pending results) stay
/// with the host's own dispatch closure; only what the hook reads is here.
pub enum DispatchCall<'a> {
    Execute {
        graph: &'a dyn TaskGraph,
        current_item: &'a str,
        prompt_id: &'a str,
    },
    RecursiveExecute {
        prompt: &'a BTreeMap<String, Value>,
        current_item: &'a str,
        prompt_id: &'a str,
    },
}

impl DispatchCall<'_> {
    /// The interception point this call arrives through.
    pub fn point(&self) -> InterceptionPoint {
        match self {
            Self::Execute { .. } => InterceptionPoint::Execute,
            Self::RecursiveExecute { .. } => InterceptionPoint::RecursiveExecute,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Execute { current_item, .. } | Self::RecursiveExecute { current_item, .. } => {
                current_item
            }
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Execute { prompt_id, .. } | Self::RecursiveExecute { prompt_id, .. } => prompt_id,
        }
    }

    /// Resolves the task type label the way each signature stores it.
    pub fn task_type(&self) -> Result<String, InstrumentationError> {
        let id = self.task_id();
        let missing = || InstrumentationError::Sampling(format!("no class_type for task '{}'", id));

        match self {
            Self::Execute { graph, .. } => graph.class_type(id).ok_or_else(missing),
            Self::RecursiveExecute { prompt, .. } => prompt
                .get(id)
                .and_then(|node| node.get("class_type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(missing),
        }
    }
}

/// Interception points offered by a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    points: BTreeSet<InterceptionPoint>,
}

impl HostCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, point: InterceptionPoint) -> Self {
        self.points.insert(point);
        self
    }

    pub fn offers(&self, point: InterceptionPoint) -> bool {
        self.points.contains(&point)
    }
}

/// Interception points the hook actually attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Installation {
    points: BTreeSet<InterceptionPoint>,
}

impl Installation {
    pub(crate) fn from_points(points: BTreeSet<InterceptionPoint>) -> Self {
        Self { points }
    }

    pub fn covers(&self, point: InterceptionPoint) -> bool {
        self.points.contains(&point)
    }

    /// True when no dispatch signature was hooked.
    pub fn dispatch_is_noop(&self) -> bool {
        !self.covers(InterceptionPoint::Execute) && !self.covers(InterceptionPoint::RecursiveExecute)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = InterceptionPoint> + '_ {
        self.points.iter().copied()
    }
}

/// Host broadcaster with the hook registered on it.
///
/// Every event goes to the wrapped broadcaster unchanged; the hook observes
/// lifecycle events around that delivery and adds its own events.
pub struct HookedBroadcaster<B: Broadcaster> {
    inner: B,
    hook: Arc<ExecutionTimeHook>,
}

impl<B: Broadcaster> HookedBroadcaster<B> {
    pub fn new(inner: B, hook: Arc<ExecutionTimeHook>) -> Self {
        Self { inner, hook }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn hook(&self) -> &Arc<ExecutionTimeHook> {
        &self.hook
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: Broadcaster> Broadcaster for HookedBroadcaster<B> {
    fn send_sync(&self, event: &str, data: &Value, sid: Option<&str>) {
        self.hook.on_broadcast(event, data, sid, &self.inner);
    }

    fn client_id(&self) -> Option<String> {
        self.inner.client_id()
    }

    fn last_node_id(&self) -> Option<String> {
        self.inner.last_node_id()
    }
}
