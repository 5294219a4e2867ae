//! Execution-Time Hook
//!
//! Derives per-task and per-run resource metrics from the host's two
//! interception points:
//!
//! - **Broadcast**: `execution_start` begins a run. `executing` naming a
//!   task means the previous task (if still outstanding) has finished and
//!   the named task is about to start. `executing` without a task ends the
//!   run.
//! - **Dispatch**: when the dispatch of the announced task returns, that
//!   task is reported.
//!
//! Each task baseline is reported at most once. Metrics of the previous task
//! are emitted before the next baseline is recorded.
//!
//! The hook never disturbs the host: host events are always delivered
//! unchanged, dispatch results are returned untouched, and any failure
//! inside the instrumentation is logged and dropped.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde_json::Value;

use super::host::{
    Broadcaster, DispatchCall, HostCapabilities, Installation, InterceptionPoint,
    EXECUTING_EVENT, RUN_STARTED_EVENT,
};
use crate::config::HookConfig;
use crate::error::InstrumentationError;
use crate::monitoring::{
    compute_run_metric, compute_task_metric, publish, EventEmitter, OutboundEvent,
    ResourceSampler, SessionStore,
};

/// Label used when a task's type is not known.
pub const UNKNOWN_TASK_TYPE: &str = "unknown";

/// Lifecycle position of the hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookState {
    /// No run in progress.
    Idle,
    /// A run started; no task announced yet.
    RunActive,
    /// A task was announced and its baseline recorded; not yet reported.
    TaskBaselineRecorded {
        task_id: String,
        run_id: String,
        class_type: Option<String>,
    },
    /// The last announced task has been reported; waiting for the next one.
    TaskPending,
}

/// Parsed `executing` payload.
struct ExecutingSignal {
    node: Option<String>,
    run_id: String,
    class_type: Option<String>,
}

impl ExecutingSignal {
    /// Returns `None` for empty payloads, which carry no lifecycle meaning.
    fn parse(data: &Value) -> Option<Self> {
        let object = data.as_object().filter(|o| !o.is_empty())?;

        let node = match object.get("node") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        Some(Self {
            node,
            run_id: string_field(data, "prompt_id"),
            class_type: data.get("class_type").and_then(Value::as_str).map(str::to_string),
        })
    }
}

fn string_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Addressing of a finished task's event.
#[derive(Clone, Copy)]
enum Delivery<'a> {
    /// Same destination as the triggering signal; `None` reaches everyone.
    Signal(Option<&'a str>),
    /// The host's client, when the host moved on to a new task.
    Client(Option<&'a str>),
}

struct HookInner {
    store: SessionStore,
    state: HookState,
    installation: Installation,
}

impl HookInner {
    fn begin_run(&mut self, sampler: &ResourceSampler) {
        if let HookState::TaskBaselineRecorded { task_id, .. } = &self.state {
            debug!("Discarding unreported task '{}' from the previous run", task_id);
        }
        self.store.begin_run(sampler);
        self.state = HookState::RunActive;
    }

    /// Reports the outstanding task, if any, because `next` was announced.
    ///
    /// Returns `None` when no run is active and the signal must be ignored.
    fn finish_outstanding(
        &mut self,
        next: Option<&str>,
        sid: Option<&str>,
        sampler: &ResourceSampler,
        emitter: &EventEmitter,
    ) -> Result<Option<Vec<OutboundEvent>>, InstrumentationError> {
        if self.state == HookState::Idle {
            match next {
                Some(id) => warn!("Task '{}' announced with no active run; ignoring", id),
                None => debug!("Run-end signal with no active run; ignoring"),
            }
            return Ok(None);
        }

        let HookState::TaskBaselineRecorded {
            task_id,
            run_id,
            class_type,
        } = &self.state
        else {
            return Ok(Some(Vec::new()));
        };

        if next == Some(task_id.as_str()) {
            warn!("Task '{}' announced twice; restarting its measurement", task_id);
            return Ok(Some(Vec::new()));
        }

        let (task_id, run_id, class_type) = (task_id.clone(), run_id.clone(), class_type.clone());
        self.state = HookState::TaskPending;
        self.report_task(
            &task_id,
            &run_id,
            class_type.as_deref(),
            Delivery::Signal(sid),
            sampler,
            emitter,
        )
        .map(Some)
    }

    fn start_task(
        &mut self,
        task_id: String,
        run_id: String,
        class_type: Option<String>,
        sampler: &ResourceSampler,
    ) {
        if self.state == HookState::Idle {
            debug!("Run ended before task '{}' could start; not measured", task_id);
            return;
        }
        if !self.store.begin_task(&task_id, sampler) {
            warn!("Task '{}' announced without a session; not measured", task_id);
            return;
        }
        self.state = HookState::TaskBaselineRecorded {
            task_id,
            run_id,
            class_type,
        };
    }

    fn finish_run(
        &mut self,
        data: &Value,
        run_id: &str,
        sid: Option<&str>,
        sampler: &ResourceSampler,
        emitter: &EventEmitter,
    ) -> Result<Vec<OutboundEvent>, InstrumentationError> {
        if self.state == HookState::Idle {
            debug!("Run already finished; ignoring run-end signal");
            return Ok(Vec::new());
        }
        self.state = HookState::Idle;

        let baseline = self.store.run_baseline().ok_or(InstrumentationError::NoActiveRun)?;
        let metric = compute_run_metric(&baseline, &sampler.snapshot());

        emitter.report_run(run_id, &metric);
        Ok(emitter.run_finished(data, &metric, sid)?.into_iter().collect())
    }

    fn complete_dispatch(
        &mut self,
        call: &DispatchCall<'_>,
        task_type: Option<String>,
        last_node_before: Option<String>,
        host: &dyn Broadcaster,
        sampler: &ResourceSampler,
        emitter: &EventEmitter,
    ) -> Result<Vec<OutboundEvent>, InstrumentationError> {
        let task_id = call.task_id();

        match &self.state {
            HookState::TaskBaselineRecorded {
                task_id: current,
                class_type,
                ..
            } if current == task_id => {
                let task_type = task_type.or_else(|| class_type.clone());
                self.state = HookState::TaskPending;

                // only notify subscribers when the host moved on to a new task
                let changed = last_node_before != host.last_node_id();
                let destination = host.client_id().filter(|_| changed);

                self.report_task(
                    task_id,
                    call.run_id(),
                    task_type.as_deref(),
                    Delivery::Client(destination.as_deref()),
                    sampler,
                    emitter,
                )
            }
            HookState::TaskBaselineRecorded { task_id: current, .. } => {
                warn!(
                    "Task '{}' finished while '{}' was the announced task; not reported",
                    task_id, current
                );
                Ok(Vec::new())
            }
            HookState::Idle => {
                debug!("Task '{}' finished outside of a run", task_id);
                Ok(Vec::new())
            }
            HookState::RunActive | HookState::TaskPending => {
                debug!("Task '{}' finished without a start signal; not reported", task_id);
                Ok(Vec::new())
            }
        }
    }

    fn report_task(
        &self,
        task_id: &str,
        run_id: &str,
        task_type: Option<&str>,
        delivery: Delivery<'_>,
        sampler: &ResourceSampler,
        emitter: &EventEmitter,
    ) -> Result<Vec<OutboundEvent>, InstrumentationError> {
        let baseline = self
            .store
            .task_baseline(task_id)
            .ok_or_else(|| InstrumentationError::MissingBaseline(task_id.to_string()))?;

        let metric = compute_task_metric(task_id, run_id, &baseline, &sampler.snapshot());
        emitter.report_task(task_type.unwrap_or(UNKNOWN_TASK_TYPE), &metric);

        let event = match delivery {
            Delivery::Signal(sid) => emitter.node_executed(&metric, sid)?,
            Delivery::Client(Some(client)) => emitter.node_executed(&metric, Some(client))?,
            Delivery::Client(None) => None,
        };
        Ok(event.into_iter().collect())
    }
}

/// Execution-time instrumentation for a host pipeline.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use exectime::config::HookConfig;
/// use exectime::hooks::{ExecutionTimeHook, HostCapabilities, InterceptionPoint};
/// use exectime::monitoring::ResourceSampler;
///
/// let hook = Arc::new(ExecutionTimeHook::new(ResourceSampler::detect(), HookConfig::default()));
/// let installation = hook.install(
///     &HostCapabilities::new()
///         .with(InterceptionPoint::Execute)
///         .with(InterceptionPoint::Broadcast),
/// );
/// assert!(installation.covers(InterceptionPoint::Broadcast));
/// ```
pub struct ExecutionTimeHook {
    sampler: ResourceSampler,
    emitter: EventEmitter,
    inner: Mutex<HookInner>,
}

impl ExecutionTimeHook {
    pub fn new(sampler: ResourceSampler, config: HookConfig) -> Self {
        Self {
            sampler,
            emitter: EventEmitter::new(config),
            inner: Mutex::new(HookInner {
                store: SessionStore::new(),
                state: HookState::Idle,
                installation: Installation::default(),
            }),
        }
    }

    /// Attaches to every interception point the host offers.
    ///
    /// Points the host lacks are skipped; the hook keeps working with
    /// whatever coverage remains.
    pub fn install(&self, capabilities: &HostCapabilities) -> Installation {
        let mut points = BTreeSet::new();

        for point in [
            InterceptionPoint::Execute,
            InterceptionPoint::RecursiveExecute,
            InterceptionPoint::Broadcast,
        ] {
            if capabilities.offers(point) {
                points.insert(point);
            } else {
                debug!("Host does not offer {:?}; hook not installed there", point);
            }
        }

        let installation = Installation::from_points(points);
        if installation.dispatch_is_noop() {
            debug!("No task-dispatch signature available; dispatch hook is a no-op");
        }

        self.lock().installation = installation.clone();
        installation
    }

    /// Interception points currently hooked.
    pub fn installation(&self) -> Installation {
        self.lock().installation.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HookState {
        self.lock().state.clone()
    }

    pub fn config(&self) -> &HookConfig {
        self.emitter.config()
    }

    /// Broadcast interception: delivers the host event through `origin`
    /// and tracks the lifecycle around it.
    pub fn on_broadcast(&self, event: &str, data: &Value, sid: Option<&str>, origin: &dyn Broadcaster) {
        if !self.lock().installation.covers(InterceptionPoint::Broadcast) {
            origin.send_sync(event, data, sid);
            return;
        }

        if event == RUN_STARTED_EVENT {
            absorb("run start", || {
                self.lock().begin_run(&self.sampler);
                Ok(())
            });
        }

        origin.send_sync(event, data, sid);

        if event == EXECUTING_EVENT {
            self.observe_executing(data, sid, origin);
        }
    }

    /// Dispatch interception: runs `host_dispatch` and reports the task once it
    /// returns. The return value of `host_dispatch` is passed through untouched.
    pub fn dispatch<R>(
        &self,
        call: &DispatchCall<'_>,
        host: &dyn Broadcaster,
        host_dispatch: impl FnOnce() -> R,
    ) -> R {
        if !self.lock().installation.covers(call.point()) {
            return host_dispatch();
        }

        let last_node_before = host.last_node_id();
        let task_type = match call.task_type() {
            Ok(task_type) => Some(task_type),
            Err(e) => {
                debug!("{}", e);
                None
            }
        };

        let result = host_dispatch();

        absorb("task completion", || {
            let events = self.lock().complete_dispatch(
                call,
                task_type,
                last_node_before,
                host,
                &self.sampler,
                &self.emitter,
            )?;
            publish(events, host);
            Ok(())
        });

        result
    }

    fn observe_executing(&self, data: &Value, sid: Option<&str>, origin: &dyn Broadcaster) {
        let Some(signal) = ExecutingSignal::parse(data) else {
            return;
        };

        // the previous task is reported before the next baseline exists
        let finished = absorb("task completion", || {
            self.lock().finish_outstanding(
                signal.node.as_deref(),
                sid,
                &self.sampler,
                &self.emitter,
            )
        });
        match finished {
            Some(None) => return,
            Some(Some(events)) => publish(events, origin),
            None => {}
        }

        match signal.node {
            Some(task_id) => absorb("task start", || {
                self.lock()
                    .start_task(task_id, signal.run_id, signal.class_type, &self.sampler);
                Ok(())
            }),
            None => absorb("run completion", || {
                let events = self.lock().finish_run(
                    data,
                    &signal.run_id,
                    sid,
                    &self.sampler,
                    &self.emitter,
                )?;
                publish(events, origin);
                Ok(())
            }),
        };
    }

    fn lock(&self) -> MutexGuard<'_, HookInner> {
        // a panic absorbed mid-update leaves the state usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs instrumentation code, dropping any error or panic it raises.
fn absorb<T, F>(context: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T, InstrumentationError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Execution-time instrumentation failed during {}: {}", context, e);
            None
        }
        Err(_) => {
            warn!("Execution-time instrumentation panicked during {}", context);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunFinishedPolicy;
    use crate::hooks::{HookedBroadcaster, TaskGraph};
    use crate::monitoring::{
        NullAccelerator, NullStats, ProcessSample, ProcessStats, TrackedAccelerator,
    };
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;
    const CLIENT: &str = "client-1";

    type Sent = (String, Value, Option<String>);

    /// Host broadcaster recording everything it delivers.
    #[derive(Default)]
    struct FakeHost {
        client: Option<String>,
        last_node: RefCell<Option<String>>,
        sent: RefCell<Vec<Sent>>,
    }

    impl FakeHost {
        fn with_client() -> Self {
            Self {
                client: Some(CLIENT.to_string()),
                ..Default::default()
            }
        }

        fn events_named(&self, name: &str) -> Vec<Sent> {
            self.sent
                .borrow()
                .iter()
                .filter(|(event, _, _)| event == name)
                .cloned()
                .collect()
        }

        fn event_names(&self) -> Vec<String> {
            self.sent.borrow().iter().map(|(e, _, _)| e.clone()).collect()
        }
    }

    impl Broadcaster for FakeHost {
        fn send_sync(&self, event: &str, data: &Value, sid: Option<&str>) {
            if event == EXECUTING_EVENT {
                *self.last_node.borrow_mut() =
                    data.get("node").and_then(Value::as_str).map(str::to_string);
            }
            self.sent
                .borrow_mut()
                .push((event.to_string(), data.clone(), sid.map(str::to_string)));
        }

        fn client_id(&self) -> Option<String> {
            self.client.clone()
        }

        fn last_node_id(&self) -> Option<String> {
            self.last_node.borrow().clone()
        }
    }

    /// Process statistics driven by the test.
    #[derive(Clone, Default)]
    struct ScriptedStats {
        memory: Arc<AtomicU64>,
        cpu_ms: Arc<AtomicU64>,
    }

    impl ProcessStats for ScriptedStats {
        fn sample(&self) -> Result<ProcessSample, InstrumentationError> {
            Ok(ProcessSample {
                cpu_time: self.cpu_ms.load(Ordering::SeqCst) as f64 / 1000.0,
                memory: self.memory.load(Ordering::SeqCst),
            })
        }
    }

    struct PanickingStats;

    impl ProcessStats for PanickingStats {
        fn sample(&self) -> Result<ProcessSample, InstrumentationError> {
            panic!("stats backend exploded");
        }
    }

    struct MapGraph(HashMap<String, String>);

    impl TaskGraph for MapGraph {
        fn class_type(&self, task_id: &str) -> Option<String> {
            self.0.get(task_id).cloned()
        }
    }

    fn all_points() -> HostCapabilities {
        HostCapabilities::new()
            .with(InterceptionPoint::Execute)
            .with(InterceptionPoint::RecursiveExecute)
            .with(InterceptionPoint::Broadcast)
    }

    fn hooked(
        sampler: ResourceSampler,
        config: HookConfig,
        caps: &HostCapabilities,
        host: FakeHost,
    ) -> HookedBroadcaster<FakeHost> {
        let hook = Arc::new(ExecutionTimeHook::new(sampler, config));
        hook.install(caps);
        HookedBroadcaster::new(host, hook)
    }

    fn null_sampler() -> ResourceSampler {
        ResourceSampler::new(Box::new(NullStats), Arc::new(NullAccelerator))
    }

    fn start(server: &HookedBroadcaster<FakeHost>, run: &str) {
        server.send_sync(RUN_STARTED_EVENT, &json!({"prompt_id": run}), Some(CLIENT));
    }

    fn announce(server: &HookedBroadcaster<FakeHost>, run: &str, node: &str) {
        server.send_sync(EXECUTING_EVENT, &json!({"node": node, "prompt_id": run}), Some(CLIENT));
    }

    fn finish(server: &HookedBroadcaster<FakeHost>, run: &str, sid: Option<&str>) {
        server.send_sync(EXECUTING_EVENT, &json!({"node": null, "prompt_id": run}), sid);
    }

    #[test]
    fn test_single_task_run_reports_deltas() {
        let stats = ScriptedStats::default();
        stats.memory.store(200 * MIB, Ordering::SeqCst);
        let device = Arc::new(TrackedAccelerator::new());
        let sampler = ResourceSampler::new(Box::new(stats.clone()), device.clone());
        let server = hooked(sampler, HookConfig::default(), &all_points(), FakeHost::with_client());

        let graph = MapGraph(HashMap::from([("1".to_string(), "Sampler".to_string())]));
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "run-a",
        };

        start(&server, "run-a");
        let result = server.hook().dispatch(&call, &server, || {
            announce(&server, "run-a", "1");
            thread::sleep(Duration::from_millis(120));
            stats.memory.fetch_add(50 * MIB, Ordering::SeqCst);
            device.record_alloc(10 * MIB);
            42
        });
        finish(&server, "run-a", Some(CLIENT));

        assert_eq!(result, 42);

        let host = server.inner();
        let executed = host.events_named("execution_time.node_executed");
        assert_eq!(executed.len(), 1);

        let (_, payload, sid) = &executed[0];
        assert_eq!(sid.as_deref(), Some(CLIENT));
        assert_eq!(payload["node"], "1");
        assert_eq!(payload["prompt_id"], "run-a");
        assert_eq!(payload["memory_used"], 52_428_800);
        assert_eq!(payload["accelerator_memory_used"], 10_485_760);
        let elapsed = payload["execution_time_ms"].as_u64().unwrap();
        assert!(elapsed >= 120 && elapsed < 2000, "elapsed {}", elapsed);

        let finished = host.events_named("execution_time.run_finished");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1["prompt_id"], "run-a");
        assert!(finished[0].1["execution_time_ms"].as_u64().unwrap() >= 120);
        assert_eq!(finished[0].1["memory_used"], 52_428_800);
        assert_eq!(server.hook().state(), HookState::Idle);
    }

    #[test]
    fn test_host_events_delivered_unchanged_and_in_order() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        announce(&server, "r", "1");
        announce(&server, "r", "2");
        finish(&server, "r", Some(CLIENT));

        assert_eq!(
            server.inner().event_names(),
            vec![
                "execution_start",
                "executing",
                "executing",
                "execution_time.node_executed",
                "executing",
                "execution_time.node_executed",
                "execution_time.run_finished",
            ]
        );

        let sent = server.inner().sent.borrow();
        assert_eq!(sent[1].1, json!({"node": "1", "prompt_id": "r"}));
        assert_eq!(sent[3].1["node"], "1");
        assert_eq!(sent[5].1["node"], "2");
    }

    #[test]
    fn test_run_end_without_run_start_emits_nothing() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        finish(&server, "r", Some(CLIENT));
        announce(&server, "r", "1");

        assert_eq!(server.inner().event_names(), vec!["executing", "executing"]);
        assert_eq!(server.hook().state(), HookState::Idle);
    }

    #[test]
    fn test_second_run_end_signal_is_ignored() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        finish(&server, "r", Some(CLIENT));
        finish(&server, "r", Some(CLIENT));

        assert_eq!(server.inner().events_named("execution_time.run_finished").len(), 1);
    }

    #[test]
    fn test_aborted_run_baseline_discarded() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "aborted");
        announce(&server, "aborted", "1");
        // no completion, a new run begins
        start(&server, "fresh");
        assert_eq!(server.hook().state(), HookState::RunActive);

        announce(&server, "fresh", "2");
        finish(&server, "fresh", Some(CLIENT));

        let executed = server.inner().events_named("execution_time.node_executed");
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1["node"], "2");
        assert_eq!(executed[0].1["prompt_id"], "fresh");

        let finished = server.inner().events_named("execution_time.run_finished");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].1["prompt_id"], "fresh");
    }

    #[test]
    fn test_deprecated_dispatch_signature_only() {
        let caps = HostCapabilities::new()
            .with(InterceptionPoint::RecursiveExecute)
            .with(InterceptionPoint::Broadcast);
        let server = hooked(null_sampler(), HookConfig::default(), &caps, FakeHost::with_client());

        let installation = server.hook().installation();
        assert!(installation.covers(InterceptionPoint::RecursiveExecute));
        assert!(!installation.covers(InterceptionPoint::Execute));

        let prompt = BTreeMap::from([("7".to_string(), json!({"class_type": "Legacy"}))]);
        let call = DispatchCall::RecursiveExecute {
            prompt: &prompt,
            current_item: "7",
            prompt_id: "old",
        };

        start(&server, "old");
        let out: Result<&str, String> = server.hook().dispatch(&call, &server, || {
            announce(&server, "old", "7");
            Ok("done")
        });
        finish(&server, "old", Some(CLIENT));

        assert_eq!(out, Ok("done"));
        let executed = server.inner().events_named("execution_time.node_executed");
        assert_eq!(executed.len(), 1);

        let keys: Vec<&String> = executed[0].1.as_object().unwrap().keys().collect();
        assert_eq!(
            keys,
            vec![
                "accelerator_memory_used",
                "cpu_time_used_ms",
                "execution_time_ms",
                "memory_used",
                "node",
                "prompt_id",
            ]
        );
    }

    #[test]
    fn test_uninstalled_signature_passes_through() {
        let caps = HostCapabilities::new()
            .with(InterceptionPoint::RecursiveExecute)
            .with(InterceptionPoint::Broadcast);
        let server = hooked(null_sampler(), HookConfig::default(), &caps, FakeHost::with_client());

        let graph = MapGraph(HashMap::new());
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "r",
        };

        start(&server, "r");
        let value = server.hook().dispatch(&call, &server, || {
            announce(&server, "r", "1");
            5
        });
        assert_eq!(value, 5);
        // not reported by dispatch; still outstanding until the next signal
        assert!(matches!(
            server.hook().state(),
            HookState::TaskBaselineRecorded { .. }
        ));

        finish(&server, "r", Some(CLIENT));
        assert_eq!(server.inner().events_named("execution_time.node_executed").len(), 1);
    }

    #[test]
    fn test_dispatch_error_propagates_unchanged() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());
        let graph = MapGraph(HashMap::new());
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "r",
        };

        start(&server, "r");
        let out: Result<(), String> = server.hook().dispatch(&call, &server, || {
            announce(&server, "r", "1");
            Err("task blew up".to_string())
        });

        assert_eq!(out, Err("task blew up".to_string()));
    }

    #[test]
    fn test_each_task_reported_once() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());
        let graph = MapGraph(HashMap::new());

        start(&server, "r");
        for id in ["1", "2"] {
            let call = DispatchCall::Execute {
                graph: &graph,
                current_item: id,
                prompt_id: "r",
            };
            server.hook().dispatch(&call, &server, || announce(&server, "r", id));
        }
        finish(&server, "r", Some(CLIENT));

        let executed = server.inner().events_named("execution_time.node_executed");
        let nodes: Vec<&str> = executed.iter().map(|(_, p, _)| p["node"].as_str().unwrap()).collect();
        assert_eq!(nodes, vec!["1", "2"]);
    }

    #[test]
    fn test_unchanged_last_node_suppresses_event() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());
        let graph = MapGraph(HashMap::new());
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "r",
        };

        start(&server, "r");
        // announced before dispatch: last node does not change across the call
        announce(&server, "r", "1");
        server.hook().dispatch(&call, &server, || ());

        assert!(server.inner().events_named("execution_time.node_executed").is_empty());
        assert_eq!(server.hook().state(), HookState::TaskPending);
    }

    #[test]
    fn test_signal_without_destination_broadcasts_task_event() {
        let caps = HostCapabilities::new().with(InterceptionPoint::Broadcast);
        let server = hooked(null_sampler(), HookConfig::default(), &caps, FakeHost::default());

        server.send_sync(RUN_STARTED_EVENT, &json!({"prompt_id": "r"}), None);
        server.send_sync(EXECUTING_EVENT, &json!({"node": "1", "prompt_id": "r"}), None);
        finish(&server, "r", None);

        let sent = server.inner().sent.borrow().clone();
        let names: Vec<&str> = sent.iter().map(|(e, _, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "execution_start",
                "executing",
                "executing",
                "execution_time.node_executed",
                "execution_time.run_finished",
            ]
        );
        assert_eq!(sent[3].1["node"], "1");
        assert!(sent.iter().all(|(_, _, sid)| sid.is_none()));
    }

    #[test]
    fn test_dispatch_without_client_skips_task_event() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::default());
        let graph = MapGraph(HashMap::new());
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "r",
        };

        start(&server, "r");
        server.hook().dispatch(&call, &server, || {
            server.send_sync(EXECUTING_EVENT, &json!({"node": "1", "prompt_id": "r"}), None);
        });
        assert_eq!(server.hook().state(), HookState::TaskPending);
        finish(&server, "r", None);

        assert!(server.inner().events_named("execution_time.node_executed").is_empty());
        let finished = server.inner().events_named("execution_time.run_finished");
        assert_eq!(finished.len(), 1);
        assert!(finished[0].2.is_none());
    }

    #[test]
    fn test_require_destination_policy() {
        let config = HookConfig::default().with_run_finished(RunFinishedPolicy::RequireDestination);
        let server = hooked(null_sampler(), config, &all_points(), FakeHost::default());

        start(&server, "r");
        server.send_sync(EXECUTING_EVENT, &json!({"node": "1", "prompt_id": "r"}), None);
        finish(&server, "r", None);

        assert!(server.inner().events_named("execution_time.node_executed").is_empty());
        assert!(server.inner().events_named("execution_time.run_finished").is_empty());
        assert_eq!(server.hook().state(), HookState::Idle);
    }

    #[test]
    fn test_no_accelerator_reports_zero() {
        let server = hooked(ResourceSampler::detect(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        announce(&server, "r", "1");
        announce(&server, "r", "2");
        finish(&server, "r", Some(CLIENT));

        for (_, payload, _) in server.inner().events_named("execution_time.node_executed") {
            assert_eq!(payload["accelerator_memory_used"], 0);
            assert!(payload["execution_time_ms"].as_u64().is_some());
        }
        let finished = server.inner().events_named("execution_time.run_finished");
        assert_eq!(finished[0].1["total_accelerator_memory_used"], 0);
    }

    #[test]
    fn test_panicking_sampler_never_breaks_host() {
        let sampler = ResourceSampler::new(Box::new(PanickingStats), Arc::new(NullAccelerator));
        let server = hooked(sampler, HookConfig::default(), &all_points(), FakeHost::with_client());
        let graph = MapGraph(HashMap::new());
        let call = DispatchCall::Execute {
            graph: &graph,
            current_item: "1",
            prompt_id: "r",
        };

        start(&server, "r");
        let value = server.hook().dispatch(&call, &server, || {
            announce(&server, "r", "1");
            "ok"
        });
        finish(&server, "r", Some(CLIENT));

        assert_eq!(value, "ok");
        assert_eq!(
            server.inner().event_names(),
            vec![
                "execution_start",
                "executing",
                "execution_time.node_executed",
                "executing",
                "execution_time.run_finished",
            ]
        );

        // readings from the broken backend count as zero
        let executed = server.inner().events_named("execution_time.node_executed");
        assert_eq!(executed[0].1["memory_used"], 0);
        assert_eq!(executed[0].1["cpu_time_used_ms"], 0);
        let finished = server.inner().events_named("execution_time.run_finished");
        assert_eq!(finished[0].1["memory_used"], 0);
    }

    #[test]
    fn test_task_signal_after_run_end_ignored() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        announce(&server, "r", "1");
        finish(&server, "r", Some(CLIENT));
        assert_eq!(server.hook().state(), HookState::Idle);

        announce(&server, "r", "2");
        finish(&server, "r", Some(CLIENT));

        assert_eq!(server.hook().state(), HookState::Idle);
        assert_eq!(server.inner().events_named("execution_time.node_executed").len(), 1);
        assert_eq!(server.inner().events_named("execution_time.run_finished").len(), 1);
    }

    #[test]
    fn test_idle_check_shares_lock_with_completion() {
        let sampler = null_sampler();
        let emitter = EventEmitter::default();
        let mut inner = HookInner {
            store: SessionStore::new(),
            state: HookState::Idle,
            installation: Installation::default(),
        };

        assert!(inner
            .finish_outstanding(Some("1"), None, &sampler, &emitter)
            .unwrap()
            .is_none());

        inner.start_task("1".to_string(), "r".to_string(), None, &sampler);
        assert_eq!(inner.state, HookState::Idle);
        assert!(inner.finish_run(&json!({}), "r", None, &sampler, &emitter).unwrap().is_empty());

        inner.begin_run(&sampler);
        inner.start_task("1".to_string(), "r".to_string(), None, &sampler);
        let events = inner
            .finish_outstanding(Some("2"), None, &sampler, &emitter)
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(inner.state, HookState::TaskPending);
    }

    #[test]
    fn test_broadcast_not_offered() {
        let caps = HostCapabilities::new().with(InterceptionPoint::Execute);
        let server = hooked(null_sampler(), HookConfig::default(), &caps, FakeHost::with_client());

        start(&server, "r");
        announce(&server, "r", "1");
        finish(&server, "r", Some(CLIENT));

        assert_eq!(server.inner().sent.borrow().len(), 3);
        assert_eq!(server.hook().state(), HookState::Idle);
    }

    #[test]
    fn test_nothing_offered_is_noop() {
        let hook = ExecutionTimeHook::new(null_sampler(), HookConfig::default());
        let installation = hook.install(&HostCapabilities::new());

        assert!(installation.is_empty());
        assert!(installation.dispatch_is_noop());
    }

    #[test]
    fn test_duplicate_announcement_restarts_measurement() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        announce(&server, "r", "1");
        announce(&server, "r", "1");
        finish(&server, "r", Some(CLIENT));

        assert_eq!(server.inner().events_named("execution_time.node_executed").len(), 1);
    }

    #[test]
    fn test_numeric_node_ids_and_class_type_label() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        server.send_sync(
            EXECUTING_EVENT,
            &json!({"node": 3, "prompt_id": "r", "class_type": "Upscale"}),
            Some(CLIENT),
        );
        assert_eq!(
            server.hook().state(),
            HookState::TaskBaselineRecorded {
                task_id: "3".to_string(),
                run_id: "r".to_string(),
                class_type: Some("Upscale".to_string()),
            }
        );
    }

    #[test]
    fn test_empty_executing_payload_ignored() {
        let server = hooked(null_sampler(), HookConfig::default(), &all_points(), FakeHost::with_client());

        start(&server, "r");
        server.send_sync(EXECUTING_EVENT, &json!({}), Some(CLIENT));

        assert_eq!(server.hook().state(), HookState::RunActive);
        assert!(server.inner().events_named("execution_time.run_finished").is_empty());
    }
}
