//! Pipeline Hooks Module
//!
//! Attaches execution-time instrumentation to a host pipeline through
//! explicit registration.
//!
//! - [`host`]: what a host exposes (broadcaster, dispatch signatures)
//! - [`adapter`]: the lifecycle state machine driving the measurements

pub mod adapter;
pub mod host;

pub use adapter::{ExecutionTimeHook, HookState, UNKNOWN_TASK_TYPE};
pub use host::{
    Broadcaster, DispatchCall, HookedBroadcaster, HostCapabilities, Installation,
    InterceptionPoint, TaskGraph, EXECUTING_EVENT, RUN_STARTED_EVENT,
};
