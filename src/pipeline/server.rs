//! Event Server
//!
//! The reference host's broadcaster. It remembers the last announced task
//! and hands every event to an [`EventSink`].

use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use log::warn;
use serde::Serialize;
use serde_json::{json, Value};

use crate::hooks::{Broadcaster, EXECUTING_EVENT};

/// Final destination of broadcast events.
pub trait EventSink {
    fn deliver(&self, event: &str, data: &Value, sid: Option<&str>);
}

/// A delivered event.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: String,
    pub data: Value,
    pub sid: Option<String>,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events delivered so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given name.
    pub fn named(&self, event: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &str, data: &Value, sid: Option<&str>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                event: event.to_string(),
                data: data.clone(),
                sid: sid.map(str::to_string),
            });
        }
    }
}

/// Writes one timestamped JSON object per event.
///
/// ```text
/// {"data":{"prompt_id":"run-1"},"event":"execution_start","sid":null,"ts":"2024-05-01T10:00:00.000Z"}
/// ```
pub struct JsonLinesSink<W: Write> {
    writer: Mutex<W>,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn deliver(&self, event: &str, data: &Value, sid: Option<&str>) {
        let line = json!({
            "ts": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "event": event,
            "sid": sid,
            "data": data,
        });

        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write event '{}': {}", event, e);
        }
    }
}

/// Host-side broadcaster.
pub struct PromptServer<S: EventSink> {
    sink: S,
    client_id: Option<String>,
    last_node_id: Mutex<Option<String>>,
}

impl<S: EventSink> PromptServer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            client_id: None,
            last_node_id: Mutex::new(None),
        }
    }

    /// Sets the subscriber that receives run events.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: EventSink> Broadcaster for PromptServer<S> {
    fn send_sync(&self, event: &str, data: &Value, sid: Option<&str>) {
        if event == EXECUTING_EVENT {
            if let Ok(mut last) = self.last_node_id.lock() {
                *last = match data.get("node") {
                    Some(Value::String(id)) => Some(id.clone()),
                    Some(Value::Number(id)) => Some(id.to_string()),
                    _ => None,
                };
            }
        }
        self.sink.deliver(event, data, sid);
    }

    fn client_id(&self) -> Option<String> {
        self.client_id.clone()
    }

    fn last_node_id(&self) -> Option<String> {
        self.last_node_id.lock().ok().and_then(|last| last.clone())
    }
}
