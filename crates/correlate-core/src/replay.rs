//! Scripted replay of correlation traffic.
//!
//! A [`Script`] is a JSON list of steps run against a keyed table and a
//! message table that share one [`ManualTimer`]. Time only moves on `advance`
//! steps, so a replay is fully deterministic and its [`ReplayReport`] can be
//! diffed between runs.
//!
//! ```json
//! {
//!   "name": "ping timeout",
//!   "steps": [
//!     { "op": "send", "message": { "request_id": 1, "op": "ping" }, "delay": 100 },
//!     { "op": "advance", "by": 50 },
//!     { "op": "receive", "message": { "request_id": 1, "op": "pong" } },
//!     { "op": "register", "key": "job-7", "delay": { "secs": 1 } },
//!     { "op": "advance", "by": 1000 }
//!   ]
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::delay::Delay;
use crate::error::{Error, Result, TimedOut};
use crate::message::{MessageOptions, MessageTable, Registration};
use crate::table::{CorrelationTable, RegisterOptions, TableStats};
use crate::timer::ManualTimer;

// ---------------------------------------------------------------------------
// Script format
// ---------------------------------------------------------------------------

/// Replay script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Overrides `messages.id_field` for this script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
    pub steps: Vec<Step>,
}

/// Declarative result transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Extract the value at a JSON pointer (`null` when absent).
    Pointer(String),
    /// Wrap the value in an object under the given field.
    Wrap(String),
}

impl Transform {
    #[must_use]
    pub fn apply(&self, value: Value) -> Value {
        match self {
            Self::Pointer(pointer) => value.pointer(pointer).cloned().unwrap_or(Value::Null),
            Self::Wrap(field) => {
                let mut map = serde_json::Map::new();
                map.insert(field.clone(), value);
                Value::Object(map)
            }
        }
    }
}

/// One script step.
///
/// `register`, `resolve`, and `cancel` address the keyed table by string key;
/// `send`, `receive`, and `drop` address the message table by message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Register {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<Delay>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<Transform>,
    },
    Resolve {
        key: String,
        #[serde(default)]
        result: Value,
    },
    Cancel {
        key: String,
    },
    Advance {
        by: Delay,
    },
    Send {
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<Delay>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<Transform>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_on_missing_id: Option<bool>,
    },
    Receive {
        message: Value,
    },
    Drop {
        message: Value,
    },
}

impl Step {
    fn op(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Resolve { .. } => "resolve",
            Self::Cancel { .. } => "cancel",
            Self::Advance { .. } => "advance",
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::Drop { .. } => "drop",
        }
    }
}

impl Script {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let script: Self =
            serde_json::from_str(text).map_err(|e| Error::Replay(format!("invalid script: {e}")))?;
        if script.steps.is_empty() {
            return Err(Error::Replay("script has no steps".to_string()));
        }
        Ok(script)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

// ---------------------------------------------------------------------------
// Events and report
// ---------------------------------------------------------------------------

/// Observable outcome of a replay step or timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    /// A success continuation ran.
    Resolved { at_ms: u64, key: String, value: Value },
    /// A failure continuation ran.
    TimedOut {
        at_ms: u64,
        key: String,
        message: String,
        delay_ms: u64,
    },
    /// A pending entry was cancelled.
    Cancelled { at_ms: u64, step: usize, key: String },
    /// A registration was refused.
    Rejected {
        at_ms: u64,
        step: usize,
        op: String,
        reason: String,
    },
    /// A step matched nothing pending, or a message carried no identifier.
    Ignored {
        at_ms: u64,
        step: usize,
        op: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
}

impl fmt::Display for ReplayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { at_ms, key, value } => {
                write!(f, "[{at_ms:>6}ms] resolved  {key} => {value}")
            }
            Self::TimedOut {
                at_ms,
                key,
                message,
                delay_ms,
            } => write!(
                f,
                "[{at_ms:>6}ms] timed_out {key} after {delay_ms}ms: {message}"
            ),
            Self::Cancelled { at_ms, step, key } => {
                write!(f, "[{at_ms:>6}ms] cancelled {key} (step {step})")
            }
            Self::Rejected {
                at_ms,
                step,
                op,
                reason,
            } => write!(f, "[{at_ms:>6}ms] rejected  {op} (step {step}): {reason}"),
            Self::Ignored {
                at_ms,
                step,
                op,
                key,
            } => match key {
                Some(key) => write!(f, "[{at_ms:>6}ms] ignored   {op} {key} (step {step})"),
                None => write!(f, "[{at_ms:>6}ms] ignored   {op} without id (step {step})"),
            },
        }
    }
}

/// Result of a full replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: usize,
    pub elapsed_ms: u64,
    pub events: Vec<ReplayEvent>,
    /// Keys still pending on the keyed table, sorted.
    pub pending_keys: Vec<String>,
    /// Identifiers still pending on the message table, sorted.
    pub pending_messages: Vec<String>,
    pub keyed: TableStats,
    pub messages: TableStats,
}

// ---------------------------------------------------------------------------
// Replayer
// ---------------------------------------------------------------------------

type EventLog = Arc<Mutex<Vec<ReplayEvent>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(timer: &ManualTimer) -> u64 {
    timer.now().as_millis() as u64
}

/// Runs scripts against a fresh pair of tables.
pub struct Replayer {
    timer: ManualTimer,
    keyed: CorrelationTable<String, Value>,
    messages: MessageTable<Value>,
    events: EventLog,
}

impl Replayer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_id_field(config, &config.messages.id_field)
    }

    #[must_use]
    pub fn with_id_field(config: &Config, id_field: &str) -> Self {
        let timer = ManualTimer::new();
        let shared: Arc<dyn crate::timer::TimerService> = Arc::new(timer.clone());
        Self {
            keyed: CorrelationTable::with_config(Arc::clone(&shared), config.table.clone()),
            messages: MessageTable::json(shared, config.table.clone(), id_field),
            timer,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `script` on tables configured from `config`.
    #[must_use]
    pub fn run(config: &Config, script: &Script) -> ReplayReport {
        let id_field = script
            .id_field
            .as_deref()
            .unwrap_or(&config.messages.id_field);
        let replayer = Self::with_id_field(config, id_field);
        let span = crate::correlate_span!("replay", steps = script.steps.len());
        let _guard = span.enter();
        for (index, step) in script.steps.iter().enumerate() {
            replayer.apply(index, step);
        }
        let mut report = replayer.finish();
        report.name.clone_from(&script.name);
        report.steps = script.steps.len();
        info!(
            events = report.events.len(),
            elapsed_ms = report.elapsed_ms,
            "replay finished"
        );
        report
    }

    /// Apply one step. Steps never fail; refusals are recorded as events.
    pub fn apply(&self, index: usize, step: &Step) {
        debug!(step = index, op = step.op(), "replay step");
        match step {
            Step::Register {
                key,
                delay,
                failure_message,
                transform,
            } => {
                let options = register_options(*delay, failure_message, transform);
                let result = self.keyed.register(
                    key.clone(),
                    self.on_resolved(key.clone()),
                    self.on_timed_out(key.clone()),
                    options,
                );
                if let Err(err) = result {
                    self.reject(index, step, &err);
                }
            }
            Step::Resolve { key, result } => {
                if !self.keyed.resolve(key.as_str(), result.clone()) {
                    self.ignore(index, step, Some(key.clone()));
                }
            }
            Step::Cancel { key } => {
                if self.keyed.cancel(key.as_str()) {
                    self.cancelled(index, key.clone());
                } else {
                    self.ignore(index, step, Some(key.clone()));
                }
            }
            Step::Advance { by } => {
                self.timer.advance(by.as_duration());
            }
            Step::Send {
                message,
                delay,
                failure_message,
                transform,
                fail_on_missing_id,
            } => {
                let mut options: MessageOptions<Value> =
                    register_options(*delay, failure_message, transform).into();
                options.fail_on_missing_id = *fail_on_missing_id;
                let key = self.message_key(message);
                let label = key.clone().unwrap_or_default();
                match self.messages.register(
                    message,
                    self.on_resolved(label.clone()),
                    self.on_timed_out(label),
                    options,
                ) {
                    Ok(Registration::Tracked(_)) => {}
                    Ok(Registration::Untracked) => self.ignore(index, step, None),
                    Err(err) => self.reject(index, step, &err),
                }
            }
            Step::Receive { message } => {
                if !self.messages.resolve(message.clone()) {
                    self.ignore(index, step, self.message_key(message));
                }
            }
            Step::Drop { message } => {
                let key = self.message_key(message);
                match key {
                    Some(key) if self.messages.cancel(message) => self.cancelled(index, key),
                    key => self.ignore(index, step, key),
                }
            }
        }
    }

    fn message_key(&self, message: &Value) -> Option<String> {
        self.messages
            .request_id(message)
            .map(crate::message::RequestId::into_string)
    }

    fn on_resolved(&self, key: String) -> impl FnOnce(Value) + Send + 'static {
        let events = Arc::clone(&self.events);
        let timer = self.timer.clone();
        move |value| {
            lock(&events).push(ReplayEvent::Resolved {
                at_ms: millis(&timer),
                key,
                value,
            });
        }
    }

    fn on_timed_out(&self, key: String) -> impl FnOnce(TimedOut) + Send + 'static {
        let events = Arc::clone(&self.events);
        let timer = self.timer.clone();
        move |failure| {
            lock(&events).push(ReplayEvent::TimedOut {
                at_ms: millis(&timer),
                key,
                message: failure.message,
                delay_ms: failure.delay.as_millis() as u64,
            });
        }
    }

    fn cancelled(&self, step: usize, key: String) {
        lock(&self.events).push(ReplayEvent::Cancelled {
            at_ms: millis(&self.timer),
            step,
            key,
        });
    }

    fn reject(&self, step: usize, op: &Step, err: &Error) {
        lock(&self.events).push(ReplayEvent::Rejected {
            at_ms: millis(&self.timer),
            step,
            op: op.op().to_string(),
            reason: err.to_string(),
        });
    }

    fn ignore(&self, step: usize, op: &Step, key: Option<String>) {
        lock(&self.events).push(ReplayEvent::Ignored {
            at_ms: millis(&self.timer),
            step,
            op: op.op().to_string(),
            key,
        });
    }

    /// Collect events and final table state.
    #[must_use]
    pub fn finish(self) -> ReplayReport {
        let mut pending_keys = self.keyed.pending_keys();
        pending_keys.sort();
        let mut pending_messages: Vec<String> = self
            .messages
            .table()
            .pending_keys()
            .into_iter()
            .map(crate::message::RequestId::into_string)
            .collect();
        pending_messages.sort();

        let events = std::mem::take(&mut *lock(&self.events));
        ReplayReport {
            name: None,
            steps: 0,
            elapsed_ms: millis(&self.timer),
            events,
            pending_keys,
            pending_messages,
            keyed: self.keyed.stats(),
            messages: self.messages.table().stats(),
        }
    }
}

fn register_options(
    delay: Option<Delay>,
    failure_message: &Option<String>,
    transform: &Option<Transform>,
) -> RegisterOptions<Value> {
    let mut options = RegisterOptions::new();
    options.delay = delay;
    options.failure_message.clone_from(failure_message);
    if let Some(transform) = transform.clone() {
        options = options.transform(move |value| transform.apply(value));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(script: &str) -> ReplayReport {
        let script = Script::from_json_str(script).unwrap();
        Replayer::run(&Config::default(), &script)
    }

    #[test]
    fn message_round_trip_and_timeout() {
        let report = run(r#"{
            "name": "ping",
            "steps": [
                {"op": "send", "message": {"request_id": 1, "op": "ping"}, "delay": 100},
                {"op": "send", "message": {"request_id": 2, "op": "ping"}, "delay": 100,
                 "failure_message": "peer silent"},
                {"op": "advance", "by": 50},
                {"op": "receive", "message": {"request_id": 1, "op": "pong"}},
                {"op": "advance", "by": {"ms": 60}},
                {"op": "receive", "message": {"request_id": 2, "op": "late"}}
            ]
        }"#);

        assert_eq!(report.name.as_deref(), Some("ping"));
        assert_eq!(report.steps, 6);
        assert_eq!(report.elapsed_ms, 110);
        assert_eq!(
            report.events,
            vec![
                ReplayEvent::Resolved {
                    at_ms: 50,
                    key: "1".to_string(),
                    value: json!({"request_id": 1, "op": "pong"}),
                },
                ReplayEvent::TimedOut {
                    at_ms: 100,
                    key: "2".to_string(),
                    message: "peer silent".to_string(),
                    delay_ms: 100,
                },
                ReplayEvent::Ignored {
                    at_ms: 110,
                    step: 5,
                    op: "receive".to_string(),
                    key: Some("2".to_string()),
                },
            ]
        );
        assert_eq!(report.messages.resolved, 1);
        assert_eq!(report.messages.timed_out, 1);
        assert_eq!(report.messages.unmatched, 1);
    }

    #[test]
    fn keyed_steps_with_transforms() {
        let report = run(r#"{"steps": [
            {"op": "register", "key": "a", "transform": {"pointer": "/body/n"}},
            {"op": "register", "key": "b", "transform": {"wrap": "payload"}},
            {"op": "register", "key": "c"},
            {"op": "resolve", "key": "a", "result": {"body": {"n": 7}}},
            {"op": "resolve", "key": "b", "result": "x"},
            {"op": "cancel", "key": "c"},
            {"op": "cancel", "key": "c"}
        ]}"#);

        assert_eq!(
            report.events,
            vec![
                ReplayEvent::Resolved {
                    at_ms: 0,
                    key: "a".to_string(),
                    value: json!(7),
                },
                ReplayEvent::Resolved {
                    at_ms: 0,
                    key: "b".to_string(),
                    value: json!({"payload": "x"}),
                },
                ReplayEvent::Cancelled {
                    at_ms: 0,
                    step: 5,
                    key: "c".to_string(),
                },
                ReplayEvent::Ignored {
                    at_ms: 0,
                    step: 6,
                    op: "cancel".to_string(),
                    key: Some("c".to_string()),
                },
            ]
        );
        assert!(report.pending_keys.is_empty());
    }

    #[test]
    fn refusals_become_events() {
        let report = run(r#"{"steps": [
            {"op": "register", "key": "a"},
            {"op": "register", "key": "a"},
            {"op": "send", "message": {"op": "ping"}},
            {"op": "send", "message": {"op": "ping"}, "fail_on_missing_id": false},
            {"op": "drop", "message": {"request_id": "zzz"}}
        ]}"#);

        let kinds: Vec<&str> = report
            .events
            .iter()
            .map(|e| match e {
                ReplayEvent::Rejected { op, .. } | ReplayEvent::Ignored { op, .. } => op.as_str(),
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["register", "send", "send", "drop"]);
        assert!(matches!(&report.events[0], ReplayEvent::Rejected { reason, .. }
            if reason.contains("already pending")));
        assert!(matches!(&report.events[1], ReplayEvent::Rejected { reason, .. }
            if reason.contains("Invalid argument")));
        assert_eq!(report.pending_keys, vec!["a".to_string()]);
        assert_eq!(report.keyed.rejected, 1);
    }

    #[test]
    fn script_id_field_override() {
        let report = run(r#"{"id_field": "corr", "steps": [
            {"op": "send", "message": {"corr": "x"}},
            {"op": "advance", "by": 10},
            {"op": "drop", "message": {"corr": "x"}}
        ]}"#);
        assert!(matches!(&report.events[..], [ReplayEvent::Cancelled { key, .. }] if key == "x"));
        assert!(report.pending_messages.is_empty());
    }

    #[test]
    fn invalid_scripts_are_replay_errors() {
        assert!(matches!(
            Script::from_json_str(r#"{"steps": []}"#),
            Err(Error::Replay(_))
        ));
        assert!(matches!(
            Script::from_json_str(r#"{"steps": [{"op": "explode"}]}"#),
            Err(Error::Replay(_))
        ));
        assert!(matches!(
            Script::from_json_str(r#"{"steps": [{"op": "advance", "by": -5}]}"#),
            Err(Error::Replay(_))
        ));
    }

    #[test]
    fn event_display() {
        let event = ReplayEvent::TimedOut {
            at_ms: 100,
            key: "2".to_string(),
            message: "late".to_string(),
            delay_ms: 100,
        };
        assert_eq!(event.to_string(), "[   100ms] timed_out 2 after 100ms: late");
    }
}
