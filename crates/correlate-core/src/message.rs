//! Message-keyed correlation.
//!
//! [`MessageTable`] wraps a [`CorrelationTable`] whose key is read from the
//! message itself. Requests and responses carry the same request identifier,
//! so a transport hands every inbound message to [`MessageTable::resolve`] and
//! the table routes it to whoever registered the matching outbound message.
//!
//! Identifiers are normalized into a [`RequestId`]: strings map to themselves,
//! numbers to their decimal form (whole floats as integers), and structured values to compact JSON with
//! sorted object keys. Structurally equal identifiers from distinct message
//! instances therefore correlate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::config::TableConfig;
use crate::delay::Delay;
use crate::error::{Error, Result, TimedOut};
use crate::table::{CorrelationTable, RegisterOptions};
use crate::timer::TimerService;

/// Field read by the [`Correlated`] impl for JSON values.
pub const DEFAULT_ID_FIELD: &str = "request_id";

// =============================================================================
// Request identifiers
// =============================================================================

/// Canonical correlation key derived from a message's request identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Normalize a JSON identifier. `null` counts as absent.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(canonical_number(n).to_string())),
            other => Some(Self(canonical(other).to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Rebuild `value` with object keys inserted in lexicographic order so its
/// compact serialization does not depend on the source's key order.
///
/// serde_json's default `Map` already iterates sorted, but any crate in the
/// build enabling `preserve_order` switches every `Map` to insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

/// Whole floats in integer range are keyed as integers, so `1`, `1.0` and
/// `1e0` name the same request.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn canonical_number(n: &Number) -> Number {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

    if !n.is_f64() {
        return n.clone();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f) => {
            Number::from(f as i64)
        }
        Some(f) if f.fract() == 0.0 && (0.0..TWO_POW_64).contains(&f) => Number::from(f as u64),
        _ => n.clone(),
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl std::borrow::Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A message that carries a request identifier.
pub trait Correlated {
    /// The message's identifier, or `None` when it has none.
    fn request_id(&self) -> Option<RequestId>;
}

impl Correlated for Value {
    fn request_id(&self) -> Option<RequestId> {
        self.get(DEFAULT_ID_FIELD).and_then(RequestId::from_json)
    }
}

/// Extractor reading a top-level field of a JSON object message.
///
/// A missing field, a `null` field, or a non-object message yields `None`.
pub fn json_field_extractor(
    field: impl Into<String>,
) -> impl Fn(&Value) -> Option<RequestId> + Send + Sync + 'static {
    let field = field.into();
    move |message: &Value| message.get(&field).and_then(RequestId::from_json)
}

// =============================================================================
// Options and outcomes
// =============================================================================

/// Options for [`MessageTable::register`].
pub struct MessageOptions<M> {
    pub register: RegisterOptions<M>,
    /// Overrides the table's missing-id policy for this call.
    pub fail_on_missing_id: Option<bool>,
}

impl<M> Default for MessageOptions<M> {
    fn default() -> Self {
        Self {
            register: RegisterOptions::default(),
            fail_on_missing_id: None,
        }
    }
}

impl<M> MessageOptions<M> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.register = self.register.delay(delay);
        self
    }

    #[must_use]
    pub fn failure_message(mut self, message: impl Into<String>) -> Self {
        self.register = self.register.failure_message(message);
        self
    }

    #[must_use]
    pub fn transform(mut self, transform: impl FnOnce(M) -> M + Send + 'static) -> Self {
        self.register = self.register.transform(transform);
        self
    }

    #[must_use]
    pub fn fail_on_missing_id(mut self, fail: bool) -> Self {
        self.fail_on_missing_id = Some(fail);
        self
    }
}

impl<M> From<RegisterOptions<M>> for MessageOptions<M> {
    fn from(register: RegisterOptions<M>) -> Self {
        Self {
            register,
            fail_on_missing_id: None,
        }
    }
}

impl<M> fmt::Debug for MessageOptions<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageOptions")
            .field("register", &self.register)
            .field("fail_on_missing_id", &self.fail_on_missing_id)
            .finish()
    }
}

/// Outcome of a message registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// An entry is pending under this identifier.
    Tracked(RequestId),
    /// The message had no identifier and the policy allowed skipping it.
    Untracked,
}

impl Registration {
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked(_))
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Tracked(id) => Some(id),
            Self::Untracked => None,
        }
    }
}

// =============================================================================
// Message table
// =============================================================================

type Extractor<M> = Arc<dyn Fn(&M) -> Option<RequestId> + Send + Sync>;

/// Correlation table keyed by the request identifier carried in messages.
pub struct MessageTable<M> {
    table: CorrelationTable<RequestId, M>,
    extractor: Extractor<M>,
    fail_on_missing_id: bool,
}

impl<M> Clone for MessageTable<M> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            extractor: Arc::clone(&self.extractor),
            fail_on_missing_id: self.fail_on_missing_id,
        }
    }
}

impl<M> MessageTable<M>
where
    M: Correlated + Send + 'static,
{
    pub fn new(timer: Arc<dyn TimerService>) -> Self {
        Self::with_config(timer, TableConfig::default())
    }

    pub fn with_config(timer: Arc<dyn TimerService>, config: TableConfig) -> Self {
        Self::with_extractor(timer, config, M::request_id)
    }
}

impl MessageTable<Value> {
    /// Table for JSON messages identified by a top-level `id_field`.
    pub fn json(
        timer: Arc<dyn TimerService>,
        config: TableConfig,
        id_field: impl Into<String>,
    ) -> Self {
        Self::with_extractor(timer, config, json_field_extractor(id_field))
    }
}

impl<M> MessageTable<M>
where
    M: Send + 'static,
{
    /// Table reading identifiers with a custom extractor.
    pub fn with_extractor(
        timer: Arc<dyn TimerService>,
        config: TableConfig,
        extractor: impl Fn(&M) -> Option<RequestId> + Send + Sync + 'static,
    ) -> Self {
        let fail_on_missing_id = config.fail_on_missing_id;
        Self {
            table: CorrelationTable::with_config(timer, config),
            extractor: Arc::new(extractor),
            fail_on_missing_id,
        }
    }

    /// Identifier the table would use for `message`.
    pub fn request_id(&self, message: &M) -> Option<RequestId> {
        (self.extractor)(message)
    }

    /// Register continuations for the response to `message`.
    ///
    /// A message without an identifier is an [`Error::InvalidArgument`] when
    /// the missing-id policy is on, and [`Registration::Untracked`] otherwise.
    pub fn register<S, F>(
        &self,
        message: &M,
        on_success: S,
        on_failure: F,
        options: MessageOptions<M>,
    ) -> Result<Registration>
    where
        S: FnOnce(M) + Send + 'static,
        F: FnOnce(TimedOut) + Send + 'static,
    {
        let Some(id) = self.require_id(message, options.fail_on_missing_id)? else {
            return Ok(Registration::Untracked);
        };
        self.table
            .register(id.clone(), on_success, on_failure, options.register)?;
        Ok(Registration::Tracked(id))
    }

    /// Promise-based [`register`](Self::register). An untracked message
    /// yields `Ok(None)`.
    pub fn register_promise(
        &self,
        message: &M,
        options: MessageOptions<M>,
    ) -> Result<Option<promise::Future<M>>> {
        let Some(id) = self.require_id(message, options.fail_on_missing_id)? else {
            return Ok(None);
        };
        self.table.register_promise(id, options.register).map(Some)
    }

    fn require_id(&self, message: &M, fail_override: Option<bool>) -> Result<Option<RequestId>> {
        match self.request_id(message) {
            Some(id) => Ok(Some(id)),
            None if fail_override.unwrap_or(self.fail_on_missing_id) => Err(
                Error::InvalidArgument("message has no request identifier".to_string()),
            ),
            None => {
                debug!("message without request identifier left untracked");
                Ok(None)
            }
        }
    }

    /// Cancel the entry for `message`'s identifier.
    pub fn cancel(&self, message: &M) -> bool {
        self.request_id(message)
            .is_some_and(|id| self.table.cancel(&id))
    }

    /// Route an inbound message to the entry sharing its identifier. The
    /// message itself is the result.
    pub fn resolve(&self, message: M) -> bool {
        match self.request_id(&message) {
            Some(id) => self.table.resolve(&id, message),
            None => false,
        }
    }

    /// Underlying keyed table, for stats and teardown.
    #[must_use]
    pub fn table(&self) -> &CorrelationTable<RequestId, M> {
        &self.table
    }

    #[must_use]
    pub fn fails_on_missing_id(&self) -> bool {
        self.fail_on_missing_id
    }
}

impl<M> fmt::Debug for MessageTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTable")
            .field("table", &self.table)
            .field("fail_on_missing_id", &self.fail_on_missing_id)
            .finish()
    }
}
