//! Timeout delay for pending entries.
//!
//! [`Delay`] is the single duration type the tables accept. Raw numbers coming
//! from configuration or scripts go through the fallible constructors (or the
//! [`DelaySpec`] serde shape), which reject negative, NaN, and infinite values
//! with [`Error::InvalidArgument`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Non-negative timeout duration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "DelaySpec", into = "DelaySpec")]
pub struct Delay(Duration);

impl Delay {
    pub const ZERO: Self = Self(Duration::ZERO);

    #[must_use]
    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Normalize a fractional millisecond count.
    pub fn try_from_millis_f64(ms: f64) -> Result<Self> {
        Duration::try_from_secs_f64(ms / 1000.0)
            .map(Self)
            .map_err(|_| {
                Error::InvalidArgument(format!(
                    "delay must be a non-negative finite duration, got {ms}ms"
                ))
            })
    }

    /// Normalize a signed millisecond count.
    pub fn try_from_millis_i64(ms: i64) -> Result<Self> {
        u64::try_from(ms)
            .map(Self::from_millis)
            .map_err(|_| Error::InvalidArgument(format!("delay must be non-negative, got {ms}ms")))
    }

    #[must_use]
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        self.0.as_secs_f64() * 1000.0
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<Delay> for Duration {
    fn from(delay: Delay) -> Self {
        delay.0
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

/// Serialized form of a delay: a bare millisecond count, or an explicit
/// wrapper naming its unit.
///
/// ```json
/// 1500
/// { "ms": 1500 }
/// { "secs": 1.5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Millis(f64),
    Explicit(ExplicitDelay),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplicitDelay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secs: Option<f64>,
}

impl TryFrom<DelaySpec> for Delay {
    type Error = Error;

    fn try_from(spec: DelaySpec) -> Result<Self> {
        match spec {
            DelaySpec::Millis(ms) => Self::try_from_millis_f64(ms),
            DelaySpec::Explicit(ExplicitDelay {
                ms: Some(ms),
                secs: None,
            }) => Self::try_from_millis_f64(ms),
            DelaySpec::Explicit(ExplicitDelay {
                ms: None,
                secs: Some(secs),
            }) => Self::try_from_millis_f64(secs * 1000.0),
            DelaySpec::Explicit(_) => Err(Error::InvalidArgument(
                "explicit delay must set exactly one of `ms` or `secs`".to_string(),
            )),
        }
    }
}

impl From<Delay> for DelaySpec {
    fn from(delay: Delay) -> Self {
        Self::Millis(delay.as_millis_f64())
    }
}
