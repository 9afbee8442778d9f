//! Process-variable access.
//!
//! The acquisition core talks to every device through a typed key/value bus.
//! `ProcessVariables` is the transport seam; `PvClient` is the cloneable handle
//! the rest of the crate uses, adding typed getters and waited puts with a
//! deadline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AcqError, AppResult};

/// A value read from or written to a process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer/enum record value
    Int(i64),
    /// Floating point record value
    Float(f64),
    /// String or char-array record value
    Str(String),
}

impl PvValue {
    /// Numeric view of the value. Strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Integer view of the value. Floats must be integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            PvValue::Float(_) => None,
            PvValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// String view of the value.
    pub fn as_string(&self) -> String {
        match self {
            PvValue::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<u32> for PvValue {
    fn from(v: u32) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Str(v)
    }
}

impl From<bool> for PvValue {
    fn from(v: bool) -> Self {
        PvValue::Int(i64::from(v))
    }
}

/// Transport for process-variable reads and writes.
///
/// `put` with `wait = true` resolves only once the record has finished processing
/// (for a motor, once the move is complete). Deadlines are applied by the caller.
#[async_trait]
pub trait ProcessVariables: Send + Sync {
    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> AppResult<PvValue>;

    /// Write `value` to `key`, optionally waiting for completion.
    async fn put(&self, key: &str, value: PvValue, wait: bool) -> AppResult<()>;
}

/// Cloneable handle over a shared transport.
#[derive(Clone)]
pub struct PvClient {
    inner: Arc<dyn ProcessVariables>,
}

impl fmt::Debug for PvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PvClient").finish_non_exhaustive()
    }
}

impl PvClient {
    /// Wrap a transport.
    pub fn new(inner: Arc<dyn ProcessVariables>) -> Self {
        Self { inner }
    }

    /// Read a raw value.
    pub async fn get(&self, key: &str) -> AppResult<PvValue> {
        self.inner.get(key).await
    }

    /// Read a value as a float.
    pub async fn get_f64(&self, key: &str) -> AppResult<f64> {
        let value = self.get(key).await?;
        value.as_f64().ok_or_else(|| AcqError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Read a value as an integer.
    pub async fn get_i64(&self, key: &str) -> AppResult<i64> {
        let value = self.get(key).await?;
        value.as_i64().ok_or_else(|| AcqError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Read a value as a string.
    pub async fn get_string(&self, key: &str) -> AppResult<String> {
        Ok(self.get(key).await?.as_string())
    }

    /// Write without waiting for completion.
    pub async fn put(&self, key: &str, value: impl Into<PvValue>) -> AppResult<()> {
        let value = value.into();
        tracing::trace!(key, %value, "put");
        self.inner.put(key, value, false).await
    }

    /// Write and wait for completion, failing with `HardwareTimeout` after `timeout`.
    pub async fn put_wait(
        &self,
        key: &str,
        value: impl Into<PvValue>,
        timeout: Duration,
    ) -> AppResult<()> {
        let value = value.into();
        tracing::trace!(key, %value, ?timeout, "put (wait)");
        match tokio::time::timeout(timeout, self.inner.put(key, value, true)).await {
            Ok(result) => result,
            Err(_) => Err(AcqError::HardwareTimeout {
                key: key.to_string(),
                timeout,
            }),
        }
    }
}
