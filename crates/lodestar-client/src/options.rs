//! Registry construction options

use std::time::Duration;

use crate::error::{RegistryError, Result};

/// Default key-space root.
pub const DEFAULT_NAMESPACE: &str = "/microservices";
/// Default lease time-to-live.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);
/// Default number of re-registration attempts per recovery episode.
pub const DEFAULT_MAX_RETRY: u32 = 5;
/// Hard timeout for a single re-registration attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Options recognized by [`Registry`](crate::Registry).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Key-space root, e.g. `/microservices`
    pub namespace: String,
    /// Lease time-to-live, whole seconds
    pub ttl: Duration,
    /// Re-registration attempts per recovery episode
    pub max_retry: u32,
    /// Per-attempt timeout inside a recovery episode
    pub attempt_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: DEFAULT_TTL,
            max_retry: DEFAULT_MAX_RETRY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RegistryOptions {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Reject options the store would refuse; these are never retried.
    pub fn validate(&self) -> Result<()> {
        if !self.namespace.starts_with('/') {
            return Err(RegistryError::InvalidConfig(format!(
                "namespace must start with '/': {:?}",
                self.namespace
            )));
        }
        if self.namespace.len() > 1 && self.namespace.ends_with('/') {
            return Err(RegistryError::InvalidConfig(format!(
                "namespace must not end with '/': {:?}",
                self.namespace
            )));
        }
        if self.ttl < Duration::from_secs(1) || self.ttl.subsec_nanos() != 0 {
            return Err(RegistryError::InvalidConfig(format!(
                "ttl must be a whole number of seconds >= 1s, got {:?}",
                self.ttl
            )));
        }
        if self.attempt_timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "attempt timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Lease TTL as sent to the store.
    pub fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs() as i64
    }

    /// Prefix covering every instance of `name`.
    pub fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}", self.namespace.trim_end_matches('/'), name)
    }

    /// Store key of one instance: `{namespace}/{name}/{id}`.
    pub fn instance_key(&self, name: &str, id: &str) -> String {
        format!("{}/{}", self.service_prefix(name), id)
    }
}
