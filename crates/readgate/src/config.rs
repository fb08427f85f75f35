//! Construction-time configuration for [`ConcurrencyManager`](crate::ConcurrencyManager).

use serde::Serialize;

use crate::error::{Error, Result};
use crate::pool::CloseMode;

pub const DEFAULT_MAX_READERS: usize = 256;
pub const DEFAULT_BUFFER_CAPACITY: usize = 512;
pub const DEFAULT_THREAD_PREFIX: &str = "readgate-worker";

const ENV_MAX_READERS: &str = "READGATE_MAX_READERS";
const ENV_BUFFER_CAPACITY: &str = "READGATE_BUFFER_CAPACITY";
const ENV_CLOSE_MODE: &str = "READGATE_CLOSE_MODE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerConfig {
    /// Reader slots; bounds the number of concurrent reads.
    pub max_readers: usize,
    /// Bytes pre-allocated for each slot's key and value buffers.
    pub buffer_capacity: usize,
    /// Pinned worker threads are named `{prefix}-{n}`.
    pub worker_thread_prefix: String,
    /// How `shutdown` treats slots still held.
    pub close_mode: CloseMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_readers: DEFAULT_MAX_READERS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            worker_thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            close_mode: CloseMode::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_max_readers(mut self, max_readers: usize) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_thread_prefix = prefix.into();
        self
    }

    pub fn with_close_mode(mut self, close_mode: CloseMode) -> Self {
        self.close_mode = close_mode;
        self
    }

    /// Defaults overridden by `READGATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_READERS) {
            config.max_readers = parse_count(ENV_MAX_READERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BUFFER_CAPACITY) {
            config.buffer_capacity = parse_count(ENV_BUFFER_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLOSE_MODE) {
            config.close_mode = CloseMode::parse(&raw).ok_or_else(|| {
                Error::InvalidConfig(format!("{ENV_CLOSE_MODE}={raw:?} (expected drain or strict)"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_readers == 0 {
            return Err(Error::InvalidConfig("max_readers must be at least 1".into()));
        }
        if self.worker_thread_prefix.is_empty() {
            return Err(Error::InvalidConfig("worker_thread_prefix must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_readers, 256);
        assert_eq!(config.worker_thread_prefix, "readgate-worker");
        assert_eq!(config.close_mode, CloseMode::Drain);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("READGATE_MAX_READERS", " 8 "),
            ("READGATE_BUFFER_CAPACITY", "64"),
            ("READGATE_CLOSE_MODE", "strict"),
        ]))
        .unwrap();

        assert_eq!(config.max_readers, 8);
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.close_mode, CloseMode::Strict);
    }

    #[test]
    fn empty_env_yields_defaults() {
        let config = ManagerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        let err = ManagerConfig::from_lookup(lookup(&[("READGATE_MAX_READERS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("READGATE_MAX_READERS")));

        let err = ManagerConfig::from_lookup(lookup(&[("READGATE_MAX_READERS", "0")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ManagerConfig::from_lookup(lookup(&[("READGATE_CLOSE_MODE", "eventually")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("drain or strict")));
    }

    #[test]
    fn builder_setters() {
        let config = ManagerConfig::default()
            .with_max_readers(2)
            .with_buffer_capacity(0)
            .with_thread_prefix("reader")
            .with_close_mode(CloseMode::Strict);
        assert_eq!(config.max_readers, 2);
        assert_eq!(config.buffer_capacity, 0);
        assert_eq!(config.worker_thread_prefix, "reader");
        assert!(ManagerConfig::default().with_thread_prefix("").validate().is_err());
    }
}
