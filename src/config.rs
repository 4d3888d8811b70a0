use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::conflict::lock_table::LockWait;
use crate::errors::{LedgerError, Result};
use crate::isolation::{IsolationLevel, PhantomPolicy};

/// Ledger-wide settings.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// default_isolation = "repeatable_read"
/// phantom_policy = "postgresql"
/// gc_interval = 64
///
/// [lock_wait]
/// mode = "block"
/// timeout_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Isolation level used by `Ledger::begin_default`.
    pub default_isolation: IsolationLevel,
    /// How `RepeatableRead` range scans treat concurrently inserted rows.
    pub phantom_policy: PhantomPolicy,
    /// Run garbage collection every this many commits; `0` disables it.
    pub gc_interval: u64,
    /// Behaviour when a row or range lock is held by another transaction.
    /// Kept last so it serializes as a trailing TOML table.
    pub lock_wait: LockWait,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            phantom_policy: PhantomPolicy::default(),
            gc_interval: 128,
            lock_wait: LockWait::default(),
        }
    }
}

impl LedgerConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LedgerError::Config(e.to_string()))
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| LedgerError::Config(e.to_string()))
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn with_phantom_policy(mut self, policy: PhantomPolicy) -> Self {
        self.phantom_policy = policy;
        self
    }

    pub fn with_lock_wait(mut self, lock_wait: LockWait) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_gc_interval(mut self, gc_interval: u64) -> Self {
        self.gc_interval = gc_interval;
        self
    }
}
