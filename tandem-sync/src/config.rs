//! Replica and coordinator configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tandem_model::{ConflictStrategy, EntitySchema};
use tandem_storage::RetryPolicy;

/// Default number of operations per push or pull.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for a replica and its sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum operations per push or pull.
    pub batch_size: usize,
    /// Deadline for each transport call (ms).
    pub timeout_ms: u64,
    /// Failed pushes before a log entry becomes `Failed`.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long synced log entries are kept before compaction (ms).
    pub retention_horizon_ms: u64,
    /// Applied to `UserChoice` conflicts when no conflict UI is attached.
    pub fallback_strategy: ConflictStrategy,
    /// One declaration per entity type.
    pub schemas: Vec<EntitySchema>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_ms: 30_000,
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            retention_horizon_ms: 7 * 24 * 60 * 60 * 1000,
            fallback_strategy: ConflictStrategy::LastWriteWins,
            schemas: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Parses and validates a JSON configuration. Missing keys take their
    /// defaults.
    pub fn from_json(raw: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds an entity declaration.
    #[must_use]
    pub fn with_schema(mut self, schema: EntitySchema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(SyncError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        match self.fallback_strategy {
            ConflictStrategy::UserChoice | ConflictStrategy::CrdtNative { .. } => {
                return Err(SyncError::Config(format!(
                    "fallback_strategy cannot be {}",
                    self.fallback_strategy.name()
                )));
            }
            _ => {}
        }
        let mut seen = HashSet::new();
        for schema in &self.schemas {
            if schema.entity_type.is_empty() {
                return Err(SyncError::Config("entity_type must not be empty".into()));
            }
            if !seen.insert(schema.entity_type.as_str()) {
                return Err(SyncError::Config(format!(
                    "entity type {} declared twice",
                    schema.entity_type
                )));
            }
        }
        Ok(())
    }

    /// Looks up the declaration of an entity type.
    #[must_use]
    pub fn schema(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.iter().find(|s| s.entity_type == entity_type)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn retention_horizon(&self) -> Duration {
        Duration::from_millis(self.retention_horizon_ms)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}
