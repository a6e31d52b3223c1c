//! Configuration types for the managed ledger
//!
//! `ManagedLedgerConfig` is per ledger; `FactoryConfig` covers the process
//! wide pieces (entry cache budget, background task periods) and carries
//! the default ledger configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Replication parameters handed to the segment store when a segment is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub ensemble_size: u32,
    pub write_quorum: u32,
    pub ack_quorum: u32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 3,
            write_quorum: 2,
            ack_quorum: 2,
        }
    }
}

/// Per-ledger configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedLedgerConfig {
    /// Roll over once the current segment holds this many entries
    pub max_entries_per_segment: u64,
    /// Roll over once the current segment holds this many megabytes
    pub max_size_per_segment_mb: u64,
    /// A segment younger than this is never rolled over (ms)
    pub min_rollover_time_ms: u64,
    /// A non-empty segment older than this is rolled over (ms)
    pub max_rollover_time_ms: u64,
    /// How long consumed segments are kept (ms). -1 keeps forever, 0 keeps nothing.
    pub retention_time_ms: i64,
    /// How many consumed megabytes are kept. -1 is unbounded, 0 keeps nothing.
    pub retention_size_mb: i64,
    /// Deadline for one append (ms). 0 disables.
    pub add_entry_timeout_ms: u64,
    /// Deadline for one segment read (ms). 0 disables.
    pub read_entry_timeout_ms: u64,
    /// Deadline for segment create/seal/open and metadata calls (ms)
    pub metadata_operations_timeout_ms: u64,
    /// Roll over a segment that has seen no adds for this long (ms). 0 disables.
    pub inactive_segment_rollover_time_ms: u64,
    /// Return from open before durable cursors are recovered
    pub lazy_cursor_recovery: bool,
    /// Evict cache entries by the slowest mark-delete instead of the slowest read position
    pub cache_eviction_by_mark_delete_position: bool,
    /// Create the ledger when no metadata exists
    pub create_if_missing: bool,
    pub ensemble: EnsembleConfig,
    /// Above this many unacked ranges cursor state moves to a metadata segment
    pub max_unacked_ranges_inline: usize,
    /// Bound on local retries after a metadata version conflict
    pub metadata_max_retries: u32,
    /// Offload sealed segments once the ledger exceeds this size. -1 disables.
    pub offload_threshold_bytes: i64,
}

impl Default for ManagedLedgerConfig {
    fn default() -> Self {
        Self {
            max_entries_per_segment: 50_000,
            max_size_per_segment_mb: 2048,
            min_rollover_time_ms: 0,
            max_rollover_time_ms: 4 * 60 * 60 * 1000, // 4 hours
            retention_time_ms: 0,
            retention_size_mb: 0,
            add_entry_timeout_ms: 30_000,
            read_entry_timeout_ms: 120_000,
            metadata_operations_timeout_ms: 60_000,
            inactive_segment_rollover_time_ms: 0,
            lazy_cursor_recovery: false,
            cache_eviction_by_mark_delete_position: false,
            create_if_missing: true,
            ensemble: EnsembleConfig::default(),
            max_unacked_ranges_inline: 1000,
            metadata_max_retries: 3,
            offload_threshold_bytes: -1,
        }
    }
}

impl ManagedLedgerConfig {
    #[must_use]
    pub const fn with_max_entries_per_segment(mut self, entries: u64) -> Self {
        self.max_entries_per_segment = entries;
        self
    }

    #[must_use]
    pub const fn with_max_size_per_segment_mb(mut self, mb: u64) -> Self {
        self.max_size_per_segment_mb = mb;
        self
    }

    #[must_use]
    pub const fn with_min_rollover_time(mut self, time: Duration) -> Self {
        self.min_rollover_time_ms = duration_ms(time);
        self
    }

    #[must_use]
    pub const fn with_max_rollover_time(mut self, time: Duration) -> Self {
        self.max_rollover_time_ms = duration_ms(time);
        self
    }

    /// Negative values keep consumed segments forever.
    #[must_use]
    pub const fn with_retention_time_ms(mut self, ms: i64) -> Self {
        self.retention_time_ms = ms;
        self
    }

    /// Negative values keep consumed segments forever.
    #[must_use]
    pub const fn with_retention_size_mb(mut self, mb: i64) -> Self {
        self.retention_size_mb = mb;
        self
    }

    #[must_use]
    pub const fn with_add_entry_timeout(mut self, timeout: Duration) -> Self {
        self.add_entry_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_read_entry_timeout(mut self, timeout: Duration) -> Self {
        self.read_entry_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_metadata_operations_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_operations_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub const fn with_inactive_segment_rollover_time(mut self, time: Duration) -> Self {
        self.inactive_segment_rollover_time_ms = duration_ms(time);
        self
    }

    #[must_use]
    pub const fn with_lazy_cursor_recovery(mut self, lazy: bool) -> Self {
        self.lazy_cursor_recovery = lazy;
        self
    }

    #[must_use]
    pub const fn with_cache_eviction_by_mark_delete_position(mut self, enabled: bool) -> Self {
        self.cache_eviction_by_mark_delete_position = enabled;
        self
    }

    #[must_use]
    pub const fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    #[must_use]
    pub const fn with_ensemble(mut self, ensemble: EnsembleConfig) -> Self {
        self.ensemble = ensemble;
        self
    }

    #[must_use]
    pub const fn with_max_unacked_ranges_inline(mut self, ranges: usize) -> Self {
        self.max_unacked_ranges_inline = ranges;
        self
    }

    #[must_use]
    pub const fn with_offload_threshold_bytes(mut self, bytes: i64) -> Self {
        self.offload_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn max_segment_size_bytes(&self) -> u64 {
        self.max_size_per_segment_mb.saturating_mul(MB)
    }

    #[must_use]
    pub const fn min_rollover_time(&self) -> Duration {
        Duration::from_millis(self.min_rollover_time_ms)
    }

    #[must_use]
    pub const fn max_rollover_time(&self) -> Duration {
        Duration::from_millis(self.max_rollover_time_ms)
    }

    #[must_use]
    pub const fn add_entry_timeout(&self) -> Option<Duration> {
        optional_ms(self.add_entry_timeout_ms)
    }

    #[must_use]
    pub const fn read_entry_timeout(&self) -> Option<Duration> {
        optional_ms(self.read_entry_timeout_ms)
    }

    #[must_use]
    pub const fn metadata_operations_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_operations_timeout_ms)
    }

    #[must_use]
    pub const fn inactive_segment_rollover_time(&self) -> Option<Duration> {
        optional_ms(self.inactive_segment_rollover_time_ms)
    }

    /// Retention size in bytes, `None` when unbounded.
    #[must_use]
    pub const fn retention_size_bytes(&self) -> Option<u64> {
        if self.retention_size_mb < 0 {
            None
        } else {
            #[allow(clippy::cast_sign_loss)]
            Some((self.retention_size_mb as u64).saturating_mul(MB))
        }
    }
}

/// Factory-wide configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Budget for all entry caches together (MB). 0 disables caching.
    pub cache_max_size_mb: u64,
    /// Fraction of the budget global eviction frees down to
    pub cache_eviction_watermark: f64,
    /// Period of the background trim check (ms)
    pub trim_interval_ms: u64,
    /// Period of the inactive segment check (ms)
    pub inactive_check_interval_ms: u64,
    /// Configuration used by `open` when none is given
    pub default_ledger: ManagedLedgerConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            cache_max_size_mb: 1024,
            cache_eviction_watermark: 0.9,
            trim_interval_ms: 60_000,
            inactive_check_interval_ms: 1000,
            default_ledger: ManagedLedgerConfig::default(),
        }
    }
}

impl FactoryConfig {
    #[must_use]
    pub const fn with_cache_max_size_mb(mut self, mb: u64) -> Self {
        self.cache_max_size_mb = mb;
        self
    }

    #[must_use]
    pub const fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn with_default_ledger(mut self, config: ManagedLedgerConfig) -> Self {
        self.default_ledger = config;
        self
    }

    #[must_use]
    pub const fn cache_max_size_bytes(&self) -> u64 {
        self.cache_max_size_mb.saturating_mul(MB)
    }

    #[must_use]
    pub const fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    #[must_use]
    pub const fn inactive_check_interval(&self) -> Duration {
        Duration::from_millis(self.inactive_check_interval_ms)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

const fn optional_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagedLedgerConfig::default();
        assert_eq!(config.max_entries_per_segment, 50_000);
        assert_eq!(config.retention_time_ms, 0);
        assert_eq!(config.retention_size_bytes(), Some(0));
        assert!(config.create_if_missing);
        assert!(config.inactive_segment_rollover_time().is_none());
        assert_eq!(config.add_entry_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_builders() {
        let config = ManagedLedgerConfig::default()
            .with_max_entries_per_segment(10)
            .with_retention_size_mb(-1)
            .with_add_entry_timeout(Duration::ZERO)
            .with_min_rollover_time(Duration::from_secs(2));

        assert_eq!(config.max_entries_per_segment, 10);
        assert_eq!(config.retention_size_bytes(), None);
        assert_eq!(config.add_entry_timeout(), None);
        assert_eq!(config.min_rollover_time(), Duration::from_secs(2));
    }

    #[test]
    fn test_factory_defaults() {
        let config = FactoryConfig::default().with_cache_max_size_mb(0);
        assert_eq!(config.cache_max_size_bytes(), 0);
        assert_eq!(config.trim_interval(), Duration::from_secs(60));
        assert!((config.cache_eviction_watermark - 0.9).abs() < f64::EPSILON);
    }
}
