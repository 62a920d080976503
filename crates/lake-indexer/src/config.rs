//! Indexer configuration.
//!
//! Plain structs with defaults; the binary fills them from CLI flags and
//! `LAKE_*` environment variables. Invalid values are rejected by
//! `validate()` before anything starts.

use std::time::Duration;

use crate::error::{Error, Result};

/// Refresh loop settings shared by every view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Time between refresh starts.
    pub interval: Duration,
    /// Deadline for a single refresh; expiry counts as a failed refresh.
    pub timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(300),
        }
    }
}

impl RefreshConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero interval or timeout.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::configuration("refresh interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration("refresh timeout must be positive"));
        }
        Ok(())
    }
}

/// Epoch backfill settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Epoch fetches in flight at once.
    pub max_concurrency: usize,
    /// Epochs the newest stored epoch may lag and still count as caught up.
    pub caught_up_tolerance: u64,
    /// Oldest epoch a backfill may reach.
    pub earliest_epoch: u64,
    /// Upper bound on epochs planned by one invocation.
    pub max_epochs_per_run: u64,
    /// Resolve and report the plan without writing.
    pub dry_run: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            caught_up_tolerance: 0,
            earliest_epoch: 0,
            max_epochs_per_run: 64,
            dry_run: false,
        }
    }
}

impl BackfillConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero concurrency or a zero epoch
    /// budget.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("backfill max_concurrency must be at least 1"));
        }
        if self.max_epochs_per_run == 0 {
            return Err(Error::configuration(
                "backfill max_epochs_per_run must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Resolver cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime of a cached lookup.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}
