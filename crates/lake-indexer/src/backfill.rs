//! Bounded-concurrency epoch backfill.
//!
//! A backfill fills epochs the periodic refresh never wrote: history from
//! before the indexer first ran, or a stretch missed while it was down.
//!
//! ## Planning
//!
//! Without explicit bounds the range comes from what is already stored:
//!
//! - nothing stored: the newest `max_epochs_per_run` epochs ending at the
//!   latest completed epoch
//! - behind (`newest + caught_up_tolerance < latest`): forward from
//!   `newest + 1`, at most `max_epochs_per_run` epochs
//! - caught up: the gap below `oldest`, at most `max_epochs_per_run` epochs,
//!   never before `earliest_epoch`
//!
//! ## Execution
//!
//! Fetches run with at most `max_concurrency` in flight; results are
//! consumed in ascending epoch order and each epoch is written before the
//! next. The first failure (fetch or write) stops the run, drops the
//! in-flight fetches, and is reported with the last epoch that was written.

use async_trait::async_trait;
use futures::{StreamExt, stream};

use crate::config::BackfillConfig;
use crate::error::{Error, Result};
use crate::metrics;

/// A source of per-epoch units that can be written independently.
#[async_trait]
pub trait EpochBackfill: Send + Sync {
    /// Fetched data for one epoch.
    type Unit: Send;

    /// Domain name for logs and metrics.
    fn domain(&self) -> &'static str;

    /// Latest epoch whose data is final.
    async fn latest_completed_epoch(&self) -> Result<u64>;

    /// Oldest and newest epochs already stored.
    async fn stored_epoch_bounds(&self) -> Result<Option<(u64, u64)>>;

    /// Fetches one epoch.
    async fn fetch_epoch(&self, epoch: u64) -> Result<Self::Unit>;

    /// Writes one fetched epoch.
    async fn write_epoch(&self, epoch: u64, unit: Self::Unit) -> Result<usize>;
}

/// Inclusive epoch range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochRange {
    /// First epoch.
    pub start: u64,
    /// Last epoch.
    pub end: u64,
}

impl EpochRange {
    /// Creates a range, or `None` if `start > end`.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of epochs in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; ranges hold at least one epoch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Epochs in ascending order.
    pub fn epochs(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }
}

/// Why a range was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// Bounds were given explicitly.
    Explicit,
    /// Nothing was stored yet.
    Initial,
    /// The stored data lags the latest completed epoch.
    CatchUp,
    /// Caught up; filling history below the oldest stored epoch.
    OlderGap,
    /// Nothing left to do.
    Complete,
}

/// A resolved backfill plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPlan {
    /// Epochs to process, if any.
    pub range: Option<EpochRange>,
    /// How the range was derived.
    pub reason: PlanReason,
}

/// Optional explicit bounds for a backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillRequest {
    /// First epoch to process.
    pub start_epoch: Option<u64>,
    /// Last epoch to process.
    pub end_epoch: Option<u64>,
}

/// Result of a backfill invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// The plan that was executed (or would have been, for a dry run).
    pub plan: BackfillPlan,
    /// Epochs written, ascending.
    pub epochs_written: Vec<u64>,
    /// Rows written across all epochs.
    pub rows_written: usize,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

/// Resolves the epoch range for one backfill invocation.
///
/// # Errors
///
/// Returns a configuration error for inverted explicit bounds.
pub fn plan_range(
    request: BackfillRequest,
    stored: Option<(u64, u64)>,
    latest_completed: u64,
    config: &BackfillConfig,
) -> Result<BackfillPlan> {
    let budget = config.max_epochs_per_run.max(1);
    let earliest = config.earliest_epoch;

    if request.start_epoch.is_some() || request.end_epoch.is_some() {
        let end = request.end_epoch.unwrap_or(latest_completed);
        let start = request
            .start_epoch
            .unwrap_or_else(|| end.saturating_sub(budget - 1).max(earliest));
        let range = EpochRange::new(start, end).ok_or_else(|| {
            Error::configuration(format!("backfill start epoch {start} is after end epoch {end}"))
        })?;
        return Ok(BackfillPlan {
            range: Some(range),
            reason: PlanReason::Explicit,
        });
    }

    let plan = match stored {
        None => BackfillPlan {
            range: EpochRange::new(
                latest_completed.saturating_sub(budget - 1).max(earliest),
                latest_completed,
            ),
            reason: PlanReason::Initial,
        },
        Some((_, newest)) if newest.saturating_add(config.caught_up_tolerance) < latest_completed => {
            BackfillPlan {
                range: EpochRange::new(
                    newest + 1,
                    latest_completed.min(newest.saturating_add(budget)),
                ),
                reason: PlanReason::CatchUp,
            }
        }
        Some((oldest, _)) if oldest > earliest => BackfillPlan {
            range: EpochRange::new(oldest.saturating_sub(budget).max(earliest), oldest - 1),
            reason: PlanReason::OlderGap,
        },
        Some(_) => BackfillPlan {
            range: None,
            reason: PlanReason::Complete,
        },
    };
    Ok(match plan.range {
        Some(_) => plan,
        None => BackfillPlan {
            range: None,
            reason: PlanReason::Complete,
        },
    })
}

/// Runs one backfill invocation.
///
/// # Errors
///
/// Returns [`Error::Backfill`] for the first epoch that failed to fetch or
/// write, or the source's error if planning inputs could not be read.
pub async fn run_backfill<B>(source: &B, request: BackfillRequest, config: &BackfillConfig) -> Result<BackfillReport>
where
    B: EpochBackfill + ?Sized,
{
    config.validate()?;
    let domain = source.domain();
    let latest = source.latest_completed_epoch().await?;
    let stored = source.stored_epoch_bounds().await?;
    let plan = plan_range(request, stored, latest, config)?;

    let mut report = BackfillReport {
        plan,
        epochs_written: Vec::new(),
        rows_written: 0,
        dry_run: config.dry_run,
    };
    tracing::info!(
        domain,
        latest_completed = latest,
        stored = ?stored,
        plan = ?plan,
        dry_run = config.dry_run,
        "backfill planned"
    );

    let Some(range) = plan.range else {
        return Ok(report);
    };
    if config.dry_run {
        return Ok(report);
    }

    let mut fetched = stream::iter(range.epochs())
        .map(|epoch| async move { (epoch, source.fetch_epoch(epoch).await) })
        .buffered(config.max_concurrency);

    while let Some((epoch, result)) = fetched.next().await {
        let written = match result {
            Ok(unit) => source.write_epoch(epoch, unit).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(rows) => {
                metrics::record_backfill_epoch(domain, true);
                report.rows_written += rows;
                report.epochs_written.push(epoch);
                tracing::debug!(domain, epoch, rows, "epoch backfilled");
            }
            Err(e) => {
                metrics::record_backfill_epoch(domain, false);
                let last_success = report.epochs_written.last().copied();
                tracing::error!(domain, epoch, ?last_success, error = %e, "backfill stopped");
                return Err(Error::Backfill {
                    epoch,
                    last_success,
                    message: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        domain,
        epochs = report.epochs_written.len(),
        rows = report.rows_written,
        "backfill completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackfillConfig {
        BackfillConfig {
            max_epochs_per_run: 10,
            ..BackfillConfig::default()
        }
    }

    fn plan(stored: Option<(u64, u64)>, latest: u64, config: &BackfillConfig) -> BackfillPlan {
        plan_range(BackfillRequest::default(), stored, latest, config).unwrap()
    }

    #[test]
    fn initial_plan_ends_at_latest() {
        let p = plan(None, 500, &config());
        assert_eq!(p.reason, PlanReason::Initial);
        assert_eq!(p.range, EpochRange::new(491, 500));
    }

    #[test]
    fn initial_plan_respects_earliest() {
        let cfg = BackfillConfig {
            earliest_epoch: 495,
            ..config()
        };
        assert_eq!(plan(None, 500, &cfg).range, EpochRange::new(495, 500));
    }

    #[test]
    fn behind_plans_forward() {
        let p = plan(Some((400, 480)), 500, &config());
        assert_eq!(p.reason, PlanReason::CatchUp);
        assert_eq!(p.range, EpochRange::new(481, 490));

        let p = plan(Some((400, 497)), 500, &config());
        assert_eq!(p.range, EpochRange::new(498, 500));
    }

    #[test]
    fn caught_up_plans_older_gap() {
        let p = plan(Some((400, 500)), 500, &config());
        assert_eq!(p.reason, PlanReason::OlderGap);
        assert_eq!(p.range, EpochRange::new(390, 399));
    }

    #[test]
    fn tolerance_counts_small_lag_as_caught_up() {
        let cfg = BackfillConfig {
            caught_up_tolerance: 2,
            ..config()
        };
        let p = plan(Some((400, 498)), 500, &cfg);
        assert_eq!(p.reason, PlanReason::OlderGap);
        let p = plan(Some((400, 497)), 500, &cfg);
        assert_eq!(p.reason, PlanReason::CatchUp);
    }

    #[test]
    fn complete_when_history_reaches_earliest() {
        let cfg = BackfillConfig {
            earliest_epoch: 400,
            ..config()
        };
        let p = plan(Some((400, 500)), 500, &cfg);
        assert_eq!(p.reason, PlanReason::Complete);
        assert_eq!(p.range, None);
    }

    #[test]
    fn explicit_bounds_override() {
        let request = BackfillRequest {
            start_epoch: Some(10),
            end_epoch: Some(12),
        };
        let p = plan_range(request, Some((400, 500)), 500, &config()).unwrap();
        assert_eq!(p.reason, PlanReason::Explicit);
        assert_eq!(p.range, EpochRange::new(10, 12));

        let inverted = BackfillRequest {
            start_epoch: Some(12),
            end_epoch: Some(10),
        };
        assert!(plan_range(inverted, None, 500, &config()).is_err());
    }
}
