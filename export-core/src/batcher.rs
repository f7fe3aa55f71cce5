// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Time-window planning (§4.1). `create_batches` is safe to invoke at any
//! frequency: in steady state almost every call creates zero batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use export_config::{sanity_epoch, ExportBatch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{BatcherError, LockError};
use crate::lock::LockService;
use crate::store::ExportStore;

/// Truncates `at` down to the nearest multiple of `window`, measuring from
/// the Unix epoch.
fn truncate(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_secs = window.as_secs() as i64;
    if window_secs <= 0 {
        return at;
    }
    let epoch_secs = at.timestamp();
    let truncated = epoch_secs - epoch_secs.rem_euclid(window_secs);
    DateTime::from_timestamp(truncated, 0).unwrap_or(at)
}

/// Plans the half-open `[start, end)` windows that should exist for one
/// configuration, given the end of its most recently created batch.
///
/// `latest_end` is `None` when there is no prior batch, or when the prior
/// end predates [`sanity_epoch`] (treated identically: seed a single range
/// rather than attempting to backfill from the epoch).
pub fn make_batch_ranges(
    period: Duration,
    latest_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    truncate_window: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let publish_end = truncate(now, truncate_window);
    let latest_end = latest_end.filter(|e| *e >= sanity_epoch());

    let Some(latest_end) = latest_end else {
        let end = truncate(publish_end, period);
        return vec![(end - chrono::Duration::from_std(period).unwrap(), end)];
    };

    let end = truncate(now, period);
    if end <= latest_end {
        return vec![];
    }

    let period_delta = chrono::Duration::from_std(period).unwrap();
    let mut ranges = Vec::new();
    let mut cur_end = end;
    while cur_end > latest_end {
        if cur_end <= publish_end {
            ranges.insert(0, (cur_end - period_delta, cur_end));
        }
        cur_end -= period_delta;
    }
    ranges
}

pub struct Batcher {
    context: Arc<Context>,
    store: Arc<dyn ExportStore>,
    locks: Arc<dyn LockService>,
}

impl Batcher {
    pub fn new(context: Arc<Context>, store: Arc<dyn ExportStore>, locks: Arc<dyn LockService>) -> Self {
        Self { context, store, locks }
    }

    pub async fn create_batches(
        &self,
        now: DateTime<Utc>,
        cancellation: &CancellationToken,
    ) -> Result<(), BatcherError> {
        let ttl = self.context.parameters.create_batches_timeout;
        let guard = match self.locks.clone().lock("create_batches", ttl).await {
            Ok(guard) => guard,
            Err(LockError::AlreadyLocked(_)) => {
                self.context.metrics.batcher_already_locked.inc();
                info!("create_batches: lock held elsewhere, returning");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let effective_time = now - chrono::Duration::from_std(self.context.parameters.min_window_age).unwrap();
        let configs = self.store.list_active_configs(effective_time).await?;
        info!(count = configs.len(), "create_batches: active configs");

        let mut failed = 0usize;
        for config in &configs {
            if cancellation.is_cancelled() {
                info!("create_batches: cancelled, deferring remaining configs");
                break;
            }
            match self.plan_one(config.config_id, &config.period, now).await {
                Ok(inserted) => {
                    if inserted > 0 {
                        self.context.metrics.batches_created.inc_by(inserted as u64);
                        info!(config_id = config.config_id, inserted, "create_batches: planned");
                    }
                }
                Err(e) => {
                    warn!(config_id = config.config_id, error = %e, "create_batches: config failed");
                    self.context.metrics.batcher_configs_failed.inc();
                    failed += 1;
                }
            }
        }

        guard.unlock().await;

        if failed > 0 {
            return Err(BatcherError::PartialFailure(failed, configs.len()));
        }
        Ok(())
    }

    async fn plan_one(
        &self,
        config_id: i64,
        period: &Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, BatcherError> {
        let configs = self.store.list_active_configs(now).await?;
        let Some(config) = configs.into_iter().find(|c| c.config_id == config_id) else {
            return Ok(0);
        };
        let latest_end = self.store.latest_batch_end(config_id).await?;
        let ranges = make_batch_ranges(*period, latest_end, now, self.context.parameters.truncate_window);
        if ranges.is_empty() {
            return Ok(0);
        }
        let batches: Vec<ExportBatch> = ranges
            .into_iter()
            .map(|(start, end)| ExportBatch::new_open(&config, start, end))
            .collect();
        let inserted = self.store.insert_batches(batches).await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn seeds_a_single_range_with_no_prior_batch() {
        let period = Duration::from_secs(3600);
        let now = ts("2024-01-01T05:30:00Z");
        let ranges = make_batch_ranges(period, None, now, Duration::from_secs(600));
        assert_eq!(ranges, vec![(ts("2024-01-01T04:00:00Z"), ts("2024-01-01T05:00:00Z"))]);
    }

    #[test]
    fn emits_nothing_when_caught_up() {
        let period = Duration::from_secs(3600);
        let latest_end = ts("2024-01-01T05:00:00Z");
        let now = ts("2024-01-01T05:30:00Z");
        let ranges = make_batch_ranges(period, Some(latest_end), now, Duration::from_secs(600));
        assert!(ranges.is_empty());
    }

    #[test]
    fn heals_gaps_by_walking_backward() {
        let period = Duration::from_secs(3600);
        let latest_end = ts("2024-01-01T02:00:00Z");
        let now = ts("2024-01-01T05:10:00Z");
        let ranges = make_batch_ranges(period, Some(latest_end), now, Duration::from_secs(1));
        assert_eq!(
            ranges,
            vec![
                (ts("2024-01-01T02:00:00Z"), ts("2024-01-01T03:00:00Z")),
                (ts("2024-01-01T03:00:00Z"), ts("2024-01-01T04:00:00Z")),
                (ts("2024-01-01T04:00:00Z"), ts("2024-01-01T05:00:00Z")),
            ]
        );
    }

    #[test]
    fn never_creates_a_range_past_publish_end() {
        let period = Duration::from_secs(600);
        let latest_end = ts("2024-01-01T00:00:00Z");
        let now = ts("2024-01-01T00:25:00Z");
        // truncate_window = 900s (15min) clamps publish_end to 00:15:00, so the
        // range [00:20,00:30) that `end = truncate(now, period)` would otherwise
        // want must not appear.
        let ranges = make_batch_ranges(period, Some(latest_end), now, Duration::from_secs(900));
        for (_, end) in &ranges {
            assert!(*end <= ts("2024-01-01T00:15:00Z"));
        }
    }

    #[test]
    fn latest_end_before_sanity_epoch_is_treated_as_no_prior_batch() {
        let period = Duration::from_secs(3600);
        let ancient = ts("2000-01-01T00:00:00Z");
        let now = ts("2024-01-01T05:30:00Z");
        let ranges = make_batch_ranges(period, Some(ancient), now, Duration::from_secs(600));
        assert_eq!(ranges.len(), 1);
    }
}
