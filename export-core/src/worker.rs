// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lease, read, pad, sign, upload, index (§4.2). The worker drains as many
//! leasable batches as it can before its deadline, processing them one at a
//! time; multiple worker replicas compete for the same batches through
//! [`crate::store::ExportStore::try_lease_batch`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use export_config::{ExportBatch, ExportConfig, ExportFile, Exposure, FileStatus, SignatureInfo};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{self, ExportFileContents};
use crate::context::Context;
use crate::error::{LockError, WorkerError};
use crate::keymanager::KeyManager;
use crate::lock::LockService;
use crate::padding;
use crate::store::{BlobStore, ExportStore, ExposureCriteria, ExposureStore};

/// Candidate batches considered per `lease_batch` call.
const LEASE_CANDIDATE_LIMIT: usize = 100;

/// How long the index lock retry loop sleeps between attempts.
const INDEX_LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// `{filename_root}/{start+regen}-{end+regen}-{fileNum:05}.zip`. `regen`
/// lets an operator force regeneration of an identical window by nudging
/// both timestamps; ordinary processing always passes 0.
fn object_name(filename_root: &str, start: DateTime<Utc>, end: DateTime<Utc>, regen: i64, file_num: u32) -> String {
    format!(
        "{filename_root}/{}-{}-{file_num:05}.zip",
        start.timestamp() + regen,
        end.timestamp() + regen,
    )
}

fn index_path(filename_root: &str) -> String {
    format!("{filename_root}/index.txt")
}

pub struct Worker {
    context: Arc<Context>,
    export_store: Arc<dyn ExportStore>,
    exposure_store: Arc<dyn ExposureStore>,
    blob_store: Arc<dyn BlobStore>,
    locks: Arc<dyn LockService>,
    key_manager: Arc<dyn KeyManager>,
    /// Configs whose index has already been refreshed by this worker
    /// instance since it was constructed. A fresh `Worker` is built per
    /// `do_work` invocation, so this tracks "refreshed this invocation".
    indexes_written: parking_lot::Mutex<std::collections::HashSet<i64>>,
}

impl Worker {
    pub fn new(
        context: Arc<Context>,
        export_store: Arc<dyn ExportStore>,
        exposure_store: Arc<dyn ExposureStore>,
        blob_store: Arc<dyn BlobStore>,
        locks: Arc<dyn LockService>,
        key_manager: Arc<dyn KeyManager>,
    ) -> Self {
        Self {
            context,
            export_store,
            exposure_store,
            blob_store,
            locks,
            key_manager,
            indexes_written: parking_lot::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Drains as many leasable batches as possible before `deadline`.
    /// Per-batch errors are collected, logged, and counted, but never stop
    /// the loop; only cancellation does.
    pub async fn do_work(&self, cancellation: &CancellationToken) -> Result<usize, WorkerError> {
        let deadline = Instant::now() + self.context.parameters.worker_timeout;
        let mut processed = 0usize;
        let mut failed = 0usize;

        loop {
            if cancellation.is_cancelled() || Instant::now() >= deadline {
                info!(processed, failed, "do_work: stopping, deadline or cancellation");
                break;
            }

            let now = Utc::now();
            let Some(batch) = self.lease_batch(now).await? else {
                break;
            };
            self.context.metrics.batches_leased.inc();

            let timer = self.context.metrics.batch_processing_duration.start_timer();
            match self.process_batch(&batch, now, cancellation).await {
                Ok(()) => {
                    processed += 1;
                    self.context.metrics.batches_finalized.inc();
                }
                Err(e) => {
                    warn!(batch_id = batch.batch_id, error = %e, "do_work: batch failed, left leased");
                    self.context.metrics.batch_processing_failures.inc();
                    failed += 1;
                }
            }
            timer.observe_duration();
        }

        Ok(processed)
    }

    /// Selects up to [`LEASE_CANDIDATE_LIMIT`] leasable ids, shuffles them
    /// with a cryptographically seeded RNG to spread contention across
    /// competing workers, and CASes the first one that's still leasable by
    /// the time this replica gets to it.
    async fn lease_batch(&self, now: DateTime<Utc>) -> Result<Option<ExportBatch>, WorkerError> {
        let mut candidates = self
            .export_store
            .leasable_batch_ids(now, self.context.parameters.min_window_age, LEASE_CANDIDATE_LIMIT)
            .await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut rng = StdRng::from_entropy();
        candidates.shuffle(&mut rng);

        let ttl = self.context.parameters.worker_timeout;
        for batch_id in candidates {
            match self.export_store.try_lease_batch(batch_id, now, ttl).await? {
                Some(batch) => return Ok(Some(batch)),
                None => self.context.metrics.lease_race_losses.inc(),
            }
        }
        Ok(None)
    }

    async fn process_batch(
        &self,
        batch: &ExportBatch,
        now: DateTime<Utc>,
        cancellation: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut lock_names = batch.effective_input_regions();
        if batch.include_travelers {
            lock_names.push("TRAVELERS".to_string());
        }
        let region_guard = match self.locks.clone().multi_lock(&lock_names, self.context.parameters.worker_timeout).await {
            Ok(guard) => guard,
            Err(LockError::AlreadyLocked(name)) => {
                // Another worker building an overlapping region/traveler set
                // is already running; leave this batch leased and retry on
                // the next do_work tick once that lock clears.
                info!(batch_id = batch.batch_id, name, "process_batch: region lock contended, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let signature_infos = self.effective_signature_infos(batch, now).await?;

        let (primary, revised) = self.batch_exposures(batch).await?;
        let max_records = batch.max_records_override.unwrap_or(self.context.parameters.export_file_max_records) as usize;
        let min_records = self.context.parameters.export_file_min_records as usize;
        let jitter_range = self.context.parameters.export_file_padding_range as usize;

        let groups = self.group_exposures(primary, revised, max_records, min_records, jitter_range, now).await?;
        let group_count = groups.len() as u32;

        let mut written_files = Vec::with_capacity(groups.len());
        let mut written_names = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            if cancellation.is_cancelled() {
                // Mid-batch cancellation: leave PENDING, nothing finalized
                // yet. The lease will expire and the batch re-enters
                // rotation; this counts as a clean abort, not an error.
                return Ok(());
            }
            let file_num = (i + 1) as u32;
            let filename = object_name(&batch.filename_root, batch.start_timestamp, batch.end_timestamp, 0, file_num);

            let contents = ExportFileContents {
                start_timestamp: batch.start_timestamp,
                end_timestamp: batch.end_timestamp,
                region: batch.output_region.clone(),
                // Historically always 1/1 regardless of how many files the
                // batch is split into; files are distinguished by filename
                // suffix, not this field. Intentionally preserved, not
                // "fixed" — see DESIGN.md.
                batch_num: 1,
                batch_size: 1,
                signature_infos: &signature_infos,
                keys: group.primary,
                revised_keys: group.revised,
            };
            let zip_bytes = codec::marshal(&contents, self.key_manager.as_ref()).await?;

            self.blob_store
                .put(&batch.bucket_name, &filename, Bytes::from(zip_bytes), "application/zip")
                .await
                .map_err(|e| WorkerError::Blob(e.to_string()))?;
            self.context.metrics.files_written.inc();

            written_files.push(ExportFile {
                filename: filename.clone(),
                bucket_name: batch.bucket_name.clone(),
                batch_id: batch.batch_id,
                output_region: batch.output_region.clone(),
                input_regions: batch.input_regions.clone(),
                batch_num: file_num,
                batch_size: group_count,
                status: FileStatus::Complete,
                include_travelers: batch.include_travelers,
                only_non_travelers: batch.only_non_travelers,
            });
            written_names.push(filename);
        }

        region_guard.unlock().await;

        let first_for_config = self.indexes_written.lock().insert(batch.config_id);
        if !written_names.is_empty() || first_for_config {
            self.update_index(batch, &written_names, now).await?;
        }

        self.export_store.finalize_batch(batch.batch_id, written_files).await?;
        Ok(())
    }

    async fn effective_signature_infos(
        &self,
        batch: &ExportBatch,
        now: DateTime<Utc>,
    ) -> Result<Vec<SignatureInfo>, WorkerError> {
        let infos = self.export_store.get_signature_infos(&batch.signature_info_ids).await?;
        let effective: Vec<SignatureInfo> = infos.into_iter().filter(|i| i.is_effective_at(now)).collect();
        if effective.is_empty() {
            return Err(WorkerError::NoEffectiveSignatureInfo(batch.config_id));
        }
        Ok(effective)
    }

    /// Two-pass read: non-revised keys first (rejecting any whose
    /// `exposure_key` isn't 16 bytes), then revised keys. Both passes are
    /// sorted by key bytes so retries produce stable output.
    async fn batch_exposures(&self, batch: &ExportBatch) -> Result<(Vec<Exposure>, Vec<Exposure>), WorkerError> {
        let base = ExposureCriteria {
            since: batch.start_timestamp,
            until: batch.end_timestamp,
            include_regions: batch.effective_input_regions(),
            include_travelers: batch.include_travelers,
            only_non_travelers: batch.only_non_travelers,
            exclude_regions: batch.exclude_regions.clone(),
            only_local_provenance: false,
            only_revised_keys: false,
        };

        let mut primary = Vec::new();
        let mut dropped = 0usize;
        self.exposure_store
            .iterate_exposures(&base, &mut |e| {
                if e.exposure_key.len() == 16 {
                    primary.push(e);
                } else {
                    dropped += 1;
                }
            })
            .await?;
        self.context.metrics.exposures_read.with_label_values(&["primary"]).inc_by(primary.len() as u64);
        if dropped > 0 {
            self.context.metrics.exposures_dropped_bad_length.inc_by(dropped as u64);
        }

        let revised_criteria = ExposureCriteria {
            only_revised_keys: true,
            ..base
        };
        let mut revised = Vec::new();
        self.exposure_store
            .iterate_exposures(&revised_criteria, &mut |e| revised.push(e))
            .await?;
        self.context.metrics.exposures_read.with_label_values(&["revised"]).inc_by(revised.len() as u64);

        primary.sort_by(|a, b| a.exposure_key.cmp(&b.exposure_key));
        revised.sort_by(|a, b| a.exposure_key.cmp(&b.exposure_key));
        Ok((primary, revised))
    }

    /// Pads the primary list (if below `min_records`) and splits
    /// primary+revised into `max_records`-sized groups, primaries first.
    /// Revised keys are never padded: a padded revised key would reveal
    /// which keys had appeared in an earlier export.
    async fn group_exposures(
        &self,
        primary: Vec<Exposure>,
        revised: Vec<Exposure>,
        max_records: usize,
        min_records: usize,
        jitter_range: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExposureGroup>, WorkerError> {
        let created_at = primary.iter().map(|e| e.created_at).max().unwrap_or(now);
        let (primary, generated) = if primary.len() < min_records {
            padding::ensure_min_num_exposures(&primary, min_records, jitter_range, max_records, created_at)
        } else {
            (primary, vec![])
        };
        if !generated.is_empty() {
            self.context.metrics.keys_padded.inc_by(generated.len() as u64);
            self.exposure_store.persist_padding_keys(&generated).await?;
        }

        let mut groups = Vec::new();
        let mut primary_iter = primary.into_iter().peekable();
        let mut revised_iter = revised.into_iter().peekable();
        if primary_iter.peek().is_none() && revised_iter.peek().is_none() {
            return Ok(vec![]);
        }
        while primary_iter.peek().is_some() || revised_iter.peek().is_some() {
            let mut group = ExposureGroup::default();
            while group.len() < max_records {
                if let Some(e) = primary_iter.next() {
                    group.primary.push(e);
                } else if let Some(e) = revised_iter.next() {
                    group.revised.push(e);
                } else {
                    break;
                }
            }
            groups.push(group);
        }
        Ok(groups)
    }

    /// Refreshes `{filename_root}/index.txt` under the per-config lock:
    /// the union of already-`COMPLETE`/`DELETED` files and what was just
    /// written, deduped and sorted lexicographically. Blocks, retrying
    /// every 10s, until the lock clears or the batch's own lease is about
    /// to expire (in which case it bails rather than race the next worker
    /// that reclaims the batch).
    async fn update_index(
        &self,
        batch: &ExportBatch,
        written_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let lock_name = format!("export-config-{}", batch.config_id);
        let lease_deadline = batch.lease_expires.unwrap_or(now);

        let guard = loop {
            match self.locks.clone().lock(&lock_name, self.context.parameters.worker_timeout).await {
                Ok(guard) => break guard,
                Err(LockError::AlreadyLocked(_)) => {
                    if Utc::now() + chrono::Duration::from_std(INDEX_LOCK_RETRY_INTERVAL).unwrap() >= lease_deadline {
                        return Err(WorkerError::IndexLockTimeout(batch.config_id));
                    }
                    tokio::time::sleep(INDEX_LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let cutoff = Utc::now() - chrono::Duration::from_std(self.context.parameters.cleanup_ttl).unwrap();
        self.export_store.mark_files_del_pend_before(cutoff).await?;

        let existing = self.export_store.list_files_for_config(batch.config_id).await?;
        let mut names: std::collections::BTreeSet<String> = existing
            .into_iter()
            .filter(|f| matches!(f.status, FileStatus::Complete | FileStatus::Deleted))
            .map(|f| f.filename)
            .collect();
        names.extend(written_names.iter().cloned());

        let body = names.into_iter().collect::<Vec<_>>().join("\n");
        self.blob_store
            .put(&batch.bucket_name, &index_path(&batch.filename_root), Bytes::from(body), "text/plain")
            .await
            .map_err(|e| WorkerError::Blob(e.to_string()))?;
        self.context.metrics.index_writes.inc();

        guard.unlock().await;
        Ok(())
    }
}

#[derive(Default)]
struct ExposureGroup {
    primary: Vec<Exposure>,
    revised: Vec<Exposure>,
}

impl ExposureGroup {
    fn len(&self) -> usize {
        self.primary.len() + self.revised.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymanager::{KeyManager as _, SignatureRequest};
    use crate::lock::InMemoryLockService;
    use crate::store::{InMemoryBlobStore, InMemoryExportStore, InMemoryExposureStore};
    use async_trait::async_trait;
    use export_config::{BatchStatus, Parameters, ReportType};

    struct FixedSigner;

    #[async_trait]
    impl KeyManager for FixedSigner {
        async fn sign(&self, _request: &SignatureRequest<'_>, digest: &[u8; 32]) -> Result<Vec<u8>, crate::error::KeyManagerError> {
            Ok(digest.to_vec())
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn test_config() -> ExportConfig {
        ExportConfig {
            config_id: 1,
            bucket_name: "bucket".into(),
            filename_root: "v1".into(),
            period: Duration::from_secs(3600),
            output_region: "US".into(),
            input_regions: vec![],
            include_travelers: false,
            only_non_travelers: false,
            exclude_regions: vec![],
            from: ts("2020-01-01T00:00:00Z"),
            thru: None,
            signature_info_ids: vec![1],
            max_records_override: None,
        }
    }

    fn test_exposure(key_byte: u8, created_at: DateTime<Utc>) -> Exposure {
        Exposure {
            exposure_key: [key_byte; 16],
            interval_number: 2650000 + key_byte as i32,
            interval_count: 144,
            regions: vec!["US".into()],
            created_at,
            traveler: false,
            local_provenance: true,
            transmission_risk: 1,
            report_type: ReportType::Confirmed,
            days_since_symptom_onset: None,
            revised_report_type: None,
            revised_at: None,
        }
    }

    fn test_worker(
        export_store: Arc<InMemoryExportStore>,
        exposure_store: Arc<InMemoryExposureStore>,
    ) -> Worker {
        let mut parameters = Parameters::default();
        parameters.export_file_min_records = 2;
        parameters.export_file_padding_range = 0;
        parameters.export_file_max_records = 3;
        let registry = prometheus::Registry::new();
        let context = Arc::new(Context::new(parameters, &registry));
        Worker::new(
            context,
            export_store,
            exposure_store,
            Arc::new(InMemoryBlobStore::new()),
            InMemoryLockService::new(),
            Arc::new(FixedSigner),
        )
    }

    #[tokio::test]
    async fn do_work_leases_builds_uploads_and_finalizes_a_batch() {
        let config = test_config();
        let sig_info = SignatureInfo {
            signature_info_id: 1,
            signing_key_version: "v1".into(),
            signing_key_id: "key-1".into(),
            kms_resource_id: "resource-a".into(),
            end_timestamp: None,
        };
        let start = ts("2020-05-01T02:00:00Z");
        let end = ts("2020-05-01T03:00:00Z");
        let batch = ExportBatch::new_open(&config, start, end);

        let export_store = Arc::new(InMemoryExportStore::new(vec![config], vec![sig_info]));
        export_store.clone().insert_batches(vec![batch]).await.unwrap();

        let created_at = ts("2020-05-01T02:30:00Z");
        let exposures = vec![test_exposure(1, created_at), test_exposure(2, created_at)];
        let exposure_store = Arc::new(InMemoryExposureStore::new(exposures));

        let worker = test_worker(export_store.clone(), exposure_store);
        let cancellation = CancellationToken::new();
        let processed = worker.do_work(&cancellation).await.unwrap();
        assert_eq!(processed, 1);

        let batches = export_store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchStatus::Complete);
        assert!(batches[0].lease_expires.is_none());
    }

    #[tokio::test]
    async fn do_work_returns_zero_when_nothing_leasable() {
        let export_store = Arc::new(InMemoryExportStore::new(vec![], vec![]));
        let exposure_store = Arc::new(InMemoryExposureStore::new(vec![]));
        let worker = test_worker(export_store, exposure_store);
        let cancellation = CancellationToken::new();
        assert_eq!(worker.do_work(&cancellation).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn process_batch_fails_fatally_with_no_effective_signature_info() {
        let mut config = test_config();
        config.signature_info_ids = vec![99];
        let start = ts("2020-05-01T02:00:00Z");
        let end = ts("2020-05-01T03:00:00Z");
        let batch = ExportBatch::new_open(&config, start, end);

        let export_store = Arc::new(InMemoryExportStore::new(vec![config], vec![]));
        export_store.clone().insert_batches(vec![batch]).await.unwrap();
        let exposure_store = Arc::new(InMemoryExposureStore::new(vec![test_exposure(1, Utc::now())]));

        let worker = test_worker(export_store.clone(), exposure_store);
        let cancellation = CancellationToken::new();
        // do_work swallows the per-batch error; the batch stays PENDING for retry.
        let processed = worker.do_work(&cancellation).await.unwrap();
        assert_eq!(processed, 0);
        let batches = export_store.batches();
        assert_eq!(batches[0].status, BatchStatus::Pending);
    }

    #[test]
    fn object_name_matches_the_fixed_naming_scheme() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(object_name("v1", epoch, epoch, 0, 1), "v1/0-0-00001.zip");
    }

    #[tokio::test]
    async fn groups_split_across_max_records_boundary() {
        let export_store = Arc::new(InMemoryExportStore::new(vec![], vec![]));
        let exposure_store = Arc::new(InMemoryExposureStore::new(vec![]));
        let worker = test_worker(export_store, exposure_store);
        let now = Utc::now();
        let primary: Vec<Exposure> = (0..5).map(|i| test_exposure(i, now)).collect();
        let groups = worker.group_exposures(primary, vec![], 3, 0, 0, now).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 2);
    }
}
