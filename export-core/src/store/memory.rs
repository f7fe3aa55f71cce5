// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory fakes for `ExposureStore`, `ExportStore`, and `BlobStore`, used
//! by the batcher/worker unit tests so they don't need a live Postgres.

use std::{collections::BTreeMap, sync::atomic::{AtomicI64, Ordering}, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use export_config::{BatchStatus, ExportBatch, ExportConfig, ExportFile, Exposure, FileStatus, SignatureInfo};
use parking_lot::Mutex;

use crate::error::StoreError;

use super::{BlobStore, ExportStore, ExposureCriteria, ExposureStore};

#[derive(Default)]
pub struct InMemoryExposureStore {
    pub exposures: Mutex<Vec<Exposure>>,
}

impl InMemoryExposureStore {
    pub fn new(exposures: Vec<Exposure>) -> Self {
        Self {
            exposures: Mutex::new(exposures),
        }
    }
}

#[async_trait]
impl ExposureStore for InMemoryExposureStore {
    async fn iterate_exposures(
        &self,
        criteria: &ExposureCriteria,
        visit: &mut (dyn FnMut(Exposure) + Send),
    ) -> Result<usize, StoreError> {
        let mut count = 0;
        for exposure in self.exposures.lock().iter() {
            if exposure.created_at < criteria.since || exposure.created_at >= criteria.until {
                continue;
            }
            if criteria.only_local_provenance && !exposure.local_provenance {
                continue;
            }
            if criteria.only_revised_keys && exposure.revised_report_type.is_none() {
                continue;
            }
            if !criteria.include_travelers && exposure.traveler {
                continue;
            }
            if criteria.only_non_travelers && exposure.traveler {
                continue;
            }
            if exposure
                .regions
                .iter()
                .any(|r| criteria.exclude_regions.contains(r))
            {
                continue;
            }
            if !criteria.include_regions.is_empty()
                && !exposure.regions.iter().any(|r| criteria.include_regions.contains(r))
            {
                continue;
            }
            visit(exposure.clone());
            count += 1;
        }
        Ok(count)
    }

    async fn persist_padding_keys(&self, keys: &[Exposure]) -> Result<(), StoreError> {
        self.exposures.lock().extend(keys.iter().cloned());
        Ok(())
    }
}

struct MemoryState {
    configs: BTreeMap<i64, ExportConfig>,
    signature_infos: BTreeMap<i64, SignatureInfo>,
    batches: BTreeMap<i64, ExportBatch>,
    files: BTreeMap<String, ExportFile>,
}

pub struct InMemoryExportStore {
    state: Mutex<MemoryState>,
    next_batch_id: AtomicI64,
}

impl InMemoryExportStore {
    pub fn new(configs: Vec<ExportConfig>, signature_infos: Vec<SignatureInfo>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                configs: configs.into_iter().map(|c| (c.config_id, c)).collect(),
                signature_infos: signature_infos.into_iter().map(|s| (s.signature_info_id, s)).collect(),
                batches: BTreeMap::new(),
                files: BTreeMap::new(),
            }),
            next_batch_id: AtomicI64::new(1),
        }
    }

    pub fn batches(&self) -> Vec<ExportBatch> {
        self.state.lock().batches.values().cloned().collect()
    }
}

#[async_trait]
impl ExportStore for InMemoryExportStore {
    async fn list_active_configs(&self, at: DateTime<Utc>) -> Result<Vec<ExportConfig>, StoreError> {
        Ok(self
            .state
            .lock()
            .configs
            .values()
            .filter(|c| c.is_active_at(at))
            .cloned()
            .collect())
    }

    async fn get_signature_infos(&self, ids: &[i64]) -> Result<Vec<SignatureInfo>, StoreError> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.signature_infos.get(id).cloned())
            .collect())
    }

    async fn latest_batch_end(&self, config_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .batches
            .values()
            .filter(|b| b.config_id == config_id)
            .map(|b| b.end_timestamp)
            .max())
    }

    async fn insert_batches(&self, batches: Vec<ExportBatch>) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let n = batches.len();
        for mut batch in batches {
            batch.batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
            state.batches.insert(batch.batch_id, batch);
        }
        Ok(n)
    }

    async fn leasable_batch_ids(
        &self,
        at: DateTime<Utc>,
        min_window_age: Duration,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let min_age = chrono::Duration::from_std(min_window_age).unwrap();
        Ok(self
            .state
            .lock()
            .batches
            .values()
            .filter(|b| b.is_leasable(at) && b.end_timestamp <= at - min_age)
            .take(limit)
            .map(|b| b.batch_id)
            .collect())
    }

    async fn try_lease_batch(
        &self,
        batch_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<ExportBatch>, StoreError> {
        let mut state = self.state.lock();
        let Some(batch) = state.batches.get_mut(&batch_id) else {
            return Ok(None);
        };
        if !batch.is_leasable(at) {
            return Ok(None);
        }
        batch.status = BatchStatus::Pending;
        batch.lease_expires = Some(at + chrono::Duration::from_std(ttl).unwrap());
        Ok(Some(batch.clone()))
    }

    async fn finalize_batch(&self, batch_id: i64, files: Vec<ExportFile>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let batch = state.batches.get_mut(&batch_id).ok_or(StoreError::NotFound)?;
        batch.status = BatchStatus::Complete;
        batch.lease_expires = None;
        for file in files {
            state.files.insert(file.filename.clone(), file);
        }
        Ok(())
    }

    async fn list_files_for_batch(&self, batch_id: i64) -> Result<Vec<ExportFile>, StoreError> {
        Ok(self
            .state
            .lock()
            .files
            .values()
            .filter(|f| f.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn list_files_for_config(&self, config_id: i64) -> Result<Vec<ExportFile>, StoreError> {
        let state = self.state.lock();
        let batch_configs: BTreeMap<i64, i64> = state.batches.iter().map(|(id, b)| (*id, b.config_id)).collect();
        Ok(state
            .files
            .values()
            .filter(|f| batch_configs.get(&f.batch_id) == Some(&config_id))
            .cloned()
            .collect())
    }

    async fn mark_files_del_pend_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportFile>, StoreError> {
        let mut state = self.state.lock();
        let mut marked = Vec::new();
        let batch_ends: BTreeMap<i64, DateTime<Utc>> =
            state.batches.iter().map(|(id, b)| (*id, b.end_timestamp)).collect();
        for file in state.files.values_mut() {
            if file.status != FileStatus::Complete {
                continue;
            }
            if batch_ends.get(&file.batch_id).map(|e| *e < cutoff).unwrap_or(false) {
                file.status = FileStatus::DelPend;
                marked.push(file.clone());
            }
        }
        Ok(marked)
    }

    async fn mark_file_deleted(&self, filename: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let file = state.files.get_mut(filename).ok_or(StoreError::NotFound)?;
        file.status = FileStatus::Deleted;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<BTreeMap<String, (Bytes, String)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(bucket: &str, path: &str) -> String {
        format!("{bucket}/{path}")
    }

    /// Test helper: the content type a previous `put` recorded for `path`.
    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        self.objects.lock().get(&Self::key(bucket, path)).map(|(_, ct)| ct.clone())
    }

    /// Test helper: every object path currently stored under `bucket`.
    pub fn paths(&self, bucket: &str) -> Vec<String> {
        let prefix = format!("{bucket}/");
        self.objects
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bucket: &str, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .insert(Self::key(bucket, path), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Bytes, StoreError> {
        self.objects
            .lock()
            .get(&Self::key(bucket, path))
            .map(|(bytes, _)| bytes.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(&Self::key(bucket, path));
        Ok(())
    }
}
