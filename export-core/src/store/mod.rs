// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage seams (§4.6): one trait for the (external, read-only) TEK store,
//! one for the export subsystem's own relational rows, one for the blob
//! store files are uploaded to. Mirrors the narrow-trait-at-the-boundary
//! shape of `consensus-core`'s `CommitConsumerMonitor`/`BlockStore`.

mod blob;
mod memory;
mod postgres;

pub use blob::ObjectStoreBlobStore;
pub use memory::{InMemoryBlobStore, InMemoryExportStore, InMemoryExposureStore};
pub use postgres::{PgExportStore, PgExposureStore};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use export_config::{ExportBatch, ExportConfig, ExportFile, Exposure, SignatureInfo};

use crate::error::StoreError;

/// Selection predicate for [`ExposureStore::iterate_exposures`], assembled
/// from an [`ExportBatch`]'s own fields by the worker's two read passes
/// (non-revised, then revised-only).
#[derive(Clone, Debug)]
pub struct ExposureCriteria {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub include_regions: Vec<String>,
    pub include_travelers: bool,
    pub only_non_travelers: bool,
    pub exclude_regions: Vec<String>,
    pub only_local_provenance: bool,
    pub only_revised_keys: bool,
}

/// Read-only access to the publish pipeline's TEK store. `iterate_exposures`
/// takes a visitor rather than returning a `Vec` so large windows don't have
/// to be materialized twice (once here, once by the caller).
#[async_trait]
pub trait ExposureStore: Send + Sync {
    async fn iterate_exposures(
        &self,
        criteria: &ExposureCriteria,
        visit: &mut (dyn FnMut(Exposure) + Send),
    ) -> Result<usize, StoreError>;

    /// Persists synthetic padding keys back through the publish store so
    /// that re-processing the same window, or an adjacent batch sharing the
    /// region lock, observes byte-identical padding rather than generating
    /// a second, divergent set.
    async fn persist_padding_keys(&self, keys: &[Exposure]) -> Result<(), StoreError>;
}

/// The export subsystem's own relational state: configs, signature infos,
/// batches, files.
#[async_trait]
pub trait ExportStore: Send + Sync {
    async fn list_active_configs(&self, at: DateTime<Utc>) -> Result<Vec<ExportConfig>, StoreError>;

    async fn get_signature_infos(&self, ids: &[i64]) -> Result<Vec<SignatureInfo>, StoreError>;

    /// End timestamp of the most recently created batch for this config, or
    /// `None` if there is no prior lineage (`sanity_epoch` is the effective
    /// floor in that case).
    async fn latest_batch_end(&self, config_id: i64) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Inserts newly planned OPEN batches in one transaction per config.
    /// Returns the number actually inserted (a config racing itself across
    /// replicas can see 0 here if another replica already advanced it).
    async fn insert_batches(&self, batches: Vec<ExportBatch>) -> Result<usize, StoreError>;

    /// Up to `limit` batch ids currently leasable (OPEN, or PENDING with an
    /// expired lease), for the worker to shuffle and attempt in its own
    /// order.
    async fn leasable_batch_ids(
        &self,
        at: DateTime<Utc>,
        min_window_age: Duration,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError>;

    /// Compare-and-swap: succeeds only if the batch is still leasable at
    /// `at`, and atomically marks it PENDING with `lease_expires = at + ttl`.
    async fn try_lease_batch(
        &self,
        batch_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<ExportBatch>, StoreError>;

    /// Marks a batch COMPLETE and inserts its files, in one transaction.
    async fn finalize_batch(&self, batch_id: i64, files: Vec<ExportFile>) -> Result<(), StoreError>;

    async fn list_files_for_batch(&self, batch_id: i64) -> Result<Vec<ExportFile>, StoreError>;

    /// Every `ExportFile` row ever recorded for this config, regardless of
    /// status. The index writer (§4.2 "Index maintenance") filters this
    /// down to `COMPLETE | DELETED` itself, the same narrow-trait-wide-call
    /// shape as `list_files_for_batch`.
    async fn list_files_for_config(&self, config_id: i64) -> Result<Vec<ExportFile>, StoreError>;

    /// Marks files older than `cutoff` `DEL_PEND`, for the cleanup sweep
    /// (§4.6, `CLEANUP_TTL`). Returns the filenames so the caller can also
    /// delete the underlying blobs.
    async fn mark_files_del_pend_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportFile>, StoreError>;

    async fn mark_file_deleted(&self, filename: &str) -> Result<(), StoreError>;
}

/// Blob storage for export files and index files, keyed by `(bucket, path)`.
/// `content_type` is advisory metadata passed through to the backing object
/// store (`application/zip` for export files, `text/plain` for `index.txt`).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;
    async fn get(&self, bucket: &str, path: &str) -> Result<Bytes, StoreError>;
    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StoreError>;
}
