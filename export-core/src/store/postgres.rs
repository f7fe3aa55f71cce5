// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Postgres-backed `ExportStore`. Plain `sql_query` rather than generated
//! `table!`/`Queryable` bindings: the export schema is small and stable
//! enough that hand-written SQL reads clearer than a query-builder DSL for
//! the multi-table transactions finalize/lease need.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::sql_types::{Array, BigInt, Bool, Bytea, Integer, Nullable, Text, Timestamptz};
use diesel::QueryableByName;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use export_config::{
    BatchStatus, Exposure, ExportBatch, ExportConfig, ExportFile, FileStatus, ReportType, SignatureInfo,
};

use crate::error::StoreError;

use super::{ExposureCriteria, ExposureStore, ExportStore};

pub struct PgExportStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgExportStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

#[derive(QueryableByName)]
struct ConfigRow {
    #[diesel(sql_type = BigInt)]
    config_id: i64,
    #[diesel(sql_type = Text)]
    bucket_name: String,
    #[diesel(sql_type = Text)]
    filename_root: String,
    #[diesel(sql_type = BigInt)]
    period_seconds: i64,
    #[diesel(sql_type = Text)]
    output_region: String,
    #[diesel(sql_type = Array<Text>)]
    input_regions: Vec<String>,
    #[diesel(sql_type = Bool)]
    include_travelers: bool,
    #[diesel(sql_type = Bool)]
    only_non_travelers: bool,
    #[diesel(sql_type = Array<Text>)]
    exclude_regions: Vec<String>,
    #[diesel(sql_type = Timestamptz)]
    from_ts: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    thru_ts: Option<DateTime<Utc>>,
    #[diesel(sql_type = Array<BigInt>)]
    signature_info_ids: Vec<i64>,
    #[diesel(sql_type = Nullable<Integer>)]
    max_records_override: Option<i32>,
}

impl From<ConfigRow> for ExportConfig {
    fn from(r: ConfigRow) -> Self {
        ExportConfig {
            config_id: r.config_id,
            bucket_name: r.bucket_name,
            filename_root: r.filename_root,
            period: Duration::from_secs(r.period_seconds as u64),
            output_region: r.output_region,
            input_regions: r.input_regions,
            include_travelers: r.include_travelers,
            only_non_travelers: r.only_non_travelers,
            exclude_regions: r.exclude_regions,
            from: r.from_ts,
            thru: r.thru_ts,
            signature_info_ids: r.signature_info_ids,
            max_records_override: r.max_records_override.map(|v| v as u32),
        }
    }
}

#[derive(QueryableByName)]
struct SignatureInfoRow {
    #[diesel(sql_type = BigInt)]
    signature_info_id: i64,
    #[diesel(sql_type = Text)]
    signing_key_version: String,
    #[diesel(sql_type = Text)]
    signing_key_id: String,
    #[diesel(sql_type = Text)]
    kms_resource_id: String,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    end_timestamp: Option<DateTime<Utc>>,
}

impl From<SignatureInfoRow> for SignatureInfo {
    fn from(r: SignatureInfoRow) -> Self {
        SignatureInfo {
            signature_info_id: r.signature_info_id,
            signing_key_version: r.signing_key_version,
            signing_key_id: r.signing_key_id,
            kms_resource_id: r.kms_resource_id,
            end_timestamp: r.end_timestamp,
        }
    }
}

#[derive(QueryableByName)]
struct BatchRow {
    #[diesel(sql_type = BigInt)]
    batch_id: i64,
    #[diesel(sql_type = BigInt)]
    config_id: i64,
    #[diesel(sql_type = Text)]
    bucket_name: String,
    #[diesel(sql_type = Text)]
    filename_root: String,
    #[diesel(sql_type = Timestamptz)]
    start_timestamp: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    end_timestamp: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    output_region: String,
    #[diesel(sql_type = Array<Text>)]
    input_regions: Vec<String>,
    #[diesel(sql_type = Bool)]
    include_travelers: bool,
    #[diesel(sql_type = Bool)]
    only_non_travelers: bool,
    #[diesel(sql_type = Array<Text>)]
    exclude_regions: Vec<String>,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    lease_expires: Option<DateTime<Utc>>,
    #[diesel(sql_type = Array<BigInt>)]
    signature_info_ids: Vec<i64>,
    #[diesel(sql_type = Nullable<Integer>)]
    max_records_override: Option<i32>,
}

fn status_from_str(s: &str) -> BatchStatus {
    match s {
        "PENDING" => BatchStatus::Pending,
        "COMPLETE" => BatchStatus::Complete,
        _ => BatchStatus::Open,
    }
}

impl From<BatchRow> for ExportBatch {
    fn from(r: BatchRow) -> Self {
        ExportBatch {
            batch_id: r.batch_id,
            config_id: r.config_id,
            bucket_name: r.bucket_name,
            filename_root: r.filename_root,
            start_timestamp: r.start_timestamp,
            end_timestamp: r.end_timestamp,
            output_region: r.output_region,
            input_regions: r.input_regions,
            include_travelers: r.include_travelers,
            only_non_travelers: r.only_non_travelers,
            exclude_regions: r.exclude_regions,
            status: status_from_str(&r.status),
            lease_expires: r.lease_expires,
            signature_info_ids: r.signature_info_ids,
            max_records_override: r.max_records_override.map(|v| v as u32),
        }
    }
}

#[derive(QueryableByName)]
struct FileRow {
    #[diesel(sql_type = Text)]
    filename: String,
    #[diesel(sql_type = Text)]
    bucket_name: String,
    #[diesel(sql_type = BigInt)]
    batch_id: i64,
    #[diesel(sql_type = Text)]
    output_region: String,
    #[diesel(sql_type = Array<Text>)]
    input_regions: Vec<String>,
    #[diesel(sql_type = Integer)]
    batch_num: i32,
    #[diesel(sql_type = Integer)]
    batch_size: i32,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = Bool)]
    include_travelers: bool,
    #[diesel(sql_type = Bool)]
    only_non_travelers: bool,
}

fn file_status_to_str(s: FileStatus) -> &'static str {
    match s {
        FileStatus::Complete => "COMPLETE",
        FileStatus::DelPend => "DEL_PEND",
        FileStatus::Deleted => "DELETED",
    }
}

fn file_status_from_str(s: &str) -> FileStatus {
    match s {
        "DEL_PEND" => FileStatus::DelPend,
        "DELETED" => FileStatus::Deleted,
        _ => FileStatus::Complete,
    }
}

impl From<FileRow> for ExportFile {
    fn from(r: FileRow) -> Self {
        ExportFile {
            filename: r.filename,
            bucket_name: r.bucket_name,
            batch_id: r.batch_id,
            output_region: r.output_region,
            input_regions: r.input_regions,
            batch_num: r.batch_num as u32,
            batch_size: r.batch_size as u32,
            status: file_status_from_str(&r.status),
            include_travelers: r.include_travelers,
            only_non_travelers: r.only_non_travelers,
        }
    }
}

#[async_trait]
impl ExportStore for PgExportStore {
    async fn list_active_configs(&self, at: DateTime<Utc>) -> Result<Vec<ExportConfig>, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT config_id, bucket_name, filename_root, period_seconds, output_region, \
             input_regions, include_travelers, only_non_travelers, exclude_regions, \
             from_ts, thru_ts, signature_info_ids, max_records_override \
             FROM export_config WHERE from_ts < $1 AND (thru_ts IS NULL OR thru_ts > $1)",
        )
        .bind::<Timestamptz, _>(at)
        .load::<ConfigRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ExportConfig::from).collect())
    }

    async fn get_signature_infos(&self, ids: &[i64]) -> Result<Vec<SignatureInfo>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT signature_info_id, signing_key_version, signing_key_id, kms_resource_id, end_timestamp \
             FROM signature_info WHERE signature_info_id = ANY($1)",
        )
        .bind::<Array<BigInt>, _>(ids.to_vec())
        .load::<SignatureInfoRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(SignatureInfo::from).collect())
    }

    async fn latest_batch_end(&self, config_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        #[derive(QueryableByName)]
        struct MaxEnd {
            #[diesel(sql_type = Nullable<Timestamptz>)]
            max_end: Option<DateTime<Utc>>,
        }
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let row = diesel::sql_query("SELECT max(end_timestamp) AS max_end FROM export_batch WHERE config_id = $1")
            .bind::<BigInt, _>(config_id)
            .get_result::<MaxEnd>(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(row.max_end)
    }

    async fn insert_batches(&self, batches: Vec<ExportBatch>) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let mut inserted = 0;
        for batch in batches {
            let n = diesel::sql_query(
                "INSERT INTO export_batch \
                 (config_id, bucket_name, filename_root, start_timestamp, end_timestamp, \
                  output_region, input_regions, include_travelers, only_non_travelers, \
                  exclude_regions, status, signature_info_ids, max_records_override) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'OPEN', $11, $12) \
                 ON CONFLICT (config_id, start_timestamp) DO NOTHING",
            )
            .bind::<BigInt, _>(batch.config_id)
            .bind::<Text, _>(&batch.bucket_name)
            .bind::<Text, _>(&batch.filename_root)
            .bind::<Timestamptz, _>(batch.start_timestamp)
            .bind::<Timestamptz, _>(batch.end_timestamp)
            .bind::<Text, _>(&batch.output_region)
            .bind::<Array<Text>, _>(&batch.input_regions)
            .bind::<Bool, _>(batch.include_travelers)
            .bind::<Bool, _>(batch.only_non_travelers)
            .bind::<Array<Text>, _>(&batch.exclude_regions)
            .bind::<Array<BigInt>, _>(&batch.signature_info_ids)
            .bind::<Nullable<Integer>, _>(batch.max_records_override.map(|v| v as i32))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
            inserted += n;
        }
        Ok(inserted)
    }

    async fn leasable_batch_ids(
        &self,
        at: DateTime<Utc>,
        min_window_age: Duration,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        #[derive(QueryableByName)]
        struct IdRow {
            #[diesel(sql_type = BigInt)]
            batch_id: i64,
        }
        let min_age_secs = min_window_age.as_secs() as i64;
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT batch_id FROM export_batch \
             WHERE end_timestamp <= $1 - make_interval(secs => $2) \
             AND (status = 'OPEN' OR (status = 'PENDING' AND lease_expires < $1)) \
             LIMIT $3",
        )
        .bind::<Timestamptz, _>(at)
        .bind::<BigInt, _>(min_age_secs)
        .bind::<BigInt, _>(limit as i64)
        .load::<IdRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.batch_id).collect())
    }

    async fn try_lease_batch(
        &self,
        batch_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<ExportBatch>, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let lease_expires = at + chrono::Duration::from_std(ttl).unwrap();
        let rows = diesel::sql_query(
            "UPDATE export_batch SET status = 'PENDING', lease_expires = $1 \
             WHERE batch_id = $2 AND (status = 'OPEN' OR (status = 'PENDING' AND lease_expires < $3)) \
             RETURNING config_id, bucket_name, filename_root, start_timestamp, end_timestamp, \
                       output_region, input_regions, include_travelers, only_non_travelers, \
                       exclude_regions, status, lease_expires, signature_info_ids, max_records_override, \
                       batch_id",
        )
        .bind::<Timestamptz, _>(lease_expires)
        .bind::<BigInt, _>(batch_id)
        .bind::<Timestamptz, _>(at)
        .load::<BatchRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().next().map(ExportBatch::from))
    }

    async fn finalize_batch(&self, batch_id: i64, files: Vec<ExportFile>) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                diesel::sql_query("UPDATE export_batch SET status = 'COMPLETE', lease_expires = NULL WHERE batch_id = $1")
                    .bind::<BigInt, _>(batch_id)
                    .execute(conn)
                    .await
                    .map_err(db_err)?;

                for file in &files {
                    // A batch retry can re-upload the same filename (object
                    // names are deterministic): conflict on the primary key
                    // is tolerated, not an error.
                    diesel::sql_query(
                        "INSERT INTO export_file \
                         (filename, bucket_name, batch_id, output_region, input_regions, \
                          batch_num, batch_size, status, include_travelers, only_non_travelers) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                         ON CONFLICT (filename) DO NOTHING",
                    )
                    .bind::<Text, _>(&file.filename)
                    .bind::<Text, _>(&file.bucket_name)
                    .bind::<BigInt, _>(file.batch_id)
                    .bind::<Text, _>(&file.output_region)
                    .bind::<Array<Text>, _>(&file.input_regions)
                    .bind::<Integer, _>(file.batch_num as i32)
                    .bind::<Integer, _>(file.batch_size as i32)
                    .bind::<Text, _>(file_status_to_str(file.status))
                    .bind::<Bool, _>(file.include_travelers)
                    .bind::<Bool, _>(file.only_non_travelers)
                    .execute(conn)
                    .await
                    .map_err(db_err)?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn list_files_for_batch(&self, batch_id: i64) -> Result<Vec<ExportFile>, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT filename, bucket_name, batch_id, output_region, input_regions, \
             batch_num, batch_size, status, include_travelers, only_non_travelers \
             FROM export_file WHERE batch_id = $1 ORDER BY batch_num",
        )
        .bind::<BigInt, _>(batch_id)
        .load::<FileRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ExportFile::from).collect())
    }

    async fn list_files_for_config(&self, config_id: i64) -> Result<Vec<ExportFile>, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT f.filename, f.bucket_name, f.batch_id, f.output_region, f.input_regions, \
             f.batch_num, f.batch_size, f.status, f.include_travelers, f.only_non_travelers \
             FROM export_file f JOIN export_batch b ON b.batch_id = f.batch_id \
             WHERE b.config_id = $1",
        )
        .bind::<BigInt, _>(config_id)
        .load::<FileRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ExportFile::from).collect())
    }

    async fn mark_files_del_pend_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExportFile>, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "UPDATE export_file SET status = 'DEL_PEND' \
             WHERE status = 'COMPLETE' AND batch_id IN \
               (SELECT batch_id FROM export_batch WHERE end_timestamp < $1) \
             RETURNING filename, bucket_name, batch_id, output_region, input_regions, \
                       batch_num, batch_size, status, include_travelers, only_non_travelers",
        )
        .bind::<Timestamptz, _>(cutoff)
        .load::<FileRow>(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(ExportFile::from).collect())
    }

    async fn mark_file_deleted(&self, filename: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        diesel::sql_query("UPDATE export_file SET status = 'DELETED' WHERE filename = $1")
            .bind::<Text, _>(filename)
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn report_type_to_str(rt: ReportType) -> &'static str {
    match rt {
        ReportType::Clinical => "CLINICAL",
        ReportType::Confirmed => "CONFIRMED",
        ReportType::SelfReport => "SELF_REPORT",
        ReportType::Negative => "NEGATIVE",
        ReportType::Unknown => "UNKNOWN",
    }
}

fn report_type_from_str(s: &str) -> ReportType {
    match s {
        "CLINICAL" => ReportType::Clinical,
        "CONFIRMED" => ReportType::Confirmed,
        "SELF_REPORT" => ReportType::SelfReport,
        "NEGATIVE" => ReportType::Negative,
        _ => ReportType::Unknown,
    }
}

#[derive(QueryableByName)]
struct ExposureRow {
    #[diesel(sql_type = Bytea)]
    exposure_key: Vec<u8>,
    #[diesel(sql_type = Integer)]
    interval_number: i32,
    #[diesel(sql_type = Integer)]
    interval_count: i32,
    #[diesel(sql_type = Array<Text>)]
    regions: Vec<String>,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Bool)]
    traveler: bool,
    #[diesel(sql_type = Bool)]
    local_provenance: bool,
    #[diesel(sql_type = Integer)]
    transmission_risk: i32,
    #[diesel(sql_type = Text)]
    report_type: String,
    #[diesel(sql_type = Nullable<Integer>)]
    days_since_symptom_onset: Option<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    revised_report_type: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    revised_at: Option<DateTime<Utc>>,
}

/// `exposure_key` is a `bytea` column on the wire, not yet known to be 16
/// bytes; rows failing that check are skipped rather than surfaced. Once
/// past this boundary the domain type makes the invariant structural
/// (`Exposure::exposure_key: [u8; 16]`), so nothing downstream needs to
/// re-check it.
impl TryFrom<ExposureRow> for Exposure {
    type Error = ();

    fn try_from(r: ExposureRow) -> Result<Self, Self::Error> {
        let exposure_key: [u8; 16] = r.exposure_key.try_into().map_err(|_| ())?;
        Ok(Exposure {
            exposure_key,
            interval_number: r.interval_number,
            interval_count: r.interval_count,
            regions: r.regions,
            created_at: r.created_at,
            traveler: r.traveler,
            local_provenance: r.local_provenance,
            transmission_risk: r.transmission_risk,
            report_type: report_type_from_str(&r.report_type),
            days_since_symptom_onset: r.days_since_symptom_onset,
            revised_report_type: r.revised_report_type.as_deref().map(report_type_from_str),
            revised_at: r.revised_at,
        })
    }
}

/// Postgres-backed read side of the (externally owned) publish store.
/// Reads from the `exposure` table the publish pipeline writes into;
/// `persist_padding_keys` is the one write this subsystem performs against
/// that table — the only write-side effect the worker has on data outside
/// its own tables.
pub struct PgExposureStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgExposureStore {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExposureStore for PgExposureStore {
    async fn iterate_exposures(
        &self,
        criteria: &ExposureCriteria,
        visit: &mut (dyn FnMut(Exposure) + Send),
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await.map_err(db_err)?;
        let rows = diesel::sql_query(
            "SELECT exposure_key, interval_number, interval_count, regions, created_at, \
             traveler, local_provenance, transmission_risk, report_type, \
             days_since_symptom_onset, revised_report_type, revised_at \
             FROM exposure \
             WHERE created_at >= $1 AND created_at < $2 \
             AND ($3::bool = false OR local_provenance = true) \
             AND ($4::bool = false OR revised_report_type IS NOT NULL) \
             AND ($5::bool = true OR traveler = false) \
             AND ($6::bool = false OR traveler = true) \
             AND NOT (regions && $7) \
             AND ($8::text[] = '{}' OR regions && $8) \
             ORDER BY exposure_key",
        )
        .bind::<Timestamptz, _>(criteria.since)
        .bind::<Timestamptz, _>(criteria.until)
        .bind::<Bool, _>(criteria.only_local_provenance)
        .bind::<Bool, _>(criteria.only_revised_keys)
        .bind::<Bool, _>(criteria.include_travelers)
        .bind::<Bool, _>(criteria.only_non_travelers)
        .bind::<Array<Text>, _>(&criteria.exclude_regions)
        .bind::<Array<Text>, _>(&criteria.include_regions)
        .load::<ExposureRow>(&mut conn)
        .await
        .map_err(db_err)?;

        let mut count = 0;
        for row in rows {
            if let Ok(exposure) = Exposure::try_from(row) {
                visit(exposure);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn persist_padding_keys(&self, keys: &[Exposure]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(db_err)?;
        for key in keys {
            diesel::sql_query(
                "INSERT INTO exposure \
                 (exposure_key, interval_number, interval_count, regions, created_at, \
                  traveler, local_provenance, transmission_risk, report_type, \
                  days_since_symptom_onset, revised_report_type, revised_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (exposure_key) DO NOTHING",
            )
            .bind::<Bytea, _>(key.exposure_key.to_vec())
            .bind::<Integer, _>(key.interval_number)
            .bind::<Integer, _>(key.interval_count)
            .bind::<Array<Text>, _>(&key.regions)
            .bind::<Timestamptz, _>(key.created_at)
            .bind::<Bool, _>(key.traveler)
            .bind::<Bool, _>(key.local_provenance)
            .bind::<Integer, _>(key.transmission_risk)
            .bind::<Text, _>(report_type_to_str(key.report_type))
            .bind::<Nullable<Integer>, _>(key.days_since_symptom_onset)
            .bind::<Nullable<Text>, _>(key.revised_report_type.map(report_type_to_str))
            .bind::<Nullable<Timestamptz>, _>(key.revised_at)
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}
