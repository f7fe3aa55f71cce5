// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Data model for the export subsystem: [`ExportConfig`] owns [`ExportBatch`]
//! rows, which own [`ExportFile`] rows. The graph is a tree; upward references
//! are by id only (`config_id`, `batch_id`), never back-pointers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of seconds in a day. `ExportConfig::period` must evenly divide this.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Sanity epoch before which no real batch lineage exists (2019-01-01T00:00:00Z).
/// A config whose `latest_end` predates this is treated as having no prior batch.
pub fn sanity_epoch() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2019-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("period must be between 1s and 24h, got {0:?}")]
    PeriodOutOfRange(Duration),
    #[error("period {0:?} does not evenly divide 24h")]
    PeriodDoesNotDivideDay(Duration),
    #[error("signed output requires at least one signature_info_id")]
    MissingSignatureInfo,
    #[error("include_travelers and only_non_travelers are mutually exclusive")]
    ConflictingTravelerFlags,
}

/// A long-lived declaration of what to export and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    pub config_id: i64,
    pub bucket_name: String,
    pub filename_root: String,
    pub period: Duration,
    pub output_region: String,
    pub input_regions: Vec<String>,
    pub include_travelers: bool,
    pub only_non_travelers: bool,
    pub exclude_regions: Vec<String>,
    pub from: DateTime<Utc>,
    pub thru: Option<DateTime<Utc>>,
    pub signature_info_ids: Vec<i64>,
    pub max_records_override: Option<u32>,
}

impl ExportConfig {
    /// The set of input regions actually queried: `input_regions` if
    /// non-empty, otherwise `[output_region]`.
    pub fn effective_input_regions(&self) -> Vec<String> {
        if self.input_regions.is_empty() {
            vec![self.output_region.clone()]
        } else {
            self.input_regions.clone()
        }
    }

    /// Whether `from < at < (thru or infinity)`, i.e. this config is active.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.from < at && self.thru.map(|t| t > at).unwrap_or(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.period.as_secs();
        if secs == 0 || secs > SECONDS_PER_DAY {
            return Err(ConfigError::PeriodOutOfRange(self.period));
        }
        if SECONDS_PER_DAY % secs != 0 {
            return Err(ConfigError::PeriodDoesNotDivideDay(self.period));
        }
        if self.signature_info_ids.is_empty() {
            return Err(ConfigError::MissingSignatureInfo);
        }
        if self.include_travelers && self.only_non_travelers {
            return Err(ConfigError::ConflictingTravelerFlags);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Open,
    Pending,
    Complete,
}

/// One unit of work for one time window of one config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportBatch {
    pub batch_id: i64,
    pub config_id: i64,
    pub bucket_name: String,
    pub filename_root: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub output_region: String,
    pub input_regions: Vec<String>,
    pub include_travelers: bool,
    pub only_non_travelers: bool,
    pub exclude_regions: Vec<String>,
    pub status: BatchStatus,
    pub lease_expires: Option<DateTime<Utc>>,
    pub signature_info_ids: Vec<i64>,
    pub max_records_override: Option<u32>,
}

impl ExportBatch {
    /// Builds the OPEN batch snapshotted from `config` for window `[start, end)`.
    pub fn new_open(config: &ExportConfig, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            batch_id: 0,
            config_id: config.config_id,
            bucket_name: config.bucket_name.clone(),
            filename_root: config.filename_root.clone(),
            start_timestamp: start,
            end_timestamp: end,
            output_region: config.output_region.clone(),
            input_regions: config.input_regions.clone(),
            include_travelers: config.include_travelers,
            only_non_travelers: config.only_non_travelers,
            exclude_regions: config.exclude_regions.clone(),
            status: BatchStatus::Open,
            lease_expires: None,
            signature_info_ids: config.signature_info_ids.clone(),
            max_records_override: config.max_records_override,
        }
    }

    pub fn effective_input_regions(&self) -> Vec<String> {
        if self.input_regions.is_empty() {
            vec![self.output_region.clone()]
        } else {
            self.input_regions.clone()
        }
    }

    /// A PENDING batch whose lease has expired is selectable exactly like OPEN.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            BatchStatus::Open => true,
            BatchStatus::Pending => self.lease_expires.map(|e| e < now).unwrap_or(false),
            BatchStatus::Complete => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Complete,
    DelPend,
    Deleted,
}

/// One physical ZIP object produced for a batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportFile {
    pub filename: String,
    pub bucket_name: String,
    pub batch_id: i64,
    pub output_region: String,
    pub input_regions: Vec<String>,
    pub batch_num: u32,
    pub batch_size: u32,
    pub status: FileStatus,
    pub include_travelers: bool,
    pub only_non_travelers: bool,
}

/// Metadata about a signing key. Only infos whose `end_timestamp` is unset or
/// `>= now` are effective for signing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub signature_info_id: i64,
    pub signing_key_version: String,
    pub signing_key_id: String,
    /// Opaque reference the `KeyManager` resolves to an actual signer.
    pub kms_resource_id: String,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl SignatureInfo {
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.end_timestamp.map(|e| e >= at).unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportType {
    Clinical,
    Confirmed,
    SelfReport,
    Negative,
    Unknown,
}

/// A temporary exposure key read from the publish store. Read-only for this
/// subsystem; the publish path is an external producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Exposure {
    pub exposure_key: [u8; 16],
    pub interval_number: i32,
    pub interval_count: i32,
    pub regions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub traveler: bool,
    pub local_provenance: bool,
    pub transmission_risk: i32,
    pub report_type: ReportType,
    pub days_since_symptom_onset: Option<i32>,
    pub revised_report_type: Option<ReportType>,
    pub revised_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ExportConfig {
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
            from: DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            thru: None,
            signature_info_ids: vec![1],
            max_records_override: None,
        }
    }

    #[test]
    fn validate_accepts_divisor_periods() {
        assert!(base_config().validate().is_ok());
        let mut c = base_config();
        c.period = Duration::from_secs(86_400);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_divisor_period() {
        let mut c = base_config();
        c.period = Duration::from_secs(3601);
        assert_eq!(
            c.validate(),
            Err(ConfigError::PeriodDoesNotDivideDay(Duration::from_secs(3601)))
        );
    }

    #[test]
    fn validate_rejects_period_out_of_range() {
        let mut c = base_config();
        c.period = Duration::from_secs(0);
        assert!(matches!(c.validate(), Err(ConfigError::PeriodOutOfRange(_))));
        c.period = Duration::from_secs(SECONDS_PER_DAY + 1);
        assert!(matches!(c.validate(), Err(ConfigError::PeriodOutOfRange(_))));
    }

    #[test]
    fn validate_rejects_missing_signature_info() {
        let mut c = base_config();
        c.signature_info_ids.clear();
        assert_eq!(c.validate(), Err(ConfigError::MissingSignatureInfo));
    }

    #[test]
    fn validate_rejects_conflicting_traveler_flags() {
        let mut c = base_config();
        c.include_travelers = true;
        c.only_non_travelers = true;
        assert_eq!(c.validate(), Err(ConfigError::ConflictingTravelerFlags));
    }

    #[test]
    fn effective_input_regions_defaults_to_output_region() {
        let c = base_config();
        assert_eq!(c.effective_input_regions(), vec!["US".to_string()]);
    }

    #[test]
    fn is_active_at_respects_from_and_thru() {
        let mut c = base_config();
        let before = DateTime::parse_from_rfc3339("2019-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let during = DateTime::parse_from_rfc3339("2020-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!c.is_active_at(before));
        assert!(c.is_active_at(during));
        c.thru = Some(during);
        let after = DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!c.is_active_at(after));
    }

    #[test]
    fn batch_is_leasable_matches_state_machine() {
        let config = base_config();
        let start = config.from;
        let end = start + chrono::Duration::from_std(config.period).unwrap();
        let mut batch = ExportBatch::new_open(&config, start, end);
        let now = end;
        assert!(batch.is_leasable(now));

        batch.status = BatchStatus::Pending;
        batch.lease_expires = Some(now + chrono::Duration::seconds(60));
        assert!(!batch.is_leasable(now));
        assert!(batch.is_leasable(now + chrono::Duration::seconds(61)));

        batch.status = BatchStatus::Complete;
        assert!(!batch.is_leasable(now + chrono::Duration::seconds(1000)));
    }
}
