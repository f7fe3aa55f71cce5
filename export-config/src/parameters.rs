// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operational configuration of the export subsystem, populated from the
/// process environment at startup.
///
/// NOTE: default values should make sense, so most deployments should not
/// need to override every field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    #[serde(default = "Parameters::default_port")]
    pub port: u16,

    #[serde(default = "Parameters::default_create_batches_timeout")]
    pub create_batches_timeout: Duration,

    #[serde(default = "Parameters::default_worker_timeout")]
    pub worker_timeout: Duration,

    #[serde(default = "Parameters::default_export_file_min_records")]
    pub export_file_min_records: u32,

    #[serde(default = "Parameters::default_export_file_padding_range")]
    pub export_file_padding_range: u32,

    #[serde(default = "Parameters::default_export_file_max_records")]
    pub export_file_max_records: u32,

    #[serde(default = "Parameters::default_truncate_window")]
    pub truncate_window: Duration,

    #[serde(default = "Parameters::default_min_window_age")]
    pub min_window_age: Duration,

    #[serde(default = "Parameters::default_cleanup_ttl")]
    pub cleanup_ttl: Duration,

    /// Connection string for the relational store. Exists only so this
    /// process can find the database; the store itself is treated as an
    /// external dependency, not owned by this crate.
    pub database_url: String,

    /// Documentation-only template for how `SignatureInfo::kms_resource_id`
    /// maps to an external KMS key reference (e.g.
    /// `projects/{project}/locations/{loc}/keyRings/{ring}/cryptoKeys/{id}`).
    /// The shipped `KeyManager` is in-process (see `export_core::keymanager`)
    /// and does not call out to a KMS; this field exists so deployments that
    /// do wire one have a place to record the convention.
    #[serde(default)]
    pub kms_resource_template: String,

    /// Path to a JSON file of `{kms_resource_id: base64(private_key)}`
    /// entries, loaded at startup into an in-process `KeyManager` for
    /// single-instance deployments that don't have a KMS available.
    #[serde(default)]
    pub signing_keys_path: Option<String>,
}

#[derive(Error, Debug)]
pub enum ParametersError {
    #[error("failed to parse env var {name}={value}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required env var {0}")]
    Missing(&'static str),
}

impl Parameters {
    pub fn default_port() -> u16 {
        8080
    }

    pub fn default_create_batches_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn default_worker_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn default_export_file_min_records() -> u32 {
        1_000
    }

    pub fn default_export_file_padding_range() -> u32 {
        100
    }

    pub fn default_export_file_max_records() -> u32 {
        30_000
    }

    pub fn default_truncate_window() -> Duration {
        Duration::from_secs(60 * 60)
    }

    pub fn default_min_window_age() -> Duration {
        Duration::from_secs(2 * 60 * 60)
    }

    pub fn default_cleanup_ttl() -> Duration {
        Duration::from_secs(336 * 60 * 60)
    }

    /// Reads recognized `PORT`/`CREATE_BATCHES_TIMEOUT`/... environment
    /// variables, falling back to the defaults above. Durations are given in
    /// whole seconds.
    pub fn from_env() -> Result<Self, ParametersError> {
        fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ParametersError> {
            match std::env::var(name) {
                Ok(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ParametersError::InvalidValue {
                        name,
                        value: v,
                        reason: e.to_string(),
                    }),
                Err(_) => Ok(default),
            }
        }

        fn u32_var(name: &'static str, default: u32) -> Result<u32, ParametersError> {
            match std::env::var(name) {
                Ok(v) => v.parse::<u32>().map_err(|e| ParametersError::InvalidValue {
                    name,
                    value: v,
                    reason: e.to_string(),
                }),
                Err(_) => Ok(default),
            }
        }

        let port = match std::env::var("PORT") {
            Ok(v) => v.parse::<u16>().map_err(|e| ParametersError::InvalidValue {
                name: "PORT",
                value: v,
                reason: e.to_string(),
            })?,
            Err(_) => Self::default_port(),
        };

        Ok(Self {
            port,
            create_batches_timeout: duration_var(
                "CREATE_BATCHES_TIMEOUT",
                Self::default_create_batches_timeout(),
            )?,
            worker_timeout: duration_var("WORKER_TIMEOUT", Self::default_worker_timeout())?,
            export_file_min_records: u32_var(
                "EXPORT_FILE_MIN_RECORDS",
                Self::default_export_file_min_records(),
            )?,
            export_file_padding_range: u32_var(
                "EXPORT_FILE_PADDING_RANGE",
                Self::default_export_file_padding_range(),
            )?,
            export_file_max_records: u32_var(
                "EXPORT_FILE_MAX_RECORDS",
                Self::default_export_file_max_records(),
            )?,
            truncate_window: duration_var("TRUNCATE_WINDOW", Self::default_truncate_window())?,
            min_window_age: duration_var("MIN_WINDOW_AGE", Self::default_min_window_age())?,
            cleanup_ttl: duration_var("CLEANUP_TTL", Self::default_cleanup_ttl())?,
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| ParametersError::Missing("DATABASE_URL"))?,
            kms_resource_template: std::env::var("KMS_RESOURCE_TEMPLATE").unwrap_or_default(),
            signing_keys_path: std::env::var("SIGNING_KEYS_PATH").ok(),
        })
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            create_batches_timeout: Self::default_create_batches_timeout(),
            worker_timeout: Self::default_worker_timeout(),
            export_file_min_records: Self::default_export_file_min_records(),
            export_file_padding_range: Self::default_export_file_padding_range(),
            export_file_max_records: Self::default_export_file_max_records(),
            truncate_window: Self::default_truncate_window(),
            min_window_age: Self::default_min_window_age(),
            cleanup_ttl: Self::default_cleanup_ttl(),
            database_url: "postgres://localhost/export".to_string(),
            kms_resource_template: String::new(),
            signing_keys_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let p = Parameters::default();
        assert_eq!(p.port, 8080);
        assert_eq!(p.create_batches_timeout, Duration::from_secs(300));
        assert_eq!(p.worker_timeout, Duration::from_secs(300));
        assert_eq!(p.export_file_min_records, 1_000);
        assert_eq!(p.export_file_padding_range, 100);
        assert_eq!(p.export_file_max_records, 30_000);
        assert_eq!(p.truncate_window, Duration::from_secs(3600));
        assert_eq!(p.min_window_age, Duration::from_secs(7200));
        assert_eq!(p.cleanup_ttl, Duration::from_secs(336 * 3600));
    }
}
