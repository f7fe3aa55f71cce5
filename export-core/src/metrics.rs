// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Histogram, IntCounter, IntCounterVec, Registry,
};

/// Metrics shared by the batcher and worker. Created once per process and
/// held behind `Arc` in [`crate::context::Context`], the same shape as
/// consensus-core's `Context::metrics`.
pub struct Metrics {
    pub batches_created: IntCounter,
    pub batcher_configs_failed: IntCounter,
    pub batcher_already_locked: IntCounter,

    pub batches_leased: IntCounter,
    pub batches_finalized: IntCounter,
    pub batch_processing_failures: IntCounter,
    pub lease_race_losses: IntCounter,

    pub exposures_read: IntCounterVec,
    pub exposures_dropped_bad_length: IntCounter,
    pub keys_padded: IntCounter,

    pub files_written: IntCounter,
    pub index_writes: IntCounter,

    pub batch_processing_duration: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            batches_created: register_int_counter_with_registry!(
                "export_batches_created",
                "Number of ExportBatch rows created by the batcher",
                registry
            )
            .unwrap(),
            batcher_configs_failed: register_int_counter_with_registry!(
                "export_batcher_configs_failed",
                "Number of configs that failed during one create-batches invocation",
                registry
            )
            .unwrap(),
            batcher_already_locked: register_int_counter_with_registry!(
                "export_batcher_already_locked",
                "Number of create-batches invocations that found the global lock held",
                registry
            )
            .unwrap(),
            batches_leased: register_int_counter_with_registry!(
                "export_batches_leased",
                "Number of batches successfully leased by this worker",
                registry
            )
            .unwrap(),
            batches_finalized: register_int_counter_with_registry!(
                "export_batches_finalized",
                "Number of batches transitioned to COMPLETE",
                registry
            )
            .unwrap(),
            batch_processing_failures: register_int_counter_with_registry!(
                "export_batch_processing_failures",
                "Number of leased batches that failed before finalize",
                registry
            )
            .unwrap(),
            lease_race_losses: register_int_counter_with_registry!(
                "export_lease_race_losses",
                "Number of lease CAS attempts that lost the race to another worker",
                registry
            )
            .unwrap(),
            exposures_read: register_int_counter_vec_with_registry!(
                "export_exposures_read",
                "Exposures read from the TEK store, by pass",
                &["pass"],
                registry
            )
            .unwrap(),
            exposures_dropped_bad_length: register_int_counter_with_registry!(
                "export_exposures_dropped_bad_length",
                "Exposures dropped for key_data length != 16",
                registry
            )
            .unwrap(),
            keys_padded: register_int_counter_with_registry!(
                "export_keys_padded",
                "Synthetic keys generated for anonymizing padding",
                registry
            )
            .unwrap(),
            files_written: register_int_counter_with_registry!(
                "export_files_written",
                "Export files uploaded to the blob store",
                registry
            )
            .unwrap(),
            index_writes: register_int_counter_with_registry!(
                "export_index_writes",
                "index.txt writes",
                registry
            )
            .unwrap(),
            batch_processing_duration: register_histogram_with_registry!(
                "export_batch_processing_duration_seconds",
                "Wall time to process one leased batch end to end",
                registry
            )
            .unwrap(),
        })
    }

    #[cfg(test)]
    pub fn new_for_test() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
