// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Data model and operational configuration for the export subsystem.
//! Mirrors the split between `consensus-config`'s `Committee`/`Parameters`
//! and this subsystem's `ExportConfig`/`Parameters`: stable, serde-mapped
//! structs with no behavior beyond validation and small derived queries.

mod model;
mod parameters;

pub use model::{
    sanity_epoch, BatchStatus, ConfigError, ExportBatch, ExportConfig, ExportFile, Exposure,
    FileStatus, ReportType, SignatureInfo, SECONDS_PER_DAY,
};
pub use parameters::{Parameters, ParametersError};
