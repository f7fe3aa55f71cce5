// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use export_config::Parameters;
use prometheus::Registry;

use crate::metrics::Metrics;

/// Process-wide configuration and metrics shared by the batcher and worker,
/// mirroring `consensus-core::context::Context`.
#[derive(Clone)]
pub struct Context {
    pub parameters: Parameters,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(parameters: Parameters, registry: &Registry) -> Self {
        Self {
            parameters,
            metrics: Metrics::new(registry),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self {
            parameters: Parameters::default(),
            metrics: Metrics::new_for_test(),
        }
    }
}
