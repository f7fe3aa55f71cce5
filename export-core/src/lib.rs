// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The export production pipeline: batcher (time-window planning) and
//! worker (lease, read, pad, sign, upload, index), plus the seams they're
//! built on (lock service, storage adapters, export file codec, padding,
//! key manager).

pub mod batcher;
pub mod codec;
pub mod context;
pub mod error;
pub mod keymanager;
pub mod lock;
pub mod metrics;
pub mod padding;
mod proto;
pub mod store;
pub mod worker;

pub use batcher::{make_batch_ranges, Batcher};
pub use context::Context;
pub use worker::Worker;
