// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Generated from `proto/export.proto` by `build.rs`.

include!(concat!(env!("OUT_DIR"), "/export_core.rs"));
