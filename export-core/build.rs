// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

// Build script to generate the export file wire types from export.proto.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    prost_build::compile_protos(&["proto/export.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/export.proto");
    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
