// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Loads the in-process `KeyManager` from `Parameters::signing_keys_path`
//! (§4.9): a JSON file of `{kms_resource_id: base64(private_key)}` entries,
//! for deployments without an external KMS wired up.

use std::collections::HashMap;

use base64::Engine;
use export_core::keymanager::InProcessKeyManager;
use fastcrypto::{
    secp256r1::{Secp256r1KeyPair, Secp256r1PrivateKey},
    traits::ToFromBytes,
};

pub fn load_key_manager(path: Option<&str>) -> anyhow::Result<InProcessKeyManager> {
    let Some(path) = path else {
        tracing::warn!("no signing_keys_path configured; KeyManager has no registered keys");
        return Ok(InProcessKeyManager::new(HashMap::new()));
    };

    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading signing keys file {path}: {e}"))?;
    let entries: HashMap<String, String> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing signing keys file {path}: {e}"))?;

    let mut keys = HashMap::with_capacity(entries.len());
    for (resource_id, b64) in entries {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&b64)
            .map_err(|e| anyhow::anyhow!("decoding key for {resource_id}: {e}"))?;
        let private_key = Secp256r1PrivateKey::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("loading keypair for {resource_id}: {e}"))?;
        keys.insert(resource_id, Secp256r1KeyPair::from(private_key));
    }
    tracing::info!(count = keys.len(), "loaded signing keys");
    Ok(InProcessKeyManager::new(keys))
}
