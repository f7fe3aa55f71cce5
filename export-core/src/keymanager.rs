// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signing seam. Production deployments resolve `kms_resource_id` to an
//! external KMS call; this module only ships the in-process signer used by
//! tests and single-box deployments, built on the same
//! `fastcrypto::secp256r1` primitives used elsewhere for validator and
//! narwhal signing keys.

use std::collections::HashMap;

use async_trait::async_trait;
use export_config::SignatureInfo;
use fastcrypto::{
    secp256r1::{Secp256r1KeyPair, Secp256r1Signature},
    traits::{KeyPair, Signer},
};

use crate::error::KeyManagerError;

/// Which signature info a digest is being signed under; `KeyManager`
/// implementations key their internal signer map on `kms_resource_id`.
pub struct SignatureRequest<'a> {
    pub signature_info: &'a SignatureInfo,
}

#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Signs `digest` (a SHA-256 digest of `export.bin`) and returns an
    /// ASN.1 DER-encoded ECDSA-P256-SHA256 signature.
    async fn sign(&self, request: &SignatureRequest<'_>, digest: &[u8; 32]) -> Result<Vec<u8>, KeyManagerError>;
}

/// Holds keypairs in process memory, keyed by `kms_resource_id`. Good enough
/// for tests and for deployments that mount key material directly rather
/// than delegating to an external KMS.
pub struct InProcessKeyManager {
    keys: HashMap<String, Secp256r1KeyPair>,
}

impl InProcessKeyManager {
    pub fn new(keys: HashMap<String, Secp256r1KeyPair>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeyManager for InProcessKeyManager {
    async fn sign(&self, request: &SignatureRequest<'_>, digest: &[u8; 32]) -> Result<Vec<u8>, KeyManagerError> {
        let resource_id = &request.signature_info.kms_resource_id;
        let keypair = self
            .keys
            .get(resource_id)
            .ok_or_else(|| KeyManagerError::UnknownKey(resource_id.clone()))?;
        let signature: Secp256r1Signature = keypair.sign(digest);
        // `as_ref()` is the raw 64-byte r||s concatenation; the wire format
        // wants ASN.1 DER, the same encoding Go's `crypto/ecdsa` produces.
        Ok(der_encode_signature(signature.as_ref()))
    }
}

/// Encodes a raw fixed-width `r || s` ECDSA signature (32 bytes each, for
/// P-256) as an ASN.1 DER `SEQUENCE { INTEGER r, INTEGER s }`.
fn der_encode_signature(raw: &[u8]) -> Vec<u8> {
    debug_assert_eq!(raw.len(), 64);
    let (r, s) = raw.split_at(32);
    let mut out = Vec::with_capacity(72);
    out.push(0x30); // SEQUENCE
    let r_enc = der_encode_unsigned_integer(r);
    let s_enc = der_encode_unsigned_integer(s);
    out.push((r_enc.len() + s_enc.len()) as u8);
    out.extend_from_slice(&r_enc);
    out.extend_from_slice(&s_enc);
    out
}

/// DER INTEGER encoding of a big-endian unsigned value: strip leading zero
/// bytes, then prepend one back if the high bit would otherwise make the
/// value read as negative.
fn der_encode_unsigned_integer(be_bytes: &[u8]) -> Vec<u8> {
    let mut trimmed = be_bytes;
    while trimmed.len() > 1 && trimmed[0] == 0 {
        trimmed = &trimmed[1..];
    }
    let needs_pad = trimmed[0] & 0x80 != 0;
    let len = trimmed.len() + if needs_pad { 1 } else { 0 };
    let mut out = Vec::with_capacity(len + 2);
    out.push(0x02); // INTEGER
    out.push(len as u8);
    if needs_pad {
        out.push(0x00);
    }
    out.extend_from_slice(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcrypto::traits::KeyPair as _;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_signature_info(resource_id: &str) -> SignatureInfo {
        SignatureInfo {
            signature_info_id: 1,
            signing_key_version: "v1".into(),
            signing_key_id: "key-1".into(),
            kms_resource_id: resource_id.into(),
            end_timestamp: None,
        }
    }

    #[tokio::test]
    async fn signs_with_the_keypair_for_the_requested_resource() {
        let mut rng = StdRng::seed_from_u64(7);
        let keypair = Secp256r1KeyPair::generate(&mut rng);
        let mut keys = HashMap::new();
        keys.insert("resource-a".to_string(), keypair);
        let manager = InProcessKeyManager::new(keys);

        let info = test_signature_info("resource-a");
        let digest = [3u8; 32];
        let signature = manager
            .sign(&SignatureRequest { signature_info: &info }, &digest)
            .await
            .unwrap();
        assert!(!signature.is_empty());
        // ASN.1 DER SEQUENCE, not the raw 64-byte r||s concatenation.
        assert_eq!(signature[0], 0x30);
        assert_eq!(signature[1] as usize, signature.len() - 2);
    }

    #[tokio::test]
    async fn unknown_resource_id_is_rejected() {
        let manager = InProcessKeyManager::new(HashMap::new());
        let info = test_signature_info("nope");
        let result = manager
            .sign(&SignatureRequest { signature_info: &info }, &[0u8; 32])
            .await;
        assert!(matches!(result, Err(KeyManagerError::UnknownKey(_))));
    }

    #[test]
    fn der_encodes_sequence_of_two_unsigned_integers() {
        let mut raw = [0u8; 64];
        raw[31] = 0x7f; // r = 0x7f, no padding needed
        raw[63] = 0x80; // s = 0x80, high bit set, needs a leading zero byte
        let der = der_encode_signature(&raw);

        assert_eq!(der[0], 0x30);
        assert_eq!(der[1] as usize, der.len() - 2);
        // INTEGER r: tag, length 1, value 0x7f
        assert_eq!(&der[2..5], &[0x02, 0x01, 0x7f]);
        // INTEGER s: tag, length 2, padding zero byte, value 0x80
        assert_eq!(&der[5..9], &[0x02, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn der_encode_unsigned_integer_strips_leading_zeros() {
        let mut be = [0u8; 32];
        be[30] = 0x01;
        be[31] = 0x02;
        assert_eq!(der_encode_unsigned_integer(&be), vec![0x02, 0x02, 0x01, 0x02]);
    }
}
