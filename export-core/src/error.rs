// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors from the named-lock service (§4.5). `AlreadyLocked` is a
/// component-local recovery: callers either treat it as success (the
/// batcher) or retry after a sleep (the worker's index lock).
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock {0} is already held")]
    AlreadyLocked(String),
    #[error("storage error acquiring lock: {0}")]
    Storage(#[from] StoreError),
}

/// Errors from the relational/blob store adapters (§4.6).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("unique key conflict on {0}")]
    KeyConflict(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("blob store error: {0}")]
    Blob(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_key_conflict(&self) -> bool {
        matches!(self, StoreError::KeyConflict(_))
    }
}

/// Errors surfaced by `KeyManager::sign` (§4.7).
#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("no signer registered for kms_resource_id {0}")]
    UnknownKey(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Errors from the export file codec (§4.3).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("zip archive error: {0}")]
    Zip(String),
    #[error("export.bin entry missing")]
    MissingBin,
    #[error("export.sig entry missing")]
    MissingSig,
    #[error("export.bin header mismatch: expected {expected:?}, got {got:?}")]
    BadHeader { expected: Vec<u8>, got: Vec<u8> },
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("key manager error: {0}")]
    KeyManager(#[from] KeyManagerError),
    #[error("invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// Errors from `Batcher::create_batches` (§4.1). Per-config failures never
/// reach this type directly (they're logged and aggregated); this type is
/// for infrastructure failures that abort the whole invocation.
#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0} of {1} configs failed; see logs")]
    PartialFailure(usize, usize),
}

/// Errors from `Worker::do_work` (§4.2).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("blob store error: {0}")]
    Blob(String),
    /// Fatal: a config references no signer that is still effective.
    /// Surfaced, not silently skipped.
    #[error("config {0} has no effective signature info")]
    NoEffectiveSignatureInfo(i64),
    /// The per-config index lock stayed contended until the batch's own
    /// lease was about to expire; retrying would risk racing the next
    /// worker that reclaims the batch.
    #[error("timed out waiting for index lock on config {0}")]
    IndexLockTimeout(i64),
}
