// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjectPath, Attribute, AttributeValue, Attributes, ObjectStore, PutOptions};

use crate::error::StoreError;

use super::BlobStore;

/// Adapts a single `object_store::ObjectStore` (e.g. an S3 bucket, or a
/// local filesystem store in tests) into [`BlobStore`]. `bucket` is folded
/// into the object path rather than selecting a different store, since a
/// single `ExportConfig` only ever targets one bucket but many batches
/// share a process.
pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn object_path(bucket: &str, path: &str) -> ObjectPath {
        ObjectPath::from(format!("{bucket}/{path}"))
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put(&self, bucket: &str, path: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, AttributeValue::from(content_type.to_string()));
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(&Self::object_path(bucket, path), bytes.into(), opts)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Bytes, StoreError> {
        let result = self
            .store
            .get(&Self::object_path(bucket, path))
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => StoreError::NotFound,
                other => StoreError::Blob(other.to_string()),
            })?;
        result
            .bytes()
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StoreError> {
        self.store
            .delete(&Self::object_path(bucket, path))
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))?;
        Ok(())
    }
}
