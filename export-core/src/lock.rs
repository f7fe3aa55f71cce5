// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Named, TTL'd mutual exclusion (§4.5), implemented on top of whichever
//! relational store backs [`crate::store::ExportStore`]. Mirrors the
//! teacher's preference for a narrow trait at the seam (like
//! `CoreThreadDispatcherInterface`) with a single production adapter and an
//! in-memory fake for tests.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use diesel::sql_types::{Text, Timestamptz};
use diesel::QueryableByName;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::{LockError, StoreError};

/// A held lock (or set of locks, for `multi_lock`). Dropping this without
/// calling [`LockGuard::unlock`] simply leaves the row to expire on its own;
/// unlock is an optimization, not a correctness requirement.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    names: Vec<String>,
}

impl LockGuard {
    pub async fn unlock(self) {
        for name in &self.names {
            self.service.release(name).await;
        }
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquires or returns `LockError::AlreadyLocked` if contended.
    async fn lock(self: Arc<Self>, name: &str, ttl: Duration) -> Result<LockGuard, LockError>;

    /// Atomically acquires all named locks, in canonical (sorted) order, or
    /// none.
    async fn multi_lock(
        self: Arc<Self>,
        names: &[String],
        ttl: Duration,
    ) -> Result<LockGuard, LockError> {
        let mut sorted: BTreeSet<String> = names.iter().cloned().collect();
        let ordered: Vec<String> = std::mem::take(&mut sorted).into_iter().collect();
        let mut acquired = Vec::with_capacity(ordered.len());
        for name in &ordered {
            match self.clone().try_acquire_one(name, ttl).await {
                Ok(()) => acquired.push(name.clone()),
                Err(e) => {
                    for held in &acquired {
                        self.release(held).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(LockGuard {
            service: self,
            names: ordered,
        })
    }

    /// Best-effort release; idempotent.
    async fn release(&self, name: &str);

    /// Internal: acquires a single named lock without wrapping it in a
    /// `LockGuard`. Exposed so `multi_lock`'s default impl can build on it.
    async fn try_acquire_one(self: Arc<Self>, name: &str, ttl: Duration) -> Result<(), LockError>;
}

/// In-process fake used by tests and single-replica deployments that don't
/// need cross-process mutual exclusion.
#[derive(Default)]
pub struct InMemoryLockService {
    held_until: DashMap<String, SystemTime>,
}

impl InMemoryLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn lock(self: Arc<Self>, name: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        self.clone().try_acquire_one(name, ttl).await?;
        Ok(LockGuard {
            service: self,
            names: vec![name.to_string()],
        })
    }

    async fn release(&self, name: &str) {
        self.held_until.remove(name);
    }

    async fn try_acquire_one(self: Arc<Self>, name: &str, ttl: Duration) -> Result<(), LockError> {
        let now = SystemTime::now();
        let mut entry = self.held_until.entry(name.to_string());
        match &entry {
            dashmap::mapref::entry::Entry::Occupied(o) if *o.get() > now => {
                return Err(LockError::AlreadyLocked(name.to_string()));
            }
            _ => {}
        }
        *entry.or_insert(now) = now + ttl;
        Ok(())
    }
}

/// Postgres-backed implementation. Acquisition is an
/// `INSERT ... ON CONFLICT (name) DO UPDATE ... WHERE named_lock.expires_at < now()`
/// upsert: the same "insert-if-not-exists, tolerate stale expiry" idiom used
/// for `ExportFile` rows.
pub struct PgLockService {
    pool: Pool<AsyncPgConnection>,
}

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Text)]
    #[allow(dead_code)]
    name: String,
}

impl PgLockService {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn lock(self: Arc<Self>, name: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        self.clone().try_acquire_one(name, ttl).await?;
        Ok(LockGuard {
            service: self,
            names: vec![name.to_string()],
        })
    }

    async fn release(&self, name: &str) {
        let Ok(mut conn) = self.pool.get().await else {
            return;
        };
        let _ = diesel::sql_query("DELETE FROM named_lock WHERE name = $1")
            .bind::<Text, _>(name)
            .execute(&mut conn)
            .await;
    }

    async fn try_acquire_one(self: Arc<Self>, name: &str, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Storage(StoreError::Database(e.to_string())))?;

        let expires_at: DateTime<Utc> = Utc::now() + chrono::Duration::from_std(ttl).unwrap();
        let rows = diesel::sql_query(
            "INSERT INTO named_lock (name, expires_at) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET expires_at = EXCLUDED.expires_at \
             WHERE named_lock.expires_at < now() \
             RETURNING name",
        )
        .bind::<Text, _>(name)
        .bind::<Timestamptz, _>(expires_at)
        .load::<LockRow>(&mut conn)
        .await
        .map_err(|e| LockError::Storage(StoreError::Database(e.to_string())))?;

        if rows.is_empty() {
            Err(LockError::AlreadyLocked(name.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_until_ttl_expires() {
        let service = InMemoryLockService::new();
        let guard = service.clone().lock("create_batches", Duration::from_millis(20)).await.unwrap();
        assert!(service.clone().lock("create_batches", Duration::from_millis(20)).await.is_err());
        guard.unlock().await;
        assert!(service.clone().lock("create_batches", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let service = InMemoryLockService::new();
        let _guard = service.clone().lock("x", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.clone().lock("x", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn multi_lock_is_all_or_nothing() {
        let service = InMemoryLockService::new();
        let _held = service.clone().lock("b", Duration::from_secs(10)).await.unwrap();

        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = service.clone().multi_lock(&names, Duration::from_secs(10)).await;
        assert!(result.is_err());

        // "a" must have been released after the failed acquisition of "b".
        assert!(service.clone().lock("a", Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn multi_lock_acquires_all_when_none_contended() {
        let service = InMemoryLockService::new();
        let names = vec!["US".to_string(), "TRAVELERS".to_string()];
        let guard = service.clone().multi_lock(&names, Duration::from_secs(10)).await.unwrap();
        assert!(service.clone().lock("US", Duration::from_secs(10)).await.is_err());
        assert!(service.clone().lock("TRAVELERS", Duration::from_secs(10)).await.is_err());
        guard.unlock().await;
        assert!(service.clone().lock("US", Duration::from_secs(10)).await.is_ok());
    }
}
