//! Record store backends.
//!
//! The ingestion jobs and the trend reporter only see `RecordStore`. Postgres
//! is used when `DATABASE_URL` is configured; otherwise documents live in an
//! in-memory map for the duration of the run.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::models::{Namespace, StoredDocument};
use super::queries;
use crate::errors::AppError;

/// Key-value document store with upsert semantics.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or overwrite the document stored under `key`.
    async fn upsert(
        &self,
        namespace: Namespace,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), AppError>;

    async fn get(&self, namespace: Namespace, key: &str)
        -> Result<Option<StoredDocument>, AppError>;

    /// Remove every document in `namespace`, returning how many were removed.
    async fn clear_all(&self, namespace: Namespace) -> Result<u64, AppError>;
}

/// Postgres-backed store using the `forecast_documents` table.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(
        &self,
        namespace: Namespace,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), AppError> {
        queries::upsert_document(&self.pool, namespace, key, data).await?;
        Ok(())
    }

    async fn get(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<Option<StoredDocument>, AppError> {
        Ok(queries::get_document(&self.pool, namespace, key).await?)
    }

    async fn clear_all(&self, namespace: Namespace) -> Result<u64, AppError> {
        Ok(queries::clear_namespace(&self.pool, namespace).await?)
    }
}

/// Process-local store; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    documents: RwLock<HashMap<(Namespace, String), StoredDocument>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in `namespace`.
    #[cfg(test)]
    pub async fn len(&self, namespace: Namespace) -> usize {
        self.documents
            .read()
            .await
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(
        &self,
        namespace: Namespace,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), AppError> {
        let document = StoredDocument {
            key: key.to_string(),
            data: data.clone(),
            updated_at: Utc::now(),
        };
        self.documents
            .write()
            .await
            .insert((namespace, key.to_string()), document);
        Ok(())
    }

    async fn get(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<Option<StoredDocument>, AppError> {
        Ok(self
            .documents
            .read()
            .await
            .get(&(namespace, key.to_string()))
            .cloned())
    }

    async fn clear_all(&self, namespace: Namespace) -> Result<u64, AppError> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|(ns, _), _| *ns != namespace);
        Ok((before - documents.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_repeated_upsert_keeps_last_value() {
        let store = MemoryRecordStore::new();
        for temp in [280.0, 285.0, 290.5] {
            store
                .upsert(Namespace::ShortRange, "k", &json!({ "temperature": { "temp": temp } }))
                .await
                .unwrap();
        }

        assert_eq!(store.len(Namespace::ShortRange).await, 1);
        let doc = store.get(Namespace::ShortRange, "k").await.unwrap().unwrap();
        assert_eq!(doc.data["temperature"]["temp"], 290.5);
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let store = MemoryRecordStore::new();
        store
            .upsert(Namespace::ShortRange, "same", &json!({ "v": 1 }))
            .await
            .unwrap();
        store
            .upsert(Namespace::LongRange, "same", &json!({ "v": 2 }))
            .await
            .unwrap();

        let short = store.get(Namespace::ShortRange, "same").await.unwrap().unwrap();
        let long = store.get(Namespace::LongRange, "same").await.unwrap().unwrap();
        assert_eq!(short.data["v"], 1);
        assert_eq!(long.data["v"], 2);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryRecordStore::new();
        let result = tokio_test::assert_ok!(store.get(Namespace::ShortRange, "absent").await);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_clear_all_only_touches_one_namespace() {
        let store = MemoryRecordStore::new();
        for key in ["a", "b", "c"] {
            store
                .upsert(Namespace::ShortRange, key, &json!({}))
                .await
                .unwrap();
        }
        store
            .upsert(Namespace::LongRange, "a", &json!({}))
            .await
            .unwrap();

        let removed = store.clear_all(Namespace::ShortRange).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len(Namespace::ShortRange).await, 0);
        assert_eq!(store.len(Namespace::LongRange).await, 1);
    }
}
