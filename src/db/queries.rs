use sqlx::PgPool;

use super::models::{Namespace, StoredDocument};

/// Insert a document, or overwrite the existing one with the same key (last write wins).
pub async fn upsert_document(
    pool: &PgPool,
    namespace: Namespace,
    key: &str,
    data: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO forecast_documents (namespace, key, data, updated_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (namespace, key)
         DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
    )
    .bind(namespace.as_str())
    .bind(key)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get a single document by key.
pub async fn get_document(
    pool: &PgPool,
    namespace: Namespace,
    key: &str,
) -> Result<Option<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        "SELECT key, data, updated_at
         FROM forecast_documents
         WHERE namespace = $1 AND key = $2",
    )
    .bind(namespace.as_str())
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Delete every document in a namespace. Returns the number of rows removed.
pub async fn clear_namespace(pool: &PgPool, namespace: Namespace) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM forecast_documents WHERE namespace = $1")
        .bind(namespace.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
