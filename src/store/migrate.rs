//! Versioned schema migrations.
//!
//! Applied at startup inside an immediate-mode transaction so a second
//! process attaching to the same file cannot interleave DDL. Contention
//! (`SQLITE_BUSY`) retries up to `db.migrationMaxRetries` with
//! `db.migrationRetryDelayMs` between attempts; any other failure is fatal
//! to process initialization.

use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::DbConfig;
use crate::error::StoreError;

/// Migration batches in order; `schema_version.version` records how many
/// have been applied.
const MIGRATIONS: &[&str] = &[
    // v1: full initial schema
    r#"
    CREATE TABLE libraries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        library_id INTEGER NOT NULL REFERENCES libraries(id),
        name TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'not_indexed',
        pages_done INTEGER NOT NULL DEFAULT 0,
        pages_max INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        source_url TEXT,
        scraper_options TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(library_id, name)
    );

    CREATE TABLE pages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version_id INTEGER NOT NULL REFERENCES versions(id),
        url TEXT NOT NULL,
        title TEXT,
        content_type TEXT,
        etag TEXT,
        last_modified TEXT,
        depth INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(version_id, url)
    );

    CREATE TABLE documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        page_id INTEGER NOT NULL REFERENCES pages(id),
        sort_order INTEGER NOT NULL,
        content TEXT NOT NULL,
        section_level INTEGER NOT NULL DEFAULT 0,
        section_path TEXT NOT NULL DEFAULT '[]',
        types TEXT NOT NULL DEFAULT '["content"]',
        UNIQUE(page_id, sort_order)
    );

    CREATE TABLE document_vectors (
        document_id INTEGER PRIMARY KEY REFERENCES documents(id),
        page_id INTEGER NOT NULL REFERENCES pages(id),
        embedding BLOB NOT NULL
    );

    CREATE VIRTUAL TABLE documents_fts USING fts5(
        document_id UNINDEXED,
        page_id UNINDEXED,
        title,
        url,
        path,
        content
    );

    CREATE TABLE jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        library TEXT NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        source_url TEXT,
        options TEXT,
        status TEXT NOT NULL DEFAULT 'queued',
        pages_done INTEGER NOT NULL DEFAULT 0,
        pages_max INTEGER NOT NULL DEFAULT 0,
        pages_failed INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX idx_versions_library ON versions(library_id);
    CREATE INDEX idx_pages_version ON pages(version_id);
    CREATE INDEX idx_documents_page ON documents(page_id);
    CREATE INDEX idx_document_vectors_page ON document_vectors(page_id);
    CREATE INDEX idx_jobs_status ON jobs(status);
    "#,
];

pub async fn apply_migrations(pool: &SqlitePool, config: &DbConfig) -> Result<(), StoreError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match try_apply(pool).await {
            Ok(applied) => {
                if applied > 0 {
                    tracing::info!(applied, "database migrations applied");
                }
                return Ok(());
            }
            Err(err) if is_busy(&err) && attempts <= config.migration_max_retries => {
                tracing::warn!(attempt = attempts, "database busy during migration, retrying");
                tokio::time::sleep(Duration::from_millis(config.migration_retry_delay_ms)).await;
            }
            Err(err) => {
                return Err(StoreError::Migration {
                    attempts,
                    reason: err.to_string(),
                })
            }
        }
    }
}

async fn try_apply(pool: &SqlitePool) -> Result<u32, sqlx::Error> {
    let mut conn = pool.acquire().await?;

    sqlx::raw_sql("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result = async {
        sqlx::raw_sql("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&mut *conn)
            .await?;
        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_optional(&mut *conn)
            .await?;
        let current = match current {
            Some(version) => version,
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
                    .execute(&mut *conn)
                    .await?;
                0
            }
        };

        let mut applied = 0u32;
        for (index, batch) in MIGRATIONS.iter().enumerate() {
            let target = index as i64 + 1;
            if target <= current {
                continue;
            }
            sqlx::raw_sql(batch).execute(&mut *conn).await?;
            sqlx::query("UPDATE schema_version SET version = ?")
                .bind(target)
                .execute(&mut *conn)
                .await?;
            applied += 1;
        }
        Ok::<u32, sqlx::Error>(applied)
    }
    .await;

    match result {
        Ok(applied) => {
            sqlx::raw_sql("COMMIT").execute(&mut *conn).await?;
            Ok(applied)
        }
        Err(err) => {
            let _ = sqlx::raw_sql("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("locked") || db.message().contains("busy"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect_in_memory;

    #[tokio::test]
    async fn migrations_apply_and_are_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        let config = DbConfig::default();
        apply_migrations(&pool, &config).await.unwrap();
        apply_migrations(&pool, &config).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);

        // a representative table and the FTS mirror exist
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert!(tables.contains(&"documents".to_string()));
        assert!(tables.contains(&"documents_fts".to_string()));
        assert!(tables.contains(&"jobs".to_string()));
    }
}
