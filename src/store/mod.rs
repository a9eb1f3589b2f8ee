//! Hybrid document store.
//!
//! Persistent state lives in one embedded SQLite database: relational
//! tables (`libraries` → `versions` → `pages` → `documents`), an FTS5
//! mirror for keyword search, and a BLOB vector mirror for semantic
//! search. Foreign keys enforce the hierarchy; a single process owns the
//! file at any time.
//!
//! Writes are transactional: re-ingesting a page replaces its entire chunk
//! set atomically (delete-then-insert, mirrors included), so `sort_order`
//! is always the dense sequence `0..n-1`.

pub mod assembly;
pub mod fts;
pub mod migrate;
pub mod search;
pub mod versions;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{AssemblyConfig, SearchConfig};
use crate::embedding::{embedding_text, vec_to_blob, Embedder};
use crate::error::StoreError;
use crate::models::{
    DocumentRecord, PageRecord, ScrapeResult, SectionMeta, VersionStatus,
};

/// Open (and create if missing) the database file. WAL mode, foreign keys
/// on, one writer pool shared by the whole process.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| StoreError::Migration {
            attempts: 0,
            reason: format!("cannot create store directory: {}", err),
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(StoreError::Sqlx)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// In-memory database for tests.
pub async fn connect_in_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(StoreError::Sqlx)?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Cascade summary returned by [`DocStore::remove_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalSummary {
    pub documents_deleted: u64,
    pub version_deleted: bool,
    pub library_deleted: bool,
}

pub struct DocStore {
    pool: SqlitePool,
    embedder: Option<Arc<Embedder>>,
    pub(crate) search: SearchConfig,
    pub(crate) assembly: AssemblyConfig,
}

impl DocStore {
    pub fn new(
        pool: SqlitePool,
        embedder: Option<Arc<Embedder>>,
        search: SearchConfig,
        assembly: AssemblyConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            search,
            assembly,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn embedder(&self) -> Option<&Arc<Embedder>> {
        self.embedder.as_ref()
    }

    pub fn has_embeddings(&self) -> bool {
        self.embedder.is_some()
    }

    /// Insert-or-get the library and version rows. Libraries are keyed by
    /// lowercase name; the empty version string is the unversioned
    /// collection. New versions start in `not_indexed`.
    pub async fn resolve_version_id(
        &self,
        library: &str,
        version: &str,
    ) -> Result<i64, StoreError> {
        let library = library.to_lowercase();
        let now = Utc::now().timestamp();

        sqlx::query("INSERT INTO libraries (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
            .bind(&library)
            .bind(now)
            .execute(&self.pool)
            .await?;
        let library_id: i64 = sqlx::query_scalar("SELECT id FROM libraries WHERE name = ?")
            .bind(&library)
            .fetch_one(&self.pool)
            .await?;

        sqlx::query(
            "INSERT INTO versions (library_id, name, status, created_at, updated_at)
             VALUES (?, ?, 'not_indexed', ?, ?)
             ON CONFLICT(library_id, name) DO NOTHING",
        )
        .bind(library_id)
        .bind(version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let version_id: i64 =
            sqlx::query_scalar("SELECT id FROM versions WHERE library_id = ? AND name = ?")
                .bind(library_id)
                .bind(version)
                .fetch_one(&self.pool)
                .await?;
        Ok(version_id)
    }

    pub async fn version_id(&self, library: &str, version: &str) -> Result<i64, StoreError> {
        let library = library.to_lowercase();
        sqlx::query_scalar(
            "SELECT v.id FROM versions v JOIN libraries l ON l.id = v.library_id
             WHERE l.name = ? AND v.name = ?",
        )
        .bind(&library)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::VersionNotFound {
            library,
            version: version.to_string(),
        })
    }

    /// Persist one scraped page: upsert the page row, atomically replace
    /// its chunk set in input order, and populate the FTS and vector
    /// mirrors. Embeddings are computed before the transaction opens.
    pub async fn add_documents(
        &self,
        library: &str,
        version: &str,
        depth: u32,
        result: &ScrapeResult,
    ) -> Result<u64, StoreError> {
        let version_id = self.resolve_version_id(library, version).await?;
        let title = result.title.clone().unwrap_or_default();

        // vectors first: provider calls must not hold the write transaction
        let vectors = match &self.embedder {
            Some(embedder) => {
                let texts: Vec<String> = result
                    .chunks
                    .iter()
                    .map(|chunk| {
                        embedding_text(&title, &result.url, &chunk.meta.path, &chunk.body)
                    })
                    .collect();
                match embedder.embed_documents(&texts).await {
                    Ok(vectors) => Some(vectors),
                    Err(err) => {
                        tracing::warn!(url = result.url.as_str(), error = %err, "embedding failed, page indexed for FTS only");
                        None
                    }
                }
            }
            None => None,
        };

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let page_id: i64 = sqlx::query_scalar(
            "INSERT INTO pages (version_id, url, title, content_type, etag, last_modified, depth, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(version_id, url) DO UPDATE SET
                 title = excluded.title,
                 content_type = excluded.content_type,
                 etag = excluded.etag,
                 last_modified = excluded.last_modified,
                 depth = excluded.depth,
                 updated_at = excluded.updated_at
             RETURNING id",
        )
        .bind(version_id)
        .bind(&result.url)
        .bind(&result.title)
        .bind(&result.content_type)
        .bind(&result.etag)
        .bind(&result.last_modified)
        .bind(depth as i64)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        // full replacement: mirrors first (FK order), then the chunk rows
        sqlx::query("DELETE FROM document_vectors WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents_fts WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;

        for (index, chunk) in result.chunks.iter().enumerate() {
            let path_json = serde_json::to_string(&chunk.meta.path).unwrap_or_else(|_| "[]".into());
            let document_id: i64 = sqlx::query_scalar(
                "INSERT INTO documents (page_id, sort_order, content, section_level, section_path, types)
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(page_id)
            .bind(index as i64)
            .bind(&chunk.body)
            .bind(chunk.meta.level as i64)
            .bind(&path_json)
            .bind(chunk.meta.types.to_json())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO documents_fts (document_id, page_id, title, url, path, content)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(page_id)
            .bind(&title)
            .bind(&result.url)
            .bind(chunk.meta.path.join(" / "))
            .bind(&chunk.body)
            .execute(&mut *tx)
            .await?;

            if let Some(vectors) = &vectors {
                if let Some(vector) = vectors.get(index) {
                    sqlx::query(
                        "INSERT INTO document_vectors (document_id, page_id, embedding) VALUES (?, ?, ?)",
                    )
                    .bind(document_id)
                    .bind(page_id)
                    .bind(vec_to_blob(vector))
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(result.chunks.len() as u64)
    }

    /// Remove a page and its chunks, documents first (FK order).
    pub async fn delete_page(&self, page_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM document_vectors WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents_fts WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pages WHERE id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// A conditional refresh hit: only the page's freshness timestamp moves.
    pub async fn touch_page(&self, page_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE pages SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cascade delete: documents → pages → version → library (the latter
    /// only when it has no versions left and the caller opted in).
    pub async fn remove_version(
        &self,
        library: &str,
        version: &str,
        remove_library_if_empty: bool,
    ) -> Result<RemovalSummary, StoreError> {
        let library = library.to_lowercase();
        let version_id = self.version_id(&library, version).await?;

        let mut tx = self.pool.begin().await?;

        let documents_deleted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE page_id IN (SELECT id FROM pages WHERE version_id = ?)",
        )
        .bind(version_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM document_vectors WHERE page_id IN (SELECT id FROM pages WHERE version_id = ?)")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents_fts WHERE page_id IN (SELECT id FROM pages WHERE version_id = ?)")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE page_id IN (SELECT id FROM pages WHERE version_id = ?)")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pages WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        let library_id: i64 = sqlx::query_scalar("SELECT library_id FROM versions WHERE id = ?")
            .bind(version_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM versions WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        let mut library_deleted = false;
        if remove_library_if_empty {
            let remaining: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM versions WHERE library_id = ?")
                    .bind(library_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if remaining == 0 {
                sqlx::query("DELETE FROM libraries WHERE id = ?")
                    .bind(library_id)
                    .execute(&mut *tx)
                    .await?;
                library_deleted = true;
            }
        }

        tx.commit().await?;
        Ok(RemovalSummary {
            documents_deleted: documents_deleted as u64,
            version_deleted: true,
            library_deleted,
        })
    }

    /// Atomic single-row status transition.
    pub async fn update_version_status(
        &self,
        library: &str,
        version: &str,
        status: VersionStatus,
    ) -> Result<(), StoreError> {
        let version_id = self.resolve_version_id(library, version).await?;
        sqlx::query("UPDATE versions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_version_progress(
        &self,
        library: &str,
        version: &str,
        pages_done: u64,
        pages_max: u64,
    ) -> Result<(), StoreError> {
        let version_id = self.resolve_version_id(library, version).await?;
        sqlx::query("UPDATE versions SET pages_done = ?, pages_max = ?, updated_at = ? WHERE id = ?")
            .bind(pages_done as i64)
            .bind(pages_max as i64)
            .bind(Utc::now().timestamp())
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_version_error(
        &self,
        library: &str,
        version: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let version_id = self.resolve_version_id(library, version).await?;
        sqlx::query("UPDATE versions SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now().timestamp())
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the effective scrape options so a later refresh re-runs
    /// with identical settings.
    pub async fn set_version_source(
        &self,
        library: &str,
        version: &str,
        source_url: &str,
        options_snapshot: &str,
    ) -> Result<(), StoreError> {
        let version_id = self.resolve_version_id(library, version).await?;
        sqlx::query(
            "UPDATE versions SET source_url = ?, scraper_options = ?, updated_at = ? WHERE id = ?",
        )
        .bind(source_url)
        .bind(options_snapshot)
        .bind(Utc::now().timestamp())
        .bind(version_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn version_scraper_options(
        &self,
        library: &str,
        version: &str,
    ) -> Result<Option<String>, StoreError> {
        let version_id = self.version_id(library, version).await?;
        let snapshot: Option<String> =
            sqlx::query_scalar("SELECT scraper_options FROM versions WHERE id = ?")
                .bind(version_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(snapshot)
    }

    /// Stored pages of a version, as refresh queue seeds (url, depth, and
    /// the conditional-request validators).
    pub async fn pages_for_refresh(
        &self,
        library: &str,
        version: &str,
    ) -> Result<Vec<PageRecord>, StoreError> {
        let version_id = self.version_id(library, version).await?;
        let rows = sqlx::query(
            "SELECT id, version_id, url, title, content_type, etag, last_modified, depth, created_at
             FROM pages WHERE version_id = ? ORDER BY depth, id",
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(page_from_row).collect())
    }

    /// All chunks of one page in `sort_order`, for assembly and tests.
    pub async fn find_chunks_by_url(
        &self,
        library: &str,
        version: &str,
        url: &str,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let version_id = self.version_id(library, version).await?;
        let rows = sqlx::query(
            "SELECT d.id, d.page_id, d.sort_order, d.content, d.section_level, d.section_path, d.types
             FROM documents d JOIN pages p ON p.id = d.page_id
             WHERE p.version_id = ? AND p.url = ?
             ORDER BY d.sort_order",
        )
        .bind(version_id)
        .bind(url)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(document_from_row).collect())
    }

    /// Whether any chunk is indexed for (library, version).
    pub async fn check_document_exists(
        &self,
        library: &str,
        version: &str,
    ) -> Result<bool, StoreError> {
        let library = library.to_lowercase();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents d
             JOIN pages p ON p.id = d.page_id
             JOIN versions v ON v.id = p.version_id
             JOIN libraries l ON l.id = v.library_id
             WHERE l.name = ? AND v.name = ?",
        )
        .bind(&library)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

pub(crate) fn page_from_row(row: &sqlx::sqlite::SqliteRow) -> PageRecord {
    PageRecord {
        id: row.get("id"),
        version_id: row.get("version_id"),
        url: row.get("url"),
        title: row.get("title"),
        content_type: row.get("content_type"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        depth: row.get::<i64, _>("depth") as u32,
        created_at: chrono::DateTime::from_timestamp(row.get::<i64, _>("created_at"), 0)
            .unwrap_or_default(),
    }
}

pub(crate) fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
    let path: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("section_path")).unwrap_or_default();
    DocumentRecord {
        id: row.get("id"),
        page_id: row.get("page_id"),
        sort_order: row.get("sort_order"),
        content: row.get("content"),
        meta: SectionMeta::new(
            row.get::<i64, _>("section_level") as u8,
            path,
            crate::models::ChunkTypes::from_json(&row.get::<String, _>("types")),
        ),
    }
}
