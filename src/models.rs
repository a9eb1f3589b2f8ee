//! Core data models shared across the scraper, splitter, store, and jobs.
//!
//! The data lifecycle is:
//!
//! ```text
//! Strategy → QueueItem → Fetcher → PipelineContext → splitter → ContentChunk
//!                                                                    ↓
//!                                             DocStore.add_documents(ScrapeResult)
//!                                                                    ↓
//!                                                  search() → SearchHit / SearchResult
//! ```
//!
//! A **library** owns **versions**; a version owns **pages**; a page owns
//! ordered **chunks** (rows in the `documents` table). The `(library,
//! version)` and `(version_id, url)` pairs are unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Lifecycle state of a version. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    NotIndexed,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A refresh in progress; semantically a running state.
    Updating,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::NotIndexed => "not_indexed",
            VersionStatus::Queued => "queued",
            VersionStatus::Running => "running",
            VersionStatus::Completed => "completed",
            VersionStatus::Failed => "failed",
            VersionStatus::Cancelled => "cancelled",
            VersionStatus::Updating => "updating",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "not_indexed" => VersionStatus::NotIndexed,
            "queued" => VersionStatus::Queued,
            "running" => VersionStatus::Running,
            "completed" => VersionStatus::Completed,
            "failed" => VersionStatus::Failed,
            "cancelled" => VersionStatus::Cancelled,
            "updating" => VersionStatus::Updating,
            _ => return None,
        })
    }

    /// Terminal states end a job; `wait_for_job` resolves on any of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VersionStatus::Completed | VersionStatus::Failed | VersionStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VersionStatus::Queued | VersionStatus::Running | VersionStatus::Updating
        )
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a chunk, stored as a bitflag set in memory and
/// serialized as a JSON array of names (`["content","code"]`).
///
/// A chunk tagged purely [`ChunkTypes::STRUCTURAL`] is scaffolding (heading
/// rows, object braces) and is filtered from query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTypes(u8);

impl ChunkTypes {
    pub const CONTENT: ChunkTypes = ChunkTypes(1);
    pub const STRUCTURAL: ChunkTypes = ChunkTypes(1 << 1);
    pub const HEADING: ChunkTypes = ChunkTypes(1 << 2);
    pub const CODE: ChunkTypes = ChunkTypes(1 << 3);
    pub const TABLE: ChunkTypes = ChunkTypes(1 << 4);
    pub const LIST: ChunkTypes = ChunkTypes(1 << 5);

    const NAMES: &'static [(u8, &'static str)] = &[
        (1, "content"),
        (1 << 1, "structural"),
        (1 << 2, "heading"),
        (1 << 3, "code"),
        (1 << 4, "table"),
        (1 << 5, "list"),
    ];

    pub fn empty() -> Self {
        ChunkTypes(0)
    }

    pub fn contains(&self, other: ChunkTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(&self, other: ChunkTypes) -> ChunkTypes {
        ChunkTypes(self.0 | other.0)
    }

    /// True when the chunk carries no indexable content at all.
    pub fn is_structural_only(&self) -> bool {
        !self.contains(ChunkTypes::CONTENT)
    }

    /// Serialize to the JSON-array-of-names storage form.
    pub fn to_json(&self) -> String {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
    }

    /// Parse the storage form; unknown names are ignored.
    pub fn from_json(raw: &str) -> Self {
        let names: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
        let mut flags = 0u8;
        for name in &names {
            if let Some((bit, _)) = Self::NAMES.iter().find(|(_, n)| *n == name.as_str()) {
                flags |= bit;
            }
        }
        ChunkTypes(flags)
    }
}

impl std::ops::BitOr for ChunkTypes {
    type Output = ChunkTypes;
    fn bitor(self, rhs: ChunkTypes) -> ChunkTypes {
        self.union(rhs)
    }
}

impl Default for ChunkTypes {
    fn default() -> Self {
        ChunkTypes::CONTENT
    }
}

/// Position of a chunk within its page's heading hierarchy.
///
/// `path` is the root-to-leaf list of heading titles (or JSON property
/// names / code symbols). The parent path is the prefix of length n-1;
/// siblings share a path of equal length.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SectionMeta {
    pub level: u8,
    pub path: Vec<String>,
    pub types: ChunkTypes,
}

impl SectionMeta {
    pub fn new(level: u8, path: Vec<String>, types: ChunkTypes) -> Self {
        Self { level, path, types }
    }

    /// Two chunks are in the same section when their paths match exactly or
    /// one is a prefix of the other.
    pub fn same_section(&self, other: &SectionMeta) -> bool {
        let shorter = self.path.len().min(other.path.len());
        self.path[..shorter] == other.path[..shorter]
    }
}

/// A splitter-produced chunk before persistence. `body` excludes the
/// metadata header that is prepended only for embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    pub body: String,
    pub meta: SectionMeta,
}

impl ContentChunk {
    pub fn size(&self) -> usize {
        self.body.chars().count()
    }
}

/// Everything a completed fetch+process cycle knows about one page.
/// This is the input to [`crate::store::DocStore::add_documents`].
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    /// The URL as requested (page identity within the version).
    pub url: String,
    /// Where the fetch landed after redirects.
    pub final_url: String,
    pub title: Option<String>,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub chunks: Vec<ContentChunk>,
    /// Absolute URLs discovered on the page, unfiltered.
    pub links: Vec<Url>,
    /// Non-fatal processing errors attached to this page.
    pub errors: Vec<String>,
}

/// A unit of crawl work inside the BFS executor.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub url: Url,
    pub depth: u32,
    /// Seeded from an `llms.txt` link list; enables the `.md` sibling probe.
    pub from_llms_txt: bool,
    /// Set in refresh mode: conditional-request validators and the page row
    /// to update or delete.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub page_id: Option<i64>,
}

impl QueueItem {
    pub fn new(url: Url, depth: u32) -> Self {
        Self {
            url,
            depth,
            from_llms_txt: false,
            etag: None,
            last_modified: None,
            page_id: None,
        }
    }

    pub fn seeded_from_llms_txt(url: Url) -> Self {
        Self {
            from_llms_txt: true,
            ..Self::new(url, 0)
        }
    }

    pub fn is_refresh(&self) -> bool {
        self.page_id.is_some()
    }
}

/// A page row as stored.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub version_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
}

/// A stored chunk row (the `documents` table).
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: i64,
    pub page_id: i64,
    pub sort_order: i64,
    pub content: String,
    pub meta: SectionMeta,
}

/// One raw hit from hybrid retrieval, before neighborhood assembly.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document_id: i64,
    pub page_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub level: u8,
    pub path: Vec<String>,
    pub content: String,
    pub score: f64,
}

/// An assembled result row returned by `search`: the hit expanded with its
/// parent chain, siblings, and children merged in page order.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub url: String,
    pub title: Option<String>,
    pub path: Vec<String>,
    pub score: f64,
    pub content: String,
}

/// Aggregated view of one (library, version) pair from
/// `query_library_versions`, including versions with zero pages.
#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub library: String,
    pub version: String,
    pub status: VersionStatus,
    pub pages_done: u64,
    pub pages_max: u64,
    pub document_count: u64,
    pub unique_url_count: u64,
    pub indexed_at: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_types_roundtrip_json_names() {
        let types = ChunkTypes::CONTENT | ChunkTypes::CODE;
        let json = types.to_json();
        assert_eq!(json, r#"["content","code"]"#);
        assert_eq!(ChunkTypes::from_json(&json), types);
    }

    #[test]
    fn unknown_type_names_ignored() {
        let parsed = ChunkTypes::from_json(r#"["content","hologram"]"#);
        assert_eq!(parsed, ChunkTypes::CONTENT);
    }

    #[test]
    fn structural_only_detection() {
        assert!(ChunkTypes::STRUCTURAL.is_structural_only());
        assert!((ChunkTypes::STRUCTURAL | ChunkTypes::HEADING).is_structural_only());
        assert!(!(ChunkTypes::STRUCTURAL | ChunkTypes::CONTENT).is_structural_only());
    }

    #[test]
    fn same_section_by_prefix() {
        let a = SectionMeta::new(1, vec!["Guide".into()], ChunkTypes::CONTENT);
        let b = SectionMeta::new(2, vec!["Guide".into(), "Setup".into()], ChunkTypes::CONTENT);
        let c = SectionMeta::new(2, vec!["API".into()], ChunkTypes::CONTENT);
        assert!(a.same_section(&b));
        assert!(b.same_section(&a));
        assert!(!a.same_section(&c));
    }

    #[test]
    fn version_status_roundtrip() {
        for status in [
            VersionStatus::NotIndexed,
            VersionStatus::Queued,
            VersionStatus::Running,
            VersionStatus::Completed,
            VersionStatus::Failed,
            VersionStatus::Cancelled,
            VersionStatus::Updating,
        ] {
            assert_eq!(VersionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VersionStatus::parse("bogus"), None);
    }
}
