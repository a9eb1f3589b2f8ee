//! Library/version listing and version ordering.

use sqlx::Row;
use std::cmp::Ordering;

use super::DocStore;
use crate::error::StoreError;
use crate::models::{VersionStatus, VersionSummary};

impl DocStore {
    /// Every (library, version) pair, including versions with zero pages,
    /// with aggregated counts. Versions sort descending by the
    /// semver-aware comparator; the unversioned (empty) collection sorts
    /// as latest.
    pub async fn query_library_versions(&self) -> Result<Vec<VersionSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT l.name AS library, v.name AS version, v.status AS status,
                    v.pages_done AS pages_done, v.pages_max AS pages_max,
                    v.source_url AS source_url,
                    COUNT(d.id) AS document_count,
                    COUNT(DISTINCT p.url) AS url_count,
                    MIN(p.created_at) AS indexed_at
             FROM libraries l
             JOIN versions v ON v.library_id = l.id
             LEFT JOIN pages p ON p.version_id = v.id
             LEFT JOIN documents d ON d.page_id = p.id
             GROUP BY v.id",
        )
        .fetch_all(self.pool())
        .await?;

        let mut summaries: Vec<VersionSummary> = rows
            .iter()
            .map(|row| VersionSummary {
                library: row.get("library"),
                version: row.get("version"),
                status: VersionStatus::parse(&row.get::<String, _>("status"))
                    .unwrap_or(VersionStatus::NotIndexed),
                pages_done: row.get::<i64, _>("pages_done") as u64,
                pages_max: row.get::<i64, _>("pages_max") as u64,
                document_count: row.get::<i64, _>("document_count") as u64,
                unique_url_count: row.get::<i64, _>("url_count") as u64,
                indexed_at: row
                    .get::<Option<i64>, _>("indexed_at")
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
                source_url: row.get("source_url"),
            })
            .collect();

        summaries.sort_by(|a, b| {
            a.library
                .cmp(&b.library)
                .then_with(|| compare_versions(&b.version, &a.version))
        });
        Ok(summaries)
    }

    pub async fn list_libraries(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM libraries ORDER BY name")
                .fetch_all(self.pool())
                .await?;
        Ok(names)
    }

    pub async fn list_versions(&self, library: &str) -> Result<Vec<VersionSummary>, StoreError> {
        let library = library.to_lowercase();
        let all = self.query_library_versions().await?;
        Ok(all
            .into_iter()
            .filter(|summary| summary.library == library)
            .collect())
    }
}

/// Semver-aware ordering. Dotted numeric segments compare numerically,
/// non-numeric segments lexically; a pre-release suffix sorts below its
/// release (`1.2.0-rc.1 < 1.2.0`). The empty string denotes the
/// unversioned collection and sorts above everything.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    let (a_core, a_pre) = split_prerelease(a);
    let (b_core, b_pre) = split_prerelease(b);

    let core = compare_dotted(a_core, b_core);
    if core != Ordering::Equal {
        return core;
    }

    match (a_pre, b_pre) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare_dotted(x, y),
    }
}

fn split_prerelease(version: &str) -> (&str, Option<&str>) {
    match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    }
}

fn compare_dotted(a: &str, b: &str) -> Ordering {
    let mut a_parts = a.split('.');
    let mut b_parts = b.split('.');
    loop {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(m), Ok(n)) => m.cmp(&n),
                    _ => x.cmp(y),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_compare_numerically() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn shorter_versions_sort_below_extended() {
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
    }

    #[test]
    fn prerelease_below_release() {
        assert_eq!(compare_versions("1.2.0-rc.1", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("1.2.0-rc.2", "1.2.0-rc.1"), Ordering::Greater);
    }

    #[test]
    fn empty_version_is_latest() {
        assert_eq!(compare_versions("", "99.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("99.0.0", ""), Ordering::Less);
        assert_eq!(compare_versions("", ""), Ordering::Equal);
    }
}
