//! Contextual neighborhood assembly.
//!
//! A raw hit is a single chunk; on its own it often reads like a torn-out
//! sentence. The assembler expands each hit with, per configured limits,
//! its parent chain (nearest chunk at each prefix of the hit's path),
//! preceding and subsequent siblings (same path), and leading children
//! (path one level deeper, within `maxChunkDistance` positions). The
//! selected chunks merge back in page order into one result row; hit
//! ordering is preserved.

use std::collections::BTreeSet;
use std::collections::HashMap;

use super::DocStore;
use crate::error::StoreError;
use crate::models::{DocumentRecord, SearchHit, SearchResult};

impl DocStore {
    pub async fn assemble(&self, hits: Vec<SearchHit>) -> Result<Vec<SearchResult>, StoreError> {
        // one chunk-list load per distinct page
        let mut pages: HashMap<i64, Vec<DocumentRecord>> = HashMap::new();
        for hit in &hits {
            if !pages.contains_key(&hit.page_id) {
                pages.insert(hit.page_id, self.page_documents(hit.page_id).await?);
            }
        }

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let siblings = pages.get(&hit.page_id).map(Vec::as_slice).unwrap_or(&[]);
            let content = assemble_one(&hit, siblings, &self.assembly);
            results.push(SearchResult {
                url: hit.url,
                title: hit.title,
                path: hit.path,
                score: hit.score,
                content,
            });
        }
        Ok(results)
    }

    async fn page_documents(&self, page_id: i64) -> Result<Vec<DocumentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, page_id, sort_order, content, section_level, section_path, types
             FROM documents WHERE page_id = ? ORDER BY sort_order",
        )
        .bind(page_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(super::document_from_row).collect())
    }
}

fn assemble_one(
    hit: &SearchHit,
    page: &[DocumentRecord],
    config: &crate::config::AssemblyConfig,
) -> String {
    let Some(anchor) = page.iter().find(|d| d.id == hit.document_id) else {
        return hit.content.clone();
    };

    // page order via sort_order; BTreeSet dedupes overlapping selections
    let mut selected: BTreeSet<i64> = BTreeSet::new();
    selected.insert(anchor.sort_order);

    // parent chain: nearest chunk above the anchor at each ancestor path
    let mut parent_path = anchor.meta.path.clone();
    for _ in 0..config.max_parent_chain_depth {
        if parent_path.is_empty() {
            break;
        }
        parent_path.pop();
        if let Some(parent) = page
            .iter()
            .filter(|d| d.meta.path == parent_path && d.sort_order < anchor.sort_order)
            .max_by_key(|d| d.sort_order)
        {
            selected.insert(parent.sort_order);
        }
    }

    // preceding siblings, nearest first
    let mut preceding: Vec<&DocumentRecord> = page
        .iter()
        .filter(|d| d.meta.path == anchor.meta.path && d.sort_order < anchor.sort_order)
        .collect();
    preceding.sort_by_key(|d| std::cmp::Reverse(d.sort_order));
    for sibling in preceding.iter().take(config.preceding_siblings_limit) {
        selected.insert(sibling.sort_order);
    }

    // subsequent siblings, nearest first
    let subsequent = page
        .iter()
        .filter(|d| d.meta.path == anchor.meta.path && d.sort_order > anchor.sort_order)
        .take(config.subsequent_siblings_limit);
    for sibling in subsequent {
        selected.insert(sibling.sort_order);
    }

    // leading children: one level deeper, close to the anchor
    let children = page
        .iter()
        .filter(|d| {
            d.meta.path.len() == anchor.meta.path.len() + 1
                && d.meta.path.starts_with(&anchor.meta.path)
                && d.sort_order > anchor.sort_order
                && d.sort_order - anchor.sort_order <= config.max_chunk_distance
        })
        .take(config.child_limit);
    for child in children {
        selected.insert(child.sort_order);
    }

    page.iter()
        .filter(|d| selected.contains(&d.sort_order))
        .map(|d| d.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
