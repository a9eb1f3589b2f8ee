//! Hybrid retrieval: BM25 keyword search, brute-force vector search over
//! the BLOB mirror, and Reciprocal Rank Fusion of the two.
//!
//! Without an embedding provider only the FTS path runs. With one, both
//! indexes are over-fetched (`limit × overfetchFactor`, the vector side
//! additionally `× vectorMultiplier`), candidates get 1-based per-index
//! ranks, and each is scored `Σ wᵢ / (60 + rankᵢ)`. Ties break by
//! ascending document id. Chunks tagged purely structural never surface.

use sqlx::Row;
use std::collections::HashMap;

use super::fts::build_match_query;
use super::DocStore;
use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::error::StoreError;
use crate::models::SearchHit;

/// The RRF smoothing constant.
const RRF_K: f64 = 60.0;

impl DocStore {
    /// Top-`limit` chunks for a query within (library, version).
    pub async fn find_by_content(
        &self,
        library: &str,
        version: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let limit = limit.max(1);
        let overfetch = limit * self.search.overfetch_factor;

        let fts_ranked = self
            .fts_candidates(library, version, query, overfetch)
            .await?;

        let query_vector = match &self.embedder() {
            Some(embedder) => match embedder.embed_query(query).await {
                Ok(vector) => Some(vector),
                Err(err) => {
                    tracing::warn!(error = %err, "query embedding failed, falling back to FTS only");
                    None
                }
            },
            None => None,
        };

        let fused: Vec<(i64, f64)> = match query_vector {
            None => fts_ranked
                .iter()
                .map(|(id, score)| (*id, *score))
                .collect(),
            Some(vector) => {
                let k_vec = overfetch * self.search.vector_multiplier;
                let vec_ranked = self
                    .vector_candidates(library, version, &vector, k_vec)
                    .await?;
                rrf_fuse(
                    &vec_ranked.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                    &fts_ranked.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                    self.search.weight_vec,
                    self.search.weight_fts,
                )
            }
        };

        let top: Vec<(i64, f64)> = fused.into_iter().take(limit).collect();
        self.load_hits(&top).await
    }

    /// BM25 candidates, best first, scored `-bm25`. Title and path are
    /// boosted heavily, the URL a little, the body stays modest.
    async fn fts_candidates(
        &self,
        library: &str,
        version: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let Some(match_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        let library = library.to_lowercase();

        let rows = sqlx::query(
            "SELECT f.document_id AS document_id,
                    bm25(documents_fts, 0.0, 10.0, 2.0, 8.0, 1.0) AS rank
             FROM documents_fts f
             JOIN documents d ON d.id = f.document_id
             JOIN pages p ON p.id = d.page_id
             JOIN versions v ON v.id = p.version_id
             JOIN libraries l ON l.id = v.library_id
             WHERE documents_fts MATCH ?
               AND l.name = ? AND v.name = ?
               AND d.types LIKE '%\"content\"%'
             ORDER BY rank
             LIMIT ?",
        )
        .bind(&match_query)
        .bind(&library)
        .bind(version)
        .bind(k as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("document_id");
                let rank: f64 = row.get("rank");
                (id, -rank)
            })
            .collect())
    }

    /// Nearest neighbors by cosine over the in-scope vectors, best first.
    async fn vector_candidates(
        &self,
        library: &str,
        version: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let library = library.to_lowercase();
        let rows = sqlx::query(
            "SELECT dv.document_id AS document_id, dv.embedding AS embedding
             FROM document_vectors dv
             JOIN documents d ON d.id = dv.document_id
             JOIN pages p ON p.id = d.page_id
             JOIN versions v ON v.id = p.version_id
             JOIN libraries l ON l.id = v.library_id
             WHERE l.name = ? AND v.name = ?
               AND d.types LIKE '%\"content\"%'",
        )
        .bind(&library)
        .bind(version)
        .fetch_all(self.pool())
        .await?;

        let mut scored: Vec<(i64, f64)> = rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("document_id");
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vector, &blob_to_vec(&blob)) as f64;
                (id, similarity)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn load_hits(&self, scored: &[(i64, f64)]) -> Result<Vec<SearchHit>, StoreError> {
        let mut hits = Vec::with_capacity(scored.len());
        for (document_id, score) in scored {
            let row = sqlx::query(
                "SELECT d.id, d.page_id, d.content, d.section_level, d.section_path,
                        p.url, p.title
                 FROM documents d JOIN pages p ON p.id = d.page_id
                 WHERE d.id = ?",
            )
            .bind(document_id)
            .fetch_optional(self.pool())
            .await?;
            let Some(row) = row else { continue };

            let path: Vec<String> =
                serde_json::from_str(&row.get::<String, _>("section_path")).unwrap_or_default();
            hits.push(SearchHit {
                document_id: row.get("id"),
                page_id: row.get("page_id"),
                url: row.get("url"),
                title: row.get("title"),
                level: row.get::<i64, _>("section_level") as u8,
                path,
                content: row.get("content"),
                score: *score,
            });
        }
        Ok(hits)
    }
}

/// Fuse two ranked id lists with Reciprocal Rank Fusion. Ranks are
/// 1-based; a candidate absent from one list simply contributes nothing
/// from it. Output is sorted by descending score, ties broken by ascending
/// id so results are deterministic.
pub fn rrf_fuse(
    vec_ranked: &[i64],
    fts_ranked: &[i64],
    weight_vec: f64,
    weight_fts: f64,
) -> Vec<(i64, f64)> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    for (index, id) in vec_ranked.iter().enumerate() {
        *scores.entry(*id).or_default() += weight_vec / (RRF_K + (index + 1) as f64);
    }
    for (index, id) in fts_ranked.iter().enumerate() {
        *scores.entry(*id).or_default() += weight_fts / (RRF_K + (index + 1) as f64);
    }

    let mut fused: Vec<(i64, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_ranks_tie_break_by_id() {
        // A: vec_rank 1, fts_rank 10. B: vec_rank 10, fts_rank 1.
        let vec_ranked = vec![1, 3, 4, 5, 6, 7, 8, 9, 10, 2];
        let fts_ranked = vec![2, 3, 4, 5, 6, 7, 8, 9, 10, 1];

        let fused = rrf_fuse(&vec_ranked, &fts_ranked, 1.0, 1.0);
        let score_a = fused.iter().find(|(id, _)| *id == 1).unwrap().1;
        let score_b = fused.iter().find(|(id, _)| *id == 2).unwrap().1;

        let expected = 1.0 / 61.0 + 1.0 / 70.0;
        assert!((score_a - expected).abs() < 1e-12);
        assert!((score_a - score_b).abs() < 1e-12, "exact tie");

        // the tie resolves to the lower id first
        let pos_a = fused.iter().position(|(id, _)| *id == 1).unwrap();
        let pos_b = fused.iter().position(|(id, _)| *id == 2).unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn raising_vector_weight_is_monotone() {
        // doc 1 is vector-superior to doc 2
        let vec_ranked = vec![1, 2];
        let fts_ranked = vec![2, 1];

        let relative_rank = |weight_vec: f64| {
            let fused = rrf_fuse(&vec_ranked, &fts_ranked, weight_vec, 1.0);
            let pos_1 = fused.iter().position(|(id, _)| *id == 1).unwrap();
            let pos_2 = fused.iter().position(|(id, _)| *id == 2).unwrap();
            (pos_1 < pos_2) as i32
        };

        let mut best = -1;
        for weight in [0.5, 1.0, 2.0, 4.0, 8.0] {
            let ahead = relative_rank(weight);
            assert!(ahead >= best, "doc 1 may only improve as weight_vec grows");
            best = ahead.max(best);
        }
        assert_eq!(relative_rank(8.0), 1);
    }

    #[test]
    fn single_list_candidates_still_rank() {
        let fused = rrf_fuse(&[7], &[], 1.0, 1.0);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
    }
}
