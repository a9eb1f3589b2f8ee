//! Fallback text splitter: blank-line separated paragraphs with a shallow
//! (empty) path.

use crate::models::{ChunkTypes, ContentChunk, SectionMeta};

pub fn split(body: &str) -> Vec<ContentChunk> {
    body.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| ContentChunk {
            body: paragraph.to_string(),
            meta: SectionMeta::new(0, Vec::new(), ChunkTypes::CONTENT),
        })
        .collect()
}
