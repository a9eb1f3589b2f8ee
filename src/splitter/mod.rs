//! Two-phase document splitting.
//!
//! Phase 1 picks a semantic splitter by content category and produces
//! fine-grained chunks at natural boundaries (headings, JSON properties,
//! code symbols, paragraphs), each with a hierarchy path. Phase 2
//! ([`optimizer`]) greedily merges adjacent chunks toward
//! `splitter.preferredChunkSize` without crossing major section boundaries
//! or the hard `maxChunkSize` ceiling.

pub mod code;
pub mod json;
pub mod markdown;
pub mod optimizer;
pub mod text;

use crate::config::SplitterConfig;
use crate::models::ContentChunk;
use crate::pipeline::ContentCategory;

/// Run both phases for one document.
pub fn split(
    category: ContentCategory,
    body: &str,
    language: Option<&str>,
    config: &SplitterConfig,
) -> Vec<ContentChunk> {
    let phase1 = match category {
        // HTML reaches the splitter already converted to Markdown.
        ContentCategory::Html | ContentCategory::Markdown => markdown::split(body),
        ContentCategory::Json => json::split(body, config.max_chunk_size),
        ContentCategory::SourceCode => code::split(body, language),
        ContentCategory::Text => text::split(body),
    };
    optimizer::optimize(phase1, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_end_to_end_respects_ceiling() {
        let config = SplitterConfig {
            min_chunk_size: 20,
            preferred_chunk_size: 60,
            max_chunk_size: 200,
        };
        let body = "# Top\n\nfirst paragraph of text\n\nsecond paragraph of text\n\n## Sub\n\nthird paragraph here";
        let chunks = split(ContentCategory::Markdown, body, None, &config);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.size() <= config.max_chunk_size);
        }
    }
}
