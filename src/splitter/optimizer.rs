//! Phase-2 greedy size optimizer.
//!
//! Merges adjacent semantic chunks toward `preferredChunkSize` under three
//! constraints, in priority order:
//!
//! 1. a merge may never push the body past `maxChunkSize`;
//! 2. a chunk opening a major section (level 1–2) outside the current
//!    chunk's section forces a split once the accumulator has reached
//!    `minChunkSize`;
//! 3. below `minChunkSize` the accumulator merges unconditionally (subject
//!    to rule 1).
//!
//! When two chunks merge, their section metadata fuses: level becomes the
//! minimum, the path becomes the longest common prefix (or the descendant
//! path when one contains the other), and the type sets union. The newline
//! separator inserted between bodies counts toward the ceiling check.

use crate::config::SplitterConfig;
use crate::models::{ContentChunk, SectionMeta};

pub fn optimize(chunks: Vec<ContentChunk>, config: &SplitterConfig) -> Vec<ContentChunk> {
    let mut out: Vec<ContentChunk> = Vec::with_capacity(chunks.len());
    let mut acc: Option<ContentChunk> = None;

    for next in chunks {
        let Some(current) = acc.take() else {
            acc = Some(next);
            continue;
        };

        let separator = usize::from(!current.body.ends_with('\n'));
        let merged_size = current.size() + separator + next.size();

        let over_ceiling = merged_size > config.max_chunk_size;
        let major_boundary = starts_major_section(&next.meta)
            && !current.meta.same_section(&next.meta)
            && current.size() >= config.min_chunk_size;
        let wants_more = current.size() < config.min_chunk_size;
        let fits_target = merged_size <= config.preferred_chunk_size;

        if !over_ceiling && !major_boundary && (wants_more || fits_target) {
            acc = Some(merge(current, next, separator == 1));
        } else {
            out.push(current);
            acc = Some(next);
        }
    }

    if let Some(current) = acc {
        out.push(current);
    }
    out
}

/// A chunk "starts a major section" when it sits at heading level 1 or 2.
fn starts_major_section(meta: &SectionMeta) -> bool {
    meta.level > 0 && meta.level <= 2
}

fn merge(left: ContentChunk, right: ContentChunk, with_separator: bool) -> ContentChunk {
    let mut body = left.body;
    if with_separator {
        body.push('\n');
    }
    body.push_str(&right.body);

    ContentChunk {
        body,
        meta: fuse_meta(&left.meta, &right.meta),
    }
}

fn fuse_meta(left: &SectionMeta, right: &SectionMeta) -> SectionMeta {
    let level = match (left.level, right.level) {
        (0, r) => r,
        (l, 0) => l,
        (l, r) => l.min(r),
    };

    let path = if is_prefix(&left.path, &right.path) {
        right.path.clone()
    } else if is_prefix(&right.path, &left.path) {
        left.path.clone()
    } else {
        common_prefix(&left.path, &right.path)
    };

    SectionMeta::new(level, path, left.types.union(right.types))
}

fn is_prefix(shorter: &[String], longer: &[String]) -> bool {
    shorter.len() <= longer.len() && longer[..shorter.len()] == *shorter
}

fn common_prefix(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.clone())
        .collect()
}
