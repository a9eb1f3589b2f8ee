//! JSON splitter.
//!
//! Splits at object/property boundaries, producing paths like
//! `["dependencies", "serde"]` or `["items", "3"]`. Subtrees that fit the
//! size ceiling become a single chunk; larger objects and arrays are opened
//! with a structural chunk and recursed into. Every chunk body is
//! guaranteed to be at most `max_chunk_size` characters.

use serde_json::Value;

use crate::models::{ChunkTypes, ContentChunk, SectionMeta};

pub fn split(body: &str, max_chunk_size: usize) -> Vec<ContentChunk> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        // Validation failed upstream; index as one text chunk.
        return crate::splitter::text::split(body);
    };

    let mut chunks = Vec::new();
    split_value(&value, &[], max_chunk_size, &mut chunks);
    chunks
}

fn split_value(value: &Value, path: &[String], max: usize, out: &mut Vec<ContentChunk>) {
    let rendered = render(value);
    if rendered.chars().count() <= max {
        push_content(out, rendered, path);
        return;
    }

    match value {
        Value::Object(map) => {
            push_structural(out, "{", path);
            for (key, child) in map {
                let child_path = extend(path, key);
                let entry = format!("\"{}\": {}", key, render(child));
                if entry.chars().count() <= max {
                    push_content(out, entry, &child_path);
                } else {
                    split_value(child, &child_path, max, out);
                }
            }
        }
        Value::Array(items) => {
            push_structural(out, "[", path);
            for (index, child) in items.iter().enumerate() {
                let child_path = extend(path, &index.to_string());
                split_value(child, &child_path, max, out);
            }
        }
        // An oversized scalar: hard-split the rendered text.
        _ => {
            for piece in hard_split(&rendered, max) {
                push_content(out, piece, path);
            }
        }
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn extend(path: &[String], segment: &str) -> Vec<String> {
    let mut next = path.to_vec();
    next.push(segment.to_string());
    next
}

fn push_content(out: &mut Vec<ContentChunk>, body: String, path: &[String]) {
    if body.is_empty() {
        return;
    }
    out.push(ContentChunk {
        body,
        meta: SectionMeta::new(depth_level(path), path.to_vec(), ChunkTypes::CONTENT),
    });
}

fn push_structural(out: &mut Vec<ContentChunk>, body: &str, path: &[String]) {
    out.push(ContentChunk {
        body: body.to_string(),
        meta: SectionMeta::new(depth_level(path), path.to_vec(), ChunkTypes::STRUCTURAL),
    });
}

fn depth_level(path: &[String]) -> u8 {
    (path.len() + 1).min(u8::MAX as usize) as u8
}

fn hard_split(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}
