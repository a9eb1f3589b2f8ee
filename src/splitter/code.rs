//! Source-code splitter.
//!
//! Boundary detection over declaration keywords: each top-level
//! function/class/module becomes a chunk whose path is the symbol name,
//! with the scaffolding between bodies (imports, attributes, file-level
//! comments) emitted as structural chunks.

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{ChunkTypes, ContentChunk, SectionMeta};

fn boundary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+|unsafe\s+|extern\s+|export\s+|default\s+|static\s+)*(fn|struct|enum|trait|impl|mod|class|def|function|interface|module)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("static regex")
    })
}

/// Returns the declared symbol when the line opens a top-level unit.
fn boundary_symbol(line: &str) -> Option<String> {
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    boundary_regex()
        .captures(line)
        .map(|caps| caps[2].to_string())
}

pub fn split(body: &str, language: Option<&str>) -> Vec<ContentChunk> {
    let mut chunks = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut symbol: Option<String> = None;

    let flush = |chunks: &mut Vec<ContentChunk>, buffer: &mut Vec<&str>, symbol: &Option<String>| {
        if buffer.is_empty() {
            return;
        }
        let body = buffer.join("\n").trim_end().to_string();
        buffer.clear();
        if body.trim().is_empty() {
            return;
        }
        let (path, types, level) = match symbol {
            Some(name) => (
                vec![name.clone()],
                ChunkTypes::CONTENT | ChunkTypes::CODE,
                1,
            ),
            None => (Vec::new(), ChunkTypes::STRUCTURAL, 0),
        };
        chunks.push(ContentChunk {
            body,
            meta: SectionMeta::new(level, path, types),
        });
    };

    for line in body.lines() {
        if let Some(name) = boundary_symbol(line) {
            flush(&mut chunks, &mut buffer, &symbol);
            symbol = Some(name);
        }
        buffer.push(line);
    }
    flush(&mut chunks, &mut buffer, &symbol);

    if chunks.is_empty() && !body.trim().is_empty() {
        // no recognisable boundaries (minified or exotic source)
        chunks.push(ContentChunk {
            body: body.trim_end().to_string(),
            meta: SectionMeta::new(0, Vec::new(), ChunkTypes::CONTENT | ChunkTypes::CODE),
        });
    }

    tracing::trace!(
        language = language.unwrap_or("unknown"),
        units = chunks.len(),
        "split source file"
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_functions_split_with_symbol_paths() {
        let src = "use std::fmt;\n\npub fn alpha() {\n    body();\n}\n\nfn beta() {}\n";
        let chunks = split(src, Some("rust"));

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].meta.types.is_structural_only());
        assert!(chunks[0].body.contains("use std::fmt"));
        assert_eq!(chunks[1].meta.path, vec!["alpha"]);
        assert!(chunks[1].body.contains("body();"));
        assert_eq!(chunks[2].meta.path, vec!["beta"]);
    }

    #[test]
    fn python_defs_and_classes() {
        let src = "import os\n\nclass Indexer:\n    def run(self):\n        pass\n\ndef main():\n    pass\n";
        let chunks = split(src, Some("python"));
        let paths: Vec<&[String]> = chunks.iter().map(|c| c.meta.path.as_slice()).collect();
        assert!(paths.contains(&&["Indexer".to_string()][..]));
        assert!(paths.contains(&&["main".to_string()][..]));
        // indented def stays inside its class chunk
        let class_chunk = chunks.iter().find(|c| c.meta.path == ["Indexer"]).unwrap();
        assert!(class_chunk.body.contains("def run"));
    }

    #[test]
    fn boundary_less_source_is_one_chunk() {
        let chunks = split("x = 1; y = 2;", Some("javascript"));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].meta.types.contains(ChunkTypes::CODE));
    }
}
