//! Semantic Markdown splitter.
//!
//! Splits at headings H1–H6 while keeping code fences, tables, and lists as
//! atomic blocks. Every chunk carries its heading ancestry as the section
//! path; heading lines themselves become structural chunks so the optimizer
//! can glue them to the following body text.

use crate::models::{ChunkTypes, ContentChunk, SectionMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Paragraph,
    Code,
    Table,
    List,
}

struct Splitter {
    chunks: Vec<ContentChunk>,
    /// Heading ancestry, root first: (level, title).
    stack: Vec<(u8, String)>,
    block: Vec<String>,
    block_kind: BlockKind,
}

impl Splitter {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            stack: Vec::new(),
            block: Vec::new(),
            block_kind: BlockKind::Paragraph,
        }
    }

    fn current_level(&self) -> u8 {
        self.stack.last().map(|(level, _)| *level).unwrap_or(0)
    }

    fn current_path(&self) -> Vec<String> {
        self.stack.iter().map(|(_, title)| title.clone()).collect()
    }

    fn flush_block(&mut self) {
        if self.block.is_empty() {
            return;
        }
        let body = self.block.join("\n").trim_end().to_string();
        self.block.clear();
        if body.trim().is_empty() {
            return;
        }

        let types = match self.block_kind {
            BlockKind::Paragraph => ChunkTypes::CONTENT,
            BlockKind::Code => ChunkTypes::CONTENT | ChunkTypes::CODE,
            BlockKind::Table => ChunkTypes::CONTENT | ChunkTypes::TABLE,
            BlockKind::List => ChunkTypes::CONTENT | ChunkTypes::LIST,
        };
        self.chunks.push(ContentChunk {
            body,
            meta: SectionMeta::new(self.current_level(), self.current_path(), types),
        });
        self.block_kind = BlockKind::Paragraph;
    }

    fn open_heading(&mut self, level: u8, title: String, line: &str) {
        self.flush_block();
        while self
            .stack
            .last()
            .is_some_and(|(existing, _)| *existing >= level)
        {
            self.stack.pop();
        }
        self.stack.push((level, title));

        self.chunks.push(ContentChunk {
            body: line.to_string(),
            meta: SectionMeta::new(
                level,
                self.current_path(),
                ChunkTypes::STRUCTURAL | ChunkTypes::HEADING,
            ),
        });
    }

    fn push_line(&mut self, kind: BlockKind, line: &str) {
        if self.block_kind != kind && !self.block.is_empty() {
            self.flush_block();
        }
        self.block_kind = kind;
        self.block.push(line.to_string());
    }
}

fn heading_of(line: &str) -> Option<(u8, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    (!title.is_empty()).then_some((hashes as u8, title))
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_list_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| trimmed.strip_prefix("+ "))
    {
        return !rest.is_empty();
    }
    let digits = trimmed.bytes().take_while(|b| b.is_ascii_digit()).count();
    digits > 0 && trimmed[digits..].starts_with(". ")
}

pub fn split(body: &str) -> Vec<ContentChunk> {
    let mut splitter = Splitter::new();
    let mut in_fence = false;
    let mut fence_marker = "```";

    for line in body.lines() {
        let trimmed = line.trim_start();

        if in_fence {
            splitter.push_line(BlockKind::Code, line);
            if trimmed.starts_with(fence_marker) {
                in_fence = false;
                splitter.flush_block();
            }
            continue;
        }

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            fence_marker = if trimmed.starts_with("~~~") { "~~~" } else { "```" };
            in_fence = true;
            splitter.flush_block();
            splitter.push_line(BlockKind::Code, line);
            continue;
        }

        if let Some((level, title)) = heading_of(line) {
            splitter.open_heading(level, title, line.trim());
            continue;
        }

        if line.trim().is_empty() {
            splitter.flush_block();
            continue;
        }

        if is_table_line(line) {
            splitter.push_line(BlockKind::Table, line);
        } else if is_list_line(line) {
            splitter.push_line(BlockKind::List, line);
        } else if splitter.block_kind == BlockKind::List && line.starts_with(' ') {
            // indented continuation stays with its list
            splitter.push_line(BlockKind::List, line);
        } else {
            splitter.push_line(BlockKind::Paragraph, line);
        }
    }

    // unterminated fences are emitted as-is
    splitter.flush_block();
    splitter.chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_ancestry_becomes_path() {
        let body = "# Guide\n\nintro text\n\n## Install\n\nsteps here\n\n## Usage\n\nrun it\n\n# Reference\n\napi list";
        let chunks = split(body);

        let intro = chunks.iter().find(|c| c.body == "intro text").unwrap();
        assert_eq!(intro.meta.path, vec!["Guide"]);
        assert_eq!(intro.meta.level, 1);

        let steps = chunks.iter().find(|c| c.body == "steps here").unwrap();
        assert_eq!(steps.meta.path, vec!["Guide", "Install"]);
        assert_eq!(steps.meta.level, 2);

        let usage = chunks.iter().find(|c| c.body == "run it").unwrap();
        assert_eq!(usage.meta.path, vec!["Guide", "Usage"]);

        // sibling H1 resets the stack
        let api = chunks.iter().find(|c| c.body == "api list").unwrap();
        assert_eq!(api.meta.path, vec!["Reference"]);
    }

    #[test]
    fn heading_chunks_are_structural() {
        let chunks = split("# Guide\n\nbody");
        assert_eq!(chunks[0].body, "# Guide");
        assert!(chunks[0].meta.types.contains(ChunkTypes::HEADING));
        assert!(chunks[0].meta.types.is_structural_only());
        assert!(chunks[1].meta.types.contains(ChunkTypes::CONTENT));
    }

    #[test]
    fn code_fences_stay_atomic() {
        let body = "# T\n\n```rust\nfn a() {}\n\nfn b() {}\n```\n\nafter";
        let chunks = split(body);
        let code = chunks
            .iter()
            .find(|c| c.meta.types.contains(ChunkTypes::CODE))
            .unwrap();
        assert!(code.body.contains("fn a() {}"));
        assert!(code.body.contains("fn b() {}"));
        assert!(code.body.starts_with("```rust"));
        assert!(code.body.ends_with("```"));
    }

    #[test]
    fn tables_and_lists_tagged() {
        let body = "| a | b |\n| - | - |\n| 1 | 2 |\n\n- one\n- two\n  continued";
        let chunks = split(body);
        assert!(chunks[0].meta.types.contains(ChunkTypes::TABLE));
        assert_eq!(chunks[0].body.lines().count(), 3);
        assert!(chunks[1].meta.types.contains(ChunkTypes::LIST));
        assert!(chunks[1].body.contains("continued"));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(split("").is_empty());
        assert!(split("\n\n\n").is_empty());
    }
}
