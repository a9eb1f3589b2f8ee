//! Markdown pipeline stages: front-matter extraction and link discovery.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use super::{Flow, Middleware, PipelineContext};

/// Strips a leading YAML front-matter block and captures its `title:` field.
pub struct FrontMatter;

#[async_trait]
impl Middleware for FrontMatter {
    fn name(&self) -> &'static str {
        "front-matter"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        if let Some((title, rest)) = split_front_matter(&ctx.text) {
            if ctx.title.is_none() {
                ctx.title = title;
            }
            ctx.text = rest;
        }
        if ctx.title.is_none() {
            ctx.title = first_heading(&ctx.text);
        }
        Ok(Flow::Continue)
    }
}

/// Returns `(title, remaining_text)` when the document starts with a
/// `---` fenced front-matter block.
fn split_front_matter(text: &str) -> Option<(Option<String>, String)> {
    let rest = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n"))?;
    let end = rest.find("\n---").map(|i| {
        let after = &rest[i + 4..];
        (i, after.strip_prefix('\n').or_else(|| after.strip_prefix("\r\n")).unwrap_or(after))
    })?;
    let (block_len, remaining) = end;
    let block = &rest[..block_len];

    let title = block.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "title" {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    });

    Some((title, remaining.to_string()))
}

fn first_heading(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let trimmed = line.trim_start();
        let stripped = trimmed.strip_prefix('#')?;
        let title = stripped.trim_start_matches('#').trim();
        (!title.is_empty()).then(|| title.to_string())
    })
}

/// Resolves inline Markdown link targets against the page URL and feeds
/// them to the crawler.
pub struct MarkdownLinkDiscovery;

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]\(([^()\s]+)\)").expect("static regex"))
}

#[async_trait]
impl Middleware for MarkdownLinkDiscovery {
    fn name(&self) -> &'static str {
        "markdown-links"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        ctx.links = discover_links(&ctx.text, &ctx.source);
        Ok(Flow::Continue)
    }
}

fn discover_links(text: &str, base: &Url) -> Vec<Url> {
    let mut links = Vec::new();
    for capture in link_regex().captures_iter(text) {
        let target = capture[1].trim();
        if target.starts_with('#') {
            continue;
        }
        let lowered = target.to_ascii_lowercase();
        if lowered.starts_with("javascript:") || lowered.starts_with("mailto:") {
            continue;
        }
        if let Ok(mut url) = base.join(target) {
            if matches!(url.scheme(), "http" | "https" | "file") {
                url.set_fragment(None);
                links.push(url);
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn front_matter_title_and_strip() {
        let text = "---\ntitle: \"Install Guide\"\nauthor: docs\n---\n# Heading\n\nbody";
        let (title, rest) = split_front_matter(text).unwrap();
        assert_eq!(title.as_deref(), Some("Install Guide"));
        assert!(rest.starts_with("# Heading"));
    }

    #[test]
    fn missing_front_matter_leaves_text() {
        assert!(split_front_matter("# Just a doc\n").is_none());
    }

    #[test]
    fn heading_fallback() {
        assert_eq!(first_heading("## Deep Title\nbody").as_deref(), Some("Deep Title"));
        assert_eq!(first_heading("no headings here"), None);
    }

    #[test]
    fn links_discovered_and_resolved() {
        let base = Url::parse("https://docs.example.com/guide/").unwrap();
        let text = "See [api](../api.md) and [ext](https://other.net/x) but not [frag](#here).";
        let links = discover_links(text, &base);
        let as_strings: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            as_strings,
            vec![
                "https://docs.example.com/api.md".to_string(),
                "https://other.net/x".to_string(),
            ]
        );
    }
}
