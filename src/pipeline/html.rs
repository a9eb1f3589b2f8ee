//! HTML pipeline stages: optional dynamic render, metadata and link
//! extraction, sanitization, and DOM → Markdown conversion.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use url::Url;

use super::{Flow, Middleware, PipelineContext, RenderMode};
use crate::fetcher::render::{DynamicRenderer, EmbeddedCredentials, RenderRequest};

/// Runs the page through the configured browser driver when the render mode
/// asks for it. Without a driver, `Auto` silently skips and `Force` fails
/// the page.
pub struct DynamicRender {
    renderer: Option<Arc<dyn DynamicRenderer>>,
}

impl DynamicRender {
    pub fn new(renderer: Option<Arc<dyn DynamicRenderer>>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl Middleware for DynamicRender {
    fn name(&self) -> &'static str {
        "dynamic-render"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        match (ctx.options.render_mode, &self.renderer) {
            (RenderMode::Never, _) => return Ok(Flow::Continue),
            (RenderMode::Auto, None) => return Ok(Flow::Continue),
            (RenderMode::Force, None) => {
                anyhow::bail!("dynamic rendering requested but no browser driver is configured")
            }
            (_, Some(renderer)) => {
                let request = RenderRequest {
                    url: ctx.source.clone(),
                    policy: ctx.options.render_policy.clone(),
                    credentials: EmbeddedCredentials::from_url(&ctx.source),
                    extra_headers: Vec::new(),
                    cancel: ctx.options.cancel.clone(),
                };
                let rendered = renderer.render(request).await?;
                ctx.text = rendered.html;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Title from `<title>`, falling back to the first `<h1>`.
pub struct HtmlMetadata;

#[async_trait]
impl Middleware for HtmlMetadata {
    fn name(&self) -> &'static str {
        "html-metadata"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        let document = Html::parse_document(&ctx.text);
        ctx.title = extract_title(&document);
        Ok(Flow::Continue)
    }
}

fn extract_title(document: &Html) -> Option<String> {
    let title_sel = Selector::parse("title").ok()?;
    let h1_sel = Selector::parse("h1").ok()?;
    document
        .select(&title_sel)
        .next()
        .or_else(|| document.select(&h1_sel).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

/// Collects every `<a href>` over the full DOM as an absolute URL.
/// Anchors, `javascript:`, and `mailto:` links are dropped.
pub struct HtmlLinkDiscovery;

#[async_trait]
impl Middleware for HtmlLinkDiscovery {
    fn name(&self) -> &'static str {
        "html-links"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        let document = Html::parse_document(&ctx.text);
        ctx.links = discover_links(&document, &ctx.source);
        Ok(Flow::Continue)
    }
}

fn discover_links(document: &Html, base: &Url) -> Vec<Url> {
    let selector = match Selector::parse("a[href]") {
        Ok(sel) => sel,
        Err(_) => return Vec::new(),
    };

    let mut links = Vec::new();
    for el in document.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if let Some(url) = resolve_link(base, href) {
            links.push(url);
        }
    }
    links
}

/// Resolve an href to an absolute URL, dropping non-navigable schemes and
/// pure fragments.
fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let trimmed = href.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("javascript:") || lowered.starts_with("mailto:") {
        return None;
    }
    let mut url = base.join(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https" | "file") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// Removes navigation, ads, and script/style subtrees by configured
/// selectors. The removal is reverted when it would drop more than the
/// allowed fraction of the page's text.
pub struct HtmlSanitize;

#[async_trait]
impl Middleware for HtmlSanitize {
    fn name(&self) -> &'static str {
        "html-sanitize"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        let mut document = Html::parse_document(&ctx.text);
        let before = text_length(&document);

        let mut doomed = Vec::new();
        for raw in &ctx.options.strip_selectors {
            match Selector::parse(raw) {
                Ok(selector) => {
                    doomed.extend(document.select(&selector).map(|el| el.id()));
                }
                Err(_) => {
                    tracing::warn!(selector = raw.as_str(), "ignoring invalid strip selector");
                }
            }
        }
        if doomed.is_empty() {
            return Ok(Flow::Continue);
        }

        for id in doomed {
            if let Some(mut node) = document.tree.get_mut(id) {
                node.detach();
            }
        }

        let after = text_length(&document);
        let dropped = before.saturating_sub(after) as f64;
        if before > 0 && dropped / before as f64 > ctx.options.max_strip_fraction {
            tracing::debug!(url = %ctx.source, "sanitize would drop too much text, reverting");
            return Ok(Flow::Continue);
        }

        ctx.text = document.root_element().html();
        Ok(Flow::Continue)
    }
}

fn text_length(document: &Html) -> usize {
    document
        .root_element()
        .text()
        .map(|t| t.trim().len())
        .sum()
}

/// Converts the (sanitized) DOM into Markdown. Relative link targets are
/// rewritten to absolute here; dropped-scheme links keep their text.
pub struct HtmlToMarkdown;

#[async_trait]
impl Middleware for HtmlToMarkdown {
    fn name(&self) -> &'static str {
        "html-to-markdown"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow> {
        let document = Html::parse_document(&ctx.text);
        ctx.text = convert_to_markdown(&document, &ctx.source);
        ctx.content_type = "text/markdown".to_string();
        Ok(Flow::Continue)
    }
}

pub fn convert_to_markdown(document: &Html, base: &Url) -> String {
    let body_sel = Selector::parse("body").expect("static selector");
    let root = document
        .select(&body_sel)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    for child in root.children() {
        render_block(child, base, 0, &mut out);
    }
    collapse_blank_lines(&out)
}

fn render_block(
    node: ego_tree::NodeRef<'_, scraper::Node>,
    base: &Url,
    list_depth: usize,
    out: &mut String,
) {
    match node.value() {
        scraper::Node::Text(text) => {
            let collapsed = collapse_whitespace(&text);
            if !collapsed.is_empty() {
                out.push_str(&collapsed);
                out.push_str("\n\n");
            }
        }
        scraper::Node::Element(_) => {
            let el = ElementRef::wrap(node).expect("element node");
            let name = el.value().name();
            match name {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = name.as_bytes()[1] - b'0';
                    let text = inline_text(el, base);
                    if !text.is_empty() {
                        for _ in 0..level {
                            out.push('#');
                        }
                        out.push(' ');
                        out.push_str(&text);
                        out.push_str("\n\n");
                    }
                }
                "p" => {
                    let text = inline_text(el, base);
                    if !text.is_empty() {
                        out.push_str(&text);
                        out.push_str("\n\n");
                    }
                }
                "pre" => render_code_block(el, out),
                "ul" | "ol" => {
                    render_list(el, base, list_depth, name == "ol", out);
                    if list_depth == 0 {
                        out.push('\n');
                    }
                }
                "table" => render_table(el, base, out),
                "blockquote" => {
                    let text = inline_text(el, base);
                    for line in text.lines() {
                        out.push_str("> ");
                        out.push_str(line);
                        out.push('\n');
                    }
                    out.push('\n');
                }
                "hr" => out.push_str("---\n\n"),
                "br" => out.push('\n'),
                "script" | "style" | "noscript" | "template" | "iframe" | "img" | "svg" => {}
                "a" | "strong" | "b" | "em" | "i" | "code" | "span" => {
                    let text = inline(el, base);
                    if !collapse_whitespace(&text).is_empty() {
                        out.push_str(text.trim());
                        out.push_str("\n\n");
                    }
                }
                _ => {
                    // generic container: recurse into children as blocks
                    for child in node.children() {
                        render_block(child, base, list_depth, out);
                    }
                }
            }
        }
        _ => {}
    }
}

fn render_code_block(el: ElementRef, out: &mut String) {
    let code_sel = Selector::parse("code").expect("static selector");
    let (language, text) = match el.select(&code_sel).next() {
        Some(code) => (
            code.value()
                .attr("class")
                .and_then(extract_language_class)
                .unwrap_or_default(),
            code.text().collect::<String>(),
        ),
        None => (String::new(), el.text().collect::<String>()),
    };

    out.push_str("```");
    out.push_str(&language);
    out.push('\n');
    out.push_str(text.trim_end_matches('\n'));
    out.push_str("\n```\n\n");
}

fn extract_language_class(class: &str) -> Option<String> {
    class
        .split_whitespace()
        .find_map(|c| c.strip_prefix("language-").or_else(|| c.strip_prefix("lang-")))
        .map(|s| s.to_string())
}

fn render_list(el: ElementRef, base: &Url, depth: usize, ordered: bool, out: &mut String) {
    let mut index = 1usize;
    for child in el.children() {
        let Some(item) = ElementRef::wrap(child) else {
            continue;
        };
        if item.value().name() != "li" {
            continue;
        }

        for _ in 0..depth {
            out.push_str("  ");
        }
        if ordered {
            out.push_str(&format!("{}. ", index));
            index += 1;
        } else {
            out.push_str("- ");
        }

        // item text first, nested lists afterwards
        let mut text = String::new();
        for sub in child.children() {
            if let Some(sub_el) = ElementRef::wrap(sub) {
                if matches!(sub_el.value().name(), "ul" | "ol") {
                    continue;
                }
            }
            inline_node(sub, base, &mut text);
        }
        out.push_str(collapse_whitespace(&text).as_str());
        out.push('\n');

        for sub in child.children() {
            if let Some(sub_el) = ElementRef::wrap(sub) {
                if matches!(sub_el.value().name(), "ul" | "ol") {
                    render_list(sub_el, base, depth + 1, sub_el.value().name() == "ol", out);
                }
            }
        }
    }
}

fn render_table(el: ElementRef, base: &Url, out: &mut String) {
    let row_sel = Selector::parse("tr").expect("static selector");
    let cell_sel = Selector::parse("th, td").expect("static selector");

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in el.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|cell| collapse_whitespace(&inline(cell, base)))
            .collect();
        if !cells.is_empty() {
            rows.push(cells);
        }
    }
    if rows.is_empty() {
        return;
    }

    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    for (i, row) in rows.iter().enumerate() {
        out.push('|');
        for c in 0..width {
            out.push(' ');
            out.push_str(row.get(c).map(String::as_str).unwrap_or(""));
            out.push_str(" |");
        }
        out.push('\n');
        if i == 0 {
            out.push('|');
            for _ in 0..width {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    out.push('\n');
}

/// Inline rendering of an element's children.
fn inline(el: ElementRef, base: &Url) -> String {
    let mut out = String::new();
    for child in el.children() {
        inline_node(child, base, &mut out);
    }
    out
}

fn inline_text(el: ElementRef, base: &Url) -> String {
    collapse_whitespace(&inline(el, base))
}

fn inline_node(node: ego_tree::NodeRef<'_, scraper::Node>, base: &Url, out: &mut String) {
    match node.value() {
        scraper::Node::Text(text) => out.push_str(&text.replace(['\n', '\t'], " ")),
        scraper::Node::Element(_) => {
            let el = ElementRef::wrap(node).expect("element node");
            match el.value().name() {
                "a" => {
                    let text = collapse_whitespace(&inline(el, base));
                    match el.value().attr("href").and_then(|h| resolve_link(base, h)) {
                        Some(url) if !text.is_empty() => {
                            out.push_str(&format!("[{}]({})", text, url));
                        }
                        // anchor/javascript/mailto targets keep their text
                        _ => out.push_str(&text),
                    }
                }
                "strong" | "b" => {
                    let text = inline(el, base);
                    if !text.trim().is_empty() {
                        out.push_str(&format!("**{}**", text.trim()));
                    }
                }
                "em" | "i" => {
                    let text = inline(el, base);
                    if !text.trim().is_empty() {
                        out.push_str(&format!("*{}*", text.trim()));
                    }
                }
                "code" => {
                    let text: String = el.text().collect();
                    if !text.is_empty() {
                        out.push_str(&format!("`{}`", text));
                    }
                }
                "br" => out.push('\n'),
                "script" | "style" | "noscript" | "img" | "svg" => {}
                _ => {
                    for child in node.children() {
                        inline_node(child, base, out);
                    }
                }
            }
        }
        _ => {}
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_blank_lines(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://docs.example.com/guide/intro").unwrap()
    }

    #[test]
    fn title_prefers_title_tag() {
        let doc = Html::parse_document("<html><head><title> My Docs </title></head><body><h1>Other</h1></body></html>");
        assert_eq!(extract_title(&doc).as_deref(), Some("My Docs"));

        let doc = Html::parse_document("<html><body><h1>Fallback  Heading</h1></body></html>");
        assert_eq!(extract_title(&doc).as_deref(), Some("Fallback Heading"));
    }

    #[test]
    fn links_resolved_and_filtered() {
        let doc = Html::parse_document(
            r##"<body>
                <a href="../api">API</a>
                <a href="#section">anchor</a>
                <a href="javascript:void(0)">js</a>
                <a href="mailto:x@example.com">mail</a>
                <a href="https://other.example.net/page?x=1#frag">ext</a>
            </body>"##,
        );
        let links = discover_links(&doc, &base());
        let as_strings: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            as_strings,
            vec![
                "https://docs.example.com/api".to_string(),
                "https://other.example.net/page?x=1".to_string(),
            ]
        );
    }

    #[test]
    fn markdown_conversion_covers_structures() {
        let doc = Html::parse_document(
            r#"<body>
                <h1>Guide</h1>
                <p>Read the <a href="/api">API</a> docs <strong>now</strong>.</p>
                <ul><li>one</li><li>two<ul><li>nested</li></ul></li></ul>
                <pre><code class="language-rust">fn main() {}</code></pre>
                <table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>
            </body>"#,
        );
        let md = convert_to_markdown(&doc, &base());
        assert!(md.starts_with("# Guide"));
        assert!(md.contains("[API](https://docs.example.com/api)"));
        assert!(md.contains("**now**"));
        assert!(md.contains("- one"));
        assert!(md.contains("  - nested"));
        assert!(md.contains("```rust\nfn main() {}\n```"));
        assert!(md.contains("| A | B |"));
        assert!(md.contains("| --- | --- |"));
        assert!(md.contains("| 1 | 2 |"));
    }

    #[test]
    fn anchor_links_keep_text_in_markdown() {
        let doc = Html::parse_document(r##"<body><p>See <a href="#below">below</a>.</p></body>"##);
        let md = convert_to_markdown(&doc, &base());
        assert_eq!(md, "See below.");
    }

    #[tokio::test]
    async fn sanitize_strips_nav_but_reverts_on_heavy_loss() {
        let html = r#"<body><nav>Home About Contact</nav><p>Real content that matters here.</p></body>"#;
        let mut ctx = test_ctx(html);
        HtmlSanitize.run(&mut ctx).await.unwrap();
        assert!(!ctx.text.contains("Home About Contact"));
        assert!(ctx.text.contains("Real content"));

        // a page that is nearly all nav keeps its markup
        let html = r#"<body><nav>The entire page lives inside navigation markup</nav><p>x</p></body>"#;
        let mut ctx = test_ctx(html);
        HtmlSanitize.run(&mut ctx).await.unwrap();
        assert!(ctx.text.contains("entire page"));
    }

    fn test_ctx(html: &str) -> PipelineContext {
        let fetched = crate::fetcher::Fetched {
            bytes: html.as_bytes().to_vec(),
            content_type: "text/html".to_string(),
            etag: None,
            last_modified: None,
            final_url: base(),
            status: 200,
        };
        PipelineContext::new(base(), &fetched, super::super::PipelineOptions::default())
    }
}
