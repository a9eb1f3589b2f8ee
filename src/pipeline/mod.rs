//! Content-processing pipelines.
//!
//! A pipeline is an ordered chain of [`Middleware`]s sharing one mutable
//! [`PipelineContext`]. Each middleware runs in order and may short-circuit
//! the rest of the chain. Pipelines are selected per content type: HTML gets
//! the full render/sanitize/convert treatment, Markdown and JSON much less,
//! everything else passes through as plain text.
//!
//! Responses negotiated as `text/markdown` or `text/plain` bypass the HTML
//! stages entirely.

pub mod code;
pub mod html;
pub mod json;
pub mod markdown;

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::Fetched;

/// Whether the HTML pipeline should run content through a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Never render; static HTML only.
    #[default]
    Never,
    /// Render when a driver is available and the content looks like HTML.
    Auto,
    /// Always render; fail the page when no driver is configured.
    Force,
}

/// Options threaded through every middleware.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub render_mode: RenderMode,
    /// Wait and abort policy handed to the browser driver.
    pub render_policy: crate::fetcher::render::RenderPolicy,
    /// CSS selectors removed during sanitization.
    pub strip_selectors: Vec<String>,
    /// Sanitization is reverted when it would drop more than this fraction
    /// of the page's text.
    pub max_strip_fraction: f64,
    /// Aborts long-running stages (rendering) on job cancellation.
    pub cancel: crate::cancel::CancelToken,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            render_mode: RenderMode::Never,
            render_policy: crate::fetcher::render::RenderPolicy::new(
                std::time::Duration::from_secs(2),
                std::time::Duration::from_secs(60),
            ),
            strip_selectors: default_strip_selectors(),
            max_strip_fraction: 0.6,
            cancel: crate::cancel::CancelToken::new(),
        }
    }
}

fn default_strip_selectors() -> Vec<String> {
    [
        "nav",
        "footer",
        "aside",
        "script",
        "style",
        "noscript",
        "header[role=banner]",
        "[role=navigation]",
        "[aria-hidden=true]",
        ".sidebar",
        ".advertisement",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Mutable state owned by the pipeline runner and passed to each stage by
/// exclusive reference.
#[derive(Debug)]
pub struct PipelineContext {
    pub source: Url,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Decoded and progressively transformed textual form.
    pub text: String,
    pub lossy_decoded: bool,
    pub title: Option<String>,
    /// Source language for code content.
    pub language: Option<String>,
    /// Absolute URLs discovered on the page.
    pub links: Vec<Url>,
    /// Non-fatal per-page processing errors.
    pub errors: Vec<String>,
    pub options: PipelineOptions,
}

impl PipelineContext {
    pub fn new(source: Url, fetched: &Fetched, options: PipelineOptions) -> Self {
        let decoded = String::from_utf8_lossy(&fetched.bytes);
        let lossy_decoded = matches!(decoded, std::borrow::Cow::Owned(_));
        Self {
            source,
            content_type: fetched.content_type.clone(),
            bytes: fetched.bytes.clone(),
            text: decoded.into_owned(),
            lossy_decoded,
            title: None,
            language: None,
            links: Vec::new(),
            errors: Vec::new(),
            options,
        }
    }
}

/// Outcome of one middleware stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip the remaining stages.
    Stop,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut PipelineContext) -> anyhow::Result<Flow>;
}

/// An ordered middleware chain for one content category.
pub struct Pipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub async fn process(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        for stage in &self.stages {
            tracing::trace!(stage = stage.name(), url = %ctx.source, "pipeline stage");
            match stage.run(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => {
                    ctx.errors.push(format!("{}: {}", stage.name(), err));
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Coarse content categories driving pipeline and splitter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Html,
    Markdown,
    Json,
    SourceCode,
    Text,
}

pub fn category_for(content_type: &str) -> ContentCategory {
    let main = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match main.as_str() {
        "text/html" | "application/xhtml+xml" => ContentCategory::Html,
        "text/markdown" | "text/x-markdown" => ContentCategory::Markdown,
        "application/json" => ContentCategory::Json,
        _ if main.ends_with("+json") => ContentCategory::Json,
        _ if main.starts_with("text/x-") => ContentCategory::SourceCode,
        _ => ContentCategory::Text,
    }
}

/// Build the middleware chain for a category.
pub fn pipeline_for(
    category: ContentCategory,
    renderer: Option<Arc<dyn DynamicRenderer>>,
) -> Pipeline {
    match category {
        ContentCategory::Html => Pipeline::new(vec![
            Box::new(html::DynamicRender::new(renderer)),
            Box::new(html::HtmlMetadata),
            Box::new(html::HtmlLinkDiscovery),
            Box::new(html::HtmlSanitize),
            Box::new(html::HtmlToMarkdown),
        ]),
        ContentCategory::Markdown => Pipeline::new(vec![
            Box::new(markdown::FrontMatter),
            Box::new(markdown::MarkdownLinkDiscovery),
        ]),
        ContentCategory::Json => Pipeline::new(vec![Box::new(json::JsonValidate)]),
        ContentCategory::SourceCode => Pipeline::new(vec![Box::new(code::DetectLanguage)]),
        ContentCategory::Text => Pipeline::new(Vec::new()),
    }
}
