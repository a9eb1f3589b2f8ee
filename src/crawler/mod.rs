//! Scraper strategies and their shared plumbing.
//!
//! A [`ScrapeStrategy`] answers two questions: *can you handle this input?*
//! and *which URLs should be processed, and how?* It owns no threading; the
//! [`executor::BfsExecutor`] drives it. Strategies are registered in order
//! and the first match wins: web, local files, npm, PyPI, git hosting.

pub mod executor;
pub mod git;
pub mod local;
pub mod packages;
pub mod web;

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::cancel::CancelToken;
use crate::config::SplitterConfig;
use crate::error::FetchError;
use crate::fetcher::{FetchOptions, FetcherSet};
use crate::models::{QueueItem, ScrapeResult};
use crate::pipeline::{category_for, pipeline_for, PipelineContext, PipelineOptions, RenderMode};
use crate::splitter;

/// Which URLs count as inside the crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMode {
    /// URL must live under the input URL's directory (default).
    #[default]
    Subpages,
    /// Same host.
    Hostname,
    /// Same registrable domain.
    Domain,
    /// No restriction.
    Any,
}

impl ScopeMode {
    pub fn in_scope(&self, root: &Url, candidate: &Url) -> bool {
        match self {
            ScopeMode::Any => true,
            ScopeMode::Hostname => host_of(candidate) == host_of(root),
            ScopeMode::Domain => {
                registrable_domain(&host_of(candidate)) == registrable_domain(&host_of(root))
            }
            ScopeMode::Subpages => {
                host_of(candidate) == host_of(root)
                    && candidate.path().starts_with(&parent_directory(root.path()))
            }
        }
    }
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or("").to_ascii_lowercase()
}

/// Last two labels of the host. A public-suffix list would be more precise;
/// documentation hosts are overwhelmingly two-label domains.
fn registrable_domain(host: &str) -> String {
    let labels: Vec<&str> = host.rsplit('.').take(2).collect();
    labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

/// `/docs/guide` → `/docs/`; `/docs/` stays `/docs/`.
pub(crate) fn parent_directory(path: &str) -> String {
    match path.rfind('/') {
        Some(index) => path[..=index].to_string(),
        None => "/".to_string(),
    }
}

/// One include/exclude pattern: glob by default, regex behind a `regex:`
/// prefix.
#[derive(Debug, Clone)]
pub enum Pattern {
    Glob(GlobMatcher),
    Regex(Regex),
}

impl Pattern {
    pub fn compile(raw: &str) -> Result<Self> {
        if let Some(expr) = raw.strip_prefix("regex:") {
            Ok(Pattern::Regex(Regex::new(expr)?))
        } else {
            Ok(Pattern::Glob(Glob::new(raw)?.compile_matcher()))
        }
    }

    fn matches(&self, url: &Url) -> bool {
        match self {
            Pattern::Glob(glob) => glob.is_match(url.path()) || glob.is_match(url.as_str()),
            Pattern::Regex(regex) => regex.is_match(url.as_str()),
        }
    }
}

/// Composite URL admission test: scope ∧ includes ∧ ¬excludes. The user's
/// patterns replace the defaults entirely when provided. `llms.txt` files
/// are never indexed, regardless of patterns.
#[derive(Debug, Clone)]
pub struct UrlFilter {
    root: Url,
    scope: ScopeMode,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const DEFAULT_EXCLUDES: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.ico", "*.css", "*.woff", "*.woff2",
    "*.ttf", "*.mp4", "*.webm", "*.pdf",
];

impl UrlFilter {
    pub fn new(
        root: Url,
        scope: ScopeMode,
        include_patterns: &[String],
        exclude_patterns: &[String],
    ) -> Result<Self> {
        let include = include_patterns
            .iter()
            .map(|p| Pattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let exclude = if exclude_patterns.is_empty() {
            DEFAULT_EXCLUDES
                .iter()
                .map(|p| Pattern::compile(p))
                .collect::<Result<Vec<_>>>()?
        } else {
            exclude_patterns
                .iter()
                .map(|p| Pattern::compile(p))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            root,
            scope,
            include,
            exclude,
        })
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Re-root the filter, e.g. after a package registry resolved its
    /// documentation entry point.
    pub fn rebase(&mut self, root: Url) {
        self.root = root;
    }

    pub fn allows(&self, url: &Url) -> bool {
        if url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .is_some_and(|name| name.eq_ignore_ascii_case("llms.txt"))
        {
            return false;
        }
        if !self.scope.in_scope(&self.root, url) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(url)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(url))
    }
}

/// Canonical form for the per-job visited set: fragment stripped, host
/// lowercased, trailing slash normalized away (except the bare root).
pub fn canonical_url(url: &Url) -> String {
    let mut clone = url.clone();
    clone.set_fragment(None);
    let mut raw = clone.to_string();
    if raw.ends_with('/') && clone.path() != "/" {
        raw.pop();
    }
    raw
}

/// The effective options for one scrape, persisted as the version's
/// `scraper_options` snapshot so a refresh re-runs with identical settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapeOptions {
    pub url: String,
    pub library: String,
    pub version: String,
    pub scope: ScopeMode,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub render_mode: RenderMode,
    /// Overrides of `scraper.*` config for this job.
    pub max_pages: Option<u64>,
    pub max_depth: Option<u32>,
    pub max_concurrency: Option<usize>,
    /// When false, the first fatal page error terminates the job.
    pub ignore_errors: bool,
}

impl ScrapeOptions {
    pub fn new(url: &str, library: &str, version: &str) -> Self {
        Self {
            url: url.to_string(),
            library: library.to_string(),
            version: version.to_string(),
            ignore_errors: true,
            ..Self::default()
        }
    }
}

/// Per-job state shared between the executor and the active strategy.
pub struct JobContext {
    pub options: ScrapeOptions,
    pub filter: UrlFilter,
    pub cancel: CancelToken,
    pub is_refresh: bool,
    /// Refresh mode: the stored pages pre-populating the queue.
    pub refresh_seeds: Vec<QueueItem>,
    pub splitter: SplitterConfig,
    pub pipeline: PipelineOptions,
}

impl JobContext {
    pub fn fetch_options(&self, item: &QueueItem) -> FetchOptions {
        FetchOptions {
            if_none_match: item.etag.clone(),
            if_modified_since: item.last_modified.clone(),
            extra_headers: Vec::new(),
            cancel: self.cancel.clone(),
        }
    }
}

/// What processing one queue item produced.
#[derive(Debug)]
pub enum PageOutcome {
    Processed(Box<ScrapeResult>),
    /// Conditional fetch hit; only timestamps change.
    NotModified,
    /// The page is out of scope or otherwise skipped; not an error.
    Skipped(String),
}

#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, url: &Url) -> bool;

    /// Produce the initial queue. May re-root `job.filter` when the real
    /// entry point differs from the input URL (package registries, git
    /// hosts).
    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>>;

    /// Fetch and process a single queue item.
    async fn process(&self, job: &JobContext, item: &QueueItem)
        -> Result<PageOutcome, FetchError>;
}

/// Ordered strategy registry; the first strategy claiming a URL wins.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ScrapeStrategy>>,
}

impl StrategyRegistry {
    pub fn new(strategies: Vec<Arc<dyn ScrapeStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn for_url(&self, url: &Url) -> Option<Arc<dyn ScrapeStrategy>> {
        self.strategies.iter().find(|s| s.can_handle(url)).cloned()
    }
}

/// Fetch one item and run it through pipeline + splitter. Shared by every
/// strategy; only discovery differs between them.
pub async fn fetch_and_process(
    fetchers: &FetcherSet,
    renderer: Option<Arc<dyn crate::fetcher::render::DynamicRenderer>>,
    job: &JobContext,
    item: &QueueItem,
) -> Result<PageOutcome, FetchError> {
    let fetched = fetchers.fetch(&item.url, &job.fetch_options(item)).await?;
    if fetched.is_not_modified() {
        return Ok(PageOutcome::NotModified);
    }

    // Scope is re-evaluated against wherever the redirects landed.
    if fetched.final_url != item.url && !job.filter.allows(&fetched.final_url) {
        return Ok(PageOutcome::Skipped(format!(
            "redirected out of scope: {}",
            fetched.final_url
        )));
    }

    process_fetched(&item.url, &fetched, renderer, job).await
}

/// Pipeline + splitter for already-fetched bytes.
pub async fn process_fetched(
    url: &Url,
    fetched: &crate::fetcher::Fetched,
    renderer: Option<Arc<dyn crate::fetcher::render::DynamicRenderer>>,
    job: &JobContext,
) -> Result<PageOutcome, FetchError> {
    let mut ctx = PipelineContext::new(url.clone(), fetched, job.pipeline.clone());
    let category = category_for(&ctx.content_type);

    let pipeline = pipeline_for(category, renderer);
    pipeline
        .process(&mut ctx)
        .await
        .map_err(|err| FetchError::Permanent {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

    // The pipeline may rewrite the content type (HTML → Markdown, invalid
    // JSON → plain text); the splitter follows the rewritten type.
    let split_category = category_for(&ctx.content_type);
    let chunks = splitter::split(split_category, &ctx.text, ctx.language.as_deref(), &job.splitter);

    Ok(PageOutcome::Processed(Box::new(ScrapeResult {
        url: url.to_string(),
        final_url: fetched.final_url.to_string(),
        title: ctx.title,
        content_type: ctx.content_type,
        etag: fetched.etag.clone(),
        last_modified: fetched.last_modified.clone(),
        chunks,
        links: ctx.links,
        errors: ctx.errors,
    })))
}
