//! Git hosting strategy (GitHub).
//!
//! Repository inputs are enumerated through the host API: the default
//! branch is resolved once per job, then the recursive tree listing yields
//! raw-content URLs for every blob passing the URL filter. Wiki URLs crawl
//! as ordinary web pages and blob URLs map to their single raw file. An
//! API token (`GITHUB_TOKEN` / `GH_TOKEN`) is read once per process.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use url::Url;

use super::{fetch_and_process, JobContext, PageOutcome, ScrapeStrategy};
use crate::error::FetchError;
use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::{FetchOptions, FetcherSet};
use crate::models::QueueItem;

/// Process-wide token cache; the environment is consulted once.
fn api_token() -> Option<&'static str> {
    static TOKEN: OnceLock<Option<String>> = OnceLock::new();
    TOKEN
        .get_or_init(|| {
            std::env::var("GITHUB_TOKEN")
                .or_else(|_| std::env::var("GH_TOKEN"))
                .ok()
                .filter(|t| !t.is_empty())
        })
        .as_deref()
}

#[derive(Debug, PartialEq, Eq)]
enum RepoInput {
    /// Whole repository: owner, repo.
    Repository(String, String),
    /// A single file: owner, repo, branch, path.
    Blob(String, String, String, String),
    /// The repo wiki; crawled like a web site.
    Wiki,
}

fn parse_input(url: &Url) -> Option<RepoInput> {
    if url.host_str() != Some("github.com") {
        return None;
    }
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect();
    match segments.as_slice() {
        [owner, repo] => Some(RepoInput::Repository(owner.to_string(), repo.to_string())),
        [_, _, "wiki", ..] => Some(RepoInput::Wiki),
        [owner, repo, "blob", branch, path @ ..] if !path.is_empty() => Some(RepoInput::Blob(
            owner.to_string(),
            repo.to_string(),
            branch.to_string(),
            path.join("/"),
        )),
        _ => None,
    }
}

fn raw_url(owner: &str, repo: &str, branch: &str, path: &str) -> Result<Url> {
    Url::parse(&format!(
        "https://raw.githubusercontent.com/{}/{}/{}/{}",
        owner, repo, branch, path
    ))
    .context("building raw content URL")
}

pub struct GitHubStrategy {
    fetchers: FetcherSet,
    renderer: Option<Arc<dyn DynamicRenderer>>,
}

impl GitHubStrategy {
    pub fn new(fetchers: FetcherSet, renderer: Option<Arc<dyn DynamicRenderer>>) -> Self {
        Self { fetchers, renderer }
    }

    fn api_options(&self, job: &JobContext) -> FetchOptions {
        let mut extra_headers = vec![(
            "Accept".to_string(),
            "application/vnd.github+json".to_string(),
        )];
        if let Some(token) = api_token() {
            extra_headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        FetchOptions {
            extra_headers,
            cancel: job.cancel.clone(),
            ..FetchOptions::default()
        }
    }

    async fn api_json(&self, job: &JobContext, url: &Url) -> Result<serde_json::Value> {
        let fetched = self
            .fetchers
            .fetch(url, &self.api_options(job))
            .await
            .with_context(|| format!("GitHub API call {}", url))?;
        serde_json::from_slice(&fetched.bytes)
            .with_context(|| format!("GitHub API returned invalid JSON from {}", url))
    }

    /// Resolved once per job, before any worker starts.
    async fn default_branch(&self, job: &JobContext, owner: &str, repo: &str) -> Result<String> {
        let api = Url::parse(&format!("https://api.github.com/repos/{}/{}", owner, repo))?;
        let manifest = self.api_json(job, &api).await?;
        manifest
            .get("default_branch")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("repository {}/{} reports no default branch", owner, repo))
    }

    async fn tree_seeds(
        &self,
        job: &JobContext,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<QueueItem>> {
        let api = Url::parse(&format!(
            "https://api.github.com/repos/{}/{}/git/trees/{}?recursive=1",
            owner, repo, branch
        ))?;
        let tree = self.api_json(job, &api).await?;
        let Some(entries) = tree.get("tree").and_then(|v| v.as_array()) else {
            bail!("repository {}/{} returned no tree listing", owner, repo);
        };

        let mut seeds = Vec::new();
        for entry in entries {
            if entry.get("type").and_then(|v| v.as_str()) != Some("blob") {
                continue;
            }
            let Some(path) = entry.get("path").and_then(|v| v.as_str()) else {
                continue;
            };
            let url = raw_url(owner, repo, branch, path)?;
            if job.filter.allows(&url) {
                seeds.push(QueueItem::new(url, 0));
            }
        }
        Ok(seeds)
    }
}

#[async_trait]
impl ScrapeStrategy for GitHubStrategy {
    fn name(&self) -> &'static str {
        "github"
    }

    fn can_handle(&self, url: &Url) -> bool {
        matches!(url.host_str(), Some("github.com") | Some("raw.githubusercontent.com"))
    }

    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
        let input = Url::parse(&job.options.url)?;

        if input.host_str() == Some("raw.githubusercontent.com") {
            return Ok(vec![QueueItem::new(input, 0)]);
        }

        match parse_input(&input) {
            Some(RepoInput::Wiki) => Ok(vec![QueueItem::new(input, 0)]),
            Some(RepoInput::Blob(owner, repo, branch, path)) => {
                let url = raw_url(&owner, &repo, &branch, &path)?;
                job.filter.rebase(url.clone());
                Ok(vec![QueueItem::new(url, 0)])
            }
            Some(RepoInput::Repository(owner, repo)) => {
                let branch = self.default_branch(job, &owner, &repo).await?;
                tracing::info!(
                    repo = format!("{}/{}", owner, repo).as_str(),
                    branch = branch.as_str(),
                    "enumerating repository files"
                );
                // raw URLs live on another host, so the scope must follow
                job.filter
                    .rebase(raw_url(&owner, &repo, &branch, "")?);
                self.tree_seeds(job, &owner, &repo, &branch).await
            }
            None => bail!("unsupported GitHub input: {}", input),
        }
    }

    async fn process(
        &self,
        job: &JobContext,
        item: &QueueItem,
    ) -> Result<PageOutcome, FetchError> {
        fetch_and_process(&self.fetchers, self.renderer.clone(), job, item).await
    }
}
