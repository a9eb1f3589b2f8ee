//! Package registry strategies (npm, PyPI).
//!
//! `npm:<package>` and `pypi:<package>` inputs (or registry page URLs) are
//! resolved to the package's canonical documentation entry point via the
//! registry's JSON API; crawling then follows the web strategy rules rooted
//! at the resolved URL.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use super::web::WebStrategy;
use super::{JobContext, PageOutcome, ScrapeStrategy};
use crate::error::FetchError;
use crate::fetcher::{FetchOptions, FetcherSet};
use crate::models::QueueItem;

pub struct NpmStrategy {
    fetchers: FetcherSet,
    web: Arc<WebStrategy>,
}

impl NpmStrategy {
    pub fn new(fetchers: FetcherSet, web: Arc<WebStrategy>) -> Self {
        Self { fetchers, web }
    }

    fn package_name(url: &Url) -> Option<String> {
        match url.scheme() {
            "npm" => Some(url.path().trim_start_matches('/').to_string()),
            "http" | "https" if url.host_str() == Some("www.npmjs.com") => url
                .path()
                .strip_prefix("/package/")
                .map(|name| name.to_string()),
            _ => None,
        }
        .filter(|name| !name.is_empty())
    }

    async fn resolve_entry_point(&self, job: &JobContext, name: &str) -> Result<Url> {
        let api = Url::parse(&format!("https://registry.npmjs.org/{}", name))?;
        let fetched = self
            .fetchers
            .fetch(&api, &FetchOptions::with_cancel(job.cancel.clone()))
            .await
            .with_context(|| format!("npm registry lookup for '{}'", name))?;

        let manifest: serde_json::Value = serde_json::from_slice(&fetched.bytes)
            .with_context(|| format!("npm registry returned invalid JSON for '{}'", name))?;

        let docs = manifest
            .get("homepage")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                manifest
                    .get("repository")
                    .and_then(|r| r.get("url"))
                    .and_then(|v| v.as_str())
                    .map(normalize_repository_url)
            });

        match docs {
            Some(docs) => Url::parse(&docs)
                .with_context(|| format!("npm package '{}' has an unusable docs URL", name)),
            None => bail!("npm package '{}' declares no homepage", name),
        }
    }
}

/// `git+https://github.com/x/y.git` → `https://github.com/x/y`.
fn normalize_repository_url(raw: &str) -> String {
    raw.trim_start_matches("git+")
        .trim_end_matches(".git")
        .replace("git://", "https://")
}

#[async_trait]
impl ScrapeStrategy for NpmStrategy {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn can_handle(&self, url: &Url) -> bool {
        Self::package_name(url).is_some()
    }

    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
        let input = Url::parse(&job.options.url)?;
        let name = Self::package_name(&input)
            .ok_or_else(|| anyhow::anyhow!("not an npm package input: {}", input))?;

        let entry = self.resolve_entry_point(job, &name).await?;
        tracing::info!(package = name.as_str(), entry = %entry, "resolved npm docs entry point");

        job.filter.rebase(entry.clone());
        Ok(vec![QueueItem::new(entry, 0)])
    }

    async fn process(
        &self,
        job: &JobContext,
        item: &QueueItem,
    ) -> Result<PageOutcome, FetchError> {
        self.web.process(job, item).await
    }
}

pub struct PyPiStrategy {
    fetchers: FetcherSet,
    web: Arc<WebStrategy>,
}

impl PyPiStrategy {
    pub fn new(fetchers: FetcherSet, web: Arc<WebStrategy>) -> Self {
        Self { fetchers, web }
    }

    fn package_name(url: &Url) -> Option<String> {
        match url.scheme() {
            "pypi" => Some(url.path().trim_start_matches('/').to_string()),
            "http" | "https" if url.host_str() == Some("pypi.org") => url
                .path()
                .strip_prefix("/project/")
                .map(|rest| rest.trim_end_matches('/').to_string()),
            _ => None,
        }
        .filter(|name| !name.is_empty())
    }

    async fn resolve_entry_point(&self, job: &JobContext, name: &str) -> Result<Url> {
        let api = Url::parse(&format!("https://pypi.org/pypi/{}/json", name))?;
        let fetched = self
            .fetchers
            .fetch(&api, &FetchOptions::with_cancel(job.cancel.clone()))
            .await
            .with_context(|| format!("PyPI lookup for '{}'", name))?;

        let manifest: serde_json::Value = serde_json::from_slice(&fetched.bytes)
            .with_context(|| format!("PyPI returned invalid JSON for '{}'", name))?;
        let info = manifest
            .get("info")
            .ok_or_else(|| anyhow::anyhow!("PyPI response for '{}' lacks info", name))?;

        // documentation link preferred, then project home page
        let docs = info
            .get("project_urls")
            .and_then(|urls| urls.as_object())
            .and_then(|urls| {
                urls.iter()
                    .find(|(key, _)| {
                        let k = key.to_ascii_lowercase();
                        k.contains("doc") || k == "homepage"
                    })
                    .and_then(|(_, v)| v.as_str())
            })
            .or_else(|| info.get("home_page").and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty());

        match docs {
            Some(docs) => Url::parse(docs)
                .with_context(|| format!("PyPI package '{}' has an unusable docs URL", name)),
            None => bail!("PyPI package '{}' declares no documentation URL", name),
        }
    }
}

#[async_trait]
impl ScrapeStrategy for PyPiStrategy {
    fn name(&self) -> &'static str {
        "pypi"
    }

    fn can_handle(&self, url: &Url) -> bool {
        Self::package_name(url).is_some()
    }

    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
        let input = Url::parse(&job.options.url)?;
        let name = Self::package_name(&input)
            .ok_or_else(|| anyhow::anyhow!("not a PyPI package input: {}", input))?;

        let entry = self.resolve_entry_point(job, &name).await?;
        tracing::info!(package = name.as_str(), entry = %entry, "resolved PyPI docs entry point");

        job.filter.rebase(entry.clone());
        Ok(vec![QueueItem::new(entry, 0)])
    }

    async fn process(
        &self,
        job: &JobContext,
        item: &QueueItem,
    ) -> Result<PageOutcome, FetchError> {
        self.web.process(job, item).await
    }
}
