//! Local file strategy: recursive directory walk honoring the URL filter,
//! with archive files expanded into synthetic member URLs.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;
use walkdir::WalkDir;

use super::{fetch_and_process, JobContext, PageOutcome, ScrapeStrategy};
use crate::error::FetchError;
use crate::fetcher::archive::{archive_kind, expand, member_url};
use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::FetcherSet;
use crate::models::QueueItem;

pub struct LocalFileStrategy {
    fetchers: FetcherSet,
    renderer: Option<Arc<dyn DynamicRenderer>>,
}

impl LocalFileStrategy {
    pub fn new(fetchers: FetcherSet, renderer: Option<Arc<dyn DynamicRenderer>>) -> Self {
        Self { fetchers, renderer }
    }
}

#[async_trait]
impl ScrapeStrategy for LocalFileStrategy {
    fn name(&self) -> &'static str {
        "local-file"
    }

    fn can_handle(&self, url: &Url) -> bool {
        url.scheme() == "file"
    }

    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
        let root_url = Url::parse(&job.options.url)?;
        let root = root_url
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("not a file path: {}", job.options.url))?;

        let mut seeds = Vec::new();

        if root.is_file() {
            seeds.push(QueueItem::new(root_url, 0));
            return Ok(seeds);
        }

        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let depth = entry.depth().saturating_sub(1) as u32;

            if let Some(kind) = archive_kind(&path.to_string_lossy()) {
                let bytes = tokio::fs::read(path).await?;
                let entries = match expand(kind, &bytes, &path.to_string_lossy()) {
                    Ok(entries) => entries,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable archive");
                        continue;
                    }
                };
                for member in entries {
                    if let Ok(url) = member_url(kind, path, &member.inner_path) {
                        if job.filter.allows(&url) {
                            seeds.push(QueueItem::new(url, depth + 1));
                        }
                    }
                }
                continue;
            }

            let Ok(url) = Url::from_file_path(path) else {
                continue;
            };
            if job.filter.allows(&url) {
                seeds.push(QueueItem::new(url, depth));
            }
        }

        // deterministic crawl order regardless of directory iteration order
        seeds.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
        Ok(seeds)
    }

    async fn process(
        &self,
        job: &JobContext,
        item: &QueueItem,
    ) -> Result<PageOutcome, FetchError> {
        fetch_and_process(&self.fetchers, self.renderer.clone(), job, item).await
    }
}
