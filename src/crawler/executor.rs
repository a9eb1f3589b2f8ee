//! Breadth-first crawl executor, shared by every strategy.
//!
//! Maintains the FIFO queue, the canonicalized visited set, and a worker
//! pool capped at `scraper.maxConcurrency`. Items dequeue in insertion
//! order per depth band; completion order is not guaranteed; progress is
//! reported per *completed* page. Enqueues happen on the executor loop
//! while fetches run on workers, and the visited set caps total enqueues at
//! `maxPages` so the queue stays bounded within a job.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;

use super::{canonical_url, JobContext, PageOutcome, ScrapeStrategy};
use crate::error::FetchError;
use crate::models::{QueueItem, ScrapeResult};

/// Receives completed pages. The job runner implements this over the store;
/// tests use a recording sink.
#[async_trait]
pub trait PageSink: Send + Sync {
    async fn on_page(&self, item: &QueueItem, result: &ScrapeResult) -> Result<()>;

    /// Conditional refresh hit: only the page's timestamps move.
    async fn on_not_modified(&self, page_id: i64) -> Result<()>;

    /// A refreshed page came back 404: documents first, then the page row.
    async fn on_deleted(&self, page_id: i64) -> Result<()>;

    /// Called after each completed page, `pages_done` non-decreasing.
    async fn on_progress(&self, pages_done: u64, pages_total: u64, url: &str);
}

#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub pages_done: u64,
    pub pages_failed: u64,
    pub cancelled: bool,
}

pub struct BfsExecutor {
    max_pages: u64,
    max_depth: u32,
    max_concurrency: usize,
}

impl BfsExecutor {
    pub fn new(max_pages: u64, max_depth: u32, max_concurrency: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
            max_depth,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        strategy: Arc<dyn ScrapeStrategy>,
        mut job: JobContext,
        sink: &dyn PageSink,
    ) -> Result<CrawlSummary> {
        // seeding runs before any worker exists, so the strategy may still
        // re-root the filter
        let seeds = if job.is_refresh {
            std::mem::take(&mut job.refresh_seeds)
        } else {
            strategy.seeds(&mut job).await?
        };

        let mut queue: VecDeque<QueueItem> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut summary = CrawlSummary::default();
        let mut in_flight: JoinSet<(QueueItem, Result<PageOutcome, FetchError>)> = JoinSet::new();

        for seed in seeds {
            if visited.insert(canonical_url(&seed.url)) {
                queue.push_back(seed);
            }
        }

        self.drive(
            strategy,
            Arc::new(job),
            sink,
            queue,
            visited,
            &mut in_flight,
            &mut summary,
        )
        .await?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        strategy: Arc<dyn ScrapeStrategy>,
        job: Arc<JobContext>,
        sink: &dyn PageSink,
        mut queue: VecDeque<QueueItem>,
        mut visited: HashSet<String>,
        in_flight: &mut JoinSet<(QueueItem, Result<PageOutcome, FetchError>)>,
        summary: &mut CrawlSummary,
    ) -> Result<()> {
        loop {
            if job.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // top up the worker pool
            while in_flight.len() < self.max_concurrency
                && summary.pages_done + (in_flight.len() as u64) < self.max_pages
            {
                let Some(item) = queue.pop_front() else { break };

                // refresh seeds bypass the depth/filter gate: they exist
                // in the store already
                if !item.is_refresh() {
                    if item.depth > self.max_depth {
                        continue;
                    }
                    if item.depth > 0 && !job.filter.allows(&item.url) {
                        continue;
                    }
                }

                let strategy = Arc::clone(&strategy);
                let job = Arc::clone(&job);
                in_flight.spawn(async move {
                    let outcome = strategy.process(&job, &item).await;
                    (item, outcome)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                _ = job.cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
            };

            let Some(joined) = joined else { break };
            let (item, outcome) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    bail!("crawl worker panicked: {}", err);
                }
            };

            match outcome {
                Ok(PageOutcome::Processed(result)) => {
                    sink.on_page(&item, &result).await?;
                    summary.pages_done += 1;
                    self.report(sink, summary, &queue, in_flight.len(), &item).await;

                    if (visited.len() as u64) < self.max_pages {
                        for link in &result.links {
                            if item.depth + 1 > self.max_depth || !job.filter.allows(link) {
                                continue;
                            }
                            if visited.insert(canonical_url(link)) {
                                queue.push_back(QueueItem::new(link.clone(), item.depth + 1));
                                if visited.len() as u64 >= self.max_pages {
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(PageOutcome::NotModified) => {
                    if let Some(page_id) = item.page_id {
                        sink.on_not_modified(page_id).await?;
                    }
                    summary.pages_done += 1;
                    self.report(sink, summary, &queue, in_flight.len(), &item).await;
                }
                Ok(PageOutcome::Skipped(reason)) => {
                    tracing::debug!(url = %item.url, reason, "page skipped");
                }
                Err(FetchError::NotFound { .. }) if item.is_refresh() => {
                    if let Some(page_id) = item.page_id {
                        sink.on_deleted(page_id).await?;
                    }
                    summary.pages_done += 1;
                    self.report(sink, summary, &queue, in_flight.len(), &item).await;
                }
                Err(FetchError::Cancelled { .. }) => {
                    summary.cancelled = true;
                }
                Err(err) => {
                    summary.pages_failed += 1;
                    tracing::warn!(url = %item.url, error = %err, "page failed");
                    if !job.options.ignore_errors {
                        in_flight.abort_all();
                        while in_flight.join_next().await.is_some() {}
                        bail!("page {} failed: {}", item.url, err);
                    }
                }
            }
        }

        // structured shutdown: no worker outlives the job
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    async fn report(
        &self,
        sink: &dyn PageSink,
        summary: &CrawlSummary,
        queue: &VecDeque<QueueItem>,
        in_flight: usize,
        item: &QueueItem,
    ) {
        let discovered = summary.pages_done + in_flight as u64 + queue.len() as u64;
        let total = discovered.min(self.max_pages);
        sink.on_progress(summary.pages_done, total, item.url.as_str())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::crawler::{ScopeMode, ScrapeOptions, UrlFilter};
    use crate::models::{ChunkTypes, ContentChunk, SectionMeta};
    use std::sync::Mutex;
    use url::Url;

    /// Strategy that serves a fixed link graph from memory.
    struct GraphStrategy {
        pages: std::collections::HashMap<String, Vec<String>>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl ScrapeStrategy for GraphStrategy {
        fn name(&self) -> &'static str {
            "graph"
        }

        fn can_handle(&self, _url: &Url) -> bool {
            true
        }

        async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
            Ok(vec![QueueItem::new(Url::parse(&job.options.url)?, 0)])
        }

        async fn process(
            &self,
            job: &JobContext,
            item: &QueueItem,
        ) -> Result<PageOutcome, FetchError> {
            if job.cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    url: item.url.to_string(),
                });
            }
            tokio::time::sleep(self.delay).await;
            let key = item.url.to_string();
            let Some(links) = self.pages.get(&key) else {
                return Err(FetchError::NotFound { url: key });
            };
            Ok(PageOutcome::Processed(Box::new(ScrapeResult {
                url: key.clone(),
                final_url: key.clone(),
                title: Some("t".into()),
                content_type: "text/markdown".into(),
                etag: None,
                last_modified: None,
                chunks: vec![ContentChunk {
                    body: format!("content of {}", key),
                    meta: SectionMeta::new(1, vec!["t".into()], ChunkTypes::CONTENT),
                }],
                links: links.iter().map(|l| Url::parse(l).unwrap()).collect(),
                errors: Vec::new(),
            })))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pages: Mutex<Vec<String>>,
        progress: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl PageSink for RecordingSink {
        async fn on_page(&self, _item: &QueueItem, result: &ScrapeResult) -> Result<()> {
            self.pages.lock().unwrap().push(result.url.clone());
            Ok(())
        }

        async fn on_not_modified(&self, _page_id: i64) -> Result<()> {
            Ok(())
        }

        async fn on_deleted(&self, _page_id: i64) -> Result<()> {
            Ok(())
        }

        async fn on_progress(&self, pages_done: u64, _total: u64, _url: &str) {
            self.progress.lock().unwrap().push(pages_done);
        }
    }

    fn job_for(root: &str, cancel: CancelToken) -> JobContext {
        JobContext {
            options: ScrapeOptions::new(root, "lib", "1.0.0"),
            filter: UrlFilter::new(Url::parse(root).unwrap(), ScopeMode::Hostname, &[], &[])
                .unwrap(),
            cancel,
            is_refresh: false,
            refresh_seeds: Vec::new(),
            splitter: crate::config::SplitterConfig::default(),
            pipeline: crate::pipeline::PipelineOptions::default(),
        }
    }

    fn graph(edges: &[(&str, &[&str])]) -> std::collections::HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(page, links)| {
                (
                    page.to_string(),
                    links.iter().map(|l| l.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn bfs_visits_in_depth_bands_and_dedupes() {
        let strategy = Arc::new(GraphStrategy {
            pages: graph(&[
                ("https://x.test/a", &["https://x.test/b", "https://x.test/c"]),
                ("https://x.test/b", &["https://x.test/c", "https://x.test/a"]),
                ("https://x.test/c", &[]),
            ]),
            delay: std::time::Duration::ZERO,
        });
        let sink = RecordingSink::default();
        let executor = BfsExecutor::new(100, 5, 1);

        let summary = executor
            .run(
                strategy,
                job_for("https://x.test/a", CancelToken::new()),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(summary.pages_done, 3);
        let pages = sink.pages.lock().unwrap().clone();
        assert_eq!(pages.len(), 3, "deduplicated despite the cycle");
        assert_eq!(pages[0], "https://x.test/a");

        // progress is non-decreasing
        let progress = sink.progress.lock().unwrap().clone();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn max_pages_caps_the_crawl() {
        let mut edges: Vec<(String, Vec<String>)> = Vec::new();
        for i in 0..20 {
            edges.push((
                format!("https://x.test/p{}", i),
                vec![format!("https://x.test/p{}", i + 1)],
            ));
        }
        let strategy = Arc::new(GraphStrategy {
            pages: edges.into_iter().collect(),
            delay: std::time::Duration::ZERO,
        });
        let sink = RecordingSink::default();
        let executor = BfsExecutor::new(5, 100, 2);

        let summary = executor
            .run(
                strategy,
                job_for("https://x.test/p0", CancelToken::new()),
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(summary.pages_done, 5);
    }

    #[tokio::test]
    async fn max_depth_prunes_links() {
        let strategy = Arc::new(GraphStrategy {
            pages: graph(&[
                ("https://x.test/a", &["https://x.test/b"]),
                ("https://x.test/b", &["https://x.test/c"]),
                ("https://x.test/c", &["https://x.test/d"]),
                ("https://x.test/d", &[]),
            ]),
            delay: std::time::Duration::ZERO,
        });
        let sink = RecordingSink::default();
        let executor = BfsExecutor::new(100, 1, 1);

        let summary = executor
            .run(
                strategy,
                job_for("https://x.test/a", CancelToken::new()),
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(summary.pages_done, 2, "depth 0 and 1 only");
    }

    #[tokio::test]
    async fn cancellation_stops_dequeuing_and_resolves() {
        let mut edges: Vec<(String, Vec<String>)> = Vec::new();
        for i in 0..200 {
            edges.push((
                format!("https://x.test/p{}", i),
                vec![format!("https://x.test/p{}", i + 1)],
            ));
        }
        let strategy = Arc::new(GraphStrategy {
            pages: edges.into_iter().collect(),
            delay: std::time::Duration::from_millis(5),
        });
        let sink = RecordingSink::default();
        let executor = BfsExecutor::new(1000, 1000, 2);
        let cancel = CancelToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(60)).await;
                cancel.cancel();
            })
        };

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            executor.run(
                strategy,
                job_for("https://x.test/p0", cancel),
                &sink,
            ),
        )
        .await
        .expect("run resolved in bounded time")
        .unwrap();

        canceller.await.unwrap();
        assert!(summary.cancelled);
        assert!(summary.pages_done < 200, "partial progress persisted");
    }

    #[tokio::test]
    async fn failing_page_fails_job_when_errors_not_ignored() {
        let strategy = Arc::new(GraphStrategy {
            pages: graph(&[("https://x.test/a", &["https://x.test/missing"])]),
            delay: std::time::Duration::ZERO,
        });
        let sink = RecordingSink::default();
        let executor = BfsExecutor::new(100, 5, 1);

        let mut job = job_for("https://x.test/a", CancelToken::new());
        job.options.ignore_errors = false;
        let result = executor.run(strategy.clone(), job, &sink).await;
        assert!(result.is_err());

        // default mode records the failure and keeps going
        let sink = RecordingSink::default();
        let job = job_for("https://x.test/a", CancelToken::new());
        let summary = executor.run(strategy, job, &sink).await.unwrap();
        assert_eq!(summary.pages_done, 1);
        assert_eq!(summary.pages_failed, 1);
    }
}
