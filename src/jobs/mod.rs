//! Durable job scheduler.
//!
//! Jobs (`scrape`, `refresh`, `remove-version`) are persisted in the
//! `jobs` table, deduplicated while queued or running, executed under a
//! configurable concurrency ceiling (one at a time by default), and
//! recovered at startup. Each running job owns a [`CancelToken`]; within a
//! job the BFS executor's worker pool governs fetch parallelism.

pub mod events;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::crawler::executor::{BfsExecutor, PageSink};
use crate::crawler::{JobContext, ScrapeOptions, StrategyRegistry, UrlFilter};
use crate::error::JobError;
use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::FetcherSet;
use crate::models::{QueueItem, ScrapeResult, VersionStatus};
use crate::pipeline::PipelineOptions;
use crate::store::DocStore;
use events::{EventBus, JobEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Scrape,
    Refresh,
    RemoveVersion,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Refresh => "refresh",
            JobKind::RemoveVersion => "remove-version",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "scrape" => JobKind::Scrape,
            "refresh" => JobKind::Refresh,
            "remove-version" => JobKind::RemoveVersion,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    /// A running refresh.
    Updating,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Updating => "updating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "updating" => JobStatus::Updating,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Updating)
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub library: String,
    pub version: String,
    pub source_url: Option<String>,
    pub options: Option<String>,
    pub status: JobStatus,
    pub pages_done: u64,
    pub pages_max: u64,
    /// Pages that errored and were skipped (`ignoreErrors` mode). Survives
    /// job completion so partially failing crawls stay visible.
    pub pages_failed: u64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct PipelineManager {
    store: Arc<DocStore>,
    config: Config,
    events: EventBus,
    fetchers: FetcherSet,
    renderer: Option<Arc<dyn DynamicRenderer>>,
    /// Cancel tokens of currently running jobs.
    active: Mutex<HashMap<String, CancelToken>>,
    wake: Notify,
    shutdown: CancelToken,
}

impl PipelineManager {
    pub fn new(
        store: Arc<DocStore>,
        config: Config,
        events: EventBus,
        fetchers: FetcherSet,
        renderer: Option<Arc<dyn DynamicRenderer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            events,
            fetchers,
            renderer,
            active: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: CancelToken::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Adopt jobs left over from a previous process. Interrupted refreshes
    /// re-queue; interrupted scrapes re-queue only when
    /// `jobs.recoverInterruptedScrapes` is set, otherwise they surface as
    /// failed for user action. Queued jobs stay queued.
    pub async fn recover(&self) -> Result<()> {
        let now = Utc::now().timestamp();

        let requeued = sqlx::query(
            "UPDATE jobs SET status = 'queued', updated_at = ?
             WHERE kind = 'refresh' AND status IN ('running', 'updating')",
        )
        .bind(now)
        .execute(self.store.pool())
        .await?
        .rows_affected();

        let interrupted = if self.config.jobs.recover_interrupted_scrapes {
            sqlx::query(
                "UPDATE jobs SET status = 'queued', updated_at = ?
                 WHERE kind = 'scrape' AND status = 'running'",
            )
            .bind(now)
            .execute(self.store.pool())
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', error = 'interrupted by shutdown; enqueue again to resume', updated_at = ?
                 WHERE kind = 'scrape' AND status = 'running'",
            )
            .bind(now)
            .execute(self.store.pool())
            .await?
            .rows_affected()
        };

        if requeued + interrupted > 0 {
            tracing::info!(requeued, interrupted, "adopted jobs from previous run");
            self.events.emit(JobEvent::JobListChange);
        }
        Ok(())
    }

    /// Run the dispatch loop until shutdown. Spawn once per process.
    pub fn spawn_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = manager.shutdown.cancelled() => break,
                }
                if let Err(err) = manager.dispatch().await {
                    tracing::error!(error = %err, "job dispatch failed");
                }
            }
        })
    }

    /// Stop dispatching and cancel all running jobs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, token) in self.active.lock().unwrap().iter() {
            token.cancel();
        }
    }

    async fn dispatch(self: &Arc<Self>) -> Result<()> {
        loop {
            {
                let active = self.active.lock().unwrap();
                if active.len() >= self.config.jobs.concurrency {
                    return Ok(());
                }
            }

            let Some(job) = self.claim_next().await? else {
                return Ok(());
            };

            let token = CancelToken::new();
            self.active
                .lock()
                .unwrap()
                .insert(job.id.clone(), token.clone());
            self.events.emit(JobEvent::JobStatus {
                job_id: job.id.clone(),
                status: job.status.as_str().to_string(),
            });

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let job_id = job.id.clone();
                manager.run_job(job, token).await;
                manager.active.lock().unwrap().remove(&job_id);
                manager.wake.notify_one();
            });
        }
    }

    /// Claim the oldest queued job, atomically flipping its status so a
    /// concurrent dispatch cannot double-claim.
    async fn claim_next(&self) -> Result<Option<JobRecord>> {
        let Some(row) = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'queued' ORDER BY created_at, id LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?
        else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;

        let running_status = if job.kind == JobKind::Refresh {
            JobStatus::Updating
        } else {
            JobStatus::Running
        };
        let claimed = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ? AND status = 'queued'")
            .bind(running_status.as_str())
            .bind(Utc::now().timestamp())
            .bind(&job.id)
            .execute(self.store.pool())
            .await?
            .rows_affected();
        if claimed == 0 {
            return Ok(None);
        }
        job.status = running_status;
        Ok(Some(job))
    }

    // ============ enqueue operations ============

    /// Enqueue a scrape. An equivalent job already queued or running is
    /// returned instead of creating a duplicate.
    pub async fn enqueue_scrape(&self, options: ScrapeOptions) -> Result<String> {
        Url::parse(&options.url).with_context(|| format!("invalid scrape URL: {}", options.url))?;
        let snapshot = serde_json::to_string(&options)?;
        self.enqueue(
            JobKind::Scrape,
            &options.library,
            &options.version,
            Some(&options.url),
            Some(&snapshot),
        )
        .await
    }

    /// Enqueue a refresh; options come from the version's persisted
    /// snapshot at run time.
    pub async fn enqueue_refresh(&self, library: &str, version: &str) -> Result<String> {
        let source_url: Option<String> = {
            let version_id = self.store.version_id(library, version).await?;
            sqlx::query_scalar("SELECT source_url FROM versions WHERE id = ?")
                .bind(version_id)
                .fetch_one(self.store.pool())
                .await?
        };
        self.enqueue(
            JobKind::Refresh,
            library,
            version,
            source_url.as_deref(),
            None,
        )
        .await
    }

    pub async fn enqueue_remove_version(&self, library: &str, version: &str) -> Result<String> {
        self.enqueue(JobKind::RemoveVersion, library, version, None, None)
            .await
    }

    async fn enqueue(
        &self,
        kind: JobKind,
        library: &str,
        version: &str,
        source_url: Option<&str>,
        options: Option<&str>,
    ) -> Result<String> {
        let library = library.to_lowercase();

        // dedupe against queued/running equivalents
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs
             WHERE kind = ? AND library = ? AND version = ?
               AND IFNULL(source_url, '') = IFNULL(?, '')
               AND status IN ('queued', 'running', 'updating')
             LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(&library)
        .bind(version)
        .bind(source_url)
        .fetch_optional(self.store.pool())
        .await?;
        if let Some(id) = existing {
            tracing::debug!(job_id = id.as_str(), "returning existing equivalent job");
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO jobs (id, kind, library, version, source_url, options, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(&library)
        .bind(version)
        .bind(source_url)
        .bind(options)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        if matches!(kind, JobKind::Scrape | JobKind::Refresh) {
            self.store
                .update_version_status(&library, version, VersionStatus::Queued)
                .await?;
        }

        self.events.emit(JobEvent::JobListChange);
        self.wake.notify_one();
        Ok(id)
    }

    // ============ queries ============

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        job_from_row(&row)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC")
                    .bind(status.as_str())
                    .fetch_all(self.store.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
                    .fetch_all(self.store.pool())
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    /// Cancel a queued or running job. Queued jobs jump straight to
    /// `cancelled`; running jobs get their token cancelled and reach the
    /// terminal state through their runner.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let job = self.get_job(job_id).await?;

        if job.status == JobStatus::Queued {
            self.finish_job(&job, JobStatus::Cancelled, None).await?;
            if matches!(job.kind, JobKind::Scrape | JobKind::Refresh) {
                self.store
                    .update_version_status(&job.library, &job.version, VersionStatus::Cancelled)
                    .await?;
            }
            return Ok(());
        }

        if let Some(token) = self.active.lock().unwrap().get(job_id) {
            token.cancel();
        }
        Ok(())
    }

    /// Resolves when the job reaches any terminal state, including
    /// cancellation. Polls the durable record, so it also works for jobs
    /// owned by an earlier process.
    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobStatus> {
        loop {
            let job = self.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job.status);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    // ============ execution ============

    async fn run_job(self: &Arc<Self>, job: JobRecord, cancel: CancelToken) {
        tracing::info!(job_id = job.id.as_str(), kind = job.kind.as_str(), "job started");
        let started = std::time::Instant::now();

        if matches!(job.kind, JobKind::Scrape | JobKind::Refresh) {
            let running = if job.kind == JobKind::Refresh {
                VersionStatus::Updating
            } else {
                VersionStatus::Running
            };
            let _ = self
                .store
                .update_version_status(&job.library, &job.version, running)
                .await;
        }

        let outcome = match job.kind {
            JobKind::RemoveVersion => self.run_remove(&job).await,
            JobKind::Scrape | JobKind::Refresh => self.run_crawl(&job, cancel.clone()).await,
        };

        let (status, error) = match outcome {
            Ok(summary) if summary.cancelled => (JobStatus::Cancelled, None),
            Ok(_) => (JobStatus::Completed, None),
            Err(err) => (JobStatus::Failed, Some(err.to_string())),
        };

        if let Err(err) = self.finish_job(&job, status, error.as_deref()).await {
            tracing::error!(job_id = job.id.as_str(), error = %err, "failed to persist terminal job state");
        }

        if matches!(job.kind, JobKind::Scrape | JobKind::Refresh) {
            let version_status = match status {
                JobStatus::Completed => VersionStatus::Completed,
                JobStatus::Cancelled => VersionStatus::Cancelled,
                _ => VersionStatus::Failed,
            };
            let _ = self
                .store
                .update_version_status(&job.library, &job.version, version_status)
                .await;
            let _ = self
                .store
                .set_version_error(&job.library, &job.version, error.as_deref())
                .await;
        }

        tracing::info!(
            job_id = job.id.as_str(),
            status = status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
    }

    async fn run_remove(&self, job: &JobRecord) -> Result<crate::crawler::executor::CrawlSummary> {
        let summary = self
            .store
            .remove_version(&job.library, &job.version, true)
            .await?;
        tracing::info!(
            library = job.library.as_str(),
            version = job.version.as_str(),
            documents = summary.documents_deleted,
            library_removed = summary.library_deleted,
            "version removed"
        );
        Ok(crate::crawler::executor::CrawlSummary::default())
    }

    async fn run_crawl(
        self: &Arc<Self>,
        job: &JobRecord,
        cancel: CancelToken,
    ) -> Result<crate::crawler::executor::CrawlSummary> {
        let is_refresh = job.kind == JobKind::Refresh;

        // refresh re-runs with the persisted option snapshot
        let options: ScrapeOptions = if is_refresh {
            let snapshot = self
                .store
                .version_scraper_options(&job.library, &job.version)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "version {}@{} has no stored scraper options to refresh with",
                        job.library,
                        job.version
                    )
                })?;
            serde_json::from_str(&snapshot).context("stored scraper options are unreadable")?
        } else {
            serde_json::from_str(job.options.as_deref().unwrap_or("{}"))
                .context("job options are unreadable")?
        };

        let root = Url::parse(&options.url)?;
        let scraper = &self.config.scraper;

        let refresh_seeds = if is_refresh {
            self.store
                .pages_for_refresh(&job.library, &job.version)
                .await?
                .into_iter()
                .filter_map(|page| {
                    let url = Url::parse(&page.url).ok()?;
                    Some(QueueItem {
                        url,
                        depth: page.depth,
                        from_llms_txt: false,
                        etag: page.etag,
                        last_modified: page.last_modified,
                        page_id: Some(page.id),
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut pipeline_options = PipelineOptions {
            render_mode: options.render_mode,
            cancel: cancel.clone(),
            ..PipelineOptions::default()
        };
        pipeline_options.render_policy = crate::fetcher::render::RenderPolicy::new(
            Duration::from_secs(2),
            Duration::from_millis(scraper.browser_timeout_ms),
        );

        let context = JobContext {
            filter: UrlFilter::new(
                root.clone(),
                options.scope,
                &options.include_patterns,
                &options.exclude_patterns,
            )?,
            options: options.clone(),
            cancel: cancel.clone(),
            is_refresh,
            refresh_seeds,
            splitter: self.config.splitter.clone(),
            pipeline: pipeline_options,
        };

        let registry = self.strategy_registry();
        let strategy = registry
            .for_url(&root)
            .ok_or_else(|| anyhow::anyhow!("no strategy can handle {}", root))?;

        let executor = BfsExecutor::new(
            options.max_pages.unwrap_or(scraper.max_pages),
            options.max_depth.unwrap_or(scraper.max_depth),
            options.max_concurrency.unwrap_or(scraper.max_concurrency),
        );

        let sink = StoreSink {
            manager: Arc::clone(self),
            job_id: job.id.clone(),
            library: job.library.clone(),
            version: job.version.clone(),
        };

        let summary = executor.run(strategy, context, &sink).await?;

        sqlx::query("UPDATE jobs SET pages_failed = ?, updated_at = ? WHERE id = ?")
            .bind(summary.pages_failed as i64)
            .bind(Utc::now().timestamp())
            .bind(&job.id)
            .execute(self.store.pool())
            .await?;

        if !summary.cancelled && !is_refresh {
            let snapshot = serde_json::to_string(&options)?;
            self.store
                .set_version_source(&job.library, &job.version, &options.url, &snapshot)
                .await?;
        }

        tracing::info!(
            job_id = job.id.as_str(),
            pages_done = summary.pages_done,
            pages_failed = summary.pages_failed,
            "crawl summary"
        );
        Ok(summary)
    }

    async fn finish_job(
        &self,
        job: &JobRecord,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now().timestamp())
            .bind(&job.id)
            .execute(self.store.pool())
            .await?;

        self.events.emit(JobEvent::JobStatus {
            job_id: job.id.clone(),
            status: status.as_str().to_string(),
        });
        self.events.emit(JobEvent::JobListChange);
        Ok(())
    }

    /// Built per crawl so strategies share the manager's fetchers and
    /// renderer. Order matters: first match wins.
    fn strategy_registry(&self) -> StrategyRegistry {
        use crate::crawler::{
            git::GitHubStrategy, local::LocalFileStrategy, packages::NpmStrategy,
            packages::PyPiStrategy, web::WebStrategy,
        };

        let web = Arc::new(WebStrategy::new(
            self.fetchers.clone(),
            self.renderer.clone(),
        ));
        StrategyRegistry::new(vec![
            Arc::new(LocalFileStrategy::new(
                self.fetchers.clone(),
                self.renderer.clone(),
            )),
            Arc::new(NpmStrategy::new(self.fetchers.clone(), Arc::clone(&web))),
            Arc::new(PyPiStrategy::new(self.fetchers.clone(), Arc::clone(&web))),
            Arc::new(GitHubStrategy::new(
                self.fetchers.clone(),
                self.renderer.clone(),
            )),
            web,
        ])
    }

    async fn persist_progress(
        &self,
        job_id: &str,
        library: &str,
        version: &str,
        pages_done: u64,
        pages_max: u64,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET pages_done = ?, pages_max = ?, updated_at = ? WHERE id = ?")
            .bind(pages_done as i64)
            .bind(pages_max as i64)
            .bind(Utc::now().timestamp())
            .bind(job_id)
            .execute(self.store.pool())
            .await?;
        self.store
            .update_version_progress(library, version, pages_done, pages_max)
            .await?;
        Ok(())
    }
}

/// Bridges the BFS executor to the store and the event bus.
struct StoreSink {
    manager: Arc<PipelineManager>,
    job_id: String,
    library: String,
    version: String,
}

#[async_trait]
impl PageSink for StoreSink {
    async fn on_page(&self, item: &QueueItem, result: &ScrapeResult) -> Result<()> {
        self.manager
            .store
            .add_documents(&self.library, &self.version, item.depth, result)
            .await?;
        Ok(())
    }

    async fn on_not_modified(&self, page_id: i64) -> Result<()> {
        self.manager.store.touch_page(page_id).await?;
        Ok(())
    }

    async fn on_deleted(&self, page_id: i64) -> Result<()> {
        self.manager.store.delete_page(page_id).await?;
        Ok(())
    }

    async fn on_progress(&self, pages_done: u64, pages_total: u64, url: &str) {
        if let Err(err) = self
            .manager
            .persist_progress(&self.job_id, &self.library, &self.version, pages_done, pages_total)
            .await
        {
            tracing::warn!(error = %err, "failed to persist progress");
        }
        self.manager.events.emit(JobEvent::JobProgress {
            job_id: self.job_id.clone(),
            pages_done,
            pages_max: pages_total,
            url: url.to_string(),
        });
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    Ok(JobRecord {
        id: row.get("id"),
        kind: JobKind::parse(&kind_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown job kind: {}", kind_raw))?,
        library: row.get("library"),
        version: row.get("version"),
        source_url: row.get("source_url"),
        options: row.get("options"),
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown job status: {}", status_raw))?,
        pages_done: row.get::<i64, _>("pages_done") as u64,
        pages_max: row.get::<i64, _>("pages_max") as u64,
        pages_failed: row.get::<i64, _>("pages_failed") as u64,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
