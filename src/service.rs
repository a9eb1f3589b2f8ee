//! The service surface consumed by the CLI and outer shells (MCP, web).
//!
//! [`AppServices::init`] wires the whole core together: it opens the store
//! and applies migrations (fatal on failure), probes the embedding
//! provider (falling back to FTS-only on missing credentials), recovers
//! interrupted jobs, and starts the scheduler. Everything outward-facing
//! goes through the methods here; `app.readOnly` rejects ingest-class
//! calls at this boundary.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::crawler::ScrapeOptions;
use crate::embedding::Embedder;
use crate::fetcher::archive::ArchiveFetcher;
use crate::fetcher::file::FileFetcher;
use crate::fetcher::http::HttpFetcher;
use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::FetcherSet;
use crate::jobs::events::{EventBus, JobEvent};
use crate::jobs::{JobRecord, JobStatus, PipelineManager};
use crate::models::{SearchResult, VersionSummary};
use crate::store::{migrate, DocStore};

pub struct AppServices {
    config: Config,
    store: Arc<DocStore>,
    manager: Arc<PipelineManager>,
    renderer: Option<Arc<dyn DynamicRenderer>>,
    scheduler: tokio::task::JoinHandle<()>,
}

impl AppServices {
    /// Initialize against the configured on-disk store.
    pub async fn init(config: Config) -> Result<Self> {
        let pool = crate::store::connect(&config.database_path()).await?;
        let fetchers = default_fetchers(&config)?;
        Self::init_with(config, pool, fetchers, None).await
    }

    /// Initialization seam shared with tests (in-memory pools, scripted
    /// fetchers, fake renderers).
    pub async fn init_with(
        config: Config,
        pool: SqlitePool,
        fetchers: FetcherSet,
        renderer: Option<Arc<dyn DynamicRenderer>>,
    ) -> Result<Self> {
        // migrations are fatal at startup
        migrate::apply_migrations(&pool, &config.db).await?;

        let embedder = Embedder::init(&config.app, &config.embeddings)
            .await?
            .map(Arc::new);

        let store = Arc::new(DocStore::new(
            pool,
            embedder,
            config.search.clone(),
            config.assembly.clone(),
        ));

        let manager = PipelineManager::new(
            Arc::clone(&store),
            config.clone(),
            EventBus::default(),
            fetchers,
            renderer.clone(),
        );
        manager.recover().await?;
        let scheduler = manager.spawn_scheduler();

        Ok(Self {
            config,
            store,
            manager,
            renderer,
            scheduler,
        })
    }

    pub fn store(&self) -> &Arc<DocStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<PipelineManager> {
        &self.manager
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.app.read_only {
            bail!("store is read-only (app.readOnly); ingest operations are disabled");
        }
        Ok(())
    }

    // ============ ingestion ============

    pub async fn enqueue_scrape(&self, options: ScrapeOptions) -> Result<String> {
        self.ensure_writable()?;
        self.manager.enqueue_scrape(options).await
    }

    pub async fn enqueue_refresh(&self, library: &str, version: &str) -> Result<String> {
        self.ensure_writable()?;
        self.manager.enqueue_refresh(library, version).await
    }

    pub async fn enqueue_remove_version(&self, library: &str, version: &str) -> Result<String> {
        self.ensure_writable()?;
        self.manager.enqueue_remove_version(library, version).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        self.manager.cancel(job_id).await
    }

    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobStatus> {
        self.manager.wait_for_job(job_id).await
    }

    // ============ query ============

    /// Hybrid search followed by neighborhood assembly.
    pub async fn search(
        &self,
        library: &str,
        version: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let hits = self
            .store
            .find_by_content(library, version, query, limit)
            .await?;
        Ok(self.store.assemble(hits).await?)
    }

    // ============ introspection ============

    pub async fn list_libraries(&self) -> Result<Vec<String>> {
        Ok(self.store.list_libraries().await?)
    }

    pub async fn list_versions(&self, library: &str) -> Result<Vec<VersionSummary>> {
        Ok(self.store.list_versions(library).await?)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.manager.list_jobs(status).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.manager.get_job(job_id).await
    }

    /// SSE-style subscription to job events for dashboards and shells.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.manager.events().subscribe()
    }

    /// Stop the scheduler, cancel running jobs, and release the browser
    /// singleton (even when the driver already disconnected).
    pub async fn shutdown(self) {
        self.manager.shutdown();
        if let Some(renderer) = &self.renderer {
            renderer.shutdown().await;
        }
        self.scheduler.abort();
        let _ = self.scheduler.await;
    }
}

pub fn default_fetchers(config: &Config) -> Result<FetcherSet> {
    Ok(FetcherSet::new(vec![
        Arc::new(HttpFetcher::new(&config.scraper)?),
        Arc::new(FileFetcher::new(config.scraper.document.max_size)),
        Arc::new(ArchiveFetcher::new(config.scraper.document.max_size)),
    ]))
}
