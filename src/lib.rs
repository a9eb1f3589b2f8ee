//! # docstash
//!
//! **A local-first documentation scraper and hybrid search index.**
//!
//! docstash ingests technical documentation from web sites, local files,
//! package registries, and git hosts, splits pages into hierarchy-aware
//! chunks, indexes them in an embedded SQLite store (FTS5 + vector BLOBs),
//! and serves context-assembled hybrid search.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
//! │ Strategies  │──▶│ BFS executor │──▶│  Pipeline    │──▶│  SQLite   │
//! │ web/file/   │   │ queue+pool   │   │ + splitter  │   │ FTS5+Vec  │
//! │ npm/git     │   │ cancel/cap   │   │             │   └────┬─────┘
//! └─────────────┘   └──────────────┘   └─────────────┘        │
//!        ▲                                                    ▼
//! ┌──────┴──────┐                                       ┌──────────┐
//! │  Pipeline   │◀───── enqueue / cancel / wait ────────│ Services │
//! │  manager    │─────▶ progress events (broadcast)     │ (search) │
//! └─────────────┘                                       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A **job** (`scrape`, `refresh`, `remove-version`) is enqueued in the
//!    durable [`jobs`] queue.
//! 2. The matching **[`crawler`] strategy** discovers URLs; the shared BFS
//!    executor fetches them through the **[`fetcher`] set** under a
//!    concurrency cap with cooperative cancellation.
//! 3. The per-content-type **[`pipeline`]** transforms raw bytes (dynamic
//!    render, sanitize, DOM → Markdown) and the two-phase **[`splitter`]**
//!    produces ordered chunks with heading-hierarchy paths.
//! 4. The **[`store`]** persists pages and chunks transactionally and
//!    mirrors them into FTS5 and the vector table (via [`embedding`]).
//! 5. **Search** fuses BM25 and vector ranks with RRF, then assembles each
//!    hit's parents, siblings, and children into a coherent result.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Layered configuration (defaults ≪ TOML ≪ `DOCS_MCP_*` env ≪ CLI) |
//! | [`models`] | Core data types: versions, pages, chunks, hits |
//! | [`error`] | Typed error taxonomy (fetch, embed, store, pipeline, job) |
//! | [`fetcher`] | HTTP/file/archive fetchers, LRU resource cache, render seam |
//! | [`pipeline`] | Per-content-type middleware chains |
//! | [`splitter`] | Semantic phase-1 splitters + greedy phase-2 optimizer |
//! | [`crawler`] | Scraper strategies, URL scope/filters, BFS executor |
//! | [`embedding`] | Embedding providers, batching, vector helpers |
//! | [`store`] | SQLite store: writes, migrations, hybrid search, assembly |
//! | [`jobs`] | Durable job queue, recovery, progress events |
//! | [`service`] | The narrow surface consumed by CLI and server shells |

pub mod cancel;
pub mod config;
pub mod crawler;
pub mod embedding;
pub mod error;
pub mod fetcher;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod service;
pub mod splitter;
pub mod store;

pub use config::{load_config, Config};
pub use crawler::ScrapeOptions;
pub use error::{EmbedError, FetchError, JobError, PipelineError, StoreError};
pub use models::{SearchResult, VersionStatus, VersionSummary};
pub use service::AppServices;
