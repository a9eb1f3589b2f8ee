//! # docstash CLI
//!
//! Thin command tree over the service surface: every command loads the
//! layered configuration, initializes [`AppServices`], and delegates.
//!
//! ```bash
//! docstash init
//! docstash scrape https://docs.example.com/docs/ --library example --version 2.1.0
//! docstash search example "install on linux" --limit 5
//! docstash list
//! docstash refresh example 2.1.0
//! docstash remove example 2.1.0
//! docstash jobs --status running
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docstash::crawler::{ScopeMode, ScrapeOptions};
use docstash::jobs::JobStatus;
use docstash::pipeline::RenderMode;
use docstash::{load_config, AppServices};

#[derive(Parser)]
#[command(name = "docstash", version, about = "Documentation scraper and hybrid search index")]
struct Cli {
    /// Path to a TOML config file (read-only unless it is the default).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override app.storePath.
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and apply schema migrations.
    Init,
    /// Scrape and index a documentation source.
    Scrape {
        /// Web URL, file:// path, npm:/pypi: package, or GitHub repo.
        url: String,
        #[arg(long)]
        library: String,
        /// Version string; omit for the unversioned collection.
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, value_enum, default_value = "subpages")]
        scope: ScopeArg,
        /// Include patterns (glob, or regex: prefixed). Replaces defaults.
        #[arg(long = "include")]
        include_patterns: Vec<String>,
        /// Exclude patterns. Replaces defaults.
        #[arg(long = "exclude")]
        exclude_patterns: Vec<String>,
        #[arg(long)]
        max_pages: Option<u64>,
        #[arg(long)]
        max_depth: Option<u32>,
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Render pages in a browser: never, auto, or force.
        #[arg(long, value_enum, default_value = "never")]
        render: RenderArg,
        /// Abort the job on the first page error.
        #[arg(long)]
        fail_fast: bool,
        /// Return the job id immediately instead of waiting.
        #[arg(long)]
        no_wait: bool,
    },
    /// Re-fetch an indexed version with conditional requests.
    Refresh {
        library: String,
        #[arg(default_value = "")]
        version: String,
        #[arg(long)]
        no_wait: bool,
    },
    /// Remove a version (and the library once empty).
    Remove {
        library: String,
        #[arg(default_value = "")]
        version: String,
    },
    /// Search indexed documentation.
    Search {
        library: String,
        query: String,
        #[arg(long, default_value = "")]
        version: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List libraries and versions with indexing status.
    List {
        library: Option<String>,
    },
    /// List jobs, optionally filtered by status.
    Jobs {
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ScopeArg {
    Subpages,
    Hostname,
    Domain,
    Any,
}

impl From<ScopeArg> for ScopeMode {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Subpages => ScopeMode::Subpages,
            ScopeArg::Hostname => ScopeMode::Hostname,
            ScopeArg::Domain => ScopeMode::Domain,
            ScopeArg::Any => ScopeMode::Any,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RenderArg {
    Never,
    Auto,
    Force,
}

impl From<RenderArg> for RenderMode {
    fn from(value: RenderArg) -> Self {
        match value {
            RenderArg::Never => RenderMode::Never,
            RenderArg::Auto => RenderMode::Auto,
            RenderArg::Force => RenderMode::Force,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(store_path) = cli.store_path {
        config.app.store_path = store_path;
    }

    let services = AppServices::init(config).await?;
    let result = run(&services, cli.command).await;
    services.shutdown().await;
    result
}

async fn run(services: &AppServices, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            // AppServices::init already applied migrations
            println!("store initialized");
        }
        Command::Scrape {
            url,
            library,
            version,
            scope,
            include_patterns,
            exclude_patterns,
            max_pages,
            max_depth,
            max_concurrency,
            render,
            fail_fast,
            no_wait,
        } => {
            let options = ScrapeOptions {
                scope: scope.into(),
                include_patterns,
                exclude_patterns,
                max_pages,
                max_depth,
                max_concurrency,
                render_mode: render.into(),
                ignore_errors: !fail_fast,
                ..ScrapeOptions::new(&url, &library, &version)
            };
            let job_id = services.enqueue_scrape(options).await?;
            println!("job {}", job_id);
            if !no_wait {
                let status = services.wait_for_job(&job_id).await?;
                let job = services.get_job(&job_id).await?;
                println!(
                    "{} ({} pages{})",
                    status.as_str(),
                    job.pages_done,
                    job.error.map(|e| format!(", error: {}", e)).unwrap_or_default()
                );
            }
        }
        Command::Refresh {
            library,
            version,
            no_wait,
        } => {
            let job_id = services.enqueue_refresh(&library, &version).await?;
            println!("job {}", job_id);
            if !no_wait {
                let status = services.wait_for_job(&job_id).await?;
                println!("{}", status.as_str());
            }
        }
        Command::Remove { library, version } => {
            let job_id = services.enqueue_remove_version(&library, &version).await?;
            let status = services.wait_for_job(&job_id).await?;
            println!("{}", status.as_str());
        }
        Command::Search {
            library,
            query,
            version,
            limit,
        } => {
            let results = services.search(&library, &version, &query, limit).await?;
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (index, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {}",
                    index + 1,
                    result.score,
                    result.title.as_deref().unwrap_or("(untitled)")
                );
                if !result.path.is_empty() {
                    println!("   section: {}", result.path.join(" > "));
                }
                println!("   url: {}", result.url);
                let preview: String = result.content.chars().take(240).collect();
                println!("   {}", preview.replace('\n', " "));
                println!();
            }
        }
        Command::List { library } => {
            let versions = match library {
                Some(library) => services.list_versions(&library).await?,
                None => {
                    let mut all = Vec::new();
                    for library in services.list_libraries().await? {
                        all.extend(services.list_versions(&library).await?);
                    }
                    all
                }
            };
            for summary in versions {
                let version_label = if summary.version.is_empty() {
                    "(unversioned)"
                } else {
                    &summary.version
                };
                println!(
                    "{} {} — {} [{}/{} pages, {} chunks]",
                    summary.library,
                    version_label,
                    summary.status,
                    summary.pages_done,
                    summary.pages_max,
                    summary.document_count,
                );
            }
        }
        Command::Jobs { status } => {
            let filter = match status.as_deref() {
                Some(raw) => Some(
                    JobStatus::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("unknown job status: {}", raw))?,
                ),
                None => None,
            };
            for job in services.list_jobs(filter).await? {
                let failed = if job.pages_failed > 0 {
                    format!(", {} failed", job.pages_failed)
                } else {
                    String::new()
                };
                println!(
                    "{} {} {}@{} {} {}/{}{}{}",
                    job.id,
                    job.kind.as_str(),
                    job.library,
                    if job.version.is_empty() { "latest" } else { &job.version },
                    job.status.as_str(),
                    job.pages_done,
                    job.pages_max,
                    failed,
                    job.error.map(|e| format!(" ({})", e)).unwrap_or_default(),
                );
            }
        }
    }
    Ok(())
}
