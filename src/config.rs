//! Layered configuration.
//!
//! Sources are merged in precedence order: built-in defaults, then the TOML
//! config file, then `DOCS_MCP_*` environment variables, then CLI flags
//! (applied by the binary after loading). Keys in the file use camelCase;
//! the environment form is `DOCS_MCP_<SECTION>_<SETTING>` with camelCase
//! converted to UPPER_SNAKE, e.g. `scraper.maxPages` ↔
//! `DOCS_MCP_SCRAPER_MAX_PAGES`.
//!
//! The config file is writable only at the default location
//! (`<storePath>/docstash.toml`); explicitly passed files are read-only.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub app: AppConfig,
    pub scraper: ScraperConfig,
    pub splitter: SplitterConfig,
    pub embeddings: EmbeddingsConfig,
    pub search: SearchConfig,
    pub assembly: AssemblyConfig,
    pub db: DbConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Directory holding the database file and installation id.
    pub store_path: PathBuf,
    pub telemetry_enabled: bool,
    /// Forbids ingest-class service calls when set.
    pub read_only: bool,
    /// Embedding model spec, `provider:model` (e.g. `openai:text-embedding-3-small`).
    /// Empty disables vector search.
    pub embedding_model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            telemetry_enabled: true,
            read_only: false,
            embedding_model: String::new(),
        }
    }
}

fn default_store_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".docstash"))
        .unwrap_or_else(|| PathBuf::from(".docstash"))
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ScraperConfig {
    pub max_pages: u64,
    pub max_depth: u32,
    pub max_concurrency: usize,
    pub page_timeout_ms: u64,
    pub browser_timeout_ms: u64,
    pub fetcher: FetcherConfig,
    pub document: DocumentConfig,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_pages: 1000,
            max_depth: 3,
            max_concurrency: 3,
            page_timeout_ms: 30_000,
            browser_timeout_ms: 60_000,
            fetcher: FetcherConfig::default(),
            document: DocumentConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct FetcherConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_cache_items: usize,
    pub max_cache_item_size_bytes: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_cache_items: 256,
            max_cache_item_size_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentConfig {
    /// Documents above this byte size fail with `TooLarge` and are skipped.
    pub max_size: u64,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
        }
    }
}

/// Character-based chunk size bounds for the two-phase splitter.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitterConfig {
    pub min_chunk_size: usize,
    pub preferred_chunk_size: usize,
    pub max_chunk_size: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 500,
            preferred_chunk_size: 1500,
            max_chunk_size: 5000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingsConfig {
    pub batch_size: usize,
    pub batch_chars: usize,
    /// Fixed database vector dimension D. Models with d ≤ D are zero-padded;
    /// models with d > D are rejected at startup.
    pub vector_dimension: usize,
    pub init_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            batch_size: 96,
            batch_chars: 100_000,
            vector_dimension: 1536,
            init_timeout_ms: 15_000,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    pub weight_vec: f64,
    pub weight_fts: f64,
    pub overfetch_factor: usize,
    pub vector_multiplier: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            weight_vec: 1.0,
            weight_fts: 1.0,
            overfetch_factor: 2,
            vector_multiplier: 4,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct AssemblyConfig {
    pub max_chunk_distance: i64,
    pub max_parent_chain_depth: usize,
    pub child_limit: usize,
    pub preceding_siblings_limit: usize,
    pub subsequent_siblings_limit: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_chunk_distance: 5,
            max_parent_chain_depth: 4,
            child_limit: 3,
            preceding_siblings_limit: 1,
            subsequent_siblings_limit: 2,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
    pub migration_max_retries: u32,
    pub migration_retry_delay_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            migration_max_retries: 5,
            migration_retry_delay_ms: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct JobsConfig {
    /// Jobs executed concurrently. Fetch parallelism within a job is
    /// governed by `scraper.maxConcurrency`.
    pub concurrency: usize,
    /// Whether scrapes interrupted by a crash are re-queued at startup.
    /// When false they are surfaced as failed for user action.
    pub recover_interrupted_scrapes: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            recover_interrupted_scrapes: false,
        }
    }
}

impl Config {
    /// Path of the database file inside the store directory.
    pub fn database_path(&self) -> PathBuf {
        self.app.store_path.join("docstash.sqlite")
    }

    /// Default (writable) config file location.
    pub fn default_config_path(&self) -> PathBuf {
        self.app.store_path.join("docstash.toml")
    }

    /// Persist the config. Only the default path is writable; explicitly
    /// provided config files are treated as read-only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if path != self.default_config_path() {
            bail!(
                "refusing to write config outside the default location: {}",
                path.display()
            );
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

/// Read or create the stable installation id used for telemetry
/// attribution. Lives next to the database file.
pub fn installation_id(store_path: &Path) -> Result<String> {
    let path = store_path.join(".installation-id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    std::fs::create_dir_all(store_path)?;
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)
        .with_context(|| format!("cannot write installation id: {}", path.display()))?;
    Ok(id)
}

/// Every environment override, mapped onto its config-file key.
const ENV_KEYS: &[(&str, &str)] = &[
    ("APP_STORE_PATH", "app.storePath"),
    ("APP_TELEMETRY_ENABLED", "app.telemetryEnabled"),
    ("APP_READ_ONLY", "app.readOnly"),
    ("APP_EMBEDDING_MODEL", "app.embeddingModel"),
    ("SCRAPER_MAX_PAGES", "scraper.maxPages"),
    ("SCRAPER_MAX_DEPTH", "scraper.maxDepth"),
    ("SCRAPER_MAX_CONCURRENCY", "scraper.maxConcurrency"),
    ("SCRAPER_PAGE_TIMEOUT_MS", "scraper.pageTimeoutMs"),
    ("SCRAPER_BROWSER_TIMEOUT_MS", "scraper.browserTimeoutMs"),
    ("SCRAPER_FETCHER_MAX_RETRIES", "scraper.fetcher.maxRetries"),
    ("SCRAPER_FETCHER_BASE_DELAY_MS", "scraper.fetcher.baseDelayMs"),
    ("SCRAPER_FETCHER_MAX_CACHE_ITEMS", "scraper.fetcher.maxCacheItems"),
    (
        "SCRAPER_FETCHER_MAX_CACHE_ITEM_SIZE_BYTES",
        "scraper.fetcher.maxCacheItemSizeBytes",
    ),
    ("SCRAPER_DOCUMENT_MAX_SIZE", "scraper.document.maxSize"),
    ("SPLITTER_MIN_CHUNK_SIZE", "splitter.minChunkSize"),
    ("SPLITTER_PREFERRED_CHUNK_SIZE", "splitter.preferredChunkSize"),
    ("SPLITTER_MAX_CHUNK_SIZE", "splitter.maxChunkSize"),
    ("EMBEDDINGS_BATCH_SIZE", "embeddings.batchSize"),
    ("EMBEDDINGS_BATCH_CHARS", "embeddings.batchChars"),
    ("EMBEDDINGS_VECTOR_DIMENSION", "embeddings.vectorDimension"),
    ("EMBEDDINGS_INIT_TIMEOUT_MS", "embeddings.initTimeoutMs"),
    ("EMBEDDINGS_REQUEST_TIMEOUT_MS", "embeddings.requestTimeoutMs"),
    ("SEARCH_WEIGHT_VEC", "search.weightVec"),
    ("SEARCH_WEIGHT_FTS", "search.weightFts"),
    ("SEARCH_OVERFETCH_FACTOR", "search.overfetchFactor"),
    ("SEARCH_VECTOR_MULTIPLIER", "search.vectorMultiplier"),
    ("ASSEMBLY_MAX_CHUNK_DISTANCE", "assembly.maxChunkDistance"),
    ("ASSEMBLY_MAX_PARENT_CHAIN_DEPTH", "assembly.maxParentChainDepth"),
    ("ASSEMBLY_CHILD_LIMIT", "assembly.childLimit"),
    (
        "ASSEMBLY_PRECEDING_SIBLINGS_LIMIT",
        "assembly.precedingSiblingsLimit",
    ),
    (
        "ASSEMBLY_SUBSEQUENT_SIBLINGS_LIMIT",
        "assembly.subsequentSiblingsLimit",
    ),
    ("DB_MIGRATION_MAX_RETRIES", "db.migrationMaxRetries"),
    ("DB_MIGRATION_RETRY_DELAY_MS", "db.migrationRetryDelayMs"),
    ("JOBS_CONCURRENCY", "jobs.concurrency"),
    (
        "JOBS_RECOVER_INTERRUPTED_SCRAPES",
        "jobs.recoverInterruptedScrapes",
    ),
];

/// Load configuration from an optional file plus the environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut value = toml::Value::Table(Default::default());

    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        value = content
            .parse::<toml::Value>()
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    }

    apply_env_overrides(&mut value, |key| std::env::var(key).ok())?;

    let config: Config = value
        .try_into()
        .context("invalid configuration structure")?;
    validate(&config)?;
    Ok(config)
}

/// Overlay `DOCS_MCP_*` environment variables onto the parsed TOML tree.
fn apply_env_overrides(
    value: &mut toml::Value,
    env: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    for (env_suffix, key_path) in ENV_KEYS {
        let env_name = format!("DOCS_MCP_{}", env_suffix);
        let Some(raw) = env(&env_name) else {
            continue;
        };
        let parsed = parse_env_value(&raw);
        set_path(value, key_path, parsed).with_context(|| format!("cannot apply {}", env_name))?;
    }
    Ok(())
}

/// Environment values carry no type information; try bool, then integer,
/// then float, falling back to a plain string.
fn parse_env_value(raw: &str) -> toml::Value {
    match raw {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return toml::Value::Integer(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

fn set_path(root: &mut toml::Value, path: &str, new_value: toml::Value) -> Result<()> {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let table = current
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("{} is not a table", path))?;
        if i == segments.len() - 1 {
            table.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = table
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    let splitter = &config.splitter;
    if splitter.min_chunk_size == 0 {
        bail!("splitter.minChunkSize must be > 0");
    }
    if splitter.min_chunk_size > splitter.preferred_chunk_size {
        bail!("splitter.minChunkSize must be <= splitter.preferredChunkSize");
    }
    if splitter.preferred_chunk_size > splitter.max_chunk_size {
        bail!("splitter.preferredChunkSize must be <= splitter.maxChunkSize");
    }

    if config.scraper.max_concurrency == 0 {
        bail!("scraper.maxConcurrency must be >= 1");
    }
    if config.jobs.concurrency == 0 {
        bail!("jobs.concurrency must be >= 1");
    }
    if config.embeddings.vector_dimension == 0 {
        bail!("embeddings.vectorDimension must be > 0");
    }
    if config.search.overfetch_factor == 0 || config.search.vector_multiplier == 0 {
        bail!("search.overfetchFactor and search.vectorMultiplier must be >= 1");
    }
    if config.search.weight_vec < 0.0 || config.search.weight_fts < 0.0 {
        bail!("search weights must be >= 0");
    }

    if !config.app.embedding_model.is_empty() && !config.app.embedding_model.contains(':') {
        bail!(
            "app.embeddingModel must use the form provider:model, got '{}'",
            config.app.embedding_model
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.splitter.min_chunk_size, 500);
        assert_eq!(config.embeddings.vector_dimension, 1536);
    }

    #[test]
    fn file_values_override_defaults() {
        let toml_src = r#"
            [scraper]
            maxPages = 42

            [splitter]
            minChunkSize = 100
            preferredChunkSize = 200
            maxChunkSize = 400
        "#;
        let mut value: toml::Value = toml_src.parse().unwrap();
        apply_env_overrides(&mut value, |_| None).unwrap();
        let config: Config = value.try_into().unwrap();
        assert_eq!(config.scraper.max_pages, 42);
        assert_eq!(config.splitter.max_chunk_size, 400);
        // untouched sections keep defaults
        assert_eq!(config.scraper.max_depth, 3);
    }

    #[test]
    fn env_overrides_file() {
        let toml_src = "[scraper]\nmaxPages = 42\n";
        let mut value: toml::Value = toml_src.parse().unwrap();
        apply_env_overrides(&mut value, |key| match key {
            "DOCS_MCP_SCRAPER_MAX_PAGES" => Some("7".to_string()),
            "DOCS_MCP_APP_READ_ONLY" => Some("true".to_string()),
            "DOCS_MCP_SEARCH_WEIGHT_VEC" => Some("0.25".to_string()),
            _ => None,
        })
        .unwrap();
        let config: Config = value.try_into().unwrap();
        assert_eq!(config.scraper.max_pages, 7);
        assert!(config.app.read_only);
        assert!((config.search.weight_vec - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_chunk_ordering_rejected() {
        let mut config = Config::default();
        config.splitter.min_chunk_size = 2000;
        config.splitter.preferred_chunk_size = 1000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn embedding_model_spec_requires_provider() {
        let mut config = Config::default();
        config.app.embedding_model = "text-embedding-3-small".into();
        assert!(validate(&config).is_err());
        config.app.embedding_model = "openai:text-embedding-3-small".into();
        assert!(validate(&config).is_ok());
    }
}
