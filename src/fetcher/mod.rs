//! Byte retrieval.
//!
//! A [`Fetcher`] takes a URL and returns raw bytes plus caching metadata, or
//! a classified [`FetchError`]. Variants cover plain HTTP, local files, and
//! archive members; dynamic browser rendering sits behind the
//! [`render::DynamicRenderer`] seam. The [`FetcherSet`] dispatches a URL to
//! the first fetcher that claims it.

pub mod archive;
pub mod cache;
pub mod file;
pub mod http;
pub mod render;

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use crate::cancel::CancelToken;
use crate::error::FetchError;

/// Options recognised by every fetch call.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Sent as `If-None-Match`; a match yields status 304 with no body.
    pub if_none_match: Option<String>,
    /// Sent as `If-Modified-Since`.
    pub if_modified_since: Option<String>,
    /// Additional request headers (name, value).
    pub extra_headers: Vec<(String, String)>,
    /// Aborts the in-flight request when cancelled.
    pub cancel: CancelToken,
}

impl FetchOptions {
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.if_none_match.is_some() || self.if_modified_since.is_some()
    }
}

/// A successfully fetched resource.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Where the request landed after redirects.
    pub final_url: Url,
    /// 200 for fresh content, 304 for a conditional hit (empty body).
    pub status: u16,
}

impl Fetched {
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Result of a lightweight probe (HEAD / conditional GET): status plus
/// caching headers, no body.
#[derive(Debug, Clone)]
pub struct Probe {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Whether this fetcher handles the URL's scheme.
    fn can_fetch(&self, url: &Url) -> bool;

    async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError>;

    async fn probe(&self, url: &Url, opts: &FetchOptions) -> Result<Probe, FetchError>;
}

/// Ordered set of fetchers; the first one claiming a URL wins.
#[derive(Clone)]
pub struct FetcherSet {
    fetchers: Vec<Arc<dyn Fetcher>>,
}

impl FetcherSet {
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self { fetchers }
    }

    pub fn for_url(&self, url: &Url) -> Result<Arc<dyn Fetcher>, FetchError> {
        self.fetchers
            .iter()
            .find(|f| f.can_fetch(url))
            .cloned()
            .ok_or_else(|| FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("no fetcher registered for scheme '{}'", url.scheme()),
            })
    }

    pub async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError> {
        self.for_url(url)?.fetch(url, opts).await
    }

    pub async fn probe(&self, url: &Url, opts: &FetchOptions) -> Result<Probe, FetchError> {
        self.for_url(url)?.probe(url, opts).await
    }
}

/// Guess a MIME type from a path's extension, falling back to content
/// sniffing. Used by the file and archive fetchers; HTTP trusts the
/// `Content-Type` header.
pub(crate) fn detect_content_type(path: &str, bytes: &[u8]) -> String {
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    if let Some(mime) = mime_for_extension(&extension) {
        return mime.to_string();
    }
    sniff_content_type(bytes).to_string()
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "md" | "markdown" | "mdx" => "text/markdown",
        "html" | "htm" | "xhtml" => "text/html",
        "json" => "application/json",
        "txt" | "text" | "rst" => "text/plain",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "js" | "mjs" | "cjs" => "text/x-javascript",
        "ts" | "tsx" => "text/x-typescript",
        "go" => "text/x-go",
        "java" => "text/x-java",
        "c" | "h" => "text/x-c",
        "cpp" | "cc" | "hpp" => "text/x-c++",
        "rb" => "text/x-ruby",
        "sh" | "bash" => "text/x-shellscript",
        "toml" | "yaml" | "yml" | "ini" | "cfg" => "text/plain",
        _ => return None,
    })
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    let head = &bytes[..bytes.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with("<!doctype html") || lowered.starts_with("<html") {
        return "text/html";
    }
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_slice::<serde_json::Value>(bytes).is_ok()
    {
        return "application/json";
    }
    if bytes.iter().take(512).any(|&b| b == 0) {
        return "application/octet-stream";
    }
    "text/plain"
}

/// Treat the main content type as text-like (safe to index directly).
pub fn is_text_like(content_type: &str) -> bool {
    let main = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    main.starts_with("text/")
        || main == "application/json"
        || main == "application/xml"
        || main.ends_with("+json")
        || main.ends_with("+xml")
}
