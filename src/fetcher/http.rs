//! HTTP fetcher with retry, backoff, and conditional requests.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Method, StatusCode};
use std::time::Duration;
use url::Url;

use super::{FetchOptions, Fetched, Fetcher, Probe};
use crate::config::ScraperConfig;
use crate::error::FetchError;

/// Statuses worth retrying besides the 5xx band.
const RETRYABLE_STATUSES: &[u16] = &[408, 425, 429];

/// Redirect chain cap; scope is re-evaluated against the landing URL by the
/// caller.
const MAX_REDIRECTS: usize = 10;

/// Advertises Markdown so servers may content-negotiate it; an HTML
/// fallback keeps ordinary sites working.
pub const ACCEPT_HEADER: &str = "text/markdown, text/html;q=0.9, */*;q=0.8";

pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
    base_delay: Duration,
    max_document_size: u64,
}

impl HttpFetcher {
    pub fn new(config: &ScraperConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.page_timeout_ms))
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .gzip(true)
            .default_headers(browser_headers())
            .build()?;

        Ok(Self {
            client,
            max_retries: config.fetcher.max_retries,
            base_delay: Duration::from_millis(config.fetcher.base_delay_ms),
            max_document_size: config.document.max_size,
        })
    }

    async fn execute(
        &self,
        method: Method,
        url: &Url,
        opts: &FetchOptions,
        want_body: bool,
    ) -> Result<Fetched, FetchError> {
        let mut last_transient: Option<FetchError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2*base, 4*base, ...
                let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = opts.cancel.cancelled() => {
                        return Err(FetchError::Cancelled { url: url.to_string() });
                    }
                }
            }
            if opts.cancel.is_cancelled() {
                return Err(FetchError::Cancelled { url: url.to_string() });
            }

            let request = self.build_request(method.clone(), url, opts);
            let response = tokio::select! {
                r = request.send() => r,
                _ = opts.cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
            };

            match response {
                Ok(response) => match self.classify(url, response, opts, want_body).await {
                    Ok(fetched) => return Ok(fetched),
                    Err(err) if err.is_retryable() => last_transient = Some(err),
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    last_transient = Some(FetchError::Transient {
                        url: url.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(last_transient.unwrap_or_else(|| FetchError::Transient {
            url: url.to_string(),
            reason: "retries exhausted".to_string(),
        }))
    }

    fn build_request(
        &self,
        method: Method,
        url: &Url,
        opts: &FetchOptions,
    ) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url.clone());
        if let Some(etag) = &opts.if_none_match {
            request = request.header("If-None-Match", etag);
        }
        if let Some(since) = &opts.if_modified_since {
            request = request.header("If-Modified-Since", since);
        }
        for (name, value) in &opts.extra_headers {
            request = request.header(name, value);
        }
        request
    }

    async fn classify(
        &self,
        url: &Url,
        response: reqwest::Response,
        opts: &FetchOptions,
        want_body: bool,
    ) -> Result<Fetched, FetchError> {
        let status = response.status();
        let final_url = response.url().clone();
        let etag = header_string(response.headers(), "etag");
        let last_modified = header_string(response.headers(), "last-modified");
        let content_type = header_string(response.headers(), "content-type")
            .unwrap_or_else(|| "text/html".to_string());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched {
                bytes: Vec::new(),
                content_type,
                etag,
                last_modified,
                final_url,
                status: 304,
            });
        }

        if status.is_success() {
            if let Some(length) = response.content_length() {
                if length > self.max_document_size {
                    return Err(FetchError::TooLarge {
                        url: url.to_string(),
                        size: length,
                        limit: self.max_document_size,
                    });
                }
            }

            let bytes = if want_body {
                self.read_body_capped(url, response, opts).await?
            } else {
                Vec::new()
            };

            return Ok(Fetched {
                bytes,
                content_type,
                etag,
                last_modified,
                final_url,
                status: status.as_u16(),
            });
        }

        let code = status.as_u16();
        Err(match code {
            404 | 410 => FetchError::NotFound {
                url: url.to_string(),
            },
            401 | 403 => FetchError::Unauthorized {
                url: url.to_string(),
            },
            _ if RETRYABLE_STATUSES.contains(&code) || status.is_server_error() => {
                FetchError::Transient {
                    url: url.to_string(),
                    reason: format!("status {}", code),
                }
            }
            _ => FetchError::Permanent {
                url: url.to_string(),
                reason: format!("status {}", code),
            },
        })
    }

    /// Stream the body so oversized documents are cut off without buffering
    /// the whole payload first.
    async fn read_body_capped(
        &self,
        url: &Url,
        response: reqwest::Response,
        opts: &FetchOptions,
    ) -> Result<Vec<u8>, FetchError> {
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                c = stream.next() => c,
                _ = opts.cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|err| FetchError::Transient {
                url: url.to_string(),
                reason: format!("body stream: {}", err),
            })?;
            if (bytes.len() + chunk.len()) as u64 > self.max_document_size {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    size: (bytes.len() + chunk.len()) as u64,
                    limit: self.max_document_size,
                });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError> {
        self.execute(Method::GET, url, opts, true).await
    }

    async fn probe(&self, url: &Url, opts: &FetchOptions) -> Result<Probe, FetchError> {
        let fetched = self.execute(Method::HEAD, url, opts, false).await?;
        Ok(Probe {
            status: fetched.status,
            etag: fetched.etag,
            last_modified: fetched.last_modified,
        })
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// A realistic browser-style header set. Some documentation hosts refuse
/// obviously robotic clients.
fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let entries: &[(&str, &str)] = &[
        (
            "user-agent",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
             Chrome/126.0.0.0 Safari/537.36",
        ),
        ("accept", ACCEPT_HEADER),
        ("accept-language", "en-US,en;q=0.9"),
        ("upgrade-insecure-requests", "1"),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
    ];
    for (name, value) in entries {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}
