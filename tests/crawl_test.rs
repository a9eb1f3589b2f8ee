//! End-to-end crawl tests: scripted fetcher → strategies → BFS executor →
//! pipeline manager → store, over an in-memory database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use docstash::config::Config;
use docstash::crawler::ScrapeOptions;
use docstash::error::FetchError;
use docstash::fetcher::{FetchOptions, Fetched, Fetcher, FetcherSet, Probe};
use docstash::jobs::JobStatus;
use docstash::models::VersionStatus;
use docstash::service::AppServices;
use docstash::store::connect_in_memory;

#[derive(Clone)]
enum Route {
    Page { body: String, content_type: String },
    NotFound,
}

/// Scripted HTTP stand-in: fixed routes, request log, optional per-fetch
/// delay so cancellation has something to interrupt.
struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedFetcher {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    fn html(&self, url: &str, body: &str) {
        self.route(
            url,
            Route::Page {
                body: body.to_string(),
                content_type: "text/html".to_string(),
            },
        );
    }

    fn markdown(&self, url: &str, body: &str) {
        self.route(
            url,
            Route::Page {
                body: body.to_string(),
                content_type: "text/markdown".to_string(),
            },
        );
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn fetch(&self, url: &Url, opts: &FetchOptions) -> Result<Fetched, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = opts.cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: url.to_string() });
                }
            }
        }

        let route = self.routes.lock().unwrap().get(url.as_str()).cloned();
        match route {
            Some(Route::Page { body, content_type }) => Ok(Fetched {
                bytes: body.into_bytes(),
                content_type,
                etag: Some("\"mock\"".to_string()),
                last_modified: None,
                final_url: url.clone(),
                status: 200,
            }),
            Some(Route::NotFound) | None => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
        }
    }

    async fn probe(&self, url: &Url, _opts: &FetchOptions) -> Result<Probe, FetchError> {
        let found = self.routes.lock().unwrap().contains_key(url.as_str());
        if found {
            Ok(Probe {
                status: 200,
                etag: None,
                last_modified: None,
            })
        } else {
            Err(FetchError::NotFound {
                url: url.to_string(),
            })
        }
    }
}

async fn services_with(fetcher: Arc<ScriptedFetcher>) -> AppServices {
    let mut config = Config::default();
    config.scraper.max_concurrency = 2;
    let pool = connect_in_memory().await.unwrap();
    let fetchers = FetcherSet::new(vec![fetcher as Arc<dyn Fetcher>]);
    AppServices::init_with(config, pool, fetchers, None)
        .await
        .unwrap()
}

fn scrape_options(url: &str, library: &str, version: &str) -> ScrapeOptions {
    ScrapeOptions::new(url, library, version)
}

#[tokio::test]
async fn scrape_indexes_linked_pages_and_serves_search() {
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    fetcher.html(
        "https://x.test/docs/guide",
        r#"<html><head><title>Guide</title></head><body>
            <h1>Guide</h1><p>Start with the walrus operator.</p>
            <a href="/docs/api">API</a>
            <a href="/docs/missing">Missing</a></body></html>"#,
    );
    fetcher.html(
        "https://x.test/docs/api",
        r#"<html><head><title>API</title></head><body>
            <h1>API</h1><p>The pelican endpoint returns JSON.</p></body></html>"#,
    );

    let services = services_with(Arc::clone(&fetcher)).await;
    let job_id = services
        .enqueue_scrape(scrape_options("https://x.test/docs/guide", "xlib", "1.0.0"))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), services.wait_for_job(&job_id))
        .await
        .expect("job finished in time")
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let job = services.get_job(&job_id).await.unwrap();
    assert_eq!(job.pages_done, 2);
    // the dead link is counted and persisted, without failing the job
    assert_eq!(job.pages_failed, 1);
    assert!(job.error.is_none());

    let results = services.search("xlib", "1.0.0", "pelican", 5).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].url, "https://x.test/docs/api");
    assert!(results[0].content.contains("pelican"));

    let versions = services.list_versions("xlib").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].status, VersionStatus::Completed);
    assert_eq!(versions[0].unique_url_count, 2);

    services.shutdown().await;
}

#[tokio::test]
async fn llms_txt_seeds_in_scope_urls_from_parent_probe() {
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    fetcher.markdown(
        "https://x.test/docs/llms.txt",
        "# Example docs\n\
         - [Guide](https://x.test/docs/guide)\n\
         - [Alpha](https://x.test/docs/alpha)\n\
         - [Beta](https://x.test/docs/beta)\n\
         - [Blog](https://x.test/blog/post)\n\
         - [External](https://other.test/page)\n",
    );
    fetcher.markdown("https://x.test/docs/guide", "# Guide\n\nguide body");
    // alpha has a .md sibling which must win; beta falls back to HTML
    fetcher.markdown("https://x.test/docs/alpha.md", "# Alpha\n\nalpha markdown body");
    fetcher.html(
        "https://x.test/docs/alpha",
        "<html><body><h1>Alpha</h1><p>alpha html body</p></body></html>",
    );
    fetcher.html(
        "https://x.test/docs/beta",
        "<html><body><h1>Beta</h1><p>beta body</p></body></html>",
    );

    let services = services_with(Arc::clone(&fetcher)).await;
    let job_id = services
        .enqueue_scrape(scrape_options("https://x.test/docs/guide", "xlib", ""))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), services.wait_for_job(&job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let requests = fetcher.requests();
    assert!(requests.contains(&"https://x.test/docs/llms.txt".to_string()));
    assert!(
        !requests.contains(&"https://x.test/llms.txt".to_string()),
        "site root is not probed after the parent hit"
    );
    // out-of-scope listed URLs never fetched
    assert!(!requests.iter().any(|r| r.contains("/blog/")));
    assert!(!requests.iter().any(|r| r.contains("other.test")));

    // three pages: guide (deduplicated against the root seed), alpha, beta
    let job = services.get_job(&job_id).await.unwrap();
    assert_eq!(job.pages_done, 3);
    assert_eq!(
        requests
            .iter()
            .filter(|r| r.as_str() == "https://x.test/docs/guide")
            .count(),
        1,
        "listed root URL deduplicated"
    );

    // the .md sibling served alpha
    assert!(requests.contains(&"https://x.test/docs/alpha.md".to_string()));
    let alpha = services
        .store()
        .find_chunks_by_url("xlib", "", "https://x.test/docs/alpha")
        .await
        .unwrap();
    assert!(alpha.iter().any(|c| c.content.contains("alpha markdown body")));

    services.shutdown().await;
}

#[tokio::test]
async fn refresh_deletes_pages_that_return_404() {
    let fetcher = ScriptedFetcher::new(Duration::ZERO);
    fetcher.markdown("https://x.test/docs/", "# Home\n\n[a](/docs/a) [b](/docs/b)");
    fetcher.markdown("https://x.test/docs/a", "# A\n\nthe axolotl chapter");
    fetcher.markdown("https://x.test/docs/b", "# B\n\nthe bonobo chapter");

    let services = services_with(Arc::clone(&fetcher)).await;
    let job_id = services
        .enqueue_scrape(scrape_options("https://x.test/docs/", "xlib", "v1"))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), services.wait_for_job(&job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert!(!services
        .search("xlib", "v1", "axolotl", 5)
        .await
        .unwrap()
        .is_empty());

    // page /docs/a disappears from the site
    fetcher.route("https://x.test/docs/a", Route::NotFound);
    fetcher.clear_requests();

    let refresh_id = services.enqueue_refresh("xlib", "v1").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), services.wait_for_job(&refresh_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Completed, "404s do not fail a refresh");

    // llms.txt probing is skipped on refresh
    assert!(!fetcher.requests().iter().any(|r| r.contains("llms.txt")));

    let gone = services
        .store()
        .find_chunks_by_url("xlib", "v1", "https://x.test/docs/a")
        .await
        .unwrap();
    assert!(gone.is_empty(), "page and its chunks removed");
    assert!(services
        .search("xlib", "v1", "axolotl", 5)
        .await
        .unwrap()
        .is_empty());
    // the surviving page is still searchable
    assert!(!services
        .search("xlib", "v1", "bonobo", 5)
        .await
        .unwrap()
        .is_empty());

    services.shutdown().await;
}

#[tokio::test]
async fn cancellation_terminates_with_partial_progress() {
    let fetcher = ScriptedFetcher::new(Duration::from_millis(15));
    // a long chain so the crawl cannot finish before the cancel lands
    for i in 0..400 {
        fetcher.markdown(
            &format!("https://x.test/docs/p{}", i),
            &format!("# P{}\n\nbody\n\n[next](/docs/p{})", i, i + 1),
        );
    }

    let services = services_with(Arc::clone(&fetcher)).await;
    let mut options = scrape_options("https://x.test/docs/p0", "xlib", "big");
    options.max_pages = Some(1000);
    options.max_depth = Some(1000);
    let job_id = services.enqueue_scrape(options).await.unwrap();

    // let some pages complete, then cancel
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = services.get_job(&job_id).await.unwrap();
        if job.pages_done >= 3 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "crawl never progressed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    services.cancel(&job_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), services.wait_for_job(&job_id))
        .await
        .expect("wait_for_job resolves in bounded time after cancel")
        .unwrap();
    assert_eq!(status, JobStatus::Cancelled);

    let job = services.get_job(&job_id).await.unwrap();
    assert!(job.pages_done >= 3, "partial progress persisted");
    assert!(job.pages_done < 400, "crawl did not run to completion");

    let versions = services.list_versions("xlib").await.unwrap();
    assert_eq!(versions[0].status, VersionStatus::Cancelled);

    services.shutdown().await;
}

#[tokio::test]
async fn equivalent_jobs_deduplicate_while_active() {
    let fetcher = ScriptedFetcher::new(Duration::from_millis(25));
    fetcher.markdown("https://x.test/docs/solo", "# Solo\n\nbody");

    let services = services_with(Arc::clone(&fetcher)).await;
    let options = scrape_options("https://x.test/docs/solo", "xlib", "1.0.0");

    let first = services.enqueue_scrape(options.clone()).await.unwrap();
    let second = services.enqueue_scrape(options).await.unwrap();
    assert_eq!(first, second, "equivalent queued job is reused");

    let status = tokio::time::timeout(Duration::from_secs(10), services.wait_for_job(&first))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    // once terminal, a new enqueue creates a fresh job
    let third = services
        .enqueue_scrape(scrape_options("https://x.test/docs/solo", "xlib", "1.0.0"))
        .await
        .unwrap();
    assert_ne!(first, third);

    services.shutdown().await;
}
