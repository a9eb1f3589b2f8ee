//! Web strategy: BFS over HTTP/HTTPS with llms.txt seeding.
//!
//! Before the main loop (and never on refresh) the strategy probes for an
//! `llms.txt` link list: the input URL's parent directory first, then the
//! site root. Listed in-scope URLs seed the queue at depth 0, marked
//! `from_llms_txt`; for those, a `.md` sibling is attempted before the
//! primary fetch and used when it answers 200 with a text-like type.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use url::Url;

use super::{
    fetch_and_process, process_fetched, JobContext, PageOutcome, ScrapeStrategy,
};
use crate::error::FetchError;
use crate::fetcher::render::DynamicRenderer;
use crate::fetcher::{is_text_like, FetchOptions, FetcherSet};
use crate::models::QueueItem;

pub struct WebStrategy {
    fetchers: FetcherSet,
    renderer: Option<Arc<dyn DynamicRenderer>>,
}

impl WebStrategy {
    pub fn new(fetchers: FetcherSet, renderer: Option<Arc<dyn DynamicRenderer>>) -> Self {
        Self { fetchers, renderer }
    }

    /// Probe candidates in order: parent directory, then site root (only
    /// when that differs). The parent is computed by stripping the last
    /// path segment of the input URL.
    fn llms_candidates(root: &Url) -> Vec<Url> {
        let mut candidates = Vec::new();
        let parent = super::parent_directory(root.path());
        if let Ok(url) = root.join(&format!("{}llms.txt", parent)) {
            candidates.push(url);
        }
        if let Ok(url) = root.join("/llms.txt") {
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
        candidates
    }

    async fn llms_seeds(&self, job: &JobContext, root: &Url) -> Vec<QueueItem> {
        let opts = FetchOptions::with_cancel(job.cancel.clone());
        for candidate in Self::llms_candidates(root) {
            let fetched = match self.fetchers.fetch(&candidate, &opts).await {
                Ok(fetched) if fetched.status == 200 && is_text_like(&fetched.content_type) => {
                    fetched
                }
                _ => continue,
            };

            let body = String::from_utf8_lossy(&fetched.bytes);
            let listed = parse_llms_links(&body, &candidate);
            let seeds: Vec<QueueItem> = listed
                .into_iter()
                .filter(|url| job.filter.allows(url))
                .map(QueueItem::seeded_from_llms_txt)
                .collect();

            tracing::info!(
                source = %candidate,
                seeded = seeds.len(),
                "seeded crawl from llms.txt"
            );
            // first successful probe wins; the root is not probed after a
            // parent-directory hit
            return seeds;
        }
        Vec::new()
    }
}

/// Extract link targets from an llms.txt document: Markdown link targets
/// plus bare absolute URLs.
pub fn parse_llms_links(body: &str, base: &Url) -> Vec<Url> {
    static MD_LINK: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();
    let md_link = MD_LINK.get_or_init(|| Regex::new(r"\[[^\]]*\]\(([^()\s]+)\)").unwrap());
    let bare = BARE.get_or_init(|| Regex::new(r"https?://[^\s)\]>]+").unwrap());

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    let mut push = |raw: &str| {
        if let Ok(mut url) = base.join(raw) {
            if matches!(url.scheme(), "http" | "https") {
                url.set_fragment(None);
                if seen.insert(url.to_string()) {
                    links.push(url);
                }
            }
        }
    };

    for line in body.lines() {
        if let Some(caps) = md_link.captures(line) {
            push(&caps[1]);
        } else if let Some(found) = bare.find(line) {
            push(found.as_str());
        }
    }
    links
}

/// The `.md` sibling of an llms.txt-listed URL: `index.html.md` for
/// directory-like paths, an appended `.md` otherwise.
pub fn md_sibling(url: &Url) -> Option<Url> {
    let path = url.path();
    if path.ends_with(".md") {
        return None;
    }
    let sibling_path = if path.ends_with('/') {
        format!("{}index.html.md", path)
    } else {
        format!("{}.md", path)
    };
    let mut sibling = url.clone();
    sibling.set_path(&sibling_path);
    Some(sibling)
}

#[async_trait]
impl ScrapeStrategy for WebStrategy {
    fn name(&self) -> &'static str {
        "web"
    }

    fn can_handle(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn seeds(&self, job: &mut JobContext) -> Result<Vec<QueueItem>> {
        let root = Url::parse(&job.options.url)?;
        let mut seeds = vec![QueueItem::new(root.clone(), 0)];
        seeds.extend(self.llms_seeds(job, &root).await);
        Ok(seeds)
    }

    async fn process(
        &self,
        job: &JobContext,
        item: &QueueItem,
    ) -> Result<PageOutcome, FetchError> {
        if item.from_llms_txt {
            if let Some(sibling) = md_sibling(&item.url) {
                let opts = FetchOptions::with_cancel(job.cancel.clone());
                if let Ok(fetched) = self.fetchers.fetch(&sibling, &opts).await {
                    if fetched.status == 200 && is_text_like(&fetched.content_type) {
                        return process_fetched(&item.url, &fetched, self.renderer.clone(), job)
                            .await;
                    }
                }
            }
        }

        fetch_and_process(&self.fetchers, self.renderer.clone(), job, item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llms_candidates_parent_then_root() {
        let root = Url::parse("https://docs.example.com/docs/guide").unwrap();
        let candidates = WebStrategy::llms_candidates(&root);
        assert_eq!(
            candidates,
            vec![
                Url::parse("https://docs.example.com/docs/llms.txt").unwrap(),
                Url::parse("https://docs.example.com/llms.txt").unwrap(),
            ]
        );

        // at the site root the two candidates collapse into one
        let root = Url::parse("https://docs.example.com/").unwrap();
        let candidates = WebStrategy::llms_candidates(&root);
        assert_eq!(
            candidates,
            vec![Url::parse("https://docs.example.com/llms.txt").unwrap()]
        );
    }

    #[test]
    fn llms_links_parsed_from_markdown_and_bare() {
        let base = Url::parse("https://docs.example.com/docs/llms.txt").unwrap();
        let body = "# Docs\n\n- [Guide](https://docs.example.com/docs/guide): start here\n- [API](/docs/api)\nhttps://docs.example.com/docs/faq\nplain prose line\n";
        let links = parse_llms_links(body, &base);
        let as_strings: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            as_strings,
            vec![
                "https://docs.example.com/docs/guide",
                "https://docs.example.com/docs/api",
                "https://docs.example.com/docs/faq",
            ]
        );
    }

    #[test]
    fn md_sibling_rules() {
        let file_like = Url::parse("https://x.test/docs/guide").unwrap();
        assert_eq!(
            md_sibling(&file_like).unwrap().as_str(),
            "https://x.test/docs/guide.md"
        );

        let dir_like = Url::parse("https://x.test/docs/").unwrap();
        assert_eq!(
            md_sibling(&dir_like).unwrap().as_str(),
            "https://x.test/docs/index.html.md"
        );

        let already_md = Url::parse("https://x.test/docs/guide.md").unwrap();
        assert!(md_sibling(&already_md).is_none());
    }
}
