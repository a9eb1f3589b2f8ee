//! Store integration tests over an in-memory database (FTS-only mode).

use docstash::config::{AssemblyConfig, DbConfig, SearchConfig};
use docstash::models::{ChunkTypes, ContentChunk, ScrapeResult, SectionMeta};
use docstash::store::{connect_in_memory, migrate, DocStore};

async fn open_store() -> DocStore {
    let pool = connect_in_memory().await.unwrap();
    migrate::apply_migrations(&pool, &DbConfig::default())
        .await
        .unwrap();
    DocStore::new(pool, None, SearchConfig::default(), AssemblyConfig::default())
}

fn chunk(body: &str, level: u8, path: &[&str], types: ChunkTypes) -> ContentChunk {
    ContentChunk {
        body: body.to_string(),
        meta: SectionMeta::new(level, path.iter().map(|s| s.to_string()).collect(), types),
    }
}

fn page(url: &str, title: &str, chunks: Vec<ContentChunk>) -> ScrapeResult {
    ScrapeResult {
        url: url.to_string(),
        final_url: url.to_string(),
        title: Some(title.to_string()),
        content_type: "text/markdown".to_string(),
        etag: Some("\"v1\"".to_string()),
        last_modified: None,
        chunks,
        links: Vec::new(),
        errors: Vec::new(),
    }
}

#[tokio::test]
async fn reingest_replaces_chunks_atomically() {
    let store = open_store().await;
    let url = "https://x.test/guide";

    let first = page(
        url,
        "Guide",
        vec![
            chunk("alpha", 1, &["Guide"], ChunkTypes::CONTENT),
            chunk("beta", 1, &["Guide"], ChunkTypes::CONTENT),
            chunk("gamma", 1, &["Guide"], ChunkTypes::CONTENT),
        ],
    );
    store.add_documents("lib", "1.0.0", 0, &first).await.unwrap();

    let second = page(
        url,
        "Guide",
        vec![
            chunk("delta", 1, &["Guide"], ChunkTypes::CONTENT),
            chunk("epsilon", 1, &["Guide"], ChunkTypes::CONTENT),
        ],
    );
    store.add_documents("lib", "1.0.0", 0, &second).await.unwrap();

    let docs = store.find_chunks_by_url("lib", "1.0.0", url).await.unwrap();
    let bodies: Vec<&str> = docs.iter().map(|d| d.content.as_str()).collect();
    assert_eq!(bodies, vec!["delta", "epsilon"]);

    // sort_order is the dense sequence 0..n-1
    let orders: Vec<i64> = docs.iter().map(|d| d.sort_order).collect();
    assert_eq!(orders, vec![0, 1]);

    // nothing orphaned: exactly one page row, exactly two chunk rows
    let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents_fts")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!((pages, documents, fts_rows), (1, 2, 2));
}

#[tokio::test]
async fn idempotent_ingest_keeps_documents_stable() {
    let store = open_store().await;
    let url = "https://x.test/stable";
    let source = page(
        url,
        "Stable",
        vec![
            chunk("one", 1, &["Stable"], ChunkTypes::CONTENT),
            chunk("two", 2, &["Stable", "Sub"], ChunkTypes::CONTENT),
        ],
    );

    store.add_documents("lib", "", 0, &source).await.unwrap();
    let before = store.find_chunks_by_url("lib", "", url).await.unwrap();

    store.add_documents("lib", "", 0, &source).await.unwrap();
    let after = store.find_chunks_by_url("lib", "", url).await.unwrap();

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.content, b.content);
        assert_eq!(a.sort_order, b.sort_order);
        assert_eq!(a.meta.path, b.meta.path);
    }
}

#[tokio::test]
async fn round_trip_chunks_match_scrape_result() {
    let store = open_store().await;
    let url = "https://x.test/roundtrip";
    let source = page(
        url,
        "RT",
        vec![
            chunk("# RT", 1, &["RT"], ChunkTypes::STRUCTURAL | ChunkTypes::HEADING),
            chunk("first body", 1, &["RT"], ChunkTypes::CONTENT),
            chunk("second body", 1, &["RT"], ChunkTypes::CONTENT),
        ],
    );
    store.add_documents("lib", "2.0.0", 1, &source).await.unwrap();

    let stored = store
        .find_chunks_by_url("lib", "2.0.0", url)
        .await
        .unwrap();
    let stored_bodies: Vec<&str> = stored.iter().map(|d| d.content.as_str()).collect();
    let source_bodies: Vec<&str> = source.chunks.iter().map(|c| c.body.as_str()).collect();
    assert_eq!(stored_bodies, source_bodies);

    // metadata survives the round trip too
    assert!(stored[0].meta.types.contains(ChunkTypes::HEADING));
    assert_eq!(stored[1].meta.path, vec!["RT"]);
}

#[tokio::test]
async fn delete_page_removes_documents_first() {
    let store = open_store().await;
    let url = "https://x.test/gone";
    store
        .add_documents(
            "lib",
            "",
            0,
            &page(url, "Gone", vec![chunk("body", 1, &["Gone"], ChunkTypes::CONTENT)]),
        )
        .await
        .unwrap();

    let page_id: i64 = sqlx::query_scalar("SELECT id FROM pages WHERE url = ?")
        .bind(url)
        .fetch_one(store.pool())
        .await
        .unwrap();
    store.delete_page(page_id).await.unwrap();

    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!((documents, pages), (0, 0));
}

#[tokio::test]
async fn remove_version_cascades_and_honors_library_flag() {
    let store = open_store().await;
    store
        .add_documents(
            "lib",
            "1.0.0",
            0,
            &page("https://x.test/a", "A", vec![chunk("va", 1, &["A"], ChunkTypes::CONTENT)]),
        )
        .await
        .unwrap();
    store
        .add_documents(
            "lib",
            "2.0.0",
            0,
            &page("https://x.test/b", "B", vec![chunk("vb", 1, &["B"], ChunkTypes::CONTENT)]),
        )
        .await
        .unwrap();

    let summary = store.remove_version("lib", "1.0.0", true).await.unwrap();
    assert_eq!(summary.documents_deleted, 1);
    assert!(summary.version_deleted);
    assert!(!summary.library_deleted, "another version remains");
    assert!(!store.check_document_exists("lib", "1.0.0").await.unwrap());
    assert!(store.check_document_exists("lib", "2.0.0").await.unwrap());

    let summary = store.remove_version("lib", "2.0.0", true).await.unwrap();
    assert!(summary.library_deleted);
    assert!(store.list_libraries().await.unwrap().is_empty());
}

#[tokio::test]
async fn fts_search_finds_and_filters_structural() {
    let store = open_store().await;
    store
        .add_documents(
            "lib",
            "",
            0,
            &page(
                "https://x.test/search",
                "Searchable",
                vec![
                    chunk(
                        "# zanzibar heading",
                        1,
                        &["zanzibar heading"],
                        ChunkTypes::STRUCTURAL | ChunkTypes::HEADING,
                    ),
                    chunk(
                        "the zanzibar protocol handles authorization",
                        1,
                        &["zanzibar heading"],
                        ChunkTypes::CONTENT,
                    ),
                    chunk("unrelated content about parsing", 1, &["Other"], ChunkTypes::CONTENT),
                ],
            ),
        )
        .await
        .unwrap();

    let hits = store
        .find_by_content("lib", "", "zanzibar", 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1, "structural heading chunk is filtered out");
    assert!(hits[0].content.contains("protocol"));
    assert!(hits[0].score > 0.0);

    // case: searching the other library/version finds nothing
    let empty = store
        .find_by_content("lib", "9.9.9", "zanzibar", 10)
        .await;
    assert!(empty.is_err() || empty.unwrap().is_empty());
}

#[tokio::test]
async fn fts_queries_never_error_on_hostile_input() {
    let store = open_store().await;
    store
        .add_documents(
            "lib",
            "",
            0,
            &page(
                "https://x.test/q",
                "Q",
                vec![chunk("foo bar baz qux unbalanced", 1, &["Q"], ChunkTypes::CONTENT)],
            ),
        )
        .await
        .unwrap();

    for query in [
        "foo \"bar baz\" qux\"unbalanced",
        "\"\"\"",
        "NEAR(a b)",
        "a* OR b AND -c",
        "(((",
        "col:value",
    ] {
        let result = store.find_by_content("lib", "", query, 5).await;
        assert!(result.is_ok(), "query {:?} must not error", query);
    }

    // the mixed-quote query actually matches the document
    let hits = store
        .find_by_content("lib", "", "foo \"bar baz\" qux\"unbalanced", 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn assembled_search_includes_neighborhood() {
    let store = open_store().await;
    store
        .add_documents(
            "lib",
            "",
            0,
            &page(
                "https://x.test/ctx",
                "Ctx",
                vec![
                    chunk("intro paragraph", 1, &["Ctx"], ChunkTypes::CONTENT),
                    chunk("the flamingo setting controls retries", 2, &["Ctx", "Settings"], ChunkTypes::CONTENT),
                    chunk("next sibling paragraph", 2, &["Ctx", "Settings"], ChunkTypes::CONTENT),
                ],
            ),
        )
        .await
        .unwrap();

    let hits = store.find_by_content("lib", "", "flamingo", 5).await.unwrap();
    let results = store.assemble(hits).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("flamingo"));
    assert!(
        results[0].content.contains("next sibling paragraph"),
        "subsequent sibling merged in"
    );
}

#[tokio::test]
async fn version_listing_includes_empty_versions_sorted() {
    let store = open_store().await;
    store
        .add_documents(
            "alpha",
            "1.2.0",
            0,
            &page("https://a.test/1", "A1", vec![chunk("a", 1, &["A"], ChunkTypes::CONTENT)]),
        )
        .await
        .unwrap();
    store
        .add_documents(
            "alpha",
            "1.10.0",
            0,
            &page("https://a.test/2", "A2", vec![chunk("b", 1, &["A"], ChunkTypes::CONTENT)]),
        )
        .await
        .unwrap();
    // zero-page versions still appear
    store.resolve_version_id("alpha", "").await.unwrap();
    store.resolve_version_id("beta", "0.1.0").await.unwrap();

    let summaries = store.query_library_versions().await.unwrap();
    let labels: Vec<(String, String)> = summaries
        .iter()
        .map(|s| (s.library.clone(), s.version.clone()))
        .collect();

    assert_eq!(
        labels,
        vec![
            ("alpha".to_string(), "".to_string()),
            ("alpha".to_string(), "1.10.0".to_string()),
            ("alpha".to_string(), "1.2.0".to_string()),
            ("beta".to_string(), "0.1.0".to_string()),
        ]
    );

    let alpha_latest = &summaries[1];
    assert_eq!(alpha_latest.document_count, 1);
    assert_eq!(alpha_latest.unique_url_count, 1);
    assert!(alpha_latest.indexed_at.is_some());
}
