//! HTTP API tests.
//!
//! Each test serves the router on an ephemeral port over an in-memory
//! store and talks to it with `reqwest`, the way a front-end would.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use policy_retrieval::answer::{AnswerGenerator, ExtractiveGenerator};
use policy_retrieval::config::Config;
use policy_retrieval::embedding::HashedProvider;
use policy_retrieval::server::router;
use policy_retrieval::service::Retriever;
use policy_retrieval::store::MemoryStore;
use policy_retrieval::ScoredChunk;

const DIMS: usize = 256;

// ─── Test Generator ─────────────────────────────────────────────────

/// Names the top passage and counts how often it is asked.
#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl AnswerGenerator for CountingGenerator {
    async fn generate(
        &self,
        _question: &str,
        passages: &[ScoredChunk],
    ) -> policy_retrieval::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("See {}.", passages[0].title))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    store: Arc<MemoryStore>,
    handle: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put(
        "employee/Leave-Policy.md",
        "To apply for leave, submit a request in the HR portal at least two weeks ahead.\n\n\
         Your manager must approve leave before it starts. Apply early during peak season.",
    );
    store.put(
        "employee/Expenses.md",
        "Travel expenses are reimbursed monthly after finance review of receipts.",
    );
    store.put(
        "executive/Bonus-Plan.md",
        "Executive bonus payouts are approved by the board compensation committee.",
    );
    store
}

async fn start(generator: Arc<dyn AnswerGenerator>) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_data_dir(tmp.path().join("data"), tmp.path().join("unused"));
    config.chunking.chunk_size = 90;
    config.chunking.chunk_overlap = 40;
    config.embedding.dims = DIMS;

    let store = seeded_store();
    let retriever = Retriever::open(config, store.clone(), Arc::new(HashedProvider::new(DIMS)))
        .await
        .unwrap();
    let app = router(Arc::new(retriever), generator);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let base = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base).await;
    TestServer {
        base,
        store,
        handle,
        _tmp: tmp,
    }
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    let url = format!("{}/health", base);
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("{}{}", base, path)).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_version() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;
    let (status, body) = get(&server.base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_query_returns_passages_and_citations() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;
    let (status, body) = post(
        &server.base,
        "/query",
        json!({"query": "How do I apply for leave?", "role": "employee"}),
    )
    .await;

    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["role"], "employee");
    assert_eq!(body["query"], "how do i apply for leave?");
    assert_eq!(body["status"]["state"], "fresh");
    assert_eq!(body["passages"][0]["title"], "Leave-Policy.md");
    let citations = body["citations"].as_array().unwrap();
    let leave = citations
        .iter()
        .filter(|c| c["title"] == "Leave-Policy.md")
        .count();
    assert_eq!(leave, 1);
}

#[tokio::test]
async fn test_short_query_is_a_validation_error() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;
    let (status, body) = post(
        &server.base,
        "/query",
        json!({"query": "a", "role": "employee"}),
    )
    .await;

    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "validation_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("at least 3 characters"));
    assert_eq!(server.store.list_calls(policy_retrieval::RoleScope::Employee), 0);
}

#[tokio::test]
async fn test_unknown_role_is_a_bad_request() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;
    let (status, body) = post(
        &server.base,
        "/query",
        json!({"query": "How do I apply for leave?", "role": "contractor"}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = get(&server.base, "/scopes/contractor/stats").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_store_outage_before_first_sync_is_unavailable() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;
    server.store.set_unavailable(true);

    let (status, body) = post(
        &server.base,
        "/query",
        json!({"query": "How do I apply for leave?", "role": "employee"}),
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "store_unavailable");
}

#[tokio::test]
async fn test_refresh_and_scope_stats() {
    let server = start(Arc::new(ExtractiveGenerator::default())).await;

    let (status, body) = post(&server.base, "/refresh/employee", json!({})).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["added"].as_array().unwrap().len(), 2);
    assert_eq!(body["index_rebuilt"], true);

    let (status, body) = post(&server.base, "/refresh/employee", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["added"].as_array().unwrap().len(), 0);
    assert_eq!(body["unchanged"], 2);
    assert_eq!(body["index_rebuilt"], false);

    let (status, body) = get(&server.base, "/scopes/employee/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["documents"], 2);
    assert_eq!(body["index_fresh"], true);
}

#[tokio::test]
async fn test_answers_are_cached_and_clearable() {
    let generator = Arc::new(CountingGenerator::default());
    let server = start(generator.clone()).await;
    let question = json!({"query": "How do I apply for leave?", "role": "employee"});

    let (status, first) = post(&server.base, "/answer", question.clone()).await;
    assert_eq!(status, 200, "{}", first);
    assert_eq!(first["answer"], "See Leave-Policy.md.");
    assert_eq!(first["cached"], false);

    let (_, second) = post(&server.base, "/answer", question.clone()).await;
    assert_eq!(second["cached"], true);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let (status, stats) = get(&server.base, "/cache/stats").await;
    assert_eq!(status, 200);
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["hits"], 1);

    let resp = reqwest::Client::new()
        .delete(format!("{}/cache?role=executive", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], 0);

    let resp = reqwest::Client::new()
        .delete(format!("{}/cache?role=employee", server.base))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], 1);

    let (_, third) = post(&server.base, "/answer", question).await;
    assert_eq!(third["cached"], false);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_forced_refresh_and_rebuild() {
    let generator = Arc::new(CountingGenerator::default());
    let server = start(generator.clone()).await;
    let question = json!({"query": "How do I apply for leave?", "role": "employee"});

    let (status, _) = post(&server.base, "/answer", question.clone()).await;
    assert_eq!(status, 200);
    server.store.reset_counters();

    let (status, body) = post(&server.base, "/refresh/employee?force=true", json!({})).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["added"].as_array().unwrap().len(), 2);
    assert_eq!(body["index_rebuilt"], true);
    assert_eq!(server.store.total_fetches(), 2);

    let (_, stats) = get(&server.base, "/cache/stats").await;
    assert_eq!(stats["entries"], 0);

    let (_, answer) = post(&server.base, "/answer", question).await;
    assert_eq!(answer["cached"], false);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

    server.store.reset_counters();
    let (status, body) = post(&server.base, "/rebuild/employee", json!({})).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["documents"], 2);
    assert_eq!(body["cleared_responses"], 1);
    assert_eq!(server.store.total_fetches(), 0);

    let (status, body) = post(&server.base, "/rebuild/contractor", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}
