mod harness;

use harness::config::{ConfigBuilder, INTERNAL_SECRET};
use harness::mock_upstream::MockUpstream;
use harness::server::{API_KEY, CHAT_MODEL, TestServer, endpoint, seeded_store};
use tollgate_auth::key::hash_key;
use tollgate_store::Provider;

fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "model": CHAT_MODEL,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

async fn start(mock: &MockUpstream) -> TestServer {
    let store = seeded_store();
    store.set_upstreams(vec![endpoint(1, Provider::OpenAi, &mock.base_url())]);
    TestServer::start(ConfigBuilder::new().build(), store).await.unwrap()
}

#[tokio::test]
async fn malformed_key_is_rejected() {
    let mock = MockUpstream::start().await.unwrap();
    let server = start(&mock).await;

    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .bearer_auth("sk-short")
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(mock.chat_requests(), 0);
}

#[tokio::test]
async fn unknown_key_never_reaches_the_store() {
    let mock = MockUpstream::start().await.unwrap();
    let server = start(&mock).await;
    let lookups = server.store().key_lookups();

    let unknown = API_KEY.replace('0', "9");
    let resp = server
        .client()
        .post(server.url("/v1/chat/completions"))
        .bearer_auth(unknown)
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    assert_eq!(server.store().key_lookups(), lookups);
}

#[tokio::test]
async fn revoked_key_is_rejected_after_invalidation() {
    let mock = MockUpstream::start().await.unwrap();
    let server = start(&mock).await;

    let resp = server.post("/v1/chat/completions").json(&chat_body()).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    // the verification result is cached by a background write
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    server.store().deactivate_key(&hash_key(API_KEY));
    let resp = server.post("/v1/chat/completions").json(&chat_body()).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server
        .client()
        .post(server.url("/internal/invalidate-key"))
        .header("x-internal-secret", INTERNAL_SECRET)
        .json(&serde_json::json!({"key_hash": hash_key(API_KEY)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server.post("/v1/chat/completions").json(&chat_body()).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}
