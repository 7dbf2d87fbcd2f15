mod harness;

use std::time::Duration;

use futures_util::StreamExt;
use harness::config::ConfigBuilder;
use harness::mock_upstream::{MockUpstream, STREAM_CHUNKS};
use harness::server::{CHAT_MODEL, TestServer, dec, endpoint, seeded_store};
use tollgate_store::{CallStatus, CallStore, Provider};

fn streaming_body() -> serde_json::Value {
    serde_json::json!({
        "model": CHAT_MODEL,
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    })
}

async fn start(mock: &MockUpstream) -> TestServer {
    let store = seeded_store();
    store.set_upstreams(vec![endpoint(1, Provider::OpenAi, &mock.base_url())]);
    TestServer::start(ConfigBuilder::new().build(), store).await.unwrap()
}

/// Parse SSE event lines from raw response text
fn parse_sse_data(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_owned)
        .collect()
}

#[tokio::test]
async fn stream_is_relayed_and_billed_from_usage_chunk() {
    let mock = MockUpstream::start().await.unwrap();
    let server = start(&mock).await;

    let resp = server
        .post("/v1/chat/completions")
        .json(&streaming_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_owned();
    assert!(content_type.contains("text/event-stream"), "got {content_type}");
    assert!(resp.headers().contains_key("x-business-id"));

    let text = resp.text().await.unwrap();
    let events = parse_sse_data(&text);
    assert_eq!(events.len(), STREAM_CHUNKS + 2);
    assert_eq!(events.last().map(String::as_str), Some("[DONE]"));

    let transactions = server.wait_for_transactions(1).await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, dec("0.00005"));

    let record = server
        .store()
        .call_record(transactions[0].business_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CallStatus::Succeeded);
}

#[tokio::test]
async fn disconnected_caller_is_billed_once_for_the_full_stream() {
    let mock = MockUpstream::start_slow_stream(Duration::from_millis(50)).await.unwrap();
    let server = start(&mock).await;

    let resp = server
        .post("/v1/chat/completions")
        .json(&streaming_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut body = resp.bytes_stream();
    let mut received = 0;
    while received < 2 {
        match body.next().await {
            Some(Ok(_)) => received += 1,
            _ => break,
        }
    }
    drop(body);

    let transactions = server.wait_for_transactions(1).await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, dec("0.00005"));

    // no second row appears once the drain task is done
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.store().transactions().len(), 1);
}

#[tokio::test]
async fn stream_past_its_deadline_is_cut_and_not_charged() {
    let mock = MockUpstream::start_slow_stream(Duration::from_millis(1500)).await.unwrap();
    let store = seeded_store();
    store.set_upstreams(vec![endpoint(1, Provider::OpenAi, &mock.base_url())]);
    let config = ConfigBuilder::new().with_timeouts(1, 2).build();
    let server = TestServer::start(config, store).await.unwrap();

    let resp = server
        .post("/v1/chat/completions")
        .json(&streaming_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut body = resp.bytes_stream();
    let mut chunks = 0;
    let mut aborted = false;
    while let Some(item) = body.next().await {
        match item {
            Ok(_) => chunks += 1,
            Err(_) => {
                aborted = true;
                break;
            }
        }
    }
    assert!(aborted, "a timed out stream must not end cleanly");
    assert!(chunks < STREAM_CHUNKS);

    let transactions = server.wait_for_transactions(1).await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, dec("0"));

    let business_id = transactions[0].business_id;
    let record = server.store().call_record(business_id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Failed);
    assert!(record.no_charge);
    let detail = server.store().call_detail(business_id).await.unwrap().unwrap();
    assert!(detail.upstream_errors[0].message.contains("deadline"));
}
