use std::convert::Infallible;
use std::pin::pin;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tollgate_billing::ChatUsage;

use crate::protocol::{ChatChunk, ChatRequest, WireUsage};
use crate::tokenizer::{TokenizerError, count_request, count_text};

/// What a buffered SSE body said
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Concatenated delta text of every chunk
    pub text: String,
    /// Usage from the final chunk, when the upstream sent one
    pub usage: Option<WireUsage>,
    /// Error event sent in place of a chunk
    pub error: Option<String>,
    /// Chunks that parsed as completion data; error events are not counted
    pub events: usize,
}

/// Parse a complete or truncated SSE body
pub async fn summarize_stream(body: Bytes) -> StreamSummary {
    let mut events = pin!(futures_util::stream::once(async move { Ok::<_, Infallible>(body) }).eventsource());
    let mut summary = StreamSummary::default();

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                summary.error = Some(e.to_string());
                break;
            }
        };

        if event.data == "[DONE]" {
            break;
        }

        match serde_json::from_str::<serde_json::Value>(&event.data) {
            Ok(value) if value.get("error").is_some() => {
                summary.error = Some(value["error"].to_string());
            }
            Ok(value) => {
                let chunk: ChatChunk = serde_json::from_value(value).unwrap_or_default();
                summary.events += 1;
                for choice in &chunk.choices {
                    if let Some(content) = &choice.delta.content {
                        summary.text.push_str(content);
                    }
                }
                if chunk.usage.is_some() {
                    summary.usage = chunk.usage;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream event");
            }
        }
    }

    summary
}

/// Usage to bill: the upstream's own report when present, else a local count
pub fn resolve_usage(
    reported: Option<WireUsage>,
    request: &ChatRequest,
    response_text: &str,
) -> Result<ChatUsage, TokenizerError> {
    if let Some(usage) = reported {
        return Ok(ChatUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        });
    }

    Ok(ChatUsage {
        input_tokens: count_request(request)?,
        output_tokens: count_text(response_text)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(events: &[&str]) -> Bytes {
        let mut body = String::new();
        for event in events {
            body.push_str("data: ");
            body.push_str(event);
            body.push_str("\n\n");
        }
        Bytes::from(body)
    }

    fn request() -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn collects_text_and_final_usage() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#,
            "[DONE]",
        ]);

        let summary = summarize_stream(body).await;

        assert_eq!(summary.text, "Hello");
        assert_eq!(summary.events, 4);
        assert_eq!(
            summary.usage,
            Some(WireUsage {
                prompt_tokens: 9,
                completion_tokens: 2
            })
        );
        assert_eq!(summary.error, None);
    }

    #[tokio::test]
    async fn truncated_body_keeps_complete_events() {
        let mut body = sse(&[r#"{"choices":[{"delta":{"content":"par"}}]}"#]).to_vec();
        body.extend_from_slice(br#"data: {"choices":[{"delta":{"content":"ti"#);

        let summary = summarize_stream(Bytes::from(body)).await;

        assert_eq!(summary.text, "par");
        assert_eq!(summary.usage, None);
    }

    #[tokio::test]
    async fn error_events_are_reported() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            r#"{"error":{"message":"overloaded"}}"#,
        ]);

        let summary = summarize_stream(body).await;

        assert_eq!(summary.text, "a");
        assert_eq!(summary.events, 1);
        assert!(summary.error.unwrap().contains("overloaded"));
    }

    #[tokio::test]
    async fn error_only_stream_has_no_chunks() {
        let summary = summarize_stream(sse(&[r#"{"error":{"message":"overloaded"}}"#])).await;

        assert_eq!(summary.events, 0);
        assert!(summary.error.is_some());
    }

    #[test]
    fn reported_usage_wins() {
        let usage = resolve_usage(
            Some(WireUsage {
                prompt_tokens: 100,
                completion_tokens: 7,
            }),
            &request(),
            "ignored",
        )
        .unwrap();

        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn missing_usage_falls_back_to_tokenizer() {
        let usage = resolve_usage(None, &request(), "Hello there").unwrap();

        assert_eq!(usage.input_tokens, count_request(&request()).unwrap());
        assert_eq!(usage.output_tokens, count_text("Hello there").unwrap());
        assert!(usage.output_tokens > 0);
    }
}
