//! Local token estimates for upstreams that report no usage

use std::sync::LazyLock;

use tiktoken_rs::{CoreBPE, o200k_base};

use crate::image::image_tokens;
use crate::protocol::{ChatRequest, ContentPart, MessageContent};

/// Framing tokens around every message
const TOKENS_PER_MESSAGE: u64 = 3;
/// Extra token when a message carries a participant name
const TOKENS_PER_NAME: u64 = 1;
/// Tokens priming the assistant reply
const REPLY_PRIMING: u64 = 3;

static ENCODER: LazyLock<Result<CoreBPE, String>> = LazyLock::new(|| o200k_base().map_err(|e| e.to_string()));

/// Tokenizer could not be loaded
#[derive(Debug, Clone, thiserror::Error)]
#[error("tokenizer unavailable: {0}")]
pub struct TokenizerError(String);

fn encoder() -> Result<&'static CoreBPE, TokenizerError> {
    ENCODER.as_ref().map_err(|e| TokenizerError(e.clone()))
}

/// Token count of plain text
pub fn count_text(text: &str) -> Result<u64, TokenizerError> {
    if text.is_empty() {
        return Ok(0);
    }
    Ok(encoder()?.encode_with_special_tokens(text).len() as u64)
}

/// Prompt tokens of a request: per-message overhead plus every metered field
pub fn count_request(request: &ChatRequest) -> Result<u64, TokenizerError> {
    let mut total = REPLY_PRIMING;

    for message in &request.messages {
        total += TOKENS_PER_MESSAGE + count_text(&message.role)?;

        if let Some(name) = &message.name {
            total += TOKENS_PER_NAME + count_text(name)?;
        }

        match &message.content {
            Some(MessageContent::Text(text)) => total += count_text(text)?,
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    total += match part {
                        ContentPart::Text { text } => count_text(text)?,
                        ContentPart::ImageUrl { image_url } => {
                            image_tokens(&image_url.url, image_url.detail.as_deref())
                        }
                        ContentPart::Unknown => 0,
                    };
                }
            }
            None => {}
        }

        for call in &message.tool_calls {
            if let Some(function) = &call.function {
                total += count_text(&function.name)? + count_text(&function.arguments)?;
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: serde_json::Value) -> ChatRequest {
        serde_json::from_value(serde_json::json!({"model": "m", "messages": messages})).unwrap()
    }

    #[test]
    fn empty_text_is_free() {
        assert_eq!(count_text("").unwrap(), 0);
    }

    #[test]
    fn text_counts_are_positive() {
        let n = count_text("The quick brown fox jumps over the lazy dog").unwrap();
        assert!((5..=15).contains(&n), "unexpected count {n}");
    }

    #[test]
    fn message_overhead_is_applied() {
        let role_tokens = count_text("user").unwrap();
        let hello = count_text("hello").unwrap();

        let single = count_request(&request(serde_json::json!([{"role": "user", "content": "hello"}]))).unwrap();
        assert_eq!(single, REPLY_PRIMING + TOKENS_PER_MESSAGE + role_tokens + hello);

        let named = count_request(&request(serde_json::json!([
            {"role": "user", "content": "hello", "name": "bob"}
        ])))
        .unwrap();
        assert_eq!(named, single + TOKENS_PER_NAME + count_text("bob").unwrap());
    }

    #[test]
    fn images_add_block_tokens() {
        let text_only = count_request(&request(serde_json::json!([
            {"role": "user", "content": [{"type": "text", "text": "look"}]}
        ])))
        .unwrap();
        let with_image = count_request(&request(serde_json::json!([
            {"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png", "detail": "low"}}
            ]}
        ])))
        .unwrap();

        assert_eq!(with_image - text_only, crate::image::BASE_TOKENS);
    }
}
