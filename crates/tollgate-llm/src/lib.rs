//! OpenAI-compatible chat completion forwarding with metering
//!
//! Usage comes from the upstream's own report when present, otherwise from a
//! local tokenizer over the request messages and the emitted text.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
pub mod handler;
pub mod image;
mod pipeline;
pub mod protocol;
pub mod tokenizer;
pub mod usage;

pub use error::LlmError;
pub use handler::chat_router;
pub use pipeline::{ChatPipeline, ChatReply, ReplyStream};
