//! Metered speech synthesis and recognition

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
pub mod frame;
pub mod handler;
mod pipeline;
pub mod protocol;
pub mod stream;

pub use error::AudioError;
pub use handler::audio_router;
pub use pipeline::{AudioPipeline, ReplyStream, SpeechReply, TranscriptionReply};
