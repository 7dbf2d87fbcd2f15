//! API key verification for inbound calls

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod bloom;
mod error;
pub mod key;
mod verifier;

pub use bloom::BloomFilter;
pub use error::AuthError;
pub use verifier::{KeyVerifier, VerifierOptions};
