//! Types shared by every gateway crate

#![allow(clippy::must_use_candidate)]

pub mod best_effort;
mod error;
pub mod headers;
mod id;
mod identity;
mod notify;
mod snapshot;

pub use error::{HttpError, error_body};
pub use id::{BusinessId, InvalidBusinessId};
pub use identity::{CallerIdentity, RequestMeta};
pub use notify::{Alert, LogNotifier, Notifier, WebhookNotifier};
pub use snapshot::Snapshot;
