//! Durable records behind repository traits
//!
//! [`MemoryStore`] serves development and tests; [`PgStore`] is the
//! production backend. Both honour the same transactional contracts.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
mod memory;
mod model;
mod pg;
mod repo;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::*;
pub use pg::PgStore;
pub use repo::{CallStore, CatalogStore, KeyStore, LedgerStore, Store, StoreHandles};
