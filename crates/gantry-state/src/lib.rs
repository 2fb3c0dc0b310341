//! gantry-state — embedded state store for Gantry.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for the version registry, routes, deployment records,
//! and the append-only transition history.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Monotonic identifiers come from counters in a `meta` table, bumped in the
//! same write transaction that inserts the row. Route writes are
//! compare-and-swap on the route's `revision` token: a stale token aborts
//! the transaction with `StateError::ConcurrentModification` and nothing is
//! mutated.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
