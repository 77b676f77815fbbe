//! # State Store and Merge Engine
//!
//! Owns the single system-state snapshot and the rules for folding device reports
//! into it.
//!
//! ## Key Abstractions
//! - [`Snapshot`]: immutable value, device fields plus revision, timestamp, online
//! - [`StateStore`]: swaps whole snapshots, readers get an `Arc` and never lock
//! - [`MergeEngine`]: category-scoped, last-writer-wins field overwrite
//!
//! ## Merge Rules
//!
//! ```text
//! (category, {key: value, ..})
//!     │ unknown category          ──► dropped, store untouched
//!     │ value not bool/number     ──► dropped, store untouched
//!     ▼
//! for each key the category knows: snapshot[field(key)] = value
//! revision += 1, timestamp = now
//! ```
//!
//! Reports are applied in arrival order, so a field always holds the value of the
//! last accepted report that carried it, whichever category that report came from.

pub mod merge;
pub mod snapshot;
pub mod store;

pub use merge::{default_categories, CategoryRule, DropReason, MergeEngine, MergeOutcome, OnlinePolicy};
pub use snapshot::{FieldValue, Snapshot};
pub use store::StateStore;
