//! Configuration types for the sync pipeline.
//!
//! This module contains the configuration structures handed to every
//! component at construction time:
//! - `DatabasesConfig`: connection settings per database role
//! - `SyncSettings`: batch sizes, retry policy and orchestration knobs
//! - `TableConfig`: per-table extraction settings and importance tier
//! - `PipelineConfig`: the three above, loaded from one JSON document
//!
//! Nothing in the core reads configuration implicitly; callers construct
//! these once and pass them by reference.

mod connection;
mod pipeline;
mod sync;
mod table;

pub use connection::{DatabaseRole, DatabaseSettings, DatabasesConfig, PoolSettings};
pub use pipeline::PipelineConfig;
pub use sync::{Environment, SyncSettings};
pub use table::{ExtractionStrategy, TableConfig, TableImportance};
