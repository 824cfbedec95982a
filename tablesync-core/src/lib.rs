//! Schema-aware replication and incremental load engine.
//!
//! Tables are copied from a MySQL source into a MySQL replication copy with
//! an exact structural replica, then loaded into a PostgreSQL analytics store
//! either in full or incrementally from a recorded watermark. Structural
//! drift is detected through fingerprints of the normalized table definition
//! and always forces a full rebuild.
//!
//! # Architecture
//! Data flows strictly downstream:
//! - [`pipeline::Pipeline`] groups tables by importance tier
//! - [`pipeline::TableProcessor`] runs extract and load for one table
//! - [`replicator::ExactReplicator`] and [`analytics::AnalyticsLoader`] do the copying
//! - [`schema::SchemaDiscovery`] reads and fingerprints structure
//! - [`connection::ConnectionManager`] owns one retried, rate-limited connection
//!
//! Every component takes its configuration and connections through its
//! constructor; the crate holds no global state.

pub mod analytics;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod replicator;
pub mod schema;
pub mod sql;
pub mod value;

// Re-export commonly used types
pub use analytics::{AnalyticsLoader, LoadOutcome, LoadRecord, LoadStatus};
pub use config::{
    DatabaseRole, DatabaseSettings, DatabasesConfig, Environment, ExtractionStrategy,
    PipelineConfig, PoolSettings, SyncSettings, TableConfig, TableImportance,
};
pub use connection::{ConnectionFactory, ConnectionManager, RetryPolicy};
pub use error::{ReplicationError, Result};
pub use pipeline::{Pipeline, PipelineReport, TableOutcome, TableProcessor, TierResult};
pub use replicator::{ExactReplicator, ReplicationOutcome};
pub use schema::{SchemaDiscovery, TableSchema};
pub use value::CellValue;
