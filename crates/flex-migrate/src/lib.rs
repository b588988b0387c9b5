//! # flex-migrate
//!
//! Streaming, resumable migration engine for loosely structured sources.
//!
//! This library ingests tabular text, hierarchical markup and relational dump
//! scripts, and provides:
//!
//! - **Streaming decoders** that never load a whole source into memory
//! - **Schema inference** from a bounded sample, producing a [`SchemaDescriptor`]
//! - **Adaptive batching** driven by a memory governor
//! - **Resume capability** via signed checkpoints
//! - **Retry and partial-failure handling** with a failure-ratio circuit breaker
//! - **Reversible writes** through an operation rollback log
//! - **Throttled progress** snapshots with throughput and ETA
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use flex_migrate::decoder::open_path;
//! use flex_migrate::{BatchExecutor, Config, Record, RecordProcessor, Operation, SchemaAnalyzer};
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl RecordProcessor for Print {
//!     async fn process(&self, record: Record) -> flex_migrate::Result<Vec<Operation>> {
//!         println!("{}", record.to_json());
//!         Ok(Vec::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> flex_migrate::Result<()> {
//!     let config = Config::load("migrate.yaml")?.with_auto_tuning();
//!
//!     let mut sample = open_path(Path::new("users.csv"), None, &config.decoder)?;
//!     let schema = SchemaAnalyzer::new(config.analysis.clone()).analyze(&mut sample)?;
//!     println!("{}", schema.to_json()?);
//!
//!     let mut decoder = open_path(Path::new("users.csv"), None, &config.decoder)?;
//!     let mut executor = BatchExecutor::from_config(&config)?;
//!     let report = executor.run(&mut decoder, Arc::new(Print)).await?;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod analyzer;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod memory;
pub mod progress;
pub mod retry;
pub mod rollback;
pub mod telemetry;

// Re-exports for convenient access
pub use analyzer::SchemaAnalyzer;
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use crate::core::{FieldDefinition, PrimitiveType, Provenance, Record, SchemaDescriptor, SourceKind};
pub use decoder::{Decoder, MarkupDecoder, ScriptDecoder, TabularDecoder};
pub use error::{MigrateError, Result};
pub use executor::{BatchExecutor, BatchResult, RecordProcessor, RunReport, RunStatus};
pub use memory::{MemoryGovernor, MemoryState, PressureLevel};
pub use progress::{ProgressAggregator, ProgressSink, ProgressSnapshot};
pub use retry::{ErrorCategory, ErrorClassifier, RetryController};
pub use rollback::{
    InMemoryTarget, MutationTarget, Operation, OperationKind, OperationLog, RollbackReport,
};
pub use telemetry::init_tracing;
