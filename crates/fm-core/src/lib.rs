//! Fuzzermon Core Library
//!
//! This library provides the core functionality for collecting fuzz-test
//! results:
//! - Batch document parsing and entity resolution
//! - Transactional storage in SQLite
//! - Dashboard queries and session display preferences
//! - The HTTP service and its metrics
//!
//! The binary entry point is in `main.rs`.

pub mod batch;
pub mod config;
pub mod exit_codes;
pub mod ingest;
pub mod logging;
pub mod query;
pub mod server;
pub mod session;
pub mod store;

pub use batch::{parse_batch, Batch, BatchEntry, EntryKind};
pub use ingest::{ingest, run_ingest, IngestFailure, IngestReport};
pub use store::Store;
