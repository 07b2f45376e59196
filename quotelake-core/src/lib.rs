//! QuoteLake Core: the components the pipeline coordinator sequences.
//!
//! This crate contains every stage of the ingest-to-table pipeline:
//! - Domain types (raw observations, flattened rows)
//! - Record fetcher over the external price API
//! - Durable, append-only buffer with at-least-once submission
//! - Query engine trait with status polling and cancellation
//! - Schema-on-read catalog and the table lifecycle manager
//! - Batch transformer (flatten, de-duplicate, materialize to Parquet)
//! - Quality validator running invariant count queries

pub mod buffer;
pub mod catalog;
pub mod domain;
pub mod engine;
pub mod fetch;
pub mod fsutil;
pub mod schema;
pub mod transform;
pub mod validate;
