//! # trackpipe core
//!
//! Runtime-free logic for trackpipe: data models, the streaming record
//! source, schema normalizer, feature engine, record sink, transform driver,
//! query validation, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. Every
//! stage works over `std::io` readers and writers, so the same code runs
//! against local files, object-store downloads, and in-memory buffers.
//!
//! ```text
//! RecordSource ─▶ Normalizer ─▶ FeatureEngine ─▶ RecordSink      (transform)
//! RecordSource ─▶ batch loader (trackpipe crate) ─▶ Store       (load)
//! QueryRequest ─▶ validate ─▶ ValidatedQuery ─▶ Store          (query)
//! ```

pub mod error;
pub mod features;
pub mod models;
pub mod normalize;
pub mod query;
pub mod sink;
pub mod source;
pub mod store;
pub mod transform;
