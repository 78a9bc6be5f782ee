//! # trackpipe
//!
//! **A streaming transform-and-load pipeline for music track datasets.**
//!
//! Raw delimited files land in object storage. trackpipe normalizes and
//! enriches them in one streaming pass, loads the result into SQLite in
//! bounded batched transactions, and serves a fixed set of parameterized
//! analytical queries over the loaded tracks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  transform  ┌────────────┐   load   ┌──────────┐
//! │ raw bucket │────────────▶│ transformed│─────────▶│  SQLite  │
//! │  (CSV)     │             │  bucket    │ batches  │  tracks  │
//! └────────────┘             └────────────┘          └────┬─────┘
//!                                                         │ query
//!                                     ┌───────────────────┤
//!                                     ▼                   ▼
//!                                ┌──────────┐       ┌──────────┐
//!                                │   CLI    │       │   HTTP   │
//!                                └──────────┘       └──────────┘
//! ```
//!
//! The pure pipeline stages live in [`trackpipe_core`]; this crate adds
//! object storage, the SQLite store, the batch loader, and the CLI/HTTP
//! surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, environment overrides, validation |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Idempotent schema creation |
//! | [`sqlite_store`] | `Store` implementation over `sqlx` |
//! | [`object_store`] | Local-directory and S3 (SigV4) object backends |
//! | [`event`] | Invocation event parsing (`{bucket, key}`, S3 notifications) |
//! | [`transform`] | Transform command: raw object → transformed object |
//! | [`load`] | Batch loader state machine and load command |
//! | [`query`] | Query dispatcher |
//! | [`stats`] | Store statistics and load progress |
//! | [`server`] | HTTP invocation gateway (Axum) with CORS |

pub mod config;
pub mod db;
pub mod event;
pub mod load;
pub mod migrate;
pub mod object_store;
pub mod query;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod transform;

pub use trackpipe_core::store;
