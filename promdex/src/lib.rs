//! # promdex
//!
//! Prometheus remote storage adapter backed by a document search engine.
//!
//! promdex receives Prometheus remote-write batches, stores every sample as
//! its own document in an Elasticsearch index, and answers remote-read
//! queries by translating label matchers into boolean search queries and
//! regrouping the matching documents into time series.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One flat document per sample: `{labels, value, timestamp}`
//! - Parallel bulk indexing with a byte-size flush threshold per worker
//! - Scroll-based reads with a per-query result cap and guaranteed cursor release
//! - Per-query isolation: a failing query never fails the rest of the batch
//! - Blocking core; the HTTP layer decides how to schedule it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use promdex::{BackendKind, RemoteStorage, Storage, load_config, proto};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("adapter.yaml")?;
//! let storage = Storage::init(BackendKind::Elasticsearch, &config)?;
//!
//! // Write path: body is a snappy-compressed WriteRequest
//! # let body: Vec<u8> = Vec::new();
//! let request = proto::decode_write_request(&body)?;
//! storage.write(&request.timeseries)?;
//!
//! // Read path: answer every query, then encode the response
//! # let body: Vec<u8> = Vec::new();
//! let request = proto::decode_read_request(&body)?;
//! let results = storage.read(&request.queries)?;
//! let encoded = proto::encode_read_response(&proto::ReadResponse { results })?;
//! # let _ = encoded;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Storage`] - Process-wide façade; exists only once initialized
//! - [`RemoteStorage`] - The write/read capability the HTTP layer consumes
//! - [`SearchBackend`] - Seam to the document engine ([`ElasticClient`], [`MemoryBackend`])
//! - [`AdapterConfig`] - YAML configuration with defaults
//!
//! ## Modules
//!
//! - [`proto`] - Remote read/write protobuf messages and snappy envelope
//! - [`model`] - Label sets, fingerprints, flat documents, matchers
//! - [`codec`] - Flattening series into documents and reassembling them
//! - [`query`] - Label matcher to bool query translation
//! - [`search`] - Paginated scroll reads with a result cap
//! - [`bulk`] - Parallel bulk indexing session
//! - [`backend`] - Backend trait and implementations
//! - [`storage`] - The façade
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types

pub mod backend;
pub mod bulk;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod proto;
pub mod query;
pub mod search;
pub mod storage;

// Re-export primary API types at crate root for convenience.
pub use backend::{ElasticClient, MemoryBackend, SearchBackend};
pub use bulk::{BulkConfig, BulkStats};
pub use config::{AdapterConfig, load_config};
pub use error::{AdapterError, Result};
pub use model::{FlatDocument, Fingerprint, LabelSet};
pub use search::SearchOptions;
pub use storage::{BackendKind, DocumentStorage, RemoteStorage, Storage};
