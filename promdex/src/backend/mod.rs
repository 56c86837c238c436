//! The seam between the translation core and a document search engine.
//!
//! The bulk writer and the paginated reader only ever talk to a
//! [`SearchBackend`]. Two implementations exist:
//!
//! - [`ElasticClient`] - Elasticsearch over its REST API
//! - [`MemoryBackend`] - an in-process engine for development and tests
//!
//! All operations are blocking. Implementations must be shareable across
//! the bulk writer's worker threads.

use std::time::Duration;

use serde_json::Value;

use crate::error::BackendError;
use crate::model::FlatDocument;
use crate::query::BackendQuery;

pub mod elastic;
pub mod memory;

pub use elastic::ElasticClient;
pub use memory::MemoryBackend;

/// Outcome of indexing one document inside a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    /// Per-item HTTP status.
    pub status: u16,
    /// Backend result keyword (`created`, `updated`, ...), if any.
    pub result: Option<String>,
    /// Error description for rejected items.
    pub error: Option<String>,
}

impl BulkItem {
    /// A successfully created document.
    pub fn created() -> Self {
        Self {
            status: 201,
            result: Some("created".to_string()),
            error: None,
        }
    }

    /// A rejected document.
    pub fn rejected(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Returns true if the item was accepted.
    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Response to one bulk request; items are in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// Per-document outcomes.
    pub items: Vec<BulkItem>,
}

/// One page of a scroll (cursor) search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    /// Cursor to fetch the next page with, if the backend kept one open.
    pub scroll_id: Option<String>,
    /// Total number of documents matching the query.
    pub total: u64,
    /// Documents on this page.
    pub hits: Vec<FlatDocument>,
}

/// Operations the adapter needs from a document search engine.
pub trait SearchBackend: Send + Sync {
    /// Creates the target collection with `mapping` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the existence check, creation or mapping
    /// update fails.
    fn ensure_collection(&self, mapping: &Value) -> Result<(), BackendError>;

    /// Indexes `documents` in a single bulk request.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the request as a whole fails. Individual
    /// document rejections are reported in the response instead.
    fn bulk_index(&self, documents: &[FlatDocument]) -> Result<BulkResponse, BackendError>;

    /// Runs `query` and opens a cursor, returning the first page sorted by
    /// timestamp ascending.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the search fails.
    fn open_scroll(
        &self,
        query: &BackendQuery,
        page_size: usize,
        keep_alive: Duration,
    ) -> Result<ScrollPage, BackendError>;

    /// Fetches the next page of an open cursor and renews its lease.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the cursor expired or the request failed.
    fn next_page(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage, BackendError>;

    /// Releases an open cursor.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the release request fails.
    fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError>;
}

/// Formats a keep-alive as an Elasticsearch time unit (whole seconds, at
/// least one).
pub fn keep_alive_param(keep_alive: Duration) -> String {
    format!("{}s", keep_alive.as_secs().max(1))
}
