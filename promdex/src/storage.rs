//! The storage façade consumed by the HTTP layer.
//!
//! A [`Storage`] only exists once its backend has been connected and the
//! target index ensured, so there is no way to write or read through an
//! uninitialized one. It is built once at startup and shared for the life
//! of the process.

use std::fmt;
use std::time::Instant;

use crate::backend::{ElasticClient, MemoryBackend, SearchBackend};
use crate::bulk::{self, BulkConfig, BulkStats};
use crate::codec;
use crate::config::AdapterConfig;
use crate::error::Result;
use crate::proto::{Query, QueryResult, TimeSeries};
use crate::query;
use crate::search::{self, SearchOptions};

/// The remote-storage capability: write series, answer read queries.
pub trait RemoteStorage: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &'static str;

    /// Indexes every sample of `series`.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Bulk` if any commit failed or any document was
    /// rejected. Documents committed before the failure are kept.
    fn write(&self, series: &[TimeSeries]) -> Result<BulkStats>;

    /// Answers `queries` in input order.
    ///
    /// A query that fails, or matches nothing, has no entry in the result;
    /// the batch itself does not fail.
    ///
    /// # Errors
    ///
    /// Reserved for failures that affect the whole batch.
    fn read(&self, queries: &[Query]) -> Result<Vec<QueryResult>>;
}

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Elasticsearch over REST.
    #[default]
    Elasticsearch,
    /// In-process memory backend.
    Memory,
}

impl BackendKind {
    /// Adapter name reported in logs.
    pub fn adapter_name(self) -> &'static str {
        match self {
            Self::Elasticsearch => "ElasticSearch",
            Self::Memory => "Memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Elasticsearch => "elasticsearch",
            Self::Memory => "memory",
        })
    }
}

/// Remote storage on top of any [`SearchBackend`].
#[derive(Debug)]
pub struct DocumentStorage<B> {
    backend: B,
    bulk: BulkConfig,
    search: SearchOptions,
}

impl<B: SearchBackend> DocumentStorage<B> {
    /// Wraps an already initialized backend.
    pub fn new(backend: B, bulk: BulkConfig, search: SearchOptions) -> Self {
        Self {
            backend,
            bulk,
            search,
        }
    }

    /// Ensures the target index with the configured mapping, then wraps
    /// `backend`.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Config` if the mapping cannot be loaded, or
    /// `AdapterError::Backend` if the index cannot be ensured.
    pub fn init(backend: B, config: &AdapterConfig) -> Result<Self> {
        let mapping = config.load_mapping()?;
        backend.ensure_collection(&mapping)?;
        Ok(Self::new(
            backend,
            BulkConfig::from_config(config),
            SearchOptions::from_config(config)?,
        ))
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Bulk session tuning.
    pub fn bulk_config(&self) -> &BulkConfig {
        &self.bulk
    }

    /// Pagination parameters.
    pub fn search_options(&self) -> &SearchOptions {
        &self.search
    }

    fn write_series(&self, series: &[TimeSeries]) -> Result<BulkStats> {
        Ok(bulk::write(&self.backend, &self.bulk, series)?)
    }

    fn read_queries(&self, queries: &[Query]) -> Vec<QueryResult> {
        queries
            .iter()
            .enumerate()
            .filter_map(|(index, query)| self.read_query(index, query))
            .collect()
    }

    /// Runs one query, logging and swallowing its failure.
    fn read_query(&self, query_index: usize, query: &Query) -> Option<QueryResult> {
        let started = Instant::now();
        tracing::info!(
            query_index,
            start_ms = query.start_timestamp_ms,
            end_ms = query.end_timestamp_ms,
            matchers = query.matchers.len(),
            "query start"
        );
        if let Some(hints) = &query.hints {
            // informational only; results are never downsampled
            tracing::debug!(
                query_index,
                step_ms = hints.step_ms,
                func = %hints.func,
                range_ms = hints.range_ms,
                grouping = ?hints.grouping,
                by = hints.by,
                "read hints"
            );
        }

        let translated = match query::build(
            &query.matchers,
            query.start_timestamp_ms,
            query.end_timestamp_ms,
        ) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(query_index, error = %e, "query skipped");
                return None;
            }
        };

        let documents = match search::search(&self.backend, &translated, &self.search) {
            Ok(Some(documents)) => documents,
            Ok(None) => {
                tracing::info!(
                    query_index,
                    elapsed_ms = started.elapsed().as_millis(),
                    "query end, no matches"
                );
                return None;
            }
            Err(e) => {
                tracing::warn!(query_index, error = %e, "query failed");
                return None;
            }
        };

        let timeseries = codec::reassemble(&documents);
        tracing::info!(
            query_index,
            series = timeseries.len(),
            samples = documents.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "query end"
        );
        Some(QueryResult { timeseries })
    }
}

impl RemoteStorage for DocumentStorage<ElasticClient> {
    fn name(&self) -> &'static str {
        BackendKind::Elasticsearch.adapter_name()
    }

    fn write(&self, series: &[TimeSeries]) -> Result<BulkStats> {
        self.write_series(series)
    }

    fn read(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        Ok(self.read_queries(queries))
    }
}

impl RemoteStorage for DocumentStorage<MemoryBackend> {
    fn name(&self) -> &'static str {
        BackendKind::Memory.adapter_name()
    }

    fn write(&self, series: &[TimeSeries]) -> Result<BulkStats> {
        self.write_series(series)
    }

    fn read(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        Ok(self.read_queries(queries))
    }
}

/// The process-wide storage, selected at startup.
#[derive(Debug)]
pub enum Storage {
    /// Backed by an Elasticsearch cluster.
    Elasticsearch(DocumentStorage<ElasticClient>),
    /// Backed by process memory.
    Memory(DocumentStorage<MemoryBackend>),
}

impl Storage {
    /// Connects the selected backend and ensures the target index.
    ///
    /// Blocking; must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError` if the configuration is invalid or the
    /// backend cannot be reached. Both are fatal at startup.
    pub fn init(kind: BackendKind, config: &AdapterConfig) -> Result<Self> {
        config.validate()?;
        config.log_summary();

        let storage = match kind {
            BackendKind::Elasticsearch => {
                Self::Elasticsearch(DocumentStorage::init(ElasticClient::new(config)?, config)?)
            }
            BackendKind::Memory => {
                Self::Memory(DocumentStorage::init(MemoryBackend::new(), config)?)
            }
        };
        tracing::info!(adapter = storage.name(), "storage initialized");
        Ok(storage)
    }

    /// The selected backend kind.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Elasticsearch(_) => BackendKind::Elasticsearch,
            Self::Memory(_) => BackendKind::Memory,
        }
    }
}

impl RemoteStorage for Storage {
    fn name(&self) -> &'static str {
        self.kind().adapter_name()
    }

    fn write(&self, series: &[TimeSeries]) -> Result<BulkStats> {
        match self {
            Self::Elasticsearch(s) => s.write(series),
            Self::Memory(s) => s.write(series),
        }
    }

    fn read(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        match self {
            Self::Elasticsearch(s) => s.read(queries),
            Self::Memory(s) => s.read(queries),
        }
    }
}
