//! Error types for the promdex remote storage adapter.

use thiserror::Error;

/// The main error type for all promdex operations.
///
/// Each variant wraps the error enum of one concern: startup configuration,
/// the wire envelope, matcher translation, backend I/O, paginated search and
/// bulk indexing.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error decoding or encoding a protocol envelope.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Error translating label matchers into a backend query.
    #[error("matcher error: {0}")]
    Matcher(#[from] MatcherError),

    /// Error talking to the search backend.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Error during a paginated search (read path).
    #[error("search error: {0}")]
    Search(#[from] SearchError),

    /// Error during bulk indexing (write path).
    #[error("bulk error: {0}")]
    Bulk(#[from] BulkError),
}

/// Errors that can occur when loading or validating the adapter configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The configuration file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for the expected shape.
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// The configuration file path.
        path: std::path::PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The mapping file exists but could not be read.
    #[error("failed to read mapping file '{}': {source}", path.display())]
    MappingRead {
        /// The mapping file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The mapping file is not valid JSON.
    #[error("failed to parse mapping file '{}': {source}", path.display())]
    MappingParse {
        /// The mapping file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A backend node entry is malformed.
    #[error("invalid node {node}: {reason}")]
    InvalidNode {
        /// The offending node as written in the configuration.
        node: String,
        /// Why the node is invalid.
        reason: String,
    },

    /// A numeric or duration setting is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The configuration key.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },
}

/// Errors that can occur while decoding or encoding a snappy-compressed
/// protobuf envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// The body is not valid snappy block data.
    #[error("failed to decompress body: {source}")]
    Decompress {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// The decompressed body is not a valid protobuf message.
    #[error("failed to decode protobuf message: {source}")]
    Decode {
        /// The protobuf decoding error.
        #[source]
        source: prost::DecodeError,
    },

    /// Failed to serialize a message to protobuf.
    #[error("failed to encode protobuf message: {source}")]
    Encode {
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },

    /// Failed to compress an outgoing body.
    #[error("failed to compress body: {source}")]
    Compress {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },
}

/// Errors that can occur while translating label matchers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    /// The matcher operator is not one of EQ, NEQ, RE, NRE.
    #[error("unsupported matcher type {operator} on label '{label}'")]
    UnsupportedMatcher {
        /// The raw operator value received on the wire.
        operator: i32,
        /// The label the matcher applies to.
        label: String,
    },
}

/// Errors reported by a search backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Failed to create the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Every configured node failed at the transport level.
    #[error("request to {url} failed: {source}")]
    Request {
        /// The last URL attempted.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The backend response body could not be interpreted.
    #[error("malformed backend response: {reason}")]
    MalformedResponse {
        /// What was wrong with the response.
        reason: String,
    },

    /// A request body could not be serialized.
    #[error("failed to serialize request body: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The backend did not acknowledge an administrative operation.
    #[error("{operation} was not acknowledged")]
    NotAcknowledged {
        /// The operation that was not acknowledged.
        operation: &'static str,
    },

    /// The referenced scroll cursor does not exist or has expired.
    #[error("scroll cursor '{scroll_id}' not found")]
    ScrollNotFound {
        /// The scroll identifier.
        scroll_id: String,
    },

    /// The backend rejected the request.
    #[error("request rejected: {reason}")]
    Rejected {
        /// Why the request was rejected.
        reason: String,
    },
}

/// Errors that can occur during a paginated search.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Fetching one page of results failed.
    #[error("page {page} failed: {source}")]
    PageFailed {
        /// The 1-based page number.
        page: usize,
        /// The backend error.
        #[source]
        source: BackendError,
    },

    /// The page size is zero.
    #[error("page size must be greater than zero")]
    ZeroPageSize,
}

/// Errors that can occur during bulk indexing.
#[derive(Error, Debug)]
pub enum BulkError {
    /// A bulk worker thread could not be spawned.
    #[error("failed to spawn bulk worker {worker}: {source}")]
    WorkerSpawn {
        /// The worker index.
        worker: usize,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Every bulk worker stopped draining the submission queue.
    #[error("bulk workers are no longer running")]
    WorkerGone,

    /// A commit failed at the backend level after all retries.
    #[error("commit {execution_id} failed: {source}")]
    CommitFailed {
        /// The commit sequence number within the session.
        execution_id: u64,
        /// The backend error.
        #[source]
        source: BackendError,
    },

    /// Some documents were rejected individually by the backend.
    #[error("{failed} of {total} documents were rejected")]
    ItemsRejected {
        /// Number of rejected documents.
        failed: u64,
        /// Number of documents submitted.
        total: u64,
    },

    /// The worker count is zero.
    #[error("bulk worker count must be greater than zero")]
    NoWorkers,
}

/// Type alias for `Result<T, AdapterError>`.
pub type Result<T> = std::result::Result<T, AdapterError>;
