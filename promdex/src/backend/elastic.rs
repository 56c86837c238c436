//! Elasticsearch backend over the REST API.
//!
//! Requests go to the configured nodes in order: a transport failure moves on
//! to the next node, while any HTTP response (success or not) is final.
//!
//! Endpoints used:
//!
//! | Operation          | Request                                   |
//! |--------------------|-------------------------------------------|
//! | healthcheck        | `GET /`                                   |
//! | ensure_collection  | `HEAD /{index}`, `PUT /{index}`           |
//! | bulk_index         | `POST /_bulk` (NDJSON)                    |
//! | open_scroll        | `POST /{index}/_search?scroll={ttl}`      |
//! | next_page          | `POST /_search/scroll`                    |
//! | clear_scroll       | `DELETE /_search/scroll`                  |

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{BulkItem, BulkResponse, ScrollPage, SearchBackend, keep_alive_param};
use crate::config::AdapterConfig;
use crate::error::BackendError;
use crate::model::FlatDocument;
use crate::query::{BackendQuery, TIMESTAMP_FIELD};

/// A blocking Elasticsearch client bound to one index.
pub struct ElasticClient {
    client: Client,
    nodes: Vec<String>,
    index: String,
    user: String,
    password: String,
}

impl fmt::Debug for ElasticClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticClient")
            .field("nodes", &self.nodes)
            .field("index", &self.index)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ElasticClient {
    /// Builds a client from the adapter configuration. When `healthcheck`
    /// is enabled the cluster is pinged before returning.
    ///
    /// Must not be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the HTTP client cannot be built or the
    /// healthcheck fails.
    pub fn new(config: &AdapterConfig) -> Result<Self, BackendError> {
        let timeout = config.timeout().map_err(|e| BackendError::Rejected {
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::ClientCreate { source: e })?;

        let es = Self {
            client,
            nodes: config.node_urls(),
            index: config.index.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        };

        if config.healthcheck {
            es.healthcheck()?;
        }
        tracing::info!(nodes = ?es.nodes, index = %es.index, "connected to elasticsearch");
        Ok(es)
    }

    /// Target index name.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Pings the cluster root endpoint.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if no node answers successfully.
    pub fn healthcheck(&self) -> Result<(), BackendError> {
        let response = self.send(Method::GET, "/", |r| r)?;
        let body = read_body(response)?;
        let version = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["version"]["number"].as_str().map(str::to_string))
            .unwrap_or_default();
        tracing::info!(version = %version, "elasticsearch healthcheck passed");
        Ok(())
    }

    /// Sends a request to the first node that accepts the connection.
    fn send<F>(&self, method: Method, path: &str, build: F) -> Result<Response, BackendError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut last_error = None;

        for node in &self.nodes {
            let url = format!("{node}{path}");
            let request = self
                .client
                .request(method.clone(), &url)
                .basic_auth(&self.user, Some(&self.password));

            match build(request).send() {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "node unreachable, trying next");
                    last_error = Some(BackendError::Request { url, source: e });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackendError::Rejected {
            reason: "no backend nodes configured".to_string(),
        }))
    }
}

impl SearchBackend for ElasticClient {
    fn ensure_collection(&self, mapping: &Value) -> Result<(), BackendError> {
        let path = format!("/{}", self.index);
        let response = self.send(Method::HEAD, &path, |r| r)?;
        match response.status().as_u16() {
            200 => {
                tracing::info!(index = %self.index, "index already exists");
                return Ok(());
            }
            404 => {}
            status => {
                return Err(BackendError::HttpStatus {
                    status,
                    body: String::new(),
                });
            }
        }

        let body = json!({ "mappings": mapping });
        let response = self.send(Method::PUT, &path, |r| r.json(&body))?;
        let status = response.status().as_u16();
        let text = response.text().unwrap_or_default();
        if status == 400 && text.contains("resource_already_exists_exception") {
            tracing::info!(index = %self.index, "index created concurrently");
            return Ok(());
        }
        if !(200..300).contains(&status) {
            return Err(BackendError::HttpStatus { status, body: text });
        }
        if !is_acknowledged(&text) {
            return Err(BackendError::NotAcknowledged {
                operation: "index creation",
            });
        }
        tracing::info!(index = %self.index, "index created with mapping");
        Ok(())
    }

    fn bulk_index(&self, documents: &[FlatDocument]) -> Result<BulkResponse, BackendError> {
        let payload = bulk_body(&self.index, documents)?;
        let response = self.send(Method::POST, "/_bulk", |r| {
            r.header("Content-Type", "application/x-ndjson")
                .body(payload.clone())
        })?;
        parse_bulk_response(&read_body(response)?)
    }

    fn open_scroll(
        &self,
        query: &BackendQuery,
        page_size: usize,
        keep_alive: Duration,
    ) -> Result<ScrollPage, BackendError> {
        let path = format!(
            "/{}/_search?scroll={}",
            self.index,
            keep_alive_param(keep_alive)
        );
        let body = search_body(query, page_size);
        let response = self.send(Method::POST, &path, |r| r.json(&body))?;
        parse_search_response(&read_body(response)?)
    }

    fn next_page(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage, BackendError> {
        let body = json!({
            "scroll": keep_alive_param(keep_alive),
            "scroll_id": scroll_id,
        });
        let response = self.send(Method::POST, "/_search/scroll", |r| r.json(&body))?;
        if response.status().as_u16() == 404 {
            return Err(BackendError::ScrollNotFound {
                scroll_id: scroll_id.to_string(),
            });
        }
        parse_search_response(&read_body(response)?)
    }

    fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        let body = json!({ "scroll_id": [scroll_id] });
        let response = self.send(Method::DELETE, "/_search/scroll", |r| r.json(&body))?;
        if response.status().as_u16() == 404 {
            return Err(BackendError::ScrollNotFound {
                scroll_id: scroll_id.to_string(),
            });
        }
        read_body(response).map(|_| ())
    }
}

/// Returns the body of a successful response.
fn read_body(response: Response) -> Result<String, BackendError> {
    let status = response.status();
    let body = response.text().map_err(|e| BackendError::MalformedResponse {
        reason: format!("unreadable body: {e}"),
    })?;
    if !status.is_success() {
        return Err(BackendError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn is_acknowledged(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["acknowledged"].as_bool())
        .unwrap_or(false)
}

/// Builds the `_bulk` NDJSON payload: an action line then a source line per
/// document, newline terminated.
fn bulk_body(index: &str, documents: &[FlatDocument]) -> Result<String, BackendError> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))
        .map_err(|e| BackendError::Serialize { source: e })?;

    let mut body = String::new();
    for doc in documents {
        body.push_str(&action);
        body.push('\n');
        body.push_str(
            &serde_json::to_string(doc).map_err(|e| BackendError::Serialize { source: e })?,
        );
        body.push('\n');
    }
    Ok(body)
}

fn search_body(query: &BackendQuery, page_size: usize) -> Value {
    json!({
        "size": page_size,
        "track_total_hits": true,
        "query": query.to_json(),
        "sort": [{ TIMESTAMP_FIELD: { "order": "asc" } }],
    })
}

#[derive(Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkItem>>,
}

#[derive(Deserialize)]
struct RawBulkItem {
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

fn parse_bulk_response(body: &str) -> Result<BulkResponse, BackendError> {
    let raw: RawBulkResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedResponse {
            reason: format!("bulk response: {e}"),
        })?;

    let items = raw
        .items
        .into_iter()
        .map(|mut entry| {
            // Each entry is keyed by its action name ("index").
            let item = entry
                .remove("index")
                .or_else(|| entry.into_values().next())
                .ok_or_else(|| BackendError::MalformedResponse {
                    reason: "empty bulk item".to_string(),
                })?;
            Ok(BulkItem {
                status: item.status,
                result: item.result,
                error: item.error.map(|e| describe_error(&e)),
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    Ok(BulkResponse { items })
}

/// Renders an Elasticsearch error object as `type: reason`.
fn describe_error(error: &Value) -> String {
    match (error["type"].as_str(), error["reason"].as_str()) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

#[derive(Deserialize)]
struct RawSearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: RawHits,
}

#[derive(Deserialize)]
struct RawHits {
    #[serde(default)]
    total: Option<RawTotal>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

/// `hits.total` is a number before 7.0 and an object after.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTotal {
    Count(u64),
    Object { value: u64 },
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_source")]
    source: FlatDocument,
}

fn parse_search_response(body: &str) -> Result<ScrollPage, BackendError> {
    let raw: RawSearchResponse =
        serde_json::from_str(body).map_err(|e| BackendError::MalformedResponse {
            reason: format!("search response: {e}"),
        })?;

    let total = match raw.hits.total {
        Some(RawTotal::Count(n) | RawTotal::Object { value: n }) => n,
        None => raw.hits.hits.len() as u64,
    };

    Ok(ScrollPage {
        scroll_id: raw.scroll_id,
        total,
        hits: raw.hits.hits.into_iter().map(|h| h.source).collect(),
    })
}
