//! In-process search backend.
//!
//! Evaluates [`BackendQuery`] against documents held in memory with the same
//! semantics the Elasticsearch translation relies on: term clauses compare
//! exact values, regexp clauses are anchored at both ends, and a clause on a
//! missing label never matches.
//!
//! Besides serving as a development backend, it keeps count of open scroll
//! cursors and can inject failures, which the read and write path tests use.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use super::{BulkItem, BulkResponse, ScrollPage, SearchBackend};
use crate::error::BackendError;
use crate::model::FlatDocument;
use crate::query::{BackendQuery, Clause};

/// An in-memory [`SearchBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    mapping: Option<Value>,
    documents: Vec<FlatDocument>,
    scrolls: HashMap<String, Cursor>,
    next_scroll_id: u64,
    bulk_requests: usize,
    pages_served: usize,
    fail_bulk: Option<String>,
    fail_page: Option<usize>,
    reject_label: Option<String>,
}

#[derive(Debug)]
struct Cursor {
    remaining: std::vec::IntoIter<FlatDocument>,
    page_size: usize,
    total: u64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-loaded with `documents`.
    pub fn with_documents(documents: Vec<FlatDocument>) -> Self {
        let backend = Self::new();
        backend.lock().documents = documents;
        backend
    }

    /// Makes every subsequent bulk request fail with `reason`.
    pub fn fail_bulk_requests(&self, reason: impl Into<String>) {
        self.lock().fail_bulk = Some(reason.into());
    }

    /// Makes the `page`-th page served (1-based, counted across all cursors)
    /// fail.
    pub fn fail_page(&self, page: usize) {
        self.lock().fail_page = Some(page);
    }

    /// Rejects, item by item, every document carrying label `name`.
    pub fn reject_documents_with_label(&self, name: impl Into<String>) {
        self.lock().reject_label = Some(name.into());
    }

    /// Returns a copy of all stored documents.
    pub fn documents(&self) -> Vec<FlatDocument> {
        self.lock().documents.clone()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Number of bulk requests received.
    pub fn bulk_requests(&self) -> usize {
        self.lock().bulk_requests
    }

    /// Number of scroll cursors not yet cleared.
    pub fn open_scrolls(&self) -> usize {
        self.lock().scrolls.len()
    }

    /// The mapping applied by `ensure_collection`, if any.
    pub fn mapping(&self) -> Option<Value> {
        self.lock().mapping.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl State {
    fn take_page(&mut self, scroll_id: &str) -> Result<ScrollPage, BackendError> {
        self.pages_served += 1;
        if self.fail_page == Some(self.pages_served) {
            return Err(BackendError::Rejected {
                reason: format!("injected failure on page {}", self.pages_served),
            });
        }

        let cursor = self
            .scrolls
            .get_mut(scroll_id)
            .ok_or_else(|| BackendError::ScrollNotFound {
                scroll_id: scroll_id.to_string(),
            })?;
        let hits: Vec<_> = cursor.remaining.by_ref().take(cursor.page_size).collect();

        Ok(ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            total: cursor.total,
            hits,
        })
    }
}

impl SearchBackend for MemoryBackend {
    fn ensure_collection(&self, mapping: &Value) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.mapping.is_none() {
            state.mapping = Some(mapping.clone());
        }
        Ok(())
    }

    fn bulk_index(&self, documents: &[FlatDocument]) -> Result<BulkResponse, BackendError> {
        let mut state = self.lock();
        state.bulk_requests += 1;
        if let Some(reason) = &state.fail_bulk {
            return Err(BackendError::Rejected {
                reason: reason.clone(),
            });
        }

        let mut items = Vec::with_capacity(documents.len());
        for doc in documents {
            let rejected = state
                .reject_label
                .as_deref()
                .is_some_and(|name| doc.labels.get(name).is_some());
            if rejected {
                items.push(BulkItem::rejected(400, "document_parsing_exception"));
            } else {
                state.documents.push(doc.clone());
                items.push(BulkItem::created());
            }
        }
        Ok(BulkResponse { items })
    }

    fn open_scroll(
        &self,
        query: &BackendQuery,
        page_size: usize,
        _keep_alive: Duration,
    ) -> Result<ScrollPage, BackendError> {
        if page_size == 0 {
            return Err(BackendError::Rejected {
                reason: "size must be positive".to_string(),
            });
        }
        let predicate = CompiledQuery::new(query)?;

        let mut state = self.lock();
        let mut matched: Vec<_> = state
            .documents
            .iter()
            .filter(|doc| predicate.matches(doc))
            .cloned()
            .collect();
        matched.sort_by_key(|doc| doc.timestamp);

        state.next_scroll_id += 1;
        let scroll_id = format!("scroll-{}", state.next_scroll_id);
        state.scrolls.insert(
            scroll_id.clone(),
            Cursor {
                total: matched.len() as u64,
                remaining: matched.into_iter(),
                page_size,
            },
        );
        let page = state.take_page(&scroll_id);
        if page.is_err() {
            // A failed initial search leaves no cursor behind.
            state.scrolls.remove(&scroll_id);
        }
        page
    }

    fn next_page(
        &self,
        scroll_id: &str,
        _keep_alive: Duration,
    ) -> Result<ScrollPage, BackendError> {
        self.lock().take_page(scroll_id)
    }

    fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
        self.lock()
            .scrolls
            .remove(scroll_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::ScrollNotFound {
                scroll_id: scroll_id.to_string(),
            })
    }
}

/// A [`BackendQuery`] with its regular expressions compiled.
struct CompiledQuery {
    must: Vec<Predicate>,
    must_not: Vec<Predicate>,
}

enum Predicate {
    Term { label: String, value: String },
    Regexp { label: String, regex: Regex },
    Range { gte: i64, lte: i64 },
}

impl CompiledQuery {
    fn new(query: &BackendQuery) -> Result<Self, BackendError> {
        let compile = |clauses: &[Clause]| -> Result<Vec<Predicate>, BackendError> {
            clauses.iter().map(Predicate::new).collect()
        };
        let mut must = compile(&query.must)?;
        must.extend(compile(&query.filter)?);
        Ok(Self {
            must,
            must_not: compile(&query.must_not)?,
        })
    }

    fn matches(&self, doc: &FlatDocument) -> bool {
        self.must.iter().all(|p| p.matches(doc)) && !self.must_not.iter().any(|p| p.matches(doc))
    }
}

impl Predicate {
    fn new(clause: &Clause) -> Result<Self, BackendError> {
        Ok(match clause {
            Clause::Term { label, value } => Self::Term {
                label: label.clone(),
                value: value.clone(),
            },
            Clause::Regexp { label, pattern } => Self::Regexp {
                label: label.clone(),
                regex: Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                    BackendError::Rejected {
                        reason: format!("invalid regexp '{pattern}': {e}"),
                    }
                })?,
            },
            Clause::Range { gte, lte } => Self::Range {
                gte: *gte,
                lte: *lte,
            },
        })
    }

    fn matches(&self, doc: &FlatDocument) -> bool {
        match self {
            Self::Term { label, value } => doc.labels.get(label) == Some(value.as_str()),
            Self::Regexp { label, regex } => {
                doc.labels.get(label).is_some_and(|v| regex.is_match(v))
            }
            Self::Range { gte, lte } => (*gte..=*lte).contains(&doc.timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatchOp, Matcher};
    use crate::query::build_from;

    const KEEP_ALIVE: Duration = Duration::from_secs(60);

    fn doc(job: &str, timestamp: i64) -> FlatDocument {
        FlatDocument {
            labels: [("__name__", "up"), ("job", job)].into_iter().collect(),
            value: 1.0,
            timestamp,
        }
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::with_documents(vec![
            doc("api", 30),
            doc("db", 10),
            doc("api-canary", 20),
            doc("api", 99),
        ])
    }

    fn jobs(page: &ScrollPage) -> Vec<&str> {
        page.hits.iter().filter_map(|d| d.labels.get("job")).collect()
    }

    #[test]
    fn test_term_and_range() {
        let backend = backend();
        let query = build_from(&[Matcher::new("job", "api", MatchOp::Eq)], 0, 50);

        let page = backend.open_scroll(&query, 10, KEEP_ALIVE).unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.hits[0].timestamp, 30);
    }

    #[test]
    fn test_regexp_is_fully_anchored() {
        let backend = backend();
        let query = build_from(&[Matcher::new("job", "api", MatchOp::Re)], 0, 100);

        let page = backend.open_scroll(&query, 10, KEEP_ALIVE).unwrap();

        // "api-canary" would match an unanchored search
        assert_eq!(jobs(&page), vec!["api", "api"]);
    }

    #[test]
    fn test_negated_clauses() {
        let backend = backend();
        let query = build_from(&[Matcher::new("job", "api.*", MatchOp::Nre)], 0, 100);

        let page = backend.open_scroll(&query, 10, KEEP_ALIVE).unwrap();

        assert_eq!(jobs(&page), vec!["db"]);
    }

    #[test]
    fn test_missing_label_never_matches() {
        let backend = backend();
        let query = build_from(&[Matcher::new("zone", ".*", MatchOp::Re)], 0, 100);

        let page = backend.open_scroll(&query, 10, KEEP_ALIVE).unwrap();

        assert_eq!(page.total, 0);
        assert!(page.hits.is_empty());
    }

    #[test]
    fn test_scroll_pages_sorted_by_timestamp() {
        let backend = backend();
        let query = build_from(&[], 0, 1000);

        let first = backend.open_scroll(&query, 3, KEEP_ALIVE).unwrap();
        let id = first.scroll_id.clone().unwrap();
        let second = backend.next_page(&id, KEEP_ALIVE).unwrap();
        let third = backend.next_page(&id, KEEP_ALIVE).unwrap();

        let ts: Vec<_> = first.hits.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(second.hits.len(), 1);
        assert_eq!(second.hits[0].timestamp, 99);
        assert!(third.hits.is_empty());
        assert_eq!(first.total, 4);

        assert_eq!(backend.open_scrolls(), 1);
        backend.clear_scroll(&id).unwrap();
        assert_eq!(backend.open_scrolls(), 0);
        assert!(matches!(
            backend.next_page(&id, KEEP_ALIVE),
            Err(BackendError::ScrollNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_regexp_is_rejected() {
        let backend = backend();
        let query = build_from(&[Matcher::new("job", "(", MatchOp::Re)], 0, 100);

        let err = backend.open_scroll(&query, 10, KEEP_ALIVE).unwrap_err();
        assert!(matches!(err, BackendError::Rejected { .. }));
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_bulk_index_with_rejections() {
        let backend = MemoryBackend::new();
        backend.reject_documents_with_label("bad");
        let mut poisoned = doc("api", 1);
        poisoned.labels.insert("bad", "yes");

        let response = backend.bulk_index(&[doc("api", 1), poisoned]).unwrap();

        assert!(response.items[0].succeeded());
        assert!(!response.items[1].succeeded());
        assert_eq!(backend.document_count(), 1);
        assert_eq!(backend.bulk_requests(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let backend = backend();
        backend.fail_bulk_requests("cluster_block_exception");
        assert!(backend.bulk_index(&[doc("x", 1)]).is_err());

        backend.fail_page(1);
        assert!(backend.open_scroll(&build_from(&[], 0, 100), 1, KEEP_ALIVE).is_err());
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_ensure_collection_keeps_first_mapping() {
        let backend = MemoryBackend::new();
        backend.ensure_collection(&serde_json::json!({"a": 1})).unwrap();
        backend.ensure_collection(&serde_json::json!({"b": 2})).unwrap();
        assert_eq!(backend.mapping(), Some(serde_json::json!({"a": 1})));
    }
}
