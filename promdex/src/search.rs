//! Paginated (scroll) retrieval of matching documents.
//!
//! The first page opens a cursor and reports the total match count. Pages
//! are then fetched until `pages * page_size` reaches the capped count,
//! and the result is truncated to exactly that count. The cursor is
//! released on every exit path by [`ScrollGuard`].

use std::time::Duration;

use crate::backend::SearchBackend;
use crate::config::AdapterConfig;
use crate::error::{ConfigError, SearchError};
use crate::model::FlatDocument;
use crate::query::BackendQuery;

/// Pagination parameters for [`search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    /// Documents per page.
    pub page_size: usize,
    /// Result cap; `None` returns every match.
    pub max_results: Option<usize>,
    /// Cursor lease, renewed with every page.
    pub keep_alive: Duration,
}

impl SearchOptions {
    /// Extracts pagination parameters from the adapter configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the keep-alive is not a valid duration.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            page_size: config.query_size,
            max_results: config.max_results(),
            keep_alive: config.keep_alive()?,
        })
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            page_size: 5000,
            max_results: None,
            keep_alive: Duration::from_secs(180),
        }
    }
}

/// Owns an open scroll cursor and clears it when dropped.
struct ScrollGuard<'a, B: SearchBackend + ?Sized> {
    backend: &'a B,
    scroll_id: Option<String>,
}

impl<'a, B: SearchBackend + ?Sized> ScrollGuard<'a, B> {
    fn new(backend: &'a B, scroll_id: Option<String>) -> Self {
        Self { backend, scroll_id }
    }

    fn scroll_id(&self) -> Option<String> {
        self.scroll_id.clone()
    }

    /// Tracks a cursor id handed back by a later page.
    fn update(&mut self, scroll_id: Option<String>) {
        if let Some(id) = scroll_id {
            self.scroll_id = Some(id);
        }
    }
}

impl<B: SearchBackend + ?Sized> Drop for ScrollGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(id) = self.scroll_id.take()
            && let Err(e) = self.backend.clear_scroll(&id)
        {
            tracing::warn!(scroll_id = %id, error = %e, "failed to clear scroll cursor");
        }
    }
}

/// Runs `query` and collects up to the capped number of documents, sorted by
/// timestamp ascending.
///
/// Returns `Ok(None)` when the first page matches nothing, so the caller can
/// omit the query from its response.
///
/// # Errors
///
/// Returns `SearchError::PageFailed` naming the page that failed, or
/// `SearchError::ZeroPageSize`.
pub fn search<B: SearchBackend + ?Sized>(
    backend: &B,
    query: &BackendQuery,
    options: &SearchOptions,
) -> Result<Option<Vec<FlatDocument>>, SearchError> {
    if options.page_size == 0 {
        return Err(SearchError::ZeroPageSize);
    }

    let first = backend
        .open_scroll(query, options.page_size, options.keep_alive)
        .map_err(|source| page_failed(1, source))?;
    let mut guard = ScrollGuard::new(backend, first.scroll_id);

    if first.hits.is_empty() {
        tracing::debug!(page = 1, "no documents matched");
        return Ok(None);
    }

    let total = usize::try_from(first.total)
        .unwrap_or(usize::MAX)
        .max(first.hits.len());
    let cap = options.max_results.map_or(total, |max| total.min(max));
    tracing::debug!(page = 1, hits = first.hits.len(), total, cap, "page fetched");

    let mut documents = first.hits;
    let mut pages = 1usize;

    while pages.saturating_mul(options.page_size) < cap {
        let Some(scroll_id) = guard.scroll_id() else {
            break;
        };
        pages += 1;

        let page = backend
            .next_page(&scroll_id, options.keep_alive)
            .map_err(|source| page_failed(pages, source))?;
        guard.update(page.scroll_id);

        if page.hits.is_empty() {
            break;
        }
        tracing::debug!(page = pages, hits = page.hits.len(), "page fetched");
        documents.extend(page.hits);
    }

    documents.truncate(cap);
    Ok(Some(documents))
}

fn page_failed(page: usize, source: crate::error::BackendError) -> SearchError {
    tracing::warn!(page, error = %source, "page fetch failed");
    SearchError::PageFailed { page, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::{MatchOp, Matcher};
    use crate::query::build_from;

    fn backend_with(count: i64) -> MemoryBackend {
        let docs = (0..count)
            .map(|i| FlatDocument {
                labels: [("__name__", "req"), ("job", "api")].into_iter().collect(),
                value: i as f64,
                // reverse insertion order so sorting is observable
                timestamp: 1000 - i,
            })
            .collect();
        MemoryBackend::with_documents(docs)
    }

    fn options(page_size: usize, max_results: Option<usize>) -> SearchOptions {
        SearchOptions {
            page_size,
            max_results,
            ..SearchOptions::default()
        }
    }

    fn api_query() -> BackendQuery {
        build_from(&[Matcher::new("job", "api", MatchOp::Eq)], 0, 10_000)
    }

    #[test]
    fn test_cap_is_independent_of_page_size() {
        for page_size in [30, 50, 100, 300] {
            let backend = backend_with(250);

            let docs = search(&backend, &api_query(), &options(page_size, Some(100)))
                .unwrap()
                .unwrap();

            assert_eq!(docs.len(), 100, "page_size {page_size}");
            assert_eq!(backend.open_scrolls(), 0, "page_size {page_size}");
        }
    }

    #[test]
    fn test_unlimited_returns_all_sorted() {
        let backend = backend_with(250);

        let docs = search(&backend, &api_query(), &options(30, None)).unwrap().unwrap();

        assert_eq!(docs.len(), 250);
        assert!(docs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_cap_keeps_earliest_documents() {
        let backend = backend_with(250);

        let docs = search(&backend, &api_query(), &options(50, Some(10))).unwrap().unwrap();

        let timestamps: Vec<_> = docs.iter().map(|d| d.timestamp).collect();
        assert_eq!(timestamps, (751..=760).collect::<Vec<_>>());
    }

    #[test]
    fn test_cap_above_total() {
        let backend = backend_with(40);

        let docs = search(&backend, &api_query(), &options(30, Some(100))).unwrap().unwrap();

        assert_eq!(docs.len(), 40);
    }

    #[test]
    fn test_zero_matches_signals_no_results() {
        let backend = backend_with(10);
        let query = build_from(&[Matcher::new("job", "db", MatchOp::Eq)], 0, 10_000);

        let result = search(&backend, &query, &options(30, None)).unwrap();

        assert!(result.is_none());
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_page_failure_releases_cursor() {
        let backend = backend_with(100);
        backend.fail_page(2);

        let err = search(&backend, &api_query(), &options(30, None)).unwrap_err();

        assert!(matches!(err, SearchError::PageFailed { page: 2, .. }));
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_first_page_failure() {
        let backend = backend_with(100);
        backend.fail_page(1);

        let err = search(&backend, &api_query(), &options(30, None)).unwrap_err();

        assert!(matches!(err, SearchError::PageFailed { page: 1, .. }));
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[test]
    fn test_zero_page_size() {
        let backend = backend_with(1);
        assert!(matches!(
            search(&backend, &api_query(), &options(0, None)),
            Err(SearchError::ZeroPageSize)
        ));
    }

    #[test]
    fn test_options_from_config() {
        let config = AdapterConfig {
            query_size: 200,
            max_results: 1000,
            scroll_keep_alive: "1m".to_string(),
            ..AdapterConfig::default()
        };

        let options = SearchOptions::from_config(&config).unwrap();

        assert_eq!(options.page_size, 200);
        assert_eq!(options.max_results, Some(1000));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
    }
}
