//! Translation of remote-read label matchers into backend queries.
//!
//! A [`BackendQuery`] is a boolean conjunction: matcher clauses go to
//! `must` or `must_not` depending on the operator, and the time range is a
//! mandatory `filter` on the `timestamp` field, inclusive on both bounds.
//!
//! The backend's regex matcher is implicitly anchored at both ends, so a
//! leading `^` and a trailing `$` are stripped from RE/NRE patterns before
//! translation.

use serde_json::{Value, json};

use crate::error::MatcherError;
use crate::model::{MatchOp, Matcher};
use crate::proto;

/// Document field holding the sample timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// One leaf predicate of a [`BackendQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Label value equals `value` exactly.
    Term {
        /// Label name.
        label: String,
        /// Expected value.
        value: String,
    },
    /// Label value matches `pattern` in full.
    Regexp {
        /// Label name.
        label: String,
        /// Unanchored pattern.
        pattern: String,
    },
    /// Timestamp within `[gte, lte]`.
    Range {
        /// Inclusive lower bound in milliseconds.
        gte: i64,
        /// Inclusive upper bound in milliseconds.
        lte: i64,
    },
}

impl Clause {
    /// Renders the clause in the Elasticsearch query DSL.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Term { label, value } => json!({ "term": { label_field(label): value } }),
            Self::Regexp { label, pattern } => {
                json!({ "regexp": { label_field(label): pattern } })
            }
            Self::Range { gte, lte } => {
                json!({ "range": { TIMESTAMP_FIELD: { "gte": gte, "lte": lte } } })
            }
        }
    }
}

/// Returns the keyword field path for a label.
pub fn label_field(label: &str) -> String {
    format!("labels.{label}.keyword")
}

/// A translated read query.
///
/// Built per query and consumed by a single search; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendQuery {
    /// Clauses that must all match.
    pub must: Vec<Clause>,
    /// Clauses that must not match.
    pub must_not: Vec<Clause>,
    /// Non-scoring clauses that must all match.
    pub filter: Vec<Clause>,
}

impl BackendQuery {
    /// Renders the query as an Elasticsearch `bool` query.
    pub fn to_json(&self) -> Value {
        let render =
            |clauses: &[Clause]| -> Vec<Value> { clauses.iter().map(Clause::to_json).collect() };
        json!({
            "bool": {
                "must": render(&self.must),
                "must_not": render(&self.must_not),
                "filter": render(&self.filter),
            }
        })
    }
}

/// Translates protocol matchers and a time range into a backend query.
///
/// # Errors
///
/// Returns `MatcherError::UnsupportedMatcher` naming the first matcher whose
/// operator is not EQ, NEQ, RE or NRE.
pub fn build(
    matchers: &[proto::LabelMatcher],
    start_ms: i64,
    end_ms: i64,
) -> Result<BackendQuery, MatcherError> {
    let matchers = matchers
        .iter()
        .map(|m| {
            MatchOp::from_wire(m.r#type, &m.name).map(|op| Matcher::new(&m.name, &m.value, op))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(build_from(&matchers, start_ms, end_ms))
}

/// Translates already-validated matchers and a time range.
pub fn build_from(matchers: &[Matcher], start_ms: i64, end_ms: i64) -> BackendQuery {
    let mut query = BackendQuery::default();

    for matcher in matchers {
        let clause = match matcher.op {
            MatchOp::Eq | MatchOp::Neq => Clause::Term {
                label: matcher.name.clone(),
                value: matcher.value.clone(),
            },
            MatchOp::Re | MatchOp::Nre => Clause::Regexp {
                label: matcher.name.clone(),
                pattern: strip_anchors(&matcher.value).to_string(),
            },
        };
        if matcher.op.is_negated() {
            query.must_not.push(clause);
        } else {
            query.must.push(clause);
        }
    }

    query.filter.push(Clause::Range {
        gte: start_ms,
        lte: end_ms,
    });
    query
}

/// Removes one leading `^` and one trailing unescaped `$`.
pub fn strip_anchors(pattern: &str) -> &str {
    let pattern = pattern.strip_prefix('^').unwrap_or(pattern);
    match pattern.strip_suffix('$') {
        Some(rest) if !ends_with_escape(rest) => rest,
        _ => pattern,
    }
}

/// True if `s` ends in an odd number of backslashes.
fn ends_with_escape(s: &str) -> bool {
    s.bytes().rev().take_while(|&b| b == b'\\').count() % 2 == 1
}
