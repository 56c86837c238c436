//! Core data model shared by the read and write paths.
//!
//! - [`LabelSet`] - the identity of a series
//! - [`Fingerprint`] - 64-bit grouping key derived from a label set
//! - [`FlatDocument`] - the per-sample unit stored in the backend
//! - [`Matcher`] / [`MatchOp`] - validated label predicates for reads

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MatcherError;

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Byte separating names and values when fingerprinting. Never valid UTF-8,
/// so it cannot appear inside a label.
const SEPARATOR: u8 = 0xff;

/// The label name/value pairs identifying one series.
///
/// Backed by a `BTreeMap` so iteration is sorted by label name, which keeps
/// fingerprints deterministic and reassembled labels in Prometheus order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a label, replacing any previous value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the value of a label, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Computes the FNV-1a fingerprint of this label set.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hash = FNV_OFFSET;
        for (name, value) in &self.0 {
            for byte in name
                .as_bytes()
                .iter()
                .chain(std::iter::once(&SEPARATOR))
                .chain(value.as_bytes())
                .chain(std::iter::once(&SEPARATOR))
            {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        Fingerprint(hash)
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A 64-bit hash of a [`LabelSet`].
///
/// Only used as an in-process grouping key; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The backend storage unit: one sample of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatDocument {
    /// Labels of the series the sample belongs to.
    pub labels: LabelSet,
    /// Sample value. Never NaN once written; a stored `null` reads as 0.
    #[serde(deserialize_with = "value_or_zero")]
    pub value: f64,
    /// Sample timestamp in milliseconds since epoch.
    pub timestamp: i64,
}

/// Non-finite values are written as JSON `null`; read them back as 0.
fn value_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

/// Label matcher operators supported by the remote read protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    /// Label value equals.
    Eq,
    /// Label value does not equal.
    Neq,
    /// Label value matches a regular expression.
    Re,
    /// Label value does not match a regular expression.
    Nre,
}

impl MatchOp {
    /// Converts the protocol's integer operator into a `MatchOp`.
    ///
    /// # Errors
    ///
    /// Returns `MatcherError::UnsupportedMatcher` for any value outside
    /// EQ (0), NEQ (1), RE (2) and NRE (3).
    pub fn from_wire(operator: i32, label: &str) -> Result<Self, MatcherError> {
        match operator {
            0 => Ok(Self::Eq),
            1 => Ok(Self::Neq),
            2 => Ok(Self::Re),
            3 => Ok(Self::Nre),
            _ => Err(MatcherError::UnsupportedMatcher {
                operator,
                label: label.to_string(),
            }),
        }
    }

    /// Returns true for the negated operators.
    pub fn is_negated(self) -> bool {
        matches!(self, Self::Neq | Self::Nre)
    }
}

/// A validated predicate on one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    /// Label name.
    pub name: String,
    /// Literal value or pattern, depending on `op`.
    pub value: String,
    /// Operator.
    pub op: MatchOp,
}

impl Matcher {
    /// Creates a matcher.
    pub fn new(name: impl Into<String>, value: impl Into<String>, op: MatchOp) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            op,
        }
    }
}
