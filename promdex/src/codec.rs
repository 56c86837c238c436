//! Conversion between protocol time series and flat backend documents.
//!
//! The write path [`flatten`]s every `(series, sample)` pair into its own
//! [`FlatDocument`]. The read path [`reassemble`]s documents back into one
//! [`TimeSeries`] per distinct label set, grouping by [`Fingerprint`].

use std::collections::HashMap;

use crate::model::{FlatDocument, Fingerprint, LabelSet};
use crate::proto::{Label, Sample, TimeSeries};

/// Builds the label set of a protocol series.
///
/// A repeated label name keeps its last value.
pub fn label_set(labels: &[Label]) -> LabelSet {
    labels
        .iter()
        .map(|label| (label.name.as_str(), label.value.as_str()))
        .collect()
}

/// Flattens time series into one document per sample.
///
/// NaN values are stored as `0` because the backend's numeric field type
/// cannot represent NaN. Output order is input series order, then sample
/// order.
pub fn flatten(series: &[TimeSeries]) -> Vec<FlatDocument> {
    let total = series.iter().map(|ts| ts.samples.len()).sum();
    let mut documents = Vec::with_capacity(total);

    for ts in series {
        let labels = label_set(&ts.labels);
        for sample in &ts.samples {
            let value = if sample.value.is_nan() { 0.0 } else { sample.value };
            documents.push(FlatDocument {
                labels: labels.clone(),
                value,
                timestamp: sample.timestamp,
            });
        }
    }

    documents
}

/// Groups documents back into time series.
///
/// Samples keep the order in which their documents appear. Series order in
/// the output is unspecified. Documents whose fingerprints collide but whose
/// label sets differ are kept in separate series.
pub fn reassemble(documents: &[FlatDocument]) -> Vec<TimeSeries> {
    reassemble_by(documents, LabelSet::fingerprint)
}

fn reassemble_by(
    documents: &[FlatDocument],
    key: impl Fn(&LabelSet) -> Fingerprint,
) -> Vec<TimeSeries> {
    let mut series: Vec<(LabelSet, TimeSeries)> = Vec::new();
    let mut by_fingerprint: HashMap<Fingerprint, Vec<usize>> = HashMap::new();

    for doc in documents {
        let candidates = by_fingerprint.entry(key(&doc.labels)).or_default();
        let slot = match candidates
            .iter()
            .copied()
            .find(|&i| series[i].0 == doc.labels)
        {
            Some(i) => i,
            None => {
                series.push((doc.labels.clone(), new_series(&doc.labels)));
                candidates.push(series.len() - 1);
                series.len() - 1
            }
        };

        series[slot].1.samples.push(Sample {
            value: doc.value,
            timestamp: doc.timestamp,
        });
    }

    series.into_iter().map(|(_, ts)| ts).collect()
}

/// Materializes an empty series carrying `labels`, sorted by name.
fn new_series(labels: &LabelSet) -> TimeSeries {
    TimeSeries {
        labels: labels
            .iter()
            .map(|(name, value)| Label {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
        samples: Vec::new(),
    }
}
