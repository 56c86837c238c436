//! Prometheus remote storage wire protocol.
//!
//! Hand-written types matching `prometheus/prompb/remote.proto` and
//! `types.proto`. Using prost derives avoids the need for protoc and proto
//! file management.
//!
//! Both the remote-write and remote-read bodies are protobuf messages
//! compressed with the snappy *block* format (not the framed format).

use prost::Message;

use crate::error::EnvelopeError;

/// A write request containing one or more time series.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
    /// The time series to write.
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// A read request containing one or more queries.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadRequest {
    /// The queries to run.
    #[prost(message, repeated, tag = "1")]
    pub queries: Vec<Query>,
    /// Response types the client accepts. Only `SAMPLES` (0) is produced.
    #[prost(int32, repeated, tag = "2")]
    pub accepted_response_types: Vec<i32>,
}

/// The response to a [`ReadRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadResponse {
    /// One result per answered query.
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<QueryResult>,
}

/// One query of a read request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Query {
    /// Inclusive start of the time range, in milliseconds.
    #[prost(int64, tag = "1")]
    pub start_timestamp_ms: i64,
    /// Inclusive end of the time range, in milliseconds.
    #[prost(int64, tag = "2")]
    pub end_timestamp_ms: i64,
    /// Label matchers, combined by conjunction.
    #[prost(message, repeated, tag = "3")]
    pub matchers: Vec<LabelMatcher>,
    /// Optional hints from the PromQL engine.
    #[prost(message, optional, tag = "4")]
    pub hints: Option<ReadHints>,
}

/// The series matched by one [`Query`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryResult {
    /// Matched series with their samples.
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// A predicate on one label.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LabelMatcher {
    /// Operator, see [`MatchType`]. Kept as the raw integer so that unknown
    /// operators survive decoding and can be reported by name.
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    /// Label name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Label value or pattern.
    #[prost(string, tag = "3")]
    pub value: String,
}

/// Operators of [`LabelMatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MatchType {
    /// Equality.
    Eq = 0,
    /// Inequality.
    Neq = 1,
    /// Regex match.
    Re = 2,
    /// Negated regex match.
    Nre = 3,
}

impl LabelMatcher {
    /// Creates a matcher with a known operator.
    pub fn new(name: impl Into<String>, value: impl Into<String>, r#type: MatchType) -> Self {
        Self {
            r#type: r#type as i32,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Hints about how the PromQL engine will use the result.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReadHints {
    /// Query step size in milliseconds.
    #[prost(int64, tag = "1")]
    pub step_ms: i64,
    /// Surrounding function name.
    #[prost(string, tag = "2")]
    pub func: String,
    /// Start time in milliseconds.
    #[prost(int64, tag = "3")]
    pub start_ms: i64,
    /// End time in milliseconds.
    #[prost(int64, tag = "4")]
    pub end_ms: i64,
    /// Grouping labels of the surrounding aggregation.
    #[prost(string, repeated, tag = "5")]
    pub grouping: Vec<String>,
    /// Whether grouping is `by` (true) or `without` (false).
    #[prost(bool, tag = "6")]
    pub by: bool,
    /// Range vector selector range in milliseconds.
    #[prost(int64, tag = "7")]
    pub range_ms: i64,
}

/// A single time series with labels and samples.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeSeries {
    /// Metric labels identifying the series.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    /// Data samples for this series.
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

/// A key-value label pair.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Label {
    /// Label name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Label value.
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A single data sample (value + timestamp).
#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
    /// The sample value.
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Timestamp in milliseconds since epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

/// Decodes a snappy-compressed `WriteRequest`.
///
/// # Errors
///
/// Returns `EnvelopeError` if the body is not valid snappy or protobuf.
pub fn decode_write_request(body: &[u8]) -> Result<WriteRequest, EnvelopeError> {
    decode_message(body)
}

/// Decodes a snappy-compressed `ReadRequest`.
///
/// # Errors
///
/// Returns `EnvelopeError` if the body is not valid snappy or protobuf.
pub fn decode_read_request(body: &[u8]) -> Result<ReadRequest, EnvelopeError> {
    decode_message(body)
}

/// Encodes a `ReadResponse` as snappy-compressed protobuf.
///
/// # Errors
///
/// Returns `EnvelopeError` if serialization or compression fails.
pub fn encode_read_response(response: &ReadResponse) -> Result<Vec<u8>, EnvelopeError> {
    encode_message(response)
}

/// Decompresses a snappy block and decodes the protobuf message inside.
///
/// # Errors
///
/// Returns `EnvelopeError::Decompress` or `EnvelopeError::Decode`.
pub fn decode_message<M: Message + Default>(body: &[u8]) -> Result<M, EnvelopeError> {
    let decompressed = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| EnvelopeError::Decompress { source: e })?;
    M::decode(decompressed.as_slice()).map_err(|e| EnvelopeError::Decode { source: e })
}

/// Serializes a protobuf message and compresses it as a snappy block.
///
/// # Errors
///
/// Returns `EnvelopeError::Encode` or `EnvelopeError::Compress`.
pub fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, EnvelopeError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .map_err(|e| EnvelopeError::Encode { source: e })?;
    snap::raw::Encoder::new()
        .compress_vec(&buf)
        .map_err(|e| EnvelopeError::Compress { source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_write_request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![Label {
                    name: "__name__".to_string(),
                    value: "up".to_string(),
                }],
                samples: vec![Sample {
                    value: 1.0,
                    timestamp: 1_700_000_000_000,
                }],
            }],
        }
    }

    #[test]
    fn test_write_request_envelope() {
        let request = sample_write_request();
        let body = encode_message(&request).unwrap();

        // Body must be a raw snappy block, not protobuf
        let raw = snap::raw::Decoder::new().decompress_vec(&body).unwrap();
        assert_eq!(raw, request.encode_to_vec());

        assert_eq!(decode_write_request(&body).unwrap(), request);
    }

    #[test]
    fn test_decode_rejects_uncompressed_body() {
        let request = sample_write_request();
        let err = decode_write_request(&request.encode_to_vec()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decompress { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage_protobuf() {
        let body = snap::raw::Encoder::new()
            .compress_vec(&[0xff, 0xff, 0xff, 0xff])
            .unwrap();
        let err = decode_read_request(&body).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode { .. }));
    }

    #[test]
    fn test_unknown_matcher_type_survives_decoding() {
        let request = ReadRequest {
            queries: vec![Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 10,
                matchers: vec![LabelMatcher {
                    r#type: 9,
                    name: "job".to_string(),
                    value: "api".to_string(),
                }],
                hints: Some(ReadHints {
                    step_ms: 15_000,
                    func: "rate".to_string(),
                    ..Default::default()
                }),
            }],
            accepted_response_types: vec![0],
        };

        let decoded = decode_read_request(&encode_message(&request).unwrap()).unwrap();
        assert_eq!(decoded.queries[0].matchers[0].r#type, 9);
        assert_eq!(decoded.queries[0].hints.as_ref().unwrap().step_ms, 15_000);
    }

    #[test]
    fn test_label_matcher_new() {
        let m = LabelMatcher::new("job", "api.*", MatchType::Nre);
        assert_eq!(m.r#type, 3);
        assert_eq!(m.name, "job");
    }
}
