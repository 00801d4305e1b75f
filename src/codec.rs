//! Serialization of query results for the cache store
//!
//! Values are wrapped in a versioned envelope carrying the time they were
//! stored and the TTL they were stored with, then written as JSON. Every field
//! is tagged with its type so a decoded value is either exactly what was
//! encoded or an error, never a partial result.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current envelope layout version
pub const ENVELOPE_VERSION: u8 = 1;

/// A scalar field of a result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Field {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Field {
    fn is_encodable(&self) -> bool {
        match self {
            Field::Float(f) => f.is_finite(),
            _ => true,
        }
    }
}

impl From<i64> for Field {
    fn from(i: i64) -> Self {
        Field::Int(i)
    }
}

impl From<i32> for Field {
    fn from(i: i32) -> Self {
        Field::Int(i64::from(i))
    }
}

impl From<f64> for Field {
    fn from(f: f64) -> Self {
        Field::Float(f)
    }
}

impl From<bool> for Field {
    fn from(b: bool) -> Self {
        Field::Bool(b)
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Text(s.to_string())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Text(s)
    }
}

/// An ordered tuple of heterogeneous fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub Vec<Field>);

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&Field> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<A: Into<Field>, B: Into<Field>> From<(A, B)> for Row {
    fn from((a, b): (A, B)) -> Self {
        Row(vec![a.into(), b.into()])
    }
}

impl<A: Into<Field>, B: Into<Field>, C: Into<Field>> From<(A, B, C)> for Row {
    fn from((a, b, c): (A, B, C)) -> Self {
        Row(vec![a.into(), b.into(), c.into()])
    }
}

/// The result of an aggregate query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QueryValue {
    Integer(i64),
    Text(String),
    Rows(Vec<Row>),
}

impl QueryValue {
    /// Build a row set from anything convertible into rows
    pub fn rows<R: Into<Row>>(rows: impl IntoIterator<Item = R>) -> Self {
        QueryValue::Rows(rows.into_iter().map(Into::into).collect())
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            QueryValue::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            QueryValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn check_encodable(&self) -> Result<()> {
        if let QueryValue::Rows(rows) = self {
            for (r, row) in rows.iter().enumerate() {
                for (c, field) in row.fields().iter().enumerate() {
                    if !field.is_encodable() {
                        return Err(CacheError::Encoding(format!(
                            "row {} column {} holds a non-finite float",
                            r, c
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A decoded cache entry: the value plus when and for how long it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: QueryValue,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u8,
    stored_at: DateTime<Utc>,
    ttl_ms: u64,
    value: &'a QueryValue,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    version: u8,
    stored_at: DateTime<Utc>,
    ttl_ms: u64,
    value: QueryValue,
}

/// Encodes and decodes cache entries
pub trait SerializationCodec: Send + Sync {
    /// Encode a value stored at `stored_at` with `ttl`
    fn encode(&self, value: &QueryValue, stored_at: DateTime<Utc>, ttl: Duration) -> Result<Vec<u8>>;

    /// Decode stored bytes; any malformation is a `Decoding` error
    fn decode(&self, bytes: &[u8]) -> Result<CachedValue>;
}

/// JSON codec backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl SerializationCodec for JsonCodec {
    fn encode(&self, value: &QueryValue, stored_at: DateTime<Utc>, ttl: Duration) -> Result<Vec<u8>> {
        value.check_encodable()?;

        let envelope = EnvelopeRef {
            version: ENVELOPE_VERSION,
            stored_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            value,
        };

        serde_json::to_vec(&envelope).map_err(|e| CacheError::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<CachedValue> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| CacheError::Decoding(e.to_string()))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(CacheError::Decoding(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        Ok(CachedValue {
            value: envelope.value,
            stored_at: envelope.stored_at,
            ttl: Duration::from_millis(envelope.ttl_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn director_rows() -> QueryValue {
        QueryValue::rows(vec![(27, "Christopher Nolan"), (14, "Denis Villeneuve")])
    }

    #[test]
    fn test_round_trip_preserves_value_and_metadata() {
        let codec = JsonCodec;
        let stored_at = Utc::now();
        let ttl = Duration::from_millis(1500);

        let values = vec![
            QueryValue::Integer(-7),
            QueryValue::Text("Christopher Nolan".to_string()),
            director_rows(),
            QueryValue::Rows(Vec::new()),
            QueryValue::Rows(vec![Row::new(vec![
                Field::Null,
                Field::Bool(false),
                Field::Int(i64::MIN),
                Field::Float(8.75),
                Field::Text(String::new()),
            ])]),
        ];

        for value in values {
            let bytes = codec.encode(&value, stored_at, ttl).unwrap();
            let decoded = codec.decode(&bytes).unwrap();
            assert_eq!(decoded.value, value);
            assert_eq!(decoded.stored_at, stored_at);
            assert_eq!(decoded.ttl, ttl);
        }
    }

    #[test]
    fn test_field_types_survive_round_trip() {
        // 1.0 must not come back as the integer 1
        let value = QueryValue::Rows(vec![Row::new(vec![Field::Float(1.0), Field::Int(1)])]);
        let bytes = JsonCodec.encode(&value, Utc::now(), Duration::from_secs(1)).unwrap();
        let decoded = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded.value.as_rows().unwrap()[0].get(0), Some(&Field::Float(1.0)));
        assert_eq!(decoded.value.as_rows().unwrap()[0].get(1), Some(&Field::Int(1)));
    }

    #[test]
    fn test_empty_rows_distinct_from_other_values() {
        let bytes = JsonCodec
            .encode(&QueryValue::Rows(Vec::new()), Utc::now(), Duration::from_secs(1))
            .unwrap();
        let decoded = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded.value, QueryValue::Rows(Vec::new()));
        assert_ne!(decoded.value, QueryValue::Integer(0));
    }

    #[test]
    fn test_non_finite_float_is_an_encoding_error() {
        let value = QueryValue::Rows(vec![Row::new(vec![Field::Float(f64::NAN)])]);
        let err = JsonCodec
            .encode(&value, Utc::now(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CacheError::Encoding(_)));
    }

    #[test]
    fn test_malformed_bytes_are_decoding_errors() {
        let bytes = JsonCodec
            .encode(&director_rows(), Utc::now(), Duration::from_secs(60))
            .unwrap();

        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(JsonCodec.decode(truncated), Err(CacheError::Decoding(_))));

        assert!(matches!(JsonCodec.decode(b""), Err(CacheError::Decoding(_))));
        assert!(matches!(JsonCodec.decode(b"world"), Err(CacheError::Decoding(_))));
        assert!(matches!(
            JsonCodec.decode(&[0xff, 0xfe, 0x00]),
            Err(CacheError::Decoding(_))
        ));

        let wrong_type = br#"{"version":1,"stored_at":"2024-01-01T00:00:00Z","ttl_ms":10,"value":{"kind":"rows","data":[[{"type":"int","value":"x"}]]}}"#;
        assert!(matches!(JsonCodec.decode(wrong_type), Err(CacheError::Decoding(_))));
    }

    #[test]
    fn test_unknown_envelope_version_rejected() {
        let future = br#"{"version":9,"stored_at":"2024-01-01T00:00:00Z","ttl_ms":10,"value":{"kind":"integer","data":1}}"#;
        assert!(matches!(JsonCodec.decode(future), Err(CacheError::Decoding(_))));
    }

    #[test]
    fn test_awkward_floats_round_trip_exactly() {
        let awkward = [
            1.0715660391465826e-75,
            -1.81996730402717e-179,
            -1.603964615428183e143,
            f64::MIN_POSITIVE,
            f64::MAX,
            f64::EPSILON,
            0.1 + 0.2,
        ];
        for f in awkward {
            let value = QueryValue::Rows(vec![Row::new(vec![Field::Float(f)])]);
            let bytes = JsonCodec.encode(&value, Utc::now(), Duration::from_secs(1)).unwrap();
            assert_eq!(JsonCodec.decode(&bytes).unwrap().value, value, "float {:e}", f);
        }
    }

    #[test]
    fn test_float_bit_patterns_round_trip_exactly() {
        // xorshift64 over the whole f64 bit space
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut failures = Vec::new();

        for _ in 0..20_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let f = f64::from_bits(state);
            if !f.is_finite() {
                continue;
            }

            let value = QueryValue::Rows(vec![Row::new(vec![Field::Float(f)])]);
            let bytes = JsonCodec.encode(&value, Utc::now(), Duration::from_secs(1)).unwrap();
            let decoded = JsonCodec.decode(&bytes).unwrap().value;
            match decoded.as_rows().and_then(|rows| rows[0].get(0)) {
                Some(Field::Float(back)) if back.to_bits() == f.to_bits() => {}
                _ => failures.push(f),
            }
        }

        assert!(failures.is_empty(), "{} floats changed, e.g. {:?}", failures.len(), &failures[..failures.len().min(3)]);
    }
}
