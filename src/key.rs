//! Canonical cache key derivation
//!
//! Keys are a pure function of the query kind and the logical parameter set.
//! Parameter names are sorted, and every variable-length segment is
//! length-prefixed so that no combination of names and values can produce the
//! key of a different query:
//!
//! ```text
//! qc:v1:17:count_by_director;8:director=s5:Nolan
//! ```

use crate::error::{CacheError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Default namespace prefix for derived keys
pub const DEFAULT_KEY_PREFIX: &str = "qc";

/// Version of the key layout; bump when the encoding changes
const KEY_FORMAT_VERSION: &str = "v1";

/// Parameters of an aggregate query, ordered by name
pub type QueryParams = BTreeMap<String, ParamValue>;

/// A single query parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn encode_into(&self, name: &str, out: &mut String) -> Result<()> {
        match self {
            ParamValue::Null => out.push('n'),
            ParamValue::Bool(b) => {
                out.push_str("b:");
                out.push_str(if *b { "true" } else { "false" });
            }
            ParamValue::Int(i) => {
                out.push_str("i:");
                out.push_str(&i.to_string());
            }
            ParamValue::Float(f) => {
                if !f.is_finite() {
                    return Err(CacheError::InvalidParameter(format!(
                        "parameter '{}' is a non-finite float ({})",
                        name, f
                    )));
                }
                // -0.0 == 0.0, so they must share a key
                let f = if *f == 0.0 { 0.0 } else { *f };
                out.push_str("f:");
                out.push_str(&f.to_string());
            }
            ParamValue::Text(s) => {
                reject_nul(s, || format!("value of parameter '{}'", name))?;
                out.push('s');
                push_segment(out, s);
            }
        }
        Ok(())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        ParamValue::Int(i64::from(i))
    }
}

impl From<u32> for ParamValue {
    fn from(i: u32) -> Self {
        ParamValue::Int(i64::from(i))
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "null"),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Opaque cache key, stable across process restarts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a query kind and its parameter set
    pub fn derive(prefix: &str, query_kind: &str, params: &QueryParams) -> Result<Self> {
        if prefix.is_empty() {
            return Err(CacheError::InvalidParameter(
                "key prefix must not be empty".to_string(),
            ));
        }
        reject_nul(prefix, || "key prefix".to_string())?;
        if query_kind.is_empty() {
            return Err(CacheError::InvalidParameter(
                "query kind must not be empty".to_string(),
            ));
        }
        reject_nul(query_kind, || "query kind".to_string())?;

        let mut key = format!("{}:{}:", prefix, KEY_FORMAT_VERSION);
        push_segment(&mut key, query_kind);

        // BTreeMap iteration is already in lexicographic name order
        for (name, value) in params {
            if name.is_empty() {
                return Err(CacheError::InvalidParameter(
                    "parameter name must not be empty".to_string(),
                ));
            }
            reject_nul(name, || format!("parameter name {:?}", name))?;

            key.push(';');
            push_segment(&mut key, name);
            key.push('=');
            value.encode_into(name, &mut key)?;
        }

        Ok(CacheKey(key))
    }

    /// The key as stored in the cache
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fluent builder for cache keys
///
/// ```
/// use aggregate_cache::CacheKeyBuilder;
///
/// let a = CacheKeyBuilder::new("count_by_director")
///     .param("director", "Nolan")
///     .param("min_rating", 7)
///     .build()
///     .unwrap();
/// let b = CacheKeyBuilder::new("count_by_director")
///     .param("min_rating", 7)
///     .param("director", "Nolan")
///     .build()
///     .unwrap();
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    prefix: String,
    query_kind: String,
    params: Vec<(String, ParamValue)>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder for a query kind
    pub fn new(query_kind: impl Into<String>) -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            query_kind: query_kind.into(),
            params: Vec::new(),
        }
    }

    /// Set the namespace prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Add a parameter to the key
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Add several parameters
    pub fn params<K, V, I>(mut self, params: I) -> Self
    where
        K: Into<String>,
        V: Into<ParamValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Build the cache key
    ///
    /// Fails if a parameter name is given twice or any input is not representable.
    pub fn build(self) -> Result<CacheKey> {
        let mut canonical = QueryParams::new();
        for (name, value) in self.params {
            if canonical.contains_key(&name) {
                return Err(CacheError::InvalidParameter(format!(
                    "duplicate parameter '{}'",
                    name
                )));
            }
            canonical.insert(name, value);
        }
        CacheKey::derive(&self.prefix, &self.query_kind, &canonical)
    }
}

fn push_segment(out: &mut String, s: &str) {
    out.push_str(&s.len().to_string());
    out.push(':');
    out.push_str(s);
}

fn reject_nul(s: &str, what: impl FnOnce() -> String) -> Result<()> {
    if s.contains('\0') {
        return Err(CacheError::InvalidParameter(format!(
            "{} contains a NUL character",
            what()
        )));
    }
    Ok(())
}
