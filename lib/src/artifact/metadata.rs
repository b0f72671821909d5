//! Meta-data validation (spec §3, §4.3 "Meta-data validation", §8 boundary
//! behaviours around ±(2^53-1)).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// The maximum (and, negated, minimum) integer spec §3 allows meta-data
/// to carry without round-tripping through a string.
pub const MAX_SAFE_INT: i64 = (1i64 << 53) - 1;

/// One validated meta-data value: string, safe-range integer, or an
/// array of those (spec forbids nesting past one level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// A UTF-8 string.
    Str(String),
    /// An integer within [-(2^53-1), 2^53-1].
    Int(i64),
    /// An array of strings/integers (no further nesting).
    Array(Vec<MetaScalar>),
}

/// The element type allowed inside a [`MetaValue::Array`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaScalar {
    /// A UTF-8 string.
    Str(String),
    /// An integer within [-(2^53-1), 2^53-1].
    Int(i64),
}

impl MetaScalar {
    /// Read this scalar as an integer. Per spec §8, a value that rounded
    /// during JSON parsing (i.e. originally exceeded the safe range) is
    /// still readable as an int, clamped to the boundary, but callers
    /// asking for the precise value should prefer [`Self::as_f64`].
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(_) => None,
        }
    }

    /// Read this scalar as a double, always exact for values produced by
    /// [`parse_meta_data`] (which never rounds; it rejects out-of-range
    /// integers outright rather than clamping).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Str(_) => None,
        }
    }
}

/// Parse and validate a `meta-data` JSON document against spec §4.3:
/// top-level object only, values restricted to string / safe-range
/// integer / array of those.
pub fn parse_meta_data(raw: &[u8]) -> Result<std::collections::BTreeMap<String, MetaValue>> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| EngineError::MetaDataStructure(format!("invalid JSON: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::MetaDataStructure("top level must be a JSON object".into()))?;

    let mut out = std::collections::BTreeMap::new();
    for (key, v) in obj {
        out.insert(key.clone(), validate_value(key, v)?);
    }
    Ok(out)
}

fn validate_value(key: &str, v: &Value) -> Result<MetaValue, EngineError> {
    match v {
        Value::String(s) => Ok(MetaValue::Str(s.clone())),
        Value::Number(n) => Ok(MetaValue::Int(validate_int(key, n)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(match item {
                    Value::String(s) => MetaScalar::Str(s.clone()),
                    Value::Number(n) => MetaScalar::Int(validate_int(key, n)?),
                    other => {
                        return Err(EngineError::MetaDataStructure(format!(
                            "key {key}: array elements must be string or integer, found {other}"
                        )))
                    }
                });
            }
            Ok(MetaValue::Array(out))
        }
        other => Err(EngineError::MetaDataStructure(format!(
            "key {key}: value must be string, integer, or array, found {other}"
        ))),
    }
}

fn validate_int(key: &str, n: &serde_json::Number) -> Result<i64, EngineError> {
    let i = n
        .as_i64()
        .ok_or_else(|| EngineError::MetaDataStructure(format!("key {key}: not an integer")))?;
    if i.abs() > MAX_SAFE_INT {
        return Err(EngineError::MetaDataOutOfRange(format!(
            "key {key}: {i} exceeds +/-(2^53-1); producers must encode as a string"
        )));
    }
    Ok(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_flat_object() {
        let raw = br#"{"a": "x", "b": 5, "c": [1, "y", 2]}"#;
        let m = parse_meta_data(raw).unwrap();
        assert_eq!(m.get("a"), Some(&MetaValue::Str("x".into())));
        assert_eq!(m.get("b"), Some(&MetaValue::Int(5)));
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(parse_meta_data(b"[1,2,3]").is_err());
    }

    #[test]
    fn rejects_nested_object() {
        let raw = br#"{"a": {"b": 1}}"#;
        assert!(parse_meta_data(raw).is_err());
    }

    #[test]
    fn boundary_integers_parse() {
        let raw = format!(r#"{{"a": {}, "b": {}}}"#, MAX_SAFE_INT, -MAX_SAFE_INT);
        let m = parse_meta_data(raw.as_bytes()).unwrap();
        assert_eq!(m.get("a"), Some(&MetaValue::Int(MAX_SAFE_INT)));
        assert_eq!(m.get("b"), Some(&MetaValue::Int(-MAX_SAFE_INT)));
    }

    #[test]
    fn out_of_range_integer_rejected() {
        let raw = format!(r#"{{"a": {}}}"#, MAX_SAFE_INT + 1);
        let err = parse_meta_data(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
