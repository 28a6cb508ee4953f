//! Structural matching of expected templates against actual documents
//!
//! `match_value` checks that `actual` is a structural superset of `expected`:
//! maps may carry extra keys, arrays must match positionally and in length,
//! scalars must be equal.
//!
//! # Example
//!
//! ```
//! use kuvio::matching::match_value;
//! use serde_json::json;
//!
//! let expected = json!({ "spec": { "replicas": 3 } });
//! let actual = json!({ "spec": { "replicas": 3, "paused": false }, "status": {} });
//! assert!(match_value(&expected, &actual).is_ok());
//!
//! let err = match_value(&json!({ "a": 1 }), &json!({ "b": 2 })).unwrap_err();
//! assert_eq!(err.to_string(), ".a: key is missing from map");
//! ```

use serde_json::{Number, Value};

/// Why a comparison failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    /// Expected and actual have different dynamic types
    #[error("type mismatch: {expected} != {actual}")]
    Type {
        expected: &'static str,
        actual: &'static str,
    },
    /// Scalars differ
    #[error("value mismatch, expected: {expected} != actual: {actual}")]
    Value { expected: String, actual: String },
    /// Arrays have different lengths
    #[error("slice length mismatch: {expected} != {actual}")]
    SliceLength { expected: usize, actual: usize },
    /// A key of the expected map is absent from the actual map
    #[error("key is missing from map")]
    MissingKey,
}

/// A failed match, qualified with the dotted path of map keys leading to it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{}", path_prefix(.path), .mismatch)]
pub struct MatchError {
    /// Dotted path such as `.spec.containers`, empty at the root
    pub path: String,
    pub mismatch: Mismatch,
}

fn path_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}: ")
    }
}

impl MatchError {
    fn new(mismatch: Mismatch) -> Self {
        Self {
            path: String::new(),
            mismatch,
        }
    }

    fn under(mut self, key: &str) -> Self {
        self.path = format!(".{key}{}", self.path);
        self
    }
}

/// Name of the dynamic type of a value, as used in mismatch messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Compare `expected` against `actual` using subset semantics
///
/// Returns the first mismatch found. Map keys are visited in the order of
/// the expected document; array elements in index order.
pub fn match_value(expected: &Value, actual: &Value) -> Result<(), MatchError> {
    match (expected, actual) {
        (Value::Null, Value::Null) => Ok(()),
        (Value::Bool(e), Value::Bool(a)) => {
            if e == a {
                Ok(())
            } else {
                Err(value_mismatch(expected, actual))
            }
        }
        (Value::Number(e), Value::Number(a)) => {
            if numbers_equal(e, a) {
                Ok(())
            } else {
                Err(value_mismatch(expected, actual))
            }
        }
        (Value::String(e), Value::String(a)) => {
            if e == a {
                Ok(())
            } else {
                Err(value_mismatch(expected, actual))
            }
        }
        (Value::Array(e), Value::Array(a)) => {
            if e.len() != a.len() {
                return Err(MatchError::new(Mismatch::SliceLength {
                    expected: e.len(),
                    actual: a.len(),
                }));
            }
            e.iter()
                .zip(a.iter())
                .try_for_each(|(e, a)| match_value(e, a))
        }
        (Value::Object(e), Value::Object(a)) => {
            for (key, expected_value) in e {
                match a.get(key) {
                    Some(actual_value) => {
                        match_value(expected_value, actual_value).map_err(|err| err.under(key))?
                    }
                    None => return Err(MatchError::new(Mismatch::MissingKey).under(key)),
                }
            }
            Ok(())
        }
        _ => Err(MatchError::new(Mismatch::Type {
            expected: type_name(expected),
            actual: type_name(actual),
        })),
    }
}

/// Whether `actual` matches `expected`
pub fn matches(expected: &Value, actual: &Value) -> bool {
    match_value(expected, actual).is_ok()
}

fn numbers_equal(e: &Number, a: &Number) -> bool {
    if let (Some(e), Some(a)) = (e.as_i64(), a.as_i64()) {
        return e == a;
    }
    if let (Some(e), Some(a)) = (e.as_u64(), a.as_u64()) {
        return e == a;
    }
    match (e.as_f64(), a.as_f64()) {
        (Some(e), Some(a)) => e == a,
        _ => false,
    }
}

fn value_mismatch(expected: &Value, actual: &Value) -> MatchError {
    MatchError::new(Mismatch::Value {
        expected: scalar_display(expected),
        actual: scalar_display(actual),
    })
}

fn scalar_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn err(expected: Value, actual: Value) -> String {
        match_value(&expected, &actual).unwrap_err().to_string()
    }

    #[test]
    fn test_exact_match() {
        assert!(match_value(&json!("hello"), &json!("hello")).is_ok());
        assert!(match_value(&json!(null), &json!(null)).is_ok());
    }

    #[test]
    fn test_type_mismatch() {
        assert_eq!(err(json!(1), json!("1")), "type mismatch: number != string");
        assert_eq!(
            err(json!({"a": []}), json!({"a": {}})),
            ".a: type mismatch: array != object"
        );
    }

    #[test]
    fn test_slice_length_mismatch_ignores_elements() {
        assert_eq!(err(json!([1, 2]), json!([1, 2, 3])), "slice length mismatch: 2 != 3");
        assert_eq!(err(json!([9, 9]), json!([1, 2, 3])), "slice length mismatch: 2 != 3");
    }

    #[test]
    fn test_missing_map_key() {
        assert_eq!(err(json!({"a": 1}), json!({"b": 2})), ".a: key is missing from map");
    }

    #[test]
    fn test_nested_structures() {
        assert!(match_value(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})).is_ok());
        assert_eq!(
            err(json!({"a": [1, 2]}), json!({"a": [1, 2, 3]})),
            ".a: slice length mismatch: 2 != 3"
        );
        assert_eq!(
            err(json!({"a": {"b": 2}}), json!({"a": {"c": 3}})),
            ".a.b: key is missing from map"
        );
    }

    #[test]
    fn test_extra_keys_allowed() {
        assert!(match_value(&json!({"a": 1}), &json!({"a": 1, "b": 2})).is_ok());
    }

    #[test]
    fn test_array_elements_are_positional() {
        assert_eq!(
            err(json!([1, 2]), json!([1, 3])),
            "value mismatch, expected: 2 != actual: 3"
        );
        assert_eq!(
            err(json!([[1, 2], [3, 4]]), json!([[1, 2], [4, 5]])),
            "value mismatch, expected: 3 != actual: 4"
        );
        assert!(match_value(&json!([1, 2]), &json!([2, 1])).is_err());
    }

    #[test]
    fn test_scalar_mismatches() {
        assert_eq!(
            err(json!(true), json!(false)),
            "value mismatch, expected: true != actual: false"
        );
        assert_eq!(
            err(json!("hello"), json!("world")),
            "value mismatch, expected: hello != actual: world"
        );
        assert_eq!(
            err(json!(1.1), json!(1.2)),
            "value mismatch, expected: 1.1 != actual: 1.2"
        );
        assert_eq!(err(json!(1), json!(2)), "value mismatch, expected: 1 != actual: 2");
    }

    #[test]
    fn test_integer_and_float_compare_numerically() {
        assert!(match_value(&json!(2), &json!(2.0)).is_ok());
        assert!(match_value(&json!(-1), &json!(-1)).is_ok());
    }

    #[test]
    fn test_superset_documents_match() {
        let expected = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "spec": { "template": { "spec": { "containers": [{ "name": "app" }] } } }
        });
        let actual = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "uid": "1234" },
            "spec": {
                "replicas": 1,
                "template": { "spec": { "containers": [{ "name": "app", "image": "nginx" }] } }
            },
            "status": { "readyReplicas": 1 }
        });
        assert!(matches(&expected, &actual));
    }

    #[test]
    fn test_deep_path_is_reported() {
        let e = match_value(
            &json!({"spec": {"containers": [{"name": "x"}]}}),
            &json!({"spec": {"containers": [{"name": "y"}]}}),
        )
        .unwrap_err();
        assert_eq!(e.path, ".spec.containers.name");
        assert_eq!(
            e.mismatch,
            Mismatch::Value {
                expected: "x".to_string(),
                actual: "y".to_string()
            }
        );
    }
}
