//! Hierarchical binding scopes
//!
//! A `Bindings` value is a persistent linked scope: `register` returns a new
//! scope that shadows the parent for one name, leaving the parent untouched.
//! Sibling steps and operations can therefore fork scopes freely.
//!
//! # Example
//!
//! ```
//! use kuvio::bindings::Bindings;
//! use serde_json::json;
//!
//! let outer = Bindings::new().register("env", json!("dev")).unwrap();
//! let inner = outer.register("env", json!("prod")).unwrap();
//!
//! assert_eq!(outer.get("env"), Some(&json!("dev")));
//! assert_eq!(inner.get("env"), Some(&json!("prod")));
//! assert_eq!(inner.resolve_value(&json!({"name": "$env"})).unwrap(), json!({"name": "prod"}));
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Binding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("invalid binding name '{0}': only letters, digits and '_' are allowed")]
    InvalidName(String),

    #[error("binding '${0}' is not defined")]
    Unresolved(String),
}

struct Node {
    name: String,
    value: Value,
    parent: Option<Arc<Node>>,
}

/// Immutable, cheaply cloneable binding scope
#[derive(Clone, Default)]
pub struct Bindings {
    head: Option<Arc<Node>>,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

/// Whether `name` is a valid binding name
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a child scope where `name` is bound to `value`
    pub fn register(&self, name: &str, value: Value) -> Result<Bindings, BindingError> {
        if !is_valid_name(name) {
            return Err(BindingError::InvalidName(name.to_string()));
        }
        Ok(Bindings {
            head: Some(Arc::new(Node {
                name: name.to_string(),
                value,
                parent: self.head.clone(),
            })),
        })
    }

    /// Innermost value bound to `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.name == name {
                return Some(&n.value);
            }
            node = n.parent.as_deref();
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Visible bindings, innermost first, shadowed entries omitted
    pub fn entries(&self) -> Vec<(&str, &Value)> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if seen.insert(n.name.as_str()) {
                out.push((n.name.as_str(), &n.value));
            }
            node = n.parent.as_deref();
        }
        out
    }

    /// Substitute whole-string `"$name"` references anywhere in `value`
    ///
    /// Strings that are not a bare reference (`"$(VAR)"`, `"a $b"`) are left
    /// as they are. A reference to an unknown binding is an error.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, BindingError> {
        match value {
            Value::String(s) => match reference(s) {
                Some(name) => self
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BindingError::Unresolved(name.to_string())),
                None => Ok(value.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

fn reference(s: &str) -> Option<&str> {
    s.strip_prefix('$').filter(|name| is_valid_name(name))
}
