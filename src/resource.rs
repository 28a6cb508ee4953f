//! Dynamic resource documents
//!
//! Resources are kept as `serde_json::Value` trees; `apiVersion`, `kind` and
//! `metadata` are recognized by convention only, so any custom kind works.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resource document errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource is not an object")]
    NotAnObject,

    #[error("resource is missing '{0}'")]
    MissingField(&'static str),

    #[error("failed to parse resource documents from {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("exactly one of 'resource' or 'file' must be set")]
    Source,

    #[error("invalid label selector '{0}': expected key=value pairs")]
    Selector(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `apiVersion` of the document
pub fn api_version(obj: &Value) -> Option<&str> {
    obj.get("apiVersion").and_then(Value::as_str)
}

/// `kind` of the document
pub fn kind(obj: &Value) -> Option<&str> {
    obj.get("kind").and_then(Value::as_str)
}

/// `metadata.name` of the document
pub fn name(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(Value::as_str)
}

/// `metadata.namespace` of the document
pub fn namespace(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/namespace").and_then(Value::as_str)
}

/// `metadata.labels` of the document, ignoring non-string values
pub fn labels(obj: &Value) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Set `metadata.namespace`, creating `metadata` when absent
pub fn set_namespace(obj: &mut Value, ns: &str) -> Result<(), ResourceError> {
    let root = obj.as_object_mut().ok_or(ResourceError::NotAnObject)?;
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let metadata = metadata
        .as_object_mut()
        .ok_or(ResourceError::MissingField("metadata"))?;
    metadata.insert("namespace".to_string(), Value::String(ns.to_string()));
    Ok(())
}

/// Check the fields every resource document needs
pub fn validate(obj: &Value) -> Result<(), ResourceError> {
    if !obj.is_object() {
        return Err(ResourceError::NotAnObject);
    }
    if api_version(obj).is_none() {
        return Err(ResourceError::MissingField("apiVersion"));
    }
    if kind(obj).is_none() {
        return Err(ResourceError::MissingField("kind"));
    }
    Ok(())
}

/// Human-readable reference such as `apps/v1/Deployment/ns/web`
pub fn describe(obj: &Value) -> String {
    let mut parts = vec![
        api_version(obj).unwrap_or("?").to_string(),
        kind(obj).unwrap_or("?").to_string(),
    ];
    if let Some(ns) = namespace(obj) {
        parts.push(ns.to_string());
    }
    match name(obj) {
        Some(n) => parts.push(n.to_string()),
        None => {
            let labels = labels(obj);
            if !labels.is_empty() {
                let selector: Vec<String> =
                    labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                parts.push(format!("[{}]", selector.join(",")));
            }
        }
    }
    parts.join("/")
}

/// Parse `---` separated YAML (or JSON) documents, skipping empty ones
pub fn parse_documents(content: &str, source_name: &str) -> Result<Vec<Value>, ResourceError> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| ResourceError::Parse {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Load every document from `paths`
///
/// Files are processed in sorted path order, documents in file order.
pub fn load_files(paths: &[PathBuf]) -> Result<Vec<Value>, ResourceError> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();

    let mut docs = Vec::new();
    for path in sorted {
        docs.extend(load_file(path)?);
    }
    Ok(docs)
}

/// Load documents from a file, or from every YAML/JSON file of a directory
///
/// Directory entries are visited in sorted order.
pub fn load_path(path: &Path) -> Result<Vec<Value>, ResourceError> {
    if !path.is_dir() {
        return load_file(path);
    }
    let read_dir = std::fs::read_dir(path).map_err(|source| ResourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| ResourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = entry.path();
        let is_document = matches!(
            file.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if file.is_file() && is_document {
            files.push(file);
        }
    }
    load_files(&files)
}

/// Load every document from one file
pub fn load_file(path: &Path) -> Result<Vec<Value>, ResourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_documents(&content, &path.display().to_string())
}
