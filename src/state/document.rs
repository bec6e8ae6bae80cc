//! The authoritative document
//!
//! [`StateDocument`] wraps the single rooted JSON tree and exposes the
//! pointer primitives the patch layer is built on: lookup, set with parent
//! materialization, and removal. Paths use RFC 6901 JSON-Pointer syntax
//! (`/a/b/0/c`); deltas handed to the rule engine use dot notation
//! (`a.b.0.c`).
//!
//! The document is owned exclusively by the core writer task. Nothing in
//! this module is shared; consumers receive copies.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from pointer operations against the document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),

    #[error("path not found: {0}")]
    NotFound(String),

    /// The pointer descends through a scalar, or indexes an array with a
    /// non-numeric token.
    #[error("path type mismatch at {0}")]
    TypeMismatch(String),

    #[error("array index out of bounds at {0}")]
    IndexOutOfBounds(String),
}

/// Split an RFC 6901 pointer into unescaped tokens.
///
/// The empty pointer addresses the root and yields no tokens. A pointer
/// that is non-empty but does not start with `/` is invalid.
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, DocumentError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(DocumentError::InvalidPointer(pointer.to_string()));
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Escape a single token for embedding in a pointer (`~` and `/`).
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Convert a pointer to the dot-notation path used in deltas.
/// The root pointer maps to the empty string.
pub fn pointer_to_dot(pointer: &str) -> String {
    match parse_pointer(pointer) {
        Ok(tokens) => tokens.join("."),
        Err(_) => pointer.trim_start_matches('/').replace('/', "."),
    }
}

/// The single authoritative JSON document.
#[derive(Debug, Clone)]
pub struct StateDocument {
    root: Value,
}

impl StateDocument {
    /// Wrap an initial tree. Non-object roots are accepted (the external
    /// state swap can briefly install one) but every schema starts as an
    /// object.
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Full copy of the tree, for snapshot emission and read replies.
    pub fn clone_root(&self) -> Value {
        self.root.clone()
    }

    /// Replace the entire tree.
    pub fn set_root(&mut self, value: Value) {
        self.root = value;
    }

    /// Resolve a pointer to a reference, `None` if any step is missing.
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        let tokens = parse_pointer(pointer).ok()?;
        let mut current = &self.root;
        for token in &tokens {
            current = match current {
                Value::Object(map) => map.get(token)?,
                Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Whether the pointer resolves to an existing value.
    pub fn contains(&self, pointer: &str) -> bool {
        self.get(pointer).is_some()
    }

    /// Set the value at `pointer`, creating missing intermediate parents
    /// as empty objects.
    ///
    /// Array parents follow RFC 6902 `add` semantics: a numeric token
    /// inserts at that index (which must be <= len), `-` appends. Arrays
    /// are never materialized - a missing parent always becomes an object.
    pub fn set(&mut self, pointer: &str, value: Value) -> Result<(), DocumentError> {
        let tokens = parse_pointer(pointer)?;
        if tokens.is_empty() {
            self.root = value;
            return Ok(());
        }

        let (last, parents) = tokens
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPointer(pointer.to_string()))?;

        let mut current = &mut self.root;
        let mut walked = String::new();
        for token in parents {
            walked.push('/');
            walked.push_str(&escape_token(token));
            current = match current {
                Value::Object(map) => map
                    .entry(token.clone())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => {
                    let idx: usize = token
                        .parse()
                        .map_err(|_| DocumentError::TypeMismatch(walked.clone()))?;
                    items
                        .get_mut(idx)
                        .ok_or_else(|| DocumentError::IndexOutOfBounds(walked.clone()))?
                }
                _ => return Err(DocumentError::TypeMismatch(walked.clone())),
            };
        }

        match current {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                if last == "-" {
                    items.push(value);
                    Ok(())
                } else {
                    let idx: usize = last
                        .parse()
                        .map_err(|_| DocumentError::TypeMismatch(pointer.to_string()))?;
                    if idx > items.len() {
                        return Err(DocumentError::IndexOutOfBounds(pointer.to_string()));
                    }
                    items.insert(idx, value);
                    Ok(())
                }
            }
            _ => Err(DocumentError::TypeMismatch(pointer.to_string())),
        }
    }

    /// Overwrite the value at an existing `pointer`.
    ///
    /// Unlike [`set`](Self::set), array indices replace rather than
    /// insert. The target must exist (callers validate first).
    pub fn replace(&mut self, pointer: &str, value: Value) -> Result<(), DocumentError> {
        let tokens = parse_pointer(pointer)?;
        if tokens.is_empty() {
            self.root = value;
            return Ok(());
        }
        let (last, parents) = tokens
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPointer(pointer.to_string()))?;

        let mut current = &mut self.root;
        for token in parents {
            current = match current {
                Value::Object(map) => map
                    .get_mut(token)
                    .ok_or_else(|| DocumentError::NotFound(pointer.to_string()))?,
                Value::Array(items) => {
                    let idx: usize = token
                        .parse()
                        .map_err(|_| DocumentError::TypeMismatch(pointer.to_string()))?;
                    items
                        .get_mut(idx)
                        .ok_or_else(|| DocumentError::NotFound(pointer.to_string()))?
                }
                _ => return Err(DocumentError::TypeMismatch(pointer.to_string())),
            };
        }

        match current {
            Value::Object(map) => {
                if !map.contains_key(last.as_str()) {
                    return Err(DocumentError::NotFound(pointer.to_string()));
                }
                map.insert(last.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let idx: usize = last
                    .parse()
                    .map_err(|_| DocumentError::TypeMismatch(pointer.to_string()))?;
                let slot = items
                    .get_mut(idx)
                    .ok_or_else(|| DocumentError::NotFound(pointer.to_string()))?;
                *slot = value;
                Ok(())
            }
            _ => Err(DocumentError::TypeMismatch(pointer.to_string())),
        }
    }

    /// Remove and return the value at `pointer`.
    pub fn remove(&mut self, pointer: &str) -> Result<Value, DocumentError> {
        let tokens = parse_pointer(pointer)?;
        let (last, parents) = tokens
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPointer(pointer.to_string()))?;

        let mut current = &mut self.root;
        for token in parents {
            current = match current {
                Value::Object(map) => map
                    .get_mut(token)
                    .ok_or_else(|| DocumentError::NotFound(pointer.to_string()))?,
                Value::Array(items) => {
                    let idx: usize = token
                        .parse()
                        .map_err(|_| DocumentError::TypeMismatch(pointer.to_string()))?;
                    items
                        .get_mut(idx)
                        .ok_or_else(|| DocumentError::NotFound(pointer.to_string()))?
                }
                _ => return Err(DocumentError::TypeMismatch(pointer.to_string())),
            };
        }

        match current {
            Value::Object(map) => map
                .remove(last.as_str())
                .ok_or_else(|| DocumentError::NotFound(pointer.to_string())),
            Value::Array(items) => {
                let idx: usize = last
                    .parse()
                    .map_err(|_| DocumentError::TypeMismatch(pointer.to_string()))?;
                if idx >= items.len() {
                    return Err(DocumentError::NotFound(pointer.to_string()));
                }
                Ok(items.remove(idx))
            }
            _ => Err(DocumentError::TypeMismatch(pointer.to_string())),
        }
    }
}
