//! JSON-Patch operations: parsing, filtering, validation, and application
//!
//! The relay speaks a three-op subset of RFC 6902 (`add`, `replace`,
//! `remove`) - the only ops the clients and internal producers emit.
//! A submission passes through three stages:
//!
//! 1. **Parse** - structurally invalid submissions are rejected whole and
//!    never touch the document.
//! 2. **Filter** - ops whose path contains a disallowed token are dropped.
//! 3. **Validate + apply** - `remove`/`replace` of a missing target are
//!    dropped; `add` materializes missing parents. Applied ops are
//!    collected for emission together with the dot-path delta.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use super::document::{pointer_to_dot, StateDocument};
use crate::config::defaults::DISALLOWED_PATH_TOKEN;

/// A single RFC 6902 operation (supported subset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Replace { path, .. }
            | PatchOp::Remove { path } => path,
        }
    }

    /// Parse a wire-form ops array. Any structural problem (not an array,
    /// unknown op, missing fields) rejects the whole submission.
    pub fn parse_array(raw: &Value) -> Result<Vec<PatchOp>, PatchError> {
        if !raw.is_array() {
            return Err(PatchError::Malformed("patch must be an array".to_string()));
        }
        serde_json::from_value(raw.clone()).map_err(|e| PatchError::Malformed(e.to_string()))
    }
}

/// Patch submission errors surfaced to the submitter.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The submission was not a structurally valid ops array.
    #[error("malformed patch: {0}")]
    Malformed(String),
}

/// New value of a path in a delta, or the removal sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaValue {
    Set(Value),
    Removed,
}

/// The set of dot-notation paths changed by one applied patch, with their
/// new values. Ordered so downstream logs are deterministic.
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub changes: BTreeMap<String, DeltaValue>,
    /// Producer tag carried into rule evaluation ("state", "discovery", ...).
    pub source: String,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Drop ops whose path mentions the disallowed token.
pub fn filter_ops(ops: Vec<PatchOp>) -> Vec<PatchOp> {
    ops.into_iter()
        .filter(|op| {
            let keep = !op
                .path()
                .split('/')
                .any(|token| token == DISALLOWED_PATH_TOKEN);
            if !keep {
                tracing::debug!(path = op.path(), "Dropped op with disallowed path token");
            }
            keep
        })
        .collect()
}

/// Validate and apply `ops` in order against `doc`.
///
/// Returns the ops that were actually applied plus the resulting delta.
/// Invalid ops (remove/replace of a missing target, descent through a
/// scalar, bad array index) are dropped individually - matching the filter
/// stage, not an error. Validation sees the effects of earlier ops in the
/// same submission.
pub fn apply_validated(
    doc: &mut StateDocument,
    ops: Vec<PatchOp>,
    source: &str,
) -> (Vec<PatchOp>, StateDelta) {
    let mut applied = Vec::with_capacity(ops.len());
    let mut delta = StateDelta {
        changes: BTreeMap::new(),
        source: source.to_string(),
    };

    for op in ops {
        let dot = pointer_to_dot(op.path());
        let outcome = match &op {
            PatchOp::Add { path, value } => doc
                .set(path, value.clone())
                .map(|()| DeltaValue::Set(value.clone())),
            PatchOp::Replace { path, value } => {
                if doc.contains(path) {
                    doc.replace(path, value.clone())
                        .map(|()| DeltaValue::Set(value.clone()))
                } else {
                    tracing::debug!(path = %path, "Dropped replace of non-existent target");
                    continue;
                }
            }
            PatchOp::Remove { path } => {
                if doc.contains(path) {
                    doc.remove(path).map(|_| DeltaValue::Removed)
                } else {
                    tracing::debug!(path = %path, "Dropped remove of non-existent target");
                    continue;
                }
            }
        };

        match outcome {
            Ok(change) => {
                delta.changes.insert(dot, change);
                applied.push(op);
            }
            Err(e) => {
                tracing::debug!(path = op.path(), error = %e, "Dropped inapplicable op");
            }
        }
    }

    (applied, delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> StateDocument {
        StateDocument::new(v)
    }

    #[test]
    fn test_parse_array_rejects_unknown_op() {
        let raw = json!([{"op": "move", "from": "/a", "path": "/b"}]);
        assert!(matches!(
            PatchOp::parse_array(&raw),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_array_rejects_non_array() {
        let raw = json!({"op": "add", "path": "/a", "value": 1});
        assert!(PatchOp::parse_array(&raw).is_err());
    }

    #[test]
    fn test_filter_drops_disallowed_token() {
        let ops = vec![
            PatchOp::Replace {
                path: "/navigation/position".to_string(),
                value: json!({}),
            },
            PatchOp::Replace {
                path: "/navigation/altitude".to_string(),
                value: json!(12.0),
            },
        ];
        let kept = filter_ops(ops);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].path(), "/navigation/position");
    }

    #[test]
    fn test_replace_of_missing_target_dropped() {
        let mut d = doc(json!({}));
        let ops = vec![PatchOp::Replace {
            path: "/a/b".to_string(),
            value: json!(1),
        }];
        let (applied, delta) = apply_validated(&mut d, ops, "test");
        assert!(applied.is_empty());
        assert!(delta.is_empty());
        assert_eq!(d.root(), &json!({}));
    }

    #[test]
    fn test_add_materializes_and_applies() {
        let mut d = doc(json!({}));
        let ops = vec![PatchOp::Add {
            path: "/a/b".to_string(),
            value: json!(1),
        }];
        let (applied, delta) = apply_validated(&mut d, ops, "test");
        assert_eq!(applied.len(), 1);
        assert_eq!(d.root(), &json!({"a": {"b": 1}}));
        assert_eq!(delta.changes.get("a.b"), Some(&DeltaValue::Set(json!(1))));
    }

    #[test]
    fn test_remove_idempotence_within_submission() {
        // First remove applies, the second is dropped by validation.
        let mut d = doc(json!({"a": {"b": 1}}));
        let ops = vec![
            PatchOp::Remove {
                path: "/a/b".to_string(),
            },
            PatchOp::Remove {
                path: "/a/b".to_string(),
            },
        ];
        let (applied, delta) = apply_validated(&mut d, ops, "test");
        assert_eq!(applied.len(), 1);
        assert_eq!(delta.changes.get("a.b"), Some(&DeltaValue::Removed));
        assert_eq!(d.root(), &json!({"a": {}}));
    }

    #[test]
    fn test_later_ops_see_earlier_effects() {
        let mut d = doc(json!({}));
        let ops = vec![
            PatchOp::Add {
                path: "/a".to_string(),
                value: json!({}),
            },
            PatchOp::Add {
                path: "/a/b".to_string(),
                value: json!(2),
            },
            PatchOp::Replace {
                path: "/a/b".to_string(),
                value: json!(3),
            },
        ];
        let (applied, delta) = apply_validated(&mut d, ops, "test");
        assert_eq!(applied.len(), 3);
        assert_eq!(d.get("/a/b"), Some(&json!(3)));
        // Later writes win in the delta map.
        assert_eq!(delta.changes.get("a.b"), Some(&DeltaValue::Set(json!(3))));
    }
}
