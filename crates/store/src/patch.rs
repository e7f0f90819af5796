//! Minimal RFC-6902 diff and patch over JSON documents.
//!
//! Supports the three operations the engine needs — `add`, `remove`,
//! `replace` — with standard pointer escaping (`~0` for `~`, `~1` for `/`)
//! and the `-` segment for array append. The engine uses this only to
//! reconcile change-callback arguments: the patch between the previous
//! working copy and a transform's output is applied back onto the previous
//! copy, so the new document differs from the old one exactly where the
//! transform touched it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error applying a patch to a document that does not match it.
#[derive(Debug, Error)]
#[error("patch application failed at {path:?}: {reason}")]
pub struct PatchError {
    /// The pointer that failed to resolve.
    pub path: String,
    /// What went wrong.
    pub reason: String,
}

/// One RFC-6902 operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a member or array element at `path`.
    Add {
        /// JSON pointer; `-` as the final segment appends to an array.
        path: String,
        /// The value to insert.
        value: Value,
    },
    /// Remove the member or array element at `path`.
    Remove {
        /// JSON pointer to the element to remove.
        path: String,
    },
    /// Replace the value at `path`.
    Replace {
        /// JSON pointer to the element to replace.
        path: String,
        /// The replacement value.
        value: Value,
    },
}

/// Escapes one pointer segment (`~` → `~0`, `/` → `~1`).
fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Unescapes one pointer segment (`~1` → `/`, then `~0` → `~`).
fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Computes the operations that transform `old` into `new`.
///
/// Objects and arrays are diffed structurally; everything else that
/// differs becomes a `replace`. Array growth appends with `-`; array
/// shrinkage removes trailing indices highest-first so the emitted
/// operations apply cleanly in order.
#[must_use]
pub fn create_patch(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into("", old, new, &mut ops);
    ops
}

fn diff_into(path: &str, old: &Value, new: &Value, ops: &mut Vec<PatchOp>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    ops.push(PatchOp::Remove { path: format!("{path}/{}", escape(key)) });
                }
            }
            for (key, new_value) in new_map {
                let child = format!("{path}/{}", escape(key));
                match old_map.get(key) {
                    Some(old_value) => diff_into(&child, old_value, new_value, ops),
                    None => ops.push(PatchOp::Add { path: child, value: new_value.clone() }),
                }
            }
        },
        (Value::Array(old_arr), Value::Array(new_arr)) => {
            let shared = old_arr.len().min(new_arr.len());
            for index in 0..shared {
                diff_into(&format!("{path}/{index}"), &old_arr[index], &new_arr[index], ops);
            }
            for index in (shared..old_arr.len()).rev() {
                ops.push(PatchOp::Remove { path: format!("{path}/{index}") });
            }
            for value in &new_arr[shared..] {
                ops.push(PatchOp::Add { path: format!("{path}/-"), value: value.clone() });
            }
        },
        _ => {
            if old != new {
                ops.push(PatchOp::Replace { path: path.to_string(), value: new.clone() });
            }
        },
    }
}

/// Applies operations to a document, returning the patched document.
///
/// # Errors
///
/// [`PatchError`] when a pointer does not resolve against the document.
pub fn apply_patch(mut doc: Value, ops: &[PatchOp]) -> Result<Value, PatchError> {
    for op in ops {
        match op {
            PatchOp::Add { path, value } => apply_add(&mut doc, path, value.clone())?,
            PatchOp::Remove { path } => apply_remove(&mut doc, path)?,
            PatchOp::Replace { path, value } => apply_replace(&mut doc, path, value.clone())?,
        }
    }
    Ok(doc)
}

fn split_pointer(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError {
            path: path.to_string(),
            reason: "pointer must start with '/'".to_string(),
        });
    };
    Ok(rest.split('/').map(unescape).collect())
}

/// Resolves the parent of a pointer, returning it with the final segment.
fn resolve_parent<'a>(
    doc: &'a mut Value,
    path: &str,
) -> Result<(&'a mut Value, String), PatchError> {
    let mut segments = split_pointer(path)?;
    let Some(last) = segments.pop() else {
        return Err(PatchError {
            path: path.to_string(),
            reason: "operation on the root document requires replace".to_string(),
        });
    };

    let mut node = doc;
    for segment in &segments {
        node = descend(node, segment, path)?;
    }
    Ok((node, last))
}

fn descend<'a>(node: &'a mut Value, segment: &str, path: &str) -> Result<&'a mut Value, PatchError> {
    match node {
        Value::Object(map) => map.get_mut(segment).ok_or_else(|| PatchError {
            path: path.to_string(),
            reason: format!("no member {segment:?}"),
        }),
        Value::Array(arr) => {
            let index = parse_index(segment, arr.len(), path)?;
            arr.get_mut(index).ok_or_else(|| PatchError {
                path: path.to_string(),
                reason: format!("index {index} out of bounds"),
            })
        },
        _ => Err(PatchError {
            path: path.to_string(),
            reason: format!("cannot descend into scalar at {segment:?}"),
        }),
    }
}

fn parse_index(segment: &str, len: usize, path: &str) -> Result<usize, PatchError> {
    segment.parse::<usize>().map_err(|_| PatchError {
        path: path.to_string(),
        reason: format!("invalid array index {segment:?} (len {len})"),
    })
}

fn apply_add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = resolve_parent(doc, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        },
        Value::Array(arr) => {
            if last == "-" {
                arr.push(value);
                return Ok(());
            }
            let index = parse_index(&last, arr.len(), path)?;
            if index > arr.len() {
                return Err(PatchError {
                    path: path.to_string(),
                    reason: format!("index {index} out of bounds for insert"),
                });
            }
            arr.insert(index, value);
            Ok(())
        },
        _ => Err(PatchError {
            path: path.to_string(),
            reason: "parent is not a container".to_string(),
        }),
    }
}

fn apply_remove(doc: &mut Value, path: &str) -> Result<(), PatchError> {
    let (parent, last) = resolve_parent(doc, path)?;
    match parent {
        Value::Object(map) => match map.remove(&last) {
            Some(_) => Ok(()),
            None => Err(PatchError {
                path: path.to_string(),
                reason: format!("no member {last:?}"),
            }),
        },
        Value::Array(arr) => {
            let index = parse_index(&last, arr.len(), path)?;
            if index >= arr.len() {
                return Err(PatchError {
                    path: path.to_string(),
                    reason: format!("index {index} out of bounds"),
                });
            }
            arr.remove(index);
            Ok(())
        },
        _ => Err(PatchError {
            path: path.to_string(),
            reason: "parent is not a container".to_string(),
        }),
    }
}

fn apply_replace(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = resolve_parent(doc, path)?;
    match parent {
        Value::Object(map) => {
            let Some(slot) = map.get_mut(&last) else {
                return Err(PatchError {
                    path: path.to_string(),
                    reason: format!("no member {last:?}"),
                });
            };
            *slot = value;
            Ok(())
        },
        Value::Array(arr) => {
            let index = parse_index(&last, arr.len(), path)?;
            let Some(slot) = arr.get_mut(index) else {
                return Err(PatchError {
                    path: path.to_string(),
                    reason: format!("index {index} out of bounds"),
                });
            };
            *slot = value;
            Ok(())
        },
        _ => Err(PatchError {
            path: path.to_string(),
            reason: "parent is not a container".to_string(),
        }),
    }
}

/// Returns `true` when `path` touches `prefix` or anything beneath it.
///
/// Used by tests to assert which subtrees a patch leaves alone.
#[must_use]
pub fn touches(ops: &[PatchOp], prefix: &str) -> bool {
    ops.iter().any(|op| {
        let path = match op {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } | PatchOp::Replace { path, .. } => {
                path
            },
        };
        path == prefix || path.starts_with(&format!("{prefix}/"))
    })
}
