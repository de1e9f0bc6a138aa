//! # Patch Operations
//!
//! A patch is an ordered list of operations addressed by JSON pointers.
//! The serialized shape follows RFC 6902 (`{"op": "add", "path": ..., "value": ...}`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pointer;
use crate::PatchError;

/// One structural edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Insert a value (object member or array element)
    Add { path: String, value: Value },

    /// Remove the value at path
    Remove { path: String },

    /// Replace the existing value at path
    Replace { path: String, value: Value },
}

/// Ordered edit sequence
pub type Patch = Vec<Operation>;

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Add { path, .. } => path,
            Operation::Remove { path } => path,
            Operation::Replace { path, .. } => path,
        }
    }

    fn apply_to(&self, doc: &mut Value) -> Result<(), PatchError> {
        let path = self.path();
        let tokens = pointer::tokens(path)?;

        let Some((last, parents)) = tokens.split_last() else {
            // Root pointer: add and replace swap the whole document
            return match self {
                Operation::Add { value, .. } | Operation::Replace { value, .. } => {
                    *doc = value.clone();
                    Ok(())
                }
                Operation::Remove { .. } => Err(PatchError::InvalidPointer(path.to_string())),
            };
        };

        let parent = resolve_mut(doc, parents, path)?;

        match (self, parent) {
            (Operation::Add { value, .. }, Value::Object(map)) => {
                map.insert(last.clone(), value.clone());
                Ok(())
            }
            (Operation::Add { value, .. }, Value::Array(items)) => {
                if last == "-" {
                    items.push(value.clone());
                    return Ok(());
                }
                let index = pointer::parse_index(last, path)?;
                if index > items.len() {
                    return Err(PatchError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                    });
                }
                items.insert(index, value.clone());
                Ok(())
            }
            (Operation::Remove { .. }, Value::Object(map)) => map
                .remove(last)
                .map(|_| ())
                .ok_or_else(|| PatchError::PathNotFound(path.to_string())),
            (Operation::Remove { .. }, Value::Array(items)) => {
                let index = pointer::parse_index(last, path)?;
                if index >= items.len() {
                    return Err(PatchError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                    });
                }
                items.remove(index);
                Ok(())
            }
            (Operation::Replace { value, .. }, Value::Object(map)) => {
                let slot = map
                    .get_mut(last)
                    .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?;
                *slot = value.clone();
                Ok(())
            }
            (Operation::Replace { value, .. }, Value::Array(items)) => {
                let index = pointer::parse_index(last, path)?;
                let slot = items.get_mut(index).ok_or_else(|| PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                })?;
                *slot = value.clone();
                Ok(())
            }
            _ => Err(PatchError::NotAContainer(path.to_string())),
        }
    }
}

fn resolve_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PatchError::PathNotFound(path.to_string()))?,
            Value::Array(items) => {
                let index = pointer::parse_index(token, path)?;
                items.get_mut(index).ok_or_else(|| PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                    index,
                })?
            }
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }
    Ok(current)
}

/// Apply operations in order.
///
/// Application is all-or-nothing: if any operation fails, `doc` is unchanged.
pub fn apply(doc: &mut Value, ops: &[Operation]) -> Result<(), PatchError> {
    if ops.is_empty() {
        return Ok(());
    }

    let mut scratch = doc.clone();
    for op in ops {
        op.apply_to(&mut scratch)?;
    }
    *doc = scratch;
    Ok(())
}
