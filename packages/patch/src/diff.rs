//! # Structural Diff
//!
//! Computes the operations that turn one document into another.
//!
//! - Objects are compared member by member
//! - Arrays are compared index by index; length changes add or remove at the tail
//! - Anything else that differs is replaced wholesale

use serde_json::Value;

use crate::operation::{Operation, Patch};
use crate::pointer;

/// Compute a patch transforming `before` into `after`.
///
/// Equal documents produce an empty patch.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut ops = Vec::new();
    diff_into(String::new(), before, after, &mut ops);
    ops
}

fn diff_into(path: String, before: &Value, after: &Value, ops: &mut Patch) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for key in old.keys() {
                if !new.contains_key(key) {
                    ops.push(Operation::Remove {
                        path: pointer::join(&path, key),
                    });
                }
            }
            for (key, new_value) in new {
                let child = pointer::join(&path, key);
                match old.get(key) {
                    Some(old_value) => diff_into(child, old_value, new_value, ops),
                    None => ops.push(Operation::Add {
                        path: child,
                        value: new_value.clone(),
                    }),
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for index in 0..common {
                diff_into(
                    pointer::join(&path, &index.to_string()),
                    &old[index],
                    &new[index],
                    ops,
                );
            }
            // Remove from the end so earlier indices stay valid
            for index in (common..old.len()).rev() {
                ops.push(Operation::Remove {
                    path: pointer::join(&path, &index.to_string()),
                });
            }
            for (index, value) in new.iter().enumerate().skip(common) {
                ops.push(Operation::Add {
                    path: pointer::join(&path, &index.to_string()),
                    value: value.clone(),
                });
            }
        }
        _ => ops.push(Operation::Replace {
            path,
            value: after.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply;
    use serde_json::json;

    #[test]
    fn test_equal_documents_produce_empty_patch() {
        let doc = json!({ "a": [1, 2, { "b": null }] });
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_scalar_change_is_replace() {
        let ops = diff(&json!({ "value": 42 }), &json!({ "value": 44 }));
        assert_eq!(
            ops,
            vec![Operation::Replace {
                path: "/value".to_string(),
                value: json!(44),
            }]
        );
    }

    #[test]
    fn test_member_added_and_removed() {
        let ops = diff(&json!({ "a": 1 }), &json!({ "b": 2 }));
        assert_eq!(
            ops,
            vec![
                Operation::Remove { path: "/a".to_string() },
                Operation::Add {
                    path: "/b".to_string(),
                    value: json!(2),
                },
            ]
        );
    }

    #[test]
    fn test_array_shrink_removes_from_tail() {
        let ops = diff(&json!([1, 2, 3]), &json!([1]));
        assert_eq!(
            ops,
            vec![
                Operation::Remove { path: "/2".to_string() },
                Operation::Remove { path: "/1".to_string() },
            ]
        );
    }

    #[test]
    fn test_forward_and_reverse_patches_restore_documents() {
        let before = json!({
            "name": "diagram",
            "nodes": [{ "id": "n1", "x": 0 }, { "id": "n2", "x": 5 }],
            "meta": { "tags": ["a"] }
        });
        let after = json!({
            "name": "diagram-2",
            "nodes": [{ "id": "n1", "x": 10 }],
            "meta": { "tags": ["a", "b"], "owner": "me" }
        });

        let mut doc = before.clone();
        apply(&mut doc, &diff(&before, &after)).unwrap();
        assert_eq!(doc, after);

        apply(&mut doc, &diff(&after, &before)).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_keys_with_special_characters() {
        let before = json!({ "a/b": 1, "c~d": 1 });
        let after = json!({ "a/b": 2, "c~d": 1 });
        let ops = diff(&before, &after);
        assert_eq!(ops[0].path(), "/a~1b");

        let mut doc = before.clone();
        apply(&mut doc, &ops).unwrap();
        assert_eq!(doc, after);
    }
}
