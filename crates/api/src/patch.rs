//! JSON merge patch (RFC 7386) applied to resource envelopes.

use std::collections::BTreeMap;

use duet_core::{Resource, StorageError, StorageResult};
use serde_json::{Map, Value};

/// Merge `patch` into `target`: objects merge recursively, `null` removes a
/// key, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn merge_string_map(map: &mut BTreeMap<String, String>, patch: &Value, field: &str) -> StorageResult<()> {
    let mut v = serde_json::to_value(&*map).map_err(|e| StorageError::Internal(e.to_string()))?;
    merge_patch(&mut v, patch);
    *map = serde_json::from_value(v)
        .map_err(|_| StorageError::BadRequest(format!("metadata.{field} values must be strings")))?;
    Ok(())
}

/// Apply a merge patch to the patchable parts of `obj` (spec, labels,
/// annotations). Returns the patched object and the resourceVersion
/// precondition carried by the patch, if any.
pub fn apply_patch(obj: &Resource, patch: &Value) -> StorageResult<(Resource, Option<String>)> {
    let Value::Object(p) = patch else {
        return Err(StorageError::BadRequest("merge patch must be a JSON object".into()));
    };
    let mut out = obj.clone();
    let mut precondition = None;
    for (key, value) in p {
        match key.as_str() {
            "spec" => merge_patch(&mut out.spec, value),
            "metadata" => {
                let Value::Object(meta) = value else {
                    return Err(StorageError::BadRequest("metadata patch must be an object".into()));
                };
                for (mk, mv) in meta {
                    match mk.as_str() {
                        "labels" => merge_string_map(&mut out.metadata.labels, mv, "labels")?,
                        "annotations" => merge_string_map(&mut out.metadata.annotations, mv, "annotations")?,
                        "resourceVersion" => precondition = mv.as_str().map(str::to_string),
                        "name" | "namespace" | "uid" => {
                            let same = match mk.as_str() {
                                "name" => mv.as_str() == Some(obj.name()),
                                "namespace" => mv.as_str() == Some(obj.namespace()),
                                _ => mv.as_str() == Some(obj.uid()),
                            };
                            if !same {
                                return Err(StorageError::BadRequest(format!("metadata.{mk} cannot be patched")));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "apiVersion" | "kind" => {}
            other => return Err(StorageError::BadRequest(format!("field {other:?} cannot be patched"))),
        }
    }
    Ok((out, precondition))
}
