//! JSON Patch (RFC 6902) for `#cloud-config-jsonp` parts
//!
//! The accumulated cloud-config is patched in place: a patch either applies
//! completely or leaves the document untouched.

use crate::CloudInitError;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

/// Parse a patch document (a JSON list of operations)
pub fn parse_patch(text: &str) -> Result<Vec<PatchOp>, CloudInitError> {
    let body = text
        .trim_start()
        .strip_prefix("#cloud-config-jsonp")
        .unwrap_or(text);
    Ok(serde_json::from_str(body)?)
}

/// Apply every operation in order; on failure `doc` is unchanged
pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), CloudInitError> {
    let mut work = doc.clone();
    for op in ops {
        apply_op(&mut work, op)?;
    }
    *doc = work;
    Ok(())
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), CloudInitError> {
    match op {
        PatchOp::Add { path, value } => add(doc, path, value.clone()),
        PatchOp::Remove { path } => remove(doc, path).map(drop),
        PatchOp::Replace { path, value } => {
            let target = doc
                .pointer_mut(path)
                .ok_or_else(|| patch_error("replace", path, "path does not exist"))?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Move { from, path } => {
            if path.starts_with(&format!("{from}/")) {
                return Err(patch_error("move", path, "cannot move into own child"));
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        PatchOp::Copy { from, path } => {
            let value = doc
                .pointer(from)
                .cloned()
                .ok_or_else(|| patch_error("copy", from, "path does not exist"))?;
            add(doc, path, value)
        }
        PatchOp::Test { path, value } => match doc.pointer(path) {
            Some(actual) if actual == value => Ok(()),
            _ => Err(patch_error("test", path, "value differs")),
        },
    }
}

fn patch_error(op: &str, path: &str, why: &str) -> CloudInitError {
    CloudInitError::InvalidData(format!("json patch {op} at '{path}': {why}"))
}

/// Split `/a/b~1c` into (`/a`, `b/c`)
fn split_pointer(path: &str) -> Result<(&str, String), CloudInitError> {
    let idx = path
        .rfind('/')
        .ok_or_else(|| patch_error("resolve", path, "not a JSON pointer"))?;
    let last = path[idx + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..idx], last))
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), CloudInitError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent_path, key) = split_pointer(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| patch_error("add", path, "parent does not exist"))?;
    match parent {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let idx: usize = key
                .parse()
                .map_err(|_| patch_error("add", path, "bad array index"))?;
            if idx > items.len() {
                return Err(patch_error("add", path, "array index out of range"));
            }
            items.insert(idx, value);
            Ok(())
        }
        _ => Err(patch_error("add", path, "parent is not a container")),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, CloudInitError> {
    let (parent_path, key) = split_pointer(path)?;
    let parent = doc
        .pointer_mut(parent_path)
        .ok_or_else(|| patch_error("remove", path, "parent does not exist"))?;
    match parent {
        Value::Object(map) => map
            .remove(&key)
            .ok_or_else(|| patch_error("remove", path, "path does not exist")),
        Value::Array(items) => {
            let idx: usize = key
                .parse()
                .map_err(|_| patch_error("remove", path, "bad array index"))?;
            if idx >= items.len() {
                return Err(patch_error("remove", path, "array index out of range"));
            }
            Ok(items.remove(idx))
        }
        _ => Err(patch_error("remove", path, "parent is not a container")),
    }
}
