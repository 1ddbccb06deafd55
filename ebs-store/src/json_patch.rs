//! JSON Patch (RFC 6902) over `serde_json::Value`.
//!
//! Operations are applied in place and strictly in order. Paths are JSON
//! Pointers (RFC 6901): `""` is the whole document, `~1` escapes `/` and
//! `~0` escapes `~`, and `-` addresses the slot past the end of an array.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Patch application errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Invalid array index in {0}")]
    InvalidIndex(String),
    #[error("Cannot address into a scalar at {0}")]
    InvalidTarget(String),
    #[error("Cannot move {from} into its own child {path}")]
    MoveIntoChild { from: String, path: String },
    #[error("Test failed at {0}")]
    TestFailed(String),
    #[error("Malformed patch: {0}")]
    Malformed(String),
}

/// A single JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Op {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl Op {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Op::Add { path: path.into(), value }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove { path: path.into() }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Op::Replace { path: path.into(), value }
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Op::Test { path: path.into(), value }
    }

    /// Target path of the operation.
    pub fn path(&self) -> &str {
        match self {
            Op::Add { path, .. }
            | Op::Remove { path }
            | Op::Replace { path, .. }
            | Op::Move { path, .. }
            | Op::Copy { path, .. }
            | Op::Test { path, .. } => path,
        }
    }
}

/// Parse a JSON text holding an array of operations.
pub fn parse_ops(json: &str) -> Result<Vec<Op>, PatchError> {
    serde_json::from_str(json).map_err(|e| PatchError::Malformed(e.to_string()))
}

/// Parse operations out of an already decoded JSON value.
pub fn ops_from_value(value: Value) -> Result<Vec<Op>, PatchError> {
    serde_json::from_value(value).map_err(|e| PatchError::Malformed(e.to_string()))
}

/// Convert operations to a JSON value (object keys sorted).
pub fn ops_to_value(ops: &[Op]) -> Result<Value, PatchError> {
    serde_json::to_value(ops).map_err(|e| PatchError::Malformed(e.to_string()))
}

/// Apply every operation to `doc`, in order.
///
/// On error the document may be left partially patched.
pub fn apply(doc: &mut Value, ops: &[Op]) -> Result<(), PatchError> {
    for op in ops {
        apply_op(doc, op)?;
    }
    Ok(())
}

/// Apply a single operation.
pub fn apply_op(doc: &mut Value, op: &Op) -> Result<(), PatchError> {
    match op {
        Op::Add { path, value } => add(doc, path, value.clone()),
        Op::Remove { path } => remove(doc, path).map(|_| ()),
        Op::Replace { path, value } => replace(doc, path, value.clone()),
        Op::Copy { from, path } => {
            let value = get(doc, from)?.clone();
            add(doc, path, value)
        }
        Op::Move { from, path } => {
            if from == path {
                // Existence still has to hold.
                get(doc, from)?;
                return Ok(());
            }
            let from_tokens = parse_pointer(from)?;
            let path_tokens = parse_pointer(path)?;
            if path_tokens.len() > from_tokens.len()
                && path_tokens[..from_tokens.len()] == from_tokens[..]
            {
                return Err(PatchError::MoveIntoChild {
                    from: from.clone(),
                    path: path.clone(),
                });
            }
            let value = remove(doc, from)?;
            add(doc, path, value)
        }
        Op::Test { path, value } => {
            if get(doc, path)? == value {
                Ok(())
            } else {
                Err(PatchError::TestFailed(path.clone()))
            }
        }
    }
}

// ─── Pointer navigation ───────────────────────────────────────────────

fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(PatchError::InvalidPointer(pointer.to_string()));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Array index token: decimal digits, no leading zeros.
fn parse_index(token: &str, pointer: &str) -> Result<usize, PatchError> {
    let well_formed = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(PatchError::InvalidIndex(pointer.to_string()));
    }
    token
        .parse()
        .map_err(|_| PatchError::InvalidIndex(pointer.to_string()))
}

fn get<'a>(doc: &'a Value, pointer: &str) -> Result<&'a Value, PatchError> {
    let mut current = doc;
    for token in parse_pointer(pointer)? {
        current = match current {
            Value::Object(map) => map.get(&token),
            Value::Array(arr) => arr.get(parse_index(&token, pointer)?),
            _ => None,
        }
        .ok_or_else(|| PatchError::NotFound(pointer.to_string()))?;
    }
    Ok(current)
}

fn get_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    pointer: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map.get_mut(token),
            Value::Array(arr) => arr.get_mut(parse_index(token, pointer)?),
            _ => None,
        }
        .ok_or_else(|| PatchError::NotFound(pointer.to_string()))?;
    }
    Ok(current)
}

/// Split a pointer into its parent container and the last token.
fn parent_of<'a>(
    doc: &'a mut Value,
    pointer: &str,
) -> Result<Option<(&'a mut Value, String)>, PatchError> {
    let mut tokens = parse_pointer(pointer)?;
    let Some(last) = tokens.pop() else {
        return Ok(None);
    };
    let parent = get_mut(doc, &tokens, pointer)?;
    Ok(Some((parent, last)))
}

// ─── Operations ───────────────────────────────────────────────────────

fn add(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
    let Some((parent, key)) = parent_of(doc, pointer)? else {
        *doc = value;
        return Ok(());
    };
    match parent {
        Value::Object(map) => {
            map.insert(key, value);
            Ok(())
        }
        Value::Array(arr) => {
            if key == "-" {
                arr.push(value);
                return Ok(());
            }
            let idx = parse_index(&key, pointer)?;
            if idx > arr.len() {
                return Err(PatchError::InvalidIndex(pointer.to_string()));
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(PatchError::InvalidTarget(pointer.to_string())),
    }
}

fn remove(doc: &mut Value, pointer: &str) -> Result<Value, PatchError> {
    let Some((parent, key)) = parent_of(doc, pointer)? else {
        return Ok(std::mem::replace(doc, Value::Null));
    };
    match parent {
        Value::Object(map) => map
            .remove(&key)
            .ok_or_else(|| PatchError::NotFound(pointer.to_string())),
        Value::Array(arr) => {
            let idx = parse_index(&key, pointer)?;
            if idx >= arr.len() {
                return Err(PatchError::NotFound(pointer.to_string()));
            }
            Ok(arr.remove(idx))
        }
        _ => Err(PatchError::InvalidTarget(pointer.to_string())),
    }
}

fn replace(doc: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
    let tokens = parse_pointer(pointer)?;
    let target = get_mut(doc, &tokens, pointer)?;
    *target = value;
    Ok(())
}
