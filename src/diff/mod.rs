// ============================================================================
// Payload Diff Operations
// ============================================================================
//
// A diff is an ordered list of operations drawn from a closed set:
// - Set:    replace the value at a dotted path
// - Merge:  deep-merge an object into the object at a dotted path
// - Append: push a value onto the array at a dotted path
//
// Paths address nested objects ("a.b.c"); missing intermediate objects are
// created, traversing into a non-object is an application error.
//
// ============================================================================

use crate::core::{BridgeError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Payload = Map<String, Value>;

lazy_static! {
    static ref RELATIVE_OPERATION: Regex = Regex::new(r"^[+\-*/]\s*\d+(\.\d+)?$").unwrap();
    static ref FUNCTION_CALL: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*\s*\(").unwrap();
}

const FORBIDDEN_SEQUENCE: &str = "__import__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    Set { path: String, value: Value },
    Merge { path: String, value: Payload },
    Append { path: String, value: Value },
}

impl DiffOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Merge { path, .. } | Self::Append { path, .. } => path,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_path(self.path())?;
        match self {
            Self::Set { value, .. } | Self::Append { value, .. } => {
                validate_value(self.path(), value)
            }
            Self::Merge { value, .. } => {
                for (key, nested) in value {
                    validate_path(key)?;
                    validate_value(key, nested)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    ops: Vec<DiffOp>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<DiffOp>) -> Self {
        Self { ops }
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(DiffOp::Set {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn merge(mut self, path: impl Into<String>, value: Payload) -> Self {
        self.ops.push(DiffOp::Merge {
            path: path.into(),
            value,
        });
        self
    }

    pub fn append(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(DiffOp::Append {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Builds a diff from a flat patch object: every key becomes a `Set`.
    pub fn from_patch(patch: &Payload) -> Self {
        let ops = patch
            .iter()
            .map(|(path, value)| DiffOp::Set {
                path: path.clone(),
                value: value.clone(),
            })
            .collect();
        Self { ops }
    }

    /// Parses either `{"ops": [...]}` or the section form `{"payload": {...}}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(BridgeError::DiffValidation(
                "diff must be a JSON object".to_string(),
            ));
        };

        if object.contains_key("ops") {
            return serde_json::from_value(value.clone())
                .map_err(|err| BridgeError::DiffValidation(format!("malformed ops: {err}")));
        }

        match object.get("payload") {
            Some(Value::Object(patch)) => Ok(Self::from_patch(patch)),
            Some(Value::Null) | None => Err(BridgeError::DiffValidation(
                "diff targets no known section (expected 'ops' or 'payload')".to_string(),
            )),
            Some(other) => Err(BridgeError::DiffValidation(format!(
                "diff['payload'] must be an object, got {}",
                json_type_name(other)
            ))),
        }
    }

    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.ops.is_empty() {
            return Err(BridgeError::DiffValidation("diff is empty".to_string()));
        }
        self.ops.iter().try_for_each(DiffOp::validate)
    }

    /// Applies the diff to a copy of `payload`. The input is never modified.
    pub fn apply(&self, payload: &Payload) -> Result<Payload> {
        self.validate()?;
        let mut base = payload.clone();
        for op in &self.ops {
            apply_op(&mut base, op)?;
        }
        Ok(base)
    }

    /// Deterministic JSON rendering used for correction id derivation.
    pub fn canonical_json(&self) -> Result<String> {
        // serde_json::Map is key-ordered, so nested objects serialize sorted.
        Ok(serde_json::to_string(&serde_json::to_value(self)?)?)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(BridgeError::DiffValidation(
            "diff keys must be non-empty strings".to_string(),
        ));
    }
    if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
        return Err(BridgeError::DiffValidation(format!(
            "diff key '{path}' contains invalid dot notation"
        )));
    }
    Ok(())
}

fn validate_value(key: &str, value: &Value) -> Result<()> {
    match value {
        Value::String(text) => validate_text(key, text),
        Value::Array(items) => items.iter().try_for_each(|item| validate_value(key, item)),
        Value::Object(object) => {
            for (nested_key, nested) in object {
                validate_path(nested_key)?;
                validate_value(nested_key, nested)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_text(key: &str, text: &str) -> Result<()> {
    let stripped = text.trim();
    if stripped.is_empty() {
        return Ok(());
    }
    if RELATIVE_OPERATION.is_match(stripped) {
        return Err(BridgeError::DiffValidation(format!(
            "relative operations forbidden in diff: {key}={text}"
        )));
    }
    if FUNCTION_CALL.is_match(stripped) {
        return Err(BridgeError::DiffValidation(format!(
            "function-style expressions forbidden in diff: {key}={text}"
        )));
    }
    if stripped.contains(FORBIDDEN_SEQUENCE) {
        return Err(BridgeError::DiffValidation(format!(
            "code patterns forbidden in diff values: {key}"
        )));
    }
    Ok(())
}

/// Walks to the parent object of the last path segment, creating missing objects.
fn parent_for<'a>(base: &'a mut Payload, path: &str) -> Result<(&'a mut Payload, String)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or_default().to_string();

    let mut cursor = base;
    for segment in segments {
        let entry = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        cursor = match entry {
            Value::Object(object) => object,
            other => {
                return Err(BridgeError::DiffApplication(format!(
                    "cannot traverse into {} segment '{}' for key '{}'",
                    json_type_name(other),
                    segment,
                    path
                )));
            }
        };
    }
    Ok((cursor, leaf))
}

fn apply_op(base: &mut Payload, op: &DiffOp) -> Result<()> {
    let (parent, leaf) = parent_for(base, op.path())?;
    match op {
        DiffOp::Set { value, .. } => {
            parent.insert(leaf, value.clone());
        }
        DiffOp::Merge { value, path } => {
            let target = parent
                .entry(leaf)
                .or_insert_with(|| Value::Object(Map::new()));
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            match target {
                Value::Object(object) => deep_merge(object, value),
                other => {
                    return Err(BridgeError::DiffApplication(format!(
                        "cannot merge object into {} at '{}'",
                        json_type_name(other),
                        path
                    )));
                }
            }
        }
        DiffOp::Append { value, path } => {
            let target = parent
                .entry(leaf)
                .or_insert_with(|| Value::Array(Vec::new()));
            match target {
                Value::Array(items) => items.push(value.clone()),
                other => {
                    return Err(BridgeError::DiffApplication(format!(
                        "cannot append to {} at '{}'",
                        json_type_name(other),
                        path
                    )));
                }
            }
        }
    }
    Ok(())
}

fn deep_merge(target: &mut Payload, patch: &Payload) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
