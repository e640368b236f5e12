use super::{Store, WireMetadata};
use crate::crypto::format_float;
use crate::error::{Result, SopsError};
use crate::tree::{ItemKey, Tree, TreeBranch, TreeItem, Value, METADATA_KEY};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number, Value as JsonValue};

/// JSON documents: a single object per file, key order preserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

impl JsonStore {
    fn parse_object(input: &[u8]) -> Result<Map<String, JsonValue>> {
        match serde_json::from_slice::<JsonValue>(input)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(SopsError::Format(format!(
                "expected a JSON object at the top level, found {}",
                json_kind(&other)
            ))),
        }
    }
}

impl Store for JsonStore {
    fn load_plain_file(&self, input: &[u8]) -> Result<Vec<TreeBranch>> {
        let object = Self::parse_object(input)?;
        if object.contains_key(METADATA_KEY) {
            return Err(SopsError::ReservedKey(METADATA_KEY.to_string()));
        }
        Ok(vec![branch_from_object(object)])
    }

    fn load_encrypted_file(&self, input: &[u8]) -> Result<Tree> {
        let mut object = Self::parse_object(input)?;
        let raw = object.shift_remove(METADATA_KEY).ok_or(SopsError::MetadataNotFound)?;
        let wire: WireMetadata = serde_json::from_value(raw)
            .map_err(|e| SopsError::InvalidMetadata(e.to_string()))?;
        let metadata = wire.to_internal()?;
        Ok(Tree::new(vec![branch_from_object(object)], metadata))
    }

    fn emit_plain_file(&self, branches: &[TreeBranch]) -> Result<Vec<u8>> {
        let object = match branches.first() {
            Some(branch) => object_from_branch(branch)?,
            None => Map::new(),
        };
        pretty(&JsonValue::Object(object))
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>> {
        let mut object = match tree.branches.first() {
            Some(branch) => object_from_branch(branch)?,
            None => Map::new(),
        };
        if object.contains_key(METADATA_KEY) {
            return Err(SopsError::ReservedKey(METADATA_KEY.to_string()));
        }
        let metadata = serde_json::to_value(WireMetadata::from(&tree.metadata))?;
        object.insert(METADATA_KEY.to_string(), metadata);
        pretty(&JsonValue::Object(object))
    }

    fn emit_value(&self, value: &Value) -> Result<Vec<u8>> {
        pretty(&to_json(value)?)
    }
}

/// Tab-indented output with a trailing newline.
fn pretty(value: &JsonValue) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn branch_from_object(object: Map<String, JsonValue>) -> TreeBranch {
    TreeBranch::from(
        object
            .into_iter()
            .map(|(key, value)| TreeItem::new(key, from_json(value)))
            .collect::<Vec<_>>(),
    )
}

/// Convert a JSON value to a tree value. Integers that fit in `i64` stay
/// integers, every other number becomes a float.
pub fn from_json(value: JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::String(s),
        JsonValue::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        JsonValue::Object(object) => Value::Branch(branch_from_object(object)),
    }
}

fn object_from_branch(branch: &TreeBranch) -> Result<Map<String, JsonValue>> {
    let mut object = Map::new();
    for item in branch.iter() {
        if let ItemKey::Key(key) = &item.key {
            object.insert(key.clone(), to_json(&item.value)?);
        }
    }
    Ok(object)
}

/// Convert a tree value to JSON. Comments have no JSON representation and
/// are dropped; bytes are emitted as base64.
pub fn to_json(value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null | Value::Comment(_) => JsonValue::Null,
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Int(i) => JsonValue::Number((*i).into()),
        Value::Float(f) => JsonValue::Number(Number::from_f64(*f).ok_or_else(|| {
            SopsError::Format(format!("{} cannot be represented in JSON", format_float(*f)))
        })?),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Bytes(b) => JsonValue::String(STANDARD.encode(b)),
        Value::Branch(branch) => JsonValue::Object(object_from_branch(branch)?),
        Value::Array(items) => JsonValue::Array(
            items
                .iter()
                .filter(|item| !matches!(item, Value::Comment(_)))
                .map(to_json)
                .collect::<Result<Vec<_>>>()?,
        ),
    })
}
