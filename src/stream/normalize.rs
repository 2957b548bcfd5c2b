//! Conversion from the service's tagged-value wire format to plain JSON.
//!
//! Every field of a drop arrives wrapped as `{"type": ..., "value": ...}`.
//! Containers nest further tagged values: `map`/`sortedMap` hold a field map,
//! `list`/`set`/`sortedSet` hold an array of elements.

use serde_json::{Map, Value};

/// Field carried through from the raw record untouched.
pub const CREATION_DATE_FIELD: &str = "creationDate";

const ELEMS_FIELD: &str = "elems";

/// Wire type tags with container semantics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ValueKind {
    Map,
    Sequence,
    Scalar,
}

impl ValueKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "map" | "sortedMap" => Self::Map,
            "list" | "set" | "sortedSet" => Self::Sequence,
            _ => Self::Scalar,
        }
    }
}

/// Flattens a raw drop into a plain object.
///
/// The tagged fields under `elems` become top-level keys holding their plain
/// values, and `creationDate` is copied alongside them. Other top-level fields
/// of the raw record are not carried over.
pub fn normalize_record(raw: &Value) -> Value {
    let mut flat = raw
        .get(ELEMS_FIELD)
        .and_then(Value::as_object)
        .map(normalize_fields)
        .unwrap_or_default();

    if let Some(created) = raw.get(CREATION_DATE_FIELD) {
        flat.insert(CREATION_DATE_FIELD.to_string(), created.clone());
    }

    Value::Object(flat)
}

/// Normalizes every tagged value of a field map.
pub fn normalize_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, tagged)| (name.clone(), normalize_value(tagged)))
        .collect()
}

/// Unwraps a single tagged value, recursing into containers.
///
/// Values that are not `{type, value}` objects are returned unchanged.
pub fn normalize_value(tagged: &Value) -> Value {
    let Some((tag, value)) = split_tagged(tagged) else {
        return tagged.clone();
    };

    match (ValueKind::from_tag(tag), value) {
        (ValueKind::Map, Value::Object(fields)) => Value::Object(normalize_fields(fields)),
        (ValueKind::Sequence, Value::Array(items)) => {
            Value::Array(items.iter().map(normalize_value).collect())
        }
        (_, value) => value.clone(),
    }
}

fn split_tagged(tagged: &Value) -> Option<(&str, &Value)> {
    let object = tagged.as_object()?;
    let tag = object.get("type")?.as_str()?;
    let value = object.get("value")?;
    Some((tag, value))
}
