use std::collections::{BTreeMap, VecDeque};

use super::error::{StoreError, StoreResult};

/// Byte payloads at least this large move out of the record into sidecar files.
pub(super) const EXTERNAL_THRESHOLD: usize = 1024;

const FIELD_TYPE: &str = "type";
const TAG_BUFFER: &str = "Buffer";
const TAG_EXTERNAL: &str = "ExternalBuffer";
const TAG_INFINITY: &str = "Infinity";

/// A value that can be stored.
///
/// This is a plain JSON tree extended with what the record format can carry
/// beyond JSON proper: raw byte strings and infinities. `From` impls cover the
/// usual scalars, so call sites can write `store.set("answer", 42.into(), None)`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Renders the value as self-contained JSON.
    ///
    /// Byte strings stay inline regardless of size, so the result never
    /// depends on sidecar files. Non-finite floats use the same tagged
    /// objects as the record format.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => (*b).into(),
            Value::Int(i) => (*i).into(),
            Value::Float(f) => encode_float(*f),
            Value::String(s) => s.clone().into(),
            Value::Bytes(bytes) => inline_buffer(bytes),
            Value::Array(values) => values.iter().map(Value::to_json).collect(),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Builds a value from plain JSON.
    ///
    /// Tagged `Buffer` and `Infinity` objects are revived; everything else
    /// maps structurally. Sidecar references cannot be resolved here and stay
    /// plain objects.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => decode_number(n),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(values) => {
                Value::Array(values.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                match map.get(FIELD_TYPE).and_then(serde_json::Value::as_str) {
                    Some(TAG_BUFFER) => {
                        if let Some(data) = map.get("data").and_then(serde_json::Value::as_array) {
                            if let Ok(value) = decode_inline_buffer(data) {
                                return value;
                            }
                        }
                    }
                    Some(TAG_INFINITY) => {
                        if let Some(sign) = map.get("sign").and_then(serde_json::Value::as_f64) {
                            return Value::Float(sign * f64::INFINITY);
                        }
                    }
                    _ => {}
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_owned())
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

/// Encodes a value into its wire JSON, moving large byte payloads into
/// `sidecars`. The nth pushed payload corresponds to the reference with
/// `index` n.
pub(super) fn encode(value: Value, sidecars: &mut Vec<Vec<u8>>) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => b.into(),
        Value::Int(i) => i.into(),
        Value::Float(f) => encode_float(f),
        Value::String(s) => s.into(),
        Value::Bytes(bytes) => encode_bytes(bytes, sidecars),
        Value::Array(values) => values
            .into_iter()
            .map(|v| encode(v, sidecars))
            .collect(),
        Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, encode(v, sidecars)))
                .collect(),
        ),
    }
}

fn encode_float(f: f64) -> serde_json::Value {
    if f.is_infinite() {
        let sign = if f > 0.0 { 1 } else { -1 };
        serde_json::json!({ "type": TAG_INFINITY, "sign": sign })
    } else {
        // NaN has no JSON form and degrades to null.
        serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, Into::into)
    }
}

fn encode_bytes(bytes: Vec<u8>, sidecars: &mut Vec<Vec<u8>>) -> serde_json::Value {
    if bytes.len() >= EXTERNAL_THRESHOLD {
        let reference = serde_json::json!({
            "type": TAG_EXTERNAL,
            "index": sidecars.len(),
            "size": bytes.len(),
        });
        sidecars.push(bytes);
        reference
    } else {
        inline_buffer(&bytes)
    }
}

fn inline_buffer(bytes: &[u8]) -> serde_json::Value {
    let data: serde_json::Value = bytes.iter().map(|&b| u64::from(b)).collect();
    serde_json::json!({ "type": TAG_BUFFER, "data": data })
}

/// A sidecar reference found while scanning wire JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct ExternalRef {
    pub index: usize,
    pub size: usize,
}

/// Collects sidecar references in deterministic walk order.
///
/// [`decode`] walks the same order, so the nth reference pairs with the nth
/// payload handed to it.
pub(super) fn external_refs(json: &serde_json::Value) -> Vec<ExternalRef> {
    let mut refs = Vec::new();
    collect_refs(json, &mut refs);
    refs
}

fn collect_refs(json: &serde_json::Value, refs: &mut Vec<ExternalRef>) {
    match json {
        serde_json::Value::Array(values) => {
            for value in values {
                collect_refs(value, refs);
            }
        }
        serde_json::Value::Object(map) => match as_external_ref(map) {
            Some(r) => refs.push(r),
            None => {
                for value in map.values() {
                    collect_refs(value, refs);
                }
            }
        },
        _ => {}
    }
}

fn as_external_ref(map: &serde_json::Map<String, serde_json::Value>) -> Option<ExternalRef> {
    if map.get(FIELD_TYPE)?.as_str()? != TAG_EXTERNAL {
        return None;
    }
    // Only a fully formed reference counts, anything partial stays a plain map.
    let index = map.get("index")?.as_u64()?;
    let size = map.get("size")?.as_u64()?;
    Some(ExternalRef {
        index: index as usize,
        size: size as usize,
    })
}

/// Decodes wire JSON back into a [`Value`], consuming one payload from
/// `payloads` per sidecar reference encountered.
pub(super) fn decode(
    json: &serde_json::Value,
    payloads: &mut VecDeque<Vec<u8>>,
) -> StoreResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => decode_number(n),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(values) => Value::Array(
            values
                .iter()
                .map(|v| decode(v, payloads))
                .collect::<StoreResult<_>>()?,
        ),
        serde_json::Value::Object(map) => decode_map(map, payloads)?,
    })
}

fn decode_number(n: &serde_json::Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::Int(i),
        // Huge and fractional numbers degrade to floats.
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn decode_map(
    map: &serde_json::Map<String, serde_json::Value>,
    payloads: &mut VecDeque<Vec<u8>>,
) -> StoreResult<Value> {
    match map.get(FIELD_TYPE).and_then(serde_json::Value::as_str) {
        Some(TAG_BUFFER) => {
            if let Some(data) = map.get("data").and_then(serde_json::Value::as_array) {
                return decode_inline_buffer(data);
            }
        }
        Some(TAG_EXTERNAL) => {
            if as_external_ref(map).is_some() {
                let bytes = payloads.pop_front().ok_or_else(|| {
                    StoreError::Malformed("external buffer without payload".into())
                })?;
                return Ok(Value::Bytes(bytes));
            }
        }
        Some(TAG_INFINITY) => {
            if let Some(sign) = map.get("sign").and_then(serde_json::Value::as_f64) {
                return Ok(Value::Float(sign * f64::INFINITY));
            }
        }
        _ => {}
    }

    let mut object = BTreeMap::new();
    for (k, v) in map {
        object.insert(k.clone(), decode(v, payloads)?);
    }
    Ok(Value::Object(object))
}

fn decode_inline_buffer(data: &[serde_json::Value]) -> StoreResult<Value> {
    let mut bytes = Vec::with_capacity(data.len());
    for v in data {
        let b = v
            .as_u64()
            .and_then(|b| u8::try_from(b).ok())
            .ok_or_else(|| StoreError::Malformed("buffer byte out of range".into()))?;
        bytes.push(b);
    }
    Ok(Value::Bytes(bytes))
}
