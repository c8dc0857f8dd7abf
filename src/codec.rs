use crate::error::{Result, TransferError};
use crate::value::{Mapping, Value};

pub fn encode(value: &Value) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

pub fn encode_rows(rows: &[Value]) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(rows)?)
}

pub fn decode(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Err(TransferError::DecodeFailure("empty buffer".to_string()));
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Decodes a buffer holding either one mapping or an array of mappings.
pub fn decode_rows(bytes: &[u8]) -> Result<Vec<Mapping>> {
    match decode(bytes)? {
        Value::Map(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                item.into_map().ok_or_else(|| {
                    TransferError::DecodeFailure(format!("element {} is not a mapping", i))
                })
            })
            .collect(),
        other => Err(TransferError::DecodeFailure(format!(
            "expected a mapping or an array of mappings, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Bool(_) => "bool",
        Value::Integer(_) => "integer",
        Value::Float(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
    }
}
