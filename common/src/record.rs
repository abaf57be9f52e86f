use serde_json::{json, Value};
use std::cmp::Ordering;

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar texto, CSV, JSONL, etc.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

/// Campos de un registro con forma clave/valor (salida de `key_by`).
pub const KEY_FIELD: &str = "key";
pub const VALUE_FIELD: &str = "value";

/// Construye un registro clave/valor: `{"key": k, "value": v}`.
pub fn pair(key: Value, value: Value) -> Record {
    json!({ KEY_FIELD: key, VALUE_FIELD: value })
}

/// Devuelve (clave, valor) si el registro tiene forma de par.
pub fn as_pair(rec: &Record) -> Option<(&Value, &Value)> {
    let obj = rec.as_object()?;
    match (obj.get(KEY_FIELD), obj.get(VALUE_FIELD)) {
        (Some(k), Some(v)) => Some((k, v)),
        _ => None,
    }
}

/// Forma canónica de una clave: strings tal cual, el resto como texto JSON.
pub fn key_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Valor numérico de un registro. Los CSV llegan como strings, así que
/// también aceptamos strings numéricos.
pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden total sobre valores JSON:
/// null < bool < número < string < array < objeto.
/// Dentro del mismo tipo: numérico, lexicográfico, o por texto JSON.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if type_rank(a) == type_rank(b) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
