//! Confluent wire format and Avro <-> JSON conversion.
//!
//! Framed payloads are `0x00`, the big-endian u32 schema id, then the Avro binary datum.
//! Values go through `serde_json::Value` on both sides so any `Serialize` type can be
//! encoded against a registered schema.

use std::collections::HashMap;

use apache_avro::{types::Value, Schema};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    schema_registry::SchemaRegistryClient,
};

pub const MAGIC_BYTE: u8 = 0;

const HEADER_LEN: usize = 5;

pub fn frame(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a framed payload into its schema id and body.
pub fn unframe(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < HEADER_LEN {
        return Err(Error::WireFormat(format!(
            "payload of {} bytes is shorter than the {HEADER_LEN} byte header",
            payload.len()
        )));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(Error::WireFormat(format!("unknown magic byte {}", payload[0])));
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_LEN..]))
}

/// Whether a payload carries the Confluent header.
pub fn is_framed(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN && payload[0] == MAGIC_BYTE
}

/// Encodes values against one registered schema.
#[derive(Debug, Clone)]
pub struct AvroSerializer {
    schema: Schema,
    schema_id: u32,
}

impl AvroSerializer {
    pub fn new(schema: Schema, schema_id: u32) -> Self { Self { schema, schema_id } }

    pub fn schema_id(&self) -> u32 { self.schema_id }

    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_value(value)?;
        let avro = json_to_avro(&json, &self.schema)?;
        let body = apache_avro::to_avro_datum(&self.schema, avro)?;
        Ok(frame(self.schema_id, &body))
    }
}

/// Decodes framed payloads, resolving writer schemas through the registry.
#[derive(Debug)]
pub struct AvroDeserializer {
    registry: SchemaRegistryClient,
    schemas: HashMap<u32, Schema>,
}

impl AvroDeserializer {
    pub fn new(registry: SchemaRegistryClient) -> Self {
        Self {
            registry,
            schemas: HashMap::new(),
        }
    }

    pub async fn deserialize(&mut self, payload: &[u8]) -> Result<serde_json::Value> {
        let (id, body) = unframe(payload)?;

        if !self.schemas.contains_key(&id) {
            let raw = self.registry.schema_by_id(id).await?;
            let schema = Schema::parse_str(&raw)?;
            tracing::debug!(schema_id = id, "Resolved writer schema");
            self.schemas.insert(id, schema);
        }

        let schema = &self.schemas[&id];
        decode_datum(schema, body)
    }
}

pub fn decode_datum(schema: &Schema, mut body: &[u8]) -> Result<serde_json::Value> {
    let value = apache_avro::from_avro_datum(schema, &mut body, None)?;
    Ok(avro_to_json(&value))
}

pub fn avro_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::json!(i),
        Value::Long(l) => serde_json::json!(l),
        Value::Float(f) => serde_json::json!(f),
        Value::Double(d) => serde_json::json!(d),
        Value::Bytes(b) | Value::Fixed(_, b) => {
            serde_json::Value::Array(b.iter().map(|byte| serde_json::json!(byte)).collect())
        },
        Value::String(s) | Value::Enum(_, s) => serde_json::Value::String(s.clone()),
        Value::Union(_, inner) => avro_to_json(inner),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(avro_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_json(v)))
                .collect(),
        ),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), avro_to_json(v)))
                .collect(),
        ),
        Value::Date(d) => serde_json::json!(d),
        Value::TimeMillis(t) => serde_json::json!(t),
        Value::TimeMicros(t) => serde_json::json!(t),
        Value::TimestampMillis(t) | Value::TimestampMicros(t) => serde_json::json!(t),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        // Logical types without a natural JSON shape.
        _ => serde_json::Value::Null,
    }
}

pub fn json_to_avro(value: &serde_json::Value, schema: &Schema) -> Result<Value> {
    use serde_json::Value as Json;

    match (value, schema) {
        (Json::Null, Schema::Null) => Ok(Value::Null),
        (Json::Bool(b), Schema::Boolean) => Ok(Value::Boolean(*b)),
        (Json::Number(n), Schema::Int) => n
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int)
            .ok_or_else(|| conversion_error(value, schema)),
        (Json::Number(n), Schema::Long | Schema::TimestampMillis) => n
            .as_i64()
            .map(|l| match schema {
                Schema::TimestampMillis => Value::TimestampMillis(l),
                _ => Value::Long(l),
            })
            .ok_or_else(|| conversion_error(value, schema)),
        (Json::Number(n), Schema::Float) => n
            .as_f64()
            .map(|f| Value::Float(f as f32))
            .ok_or_else(|| conversion_error(value, schema)),
        (Json::Number(n), Schema::Double) => n
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| conversion_error(value, schema)),
        (Json::String(s), Schema::String) => Ok(Value::String(s.clone())),
        (Json::String(s), Schema::Enum(enum_schema)) => enum_schema
            .symbols
            .iter()
            .position(|symbol| symbol == s)
            .map(|idx| Value::Enum(idx as u32, s.clone()))
            .ok_or_else(|| conversion_error(value, schema)),
        (Json::Array(items), Schema::Array(array_schema)) => items
            .iter()
            .map(|item| json_to_avro(item, &array_schema.items))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        (Json::Object(map), Schema::Map(map_schema)) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), json_to_avro(v, &map_schema.types)?)))
            .collect::<Result<HashMap<_, _>>>()
            .map(Value::Map),
        (Json::Object(map), Schema::Record(record_schema)) => {
            let mut fields = Vec::with_capacity(record_schema.fields.len());
            for field in &record_schema.fields {
                let field_value = match map.get(&field.name) {
                    Some(v) => v,
                    None => field.default.as_ref().unwrap_or(&Json::Null),
                };
                fields.push((field.name.clone(), json_to_avro(field_value, &field.schema)?));
            }
            Ok(Value::Record(fields))
        },
        (_, Schema::Union(union_schema)) => {
            for (idx, variant) in union_schema.variants().iter().enumerate() {
                if let Ok(v) = json_to_avro(value, variant) {
                    return Ok(Value::Union(idx as u32, Box::new(v)));
                }
            }
            Err(conversion_error(value, schema))
        },
        _ => Err(conversion_error(value, schema)),
    }
}

fn conversion_error(value: &serde_json::Value, schema: &Schema) -> Error {
    Error::AvroConversion {
        value: value.to_string(),
        schema: schema.canonical_form(),
    }
}
