//! JSON entity encoding.
//!
//! Rows travel as flat JSON objects. Kinds JSON cannot express on its own
//! carry a sibling `Name@odata.type` annotation:
//!
//! | Kind | JSON value | Annotation |
//! |------|------------|------------|
//! | string | string | none |
//! | boolean | bool | none |
//! | int32 | number | none |
//! | int64 | string | `Edm.Int64` |
//! | double | number, or `"NaN"`/`"Infinity"`/`"-Infinity"` | `Edm.Double` |
//! | guid | string | `Edm.Guid` |
//! | datetime | `yyyy-MM-ddTHH:mm:ss.fffffffZ` | `Edm.DateTime` |
//! | binary | base64 string | `Edm.Binary` |
//!
//! Null properties are omitted. Unannotated numbers decode as int32 when
//! they are integral and in range, int64 when integral and wider, and
//! double otherwise.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use cloudtable_storage::{DynamicEntity, ETag, EntityProperty, PropertyBag};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::error::{RestError, Result};

const PARTITION_KEY: &str = "PartitionKey";
const ROW_KEY: &str = "RowKey";
const TIMESTAMP: &str = "Timestamp";
const ETAG: &str = "odata.etag";
const TYPE_SUFFIX: &str = "@odata.type";

/// Formats a timestamp with seven fractional digits.
#[must_use]
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    let ticks = value.timestamp_subsec_nanos().min(999_999_999) / 100;
    format!("{}.{ticks:07}Z", value.format("%Y-%m-%dT%H:%M:%S"))
}

fn parse_datetime(name: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RestError::Protocol(format!("{name}: invalid datetime {text:?}: {e}")))
}

fn annotated(map: &mut Map<String, Value>, name: &str, edm: &str, value: Value) {
    map.insert(name.to_owned(), value);
    map.insert(format!("{name}{TYPE_SUFFIX}"), Value::String(edm.to_owned()));
}

fn encode_double(value: f64) -> Value {
    match Number::from_f64(value) {
        Some(number) => Value::Number(number),
        None if value.is_nan() => Value::String("NaN".to_owned()),
        None if value.is_sign_positive() => Value::String("Infinity".to_owned()),
        None => Value::String("-Infinity".to_owned()),
    }
}

/// Encodes a row body. Timestamp and version token are never sent.
#[must_use]
pub fn encode_entity(entity: &DynamicEntity) -> Value {
    let mut map = Map::new();
    map.insert(PARTITION_KEY.to_owned(), Value::String(entity.partition_key.clone()));
    map.insert(ROW_KEY.to_owned(), Value::String(entity.row_key.clone()));
    encode_properties(&entity.properties, &mut map);
    Value::Object(map)
}

fn encode_properties(properties: &PropertyBag, map: &mut Map<String, Value>) {
    for (name, property) in properties {
        match property {
            EntityProperty::String(Some(s)) => {
                map.insert(name.clone(), Value::String(s.clone()));
            },
            EntityProperty::Boolean(Some(b)) => {
                map.insert(name.clone(), Value::Bool(*b));
            },
            EntityProperty::Int32(Some(i)) => {
                map.insert(name.clone(), Value::from(*i));
            },
            EntityProperty::Int64(Some(i)) => {
                annotated(map, name, "Edm.Int64", Value::String(i.to_string()));
            },
            EntityProperty::Double(Some(d)) => {
                annotated(map, name, "Edm.Double", encode_double(*d));
            },
            EntityProperty::Guid(Some(g)) => {
                annotated(map, name, "Edm.Guid", Value::String(g.to_string()));
            },
            EntityProperty::DateTime(Some(dt)) => {
                annotated(map, name, "Edm.DateTime", Value::String(format_datetime(dt)));
            },
            EntityProperty::Binary(Some(bytes)) => {
                annotated(map, name, "Edm.Binary", Value::String(STANDARD.encode(bytes)));
            },
            _ => {},
        }
    }
}

/// Decodes one row from a response object. `header_etag` is used when the
/// body carries no `odata.etag`.
///
/// # Errors
///
/// Returns [`RestError::Protocol`] for missing keys, malformed annotated
/// values and JSON types no property kind can hold.
pub fn decode_entity(value: &Value, header_etag: Option<&str>) -> Result<DynamicEntity> {
    let Value::Object(map) = value else {
        return Err(RestError::Protocol("entity is not a JSON object".to_owned()));
    };

    let key = |name: &str| -> Result<String> {
        map.get(name)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RestError::Protocol(format!("entity is missing {name}")))
    };
    let mut entity = DynamicEntity::new(key(PARTITION_KEY)?, key(ROW_KEY)?);

    entity.timestamp = match map.get(TIMESTAMP).and_then(Value::as_str) {
        Some(text) => Some(parse_datetime(TIMESTAMP, text)?),
        None => None,
    };
    entity.etag = map
        .get(ETAG)
        .and_then(Value::as_str)
        .or(header_etag)
        .map(ETag::new);

    for (name, value) in map {
        if name == PARTITION_KEY
            || name == ROW_KEY
            || name == TIMESTAMP
            || name.starts_with("odata.")
            || name.ends_with(TYPE_SUFFIX)
        {
            continue;
        }
        let edm = map.get(&format!("{name}{TYPE_SUFFIX}")).and_then(Value::as_str);
        if let Some(property) = decode_property(name, value, edm)? {
            entity.properties.insert(name.clone(), property);
        }
    }
    Ok(entity)
}

fn decode_property(name: &str, value: &Value, edm: Option<&str>) -> Result<Option<EntityProperty>> {
    let invalid = |what: &str| RestError::Protocol(format!("{name}: invalid {what} value {value}"));

    let property = match (edm, value) {
        (_, Value::Null) => return Ok(None),
        (Some("Edm.Int64"), Value::String(s)) => {
            EntityProperty::Int64(Some(s.parse().map_err(|_| invalid("Edm.Int64"))?))
        },
        (Some("Edm.Int64"), Value::Number(n)) => {
            EntityProperty::Int64(Some(n.as_i64().ok_or_else(|| invalid("Edm.Int64"))?))
        },
        (Some("Edm.Int32"), Value::Number(n)) => EntityProperty::Int32(Some(
            n.as_i64().and_then(|i| i32::try_from(i).ok()).ok_or_else(|| invalid("Edm.Int32"))?,
        )),
        (Some("Edm.Double"), Value::Number(n)) => {
            EntityProperty::Double(Some(n.as_f64().ok_or_else(|| invalid("Edm.Double"))?))
        },
        (Some("Edm.Double"), Value::String(s)) => EntityProperty::Double(Some(match s.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other.parse().map_err(|_| invalid("Edm.Double"))?,
        })),
        (Some("Edm.Guid"), Value::String(s)) => {
            EntityProperty::Guid(Some(Uuid::parse_str(s).map_err(|_| invalid("Edm.Guid"))?))
        },
        (Some("Edm.DateTime"), Value::String(s)) => {
            EntityProperty::DateTime(Some(parse_datetime(name, s)?))
        },
        (Some("Edm.Binary"), Value::String(s)) => {
            EntityProperty::Binary(Some(STANDARD.decode(s).map_err(|_| invalid("Edm.Binary"))?))
        },
        (Some("Edm.String") | None, Value::String(s)) => EntityProperty::String(Some(s.clone())),
        (Some("Edm.Boolean") | None, Value::Bool(b)) => EntityProperty::Boolean(Some(*b)),
        (None, Value::Number(n)) => decode_untyped_number(n).ok_or_else(|| invalid("number"))?,
        (Some(other), _) => {
            return Err(RestError::Protocol(format!("{name}: unsupported type {other}")));
        },
        (None, _) => return Err(invalid("untyped")),
    };
    Ok(Some(property))
}

fn decode_untyped_number(n: &Number) -> Option<EntityProperty> {
    if let Some(i) = n.as_i64() {
        return Some(match i32::try_from(i) {
            Ok(small) => EntityProperty::Int32(Some(small)),
            Err(_) => EntityProperty::Int64(Some(i)),
        });
    }
    n.as_f64().map(|d| EntityProperty::Double(Some(d)))
}

/// Decodes the `value` array of a query response.
///
/// # Errors
///
/// As [`decode_entity`], or when the body has no `value` array.
pub fn decode_entities(body: &Value) -> Result<Vec<DynamicEntity>> {
    body.get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| RestError::Protocol("query response has no value array".to_owned()))?
        .iter()
        .map(|row| decode_entity(row, None))
        .collect()
}
