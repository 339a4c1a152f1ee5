//! Conversions between typed records and the untyped TOML tree.

use serde::de::DeserializeOwned;
use serde::Serialize;
use toml::{Table, Value};

use super::SchemaError;

/// Decode a typed value from an untyped table.
pub(crate) fn decode<T: DeserializeOwned>(entity: &'static str, table: Table) -> Result<T, SchemaError> {
    Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| SchemaError::Invalid {
            entity,
            message: e.message().to_string(),
        })
}

/// Encode a typed value into an untyped table. Unset optional fields are
/// omitted.
pub(crate) fn encode<T: Serialize>(entity: &'static str, value: &T) -> Result<Table, SchemaError> {
    match Value::try_from(value) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(other) => Err(SchemaError::Invalid {
            entity,
            message: format!("expected a table, got {}", other.type_str()),
        }),
        Err(e) => Err(SchemaError::Invalid {
            entity,
            message: e.to_string(),
        }),
    }
}

/// Overlay `patch` onto `base`. Nested tables merge key by key, every other
/// value replaces the previous one.
pub fn merge(base: &mut Table, patch: Table) {
    for (key, value) in patch {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => merge(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Parse a TOML snippet (a single record or a whole document).
pub fn parse_table(text: &str) -> Result<Table, SchemaError> {
    text.parse::<Table>()
        .map_err(|e| SchemaError::Malformed(e.message().to_string()))
}

/// Convert a JSON object, as posted by a dashboard, into an untyped table.
pub fn table_from_json(value: serde_json::Value) -> Result<Table, SchemaError> {
    match Value::try_from(value) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(other) => Err(SchemaError::Malformed(format!(
            "expected an object, got {}",
            other.type_str()
        ))),
        Err(e) => Err(SchemaError::Malformed(e.to_string())),
    }
}

/// Read the `type` discriminator of a record.
pub(crate) fn discriminator<'a>(entity: &'static str, table: &'a Table) -> Result<&'a str, SchemaError> {
    match table.get("type") {
        Some(Value::String(kind)) => Ok(kind),
        Some(other) => Err(SchemaError::Invalid {
            entity,
            message: format!("`type` must be a string, got {}", other.type_str()),
        }),
        None => Err(SchemaError::MissingField {
            entity,
            field: "type",
        }),
    }
}
