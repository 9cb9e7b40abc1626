//! The bridge between application types and rows.
//!
//! We go through serde_json because it is a convenient way to get a parseable view of any serde type.  The declared
//! columns are pulled out of that view by field name; list-valued fields become per-element sub-table rows.  If this
//! proves too slow, a custom serializer can replace it without touching the descriptor model.
//!
//! Every mismatch between a type and its descriptor surfaces here, as [PersistError::InvalidType]: a missing field,
//! a null in a non-nullable column, a non-sequence where a list was declared.
use serde_json::Value;

use crate::descriptor::{ColumnDescriptor, ColumnType, EntityDescriptor};
use crate::errors::{PersistError, Result};
use crate::table::{ColumnValue, Key, Row};

/// One entity instance, rendered into storable form.
pub(crate) struct Encoded {
    pub key: Key,
    pub row: Row,
    /// Element values for each sub-table, in descriptor order.
    pub lists: Vec<Vec<ColumnValue>>,
}

fn invalid(descriptor: &EntityDescriptor, reason: impl Into<String>) -> PersistError {
    PersistError::invalid(descriptor.qualified_name(), reason)
}

fn column_value(
    descriptor: &EntityDescriptor,
    column: &ColumnDescriptor,
    value: &mut Value,
) -> Result<ColumnValue> {
    if value.is_null() {
        if !column.is_nullable() {
            return Err(invalid(
                descriptor,
                format!("{}: got null but column isn't nullable", column.get_name()),
            ));
        }
        return Ok(ColumnValue::Null);
    }

    Ok(match column.get_column_type() {
        ColumnType::Integer => ColumnValue::Integer(value.as_i64().ok_or_else(|| {
            invalid(
                descriptor,
                format!("{}: value isn't representable as i64", column.get_name()),
            )
        })?),
        ColumnType::Real => ColumnValue::Real(value.as_f64().ok_or_else(|| {
            invalid(descriptor, format!("{}: value isn't an f64", column.get_name()))
        })?),
        ColumnType::Text => ColumnValue::Text(
            value
                .as_str()
                .ok_or_else(|| {
                    invalid(descriptor, format!("{}: value should be a string", column.get_name()))
                })?
                .to_string(),
        ),
        ColumnType::Json => ColumnValue::Json(value.take()),
    })
}

/// Render an instance into its main row plus sub-table elements.
pub(crate) fn encode<T: serde::Serialize>(
    descriptor: &EntityDescriptor,
    value: &T,
) -> Result<Encoded> {
    let mut json = serde_json::to_value(value)
        .map_err(|e| invalid(descriptor, format!("serialization failed: {}", e)))?;
    let fields = json
        .as_object_mut()
        .ok_or_else(|| invalid(descriptor, "type doesn't serialize to a map of fields"))?;

    let mut row = Row::new();
    for column in descriptor.get_columns() {
        let field = fields.get_mut(column.get_name()).ok_or_else(|| {
            invalid(
                descriptor,
                format!("type has no field for column {}", column.get_name()),
            )
        })?;
        row.push(column_value(descriptor, column, field)?);
    }

    let key = row
        .get(descriptor.primary_key_index())
        .and_then(|v| v.as_key())
        .ok_or_else(|| invalid(descriptor, "primary key value is unusable"))?;

    let mut lists = vec![];
    for sub in descriptor.get_sub_tables() {
        let field = fields.get_mut(sub.get_field()).ok_or_else(|| {
            invalid(descriptor, format!("type has no field for list {}", sub.get_field()))
        })?;
        let elements = field.as_array_mut().ok_or_else(|| {
            invalid(descriptor, format!("{}: field isn't a sequence", sub.get_field()))
        })?;

        let mut values = vec![];
        for element in elements.iter_mut() {
            values.push(column_value(descriptor, sub.value_column(), element)?);
        }
        lists.push(values);
    }

    Ok(Encoded { key, row, lists })
}

/// Pull just the primary key out of an instance.
pub(crate) fn extract_key<T: serde::Serialize>(
    descriptor: &EntityDescriptor,
    value: &T,
) -> Result<Key> {
    let json = serde_json::to_value(value)
        .map_err(|e| invalid(descriptor, format!("serialization failed: {}", e)))?;
    let pk = descriptor.primary_key();
    json.get(pk.get_name())
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64().map(Key::Integer),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        })
        .ok_or_else(|| {
            invalid(
                descriptor,
                format!("type has no usable value for key column {}", pk.get_name()),
            )
        })
}

fn json_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Integer(i) => Value::from(*i),
        ColumnValue::Real(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        ColumnValue::Text(s) => Value::String(s.clone()),
        ColumnValue::Json(v) => v.clone(),
    }
}

/// Rebuild an instance from its main row plus sub-table elements (one element list per sub-table, in descriptor
/// order).
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    descriptor: &EntityDescriptor,
    row: &Row,
    lists: &[Vec<ColumnValue>],
) -> Result<T> {
    if row.len() != descriptor.get_columns().len() {
        return Err(invalid(
            descriptor,
            format!(
                "row has {} values for {} columns",
                row.len(),
                descriptor.get_columns().len()
            ),
        ));
    }

    let mut fields = serde_json::Map::new();
    for (column, value) in descriptor.get_columns().iter().zip(row.iter()) {
        fields.insert(column.get_name().to_string(), json_value(value));
    }
    for (sub, elements) in descriptor.get_sub_tables().iter().zip(lists.iter()) {
        fields.insert(
            sub.get_field().to_string(),
            Value::Array(elements.iter().map(json_value).collect()),
        );
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| invalid(descriptor, format!("deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::descriptor::EntityBuilder;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Player {
        id: String,
        level: i64,
        title: Option<String>,
        inventory: Vec<String>,
    }

    fn descriptor() -> EntityDescriptor {
        let mut b = EntityBuilder::new("global", "player");
        b.add_text_column("id", true, false).unwrap();
        b.add_integer_column("level", false, false).unwrap();
        b.add_text_column("title", false, true).unwrap();
        b.add_list_column("inventory", ColumnType::Text).unwrap();
        b.build().unwrap()
    }

    fn player() -> Player {
        Player {
            id: "alice".into(),
            level: 9,
            title: None,
            inventory: vec!["sword".into(), "rope".into()],
        }
    }

    #[test]
    fn round_trips() {
        let desc = descriptor();
        let encoded = encode(&desc, &player()).unwrap();

        assert_eq!(encoded.key, Key::Text("alice".into()));
        assert_eq!(encoded.row.len(), 3);
        assert_eq!(encoded.row.get(2), Some(&ColumnValue::Null));
        assert_eq!(
            encoded.lists,
            vec![vec![
                ColumnValue::Text("sword".into()),
                ColumnValue::Text("rope".into())
            ]]
        );

        let decoded: Player = decode(&desc, &encoded.row, &encoded.lists).unwrap();
        assert_eq!(decoded, player());
    }

    #[test]
    fn extracts_keys_cheaply() {
        let desc = descriptor();
        assert_eq!(extract_key(&desc, &player()).unwrap(), Key::Text("alice".into()));
    }

    #[test]
    fn rejects_shape_mismatches() {
        // A column the type doesn't have.
        let mut b = EntityBuilder::new("global", "player");
        b.add_text_column("id", true, false).unwrap();
        b.add_integer_column("missing", false, false).unwrap();
        let desc = b.build().unwrap();
        assert!(matches!(
            encode(&desc, &player()),
            Err(PersistError::InvalidType { .. })
        ));

        // Null into a non-nullable column.
        let mut b = EntityBuilder::new("global", "player");
        b.add_text_column("id", true, false).unwrap();
        b.add_integer_column("level", false, false).unwrap();
        b.add_text_column("title", false, false).unwrap();
        let desc = b.build().unwrap();
        assert!(encode(&desc, &player()).is_err());
    }

    #[test]
    fn decode_defaults_nothing() {
        let desc = descriptor();
        let mut encoded = encode(&desc, &player()).unwrap();
        // Lose the list: the type requires the field, so decoding must fail rather than invent it.
        encoded.lists.clear();
        assert!(decode::<Player>(&desc, &encoded.row, &encoded.lists).is_err());
    }
}
