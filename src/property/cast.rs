//! Casting rules between declared types

use super::{Property, PropertyType, TypeError};
use serde_json::{Map, Number, Value};

/// Cast a runtime value into `target`, using the value's inferred type as its
/// declared source type.
pub fn cast(value: &Value, target: &Property) -> Result<Value, TypeError> {
    let source = Property::infer("value", value);
    cast_into(value, &source, target)
}

pub(super) fn cast_into(value: &Value, from: &Property, to: &Property) -> Result<Value, TypeError> {
    if to.is_any() {
        return Ok(value.clone());
    }
    if from.is_any() {
        return Err(TypeError::new(
            value,
            from,
            to,
            "values declared as any cannot be used where a concrete type is expected",
        ));
    }

    // A union source is narrowed to the first member matching the runtime value
    if let PropertyType::Union { any_of } = &from.kind {
        let member = any_of
            .iter()
            .find(|m| m.validate(value))
            .ok_or_else(|| {
                TypeError::new(value, from, to, "value matches no member of its union")
            })?;
        return cast_into(value, member, to);
    }

    if !from.matches_shape(value) {
        return Err(TypeError::new(value, from, to, "value does not match its declared type"));
    }

    let cast = match &to.kind {
        PropertyType::Union { any_of } => {
            return any_of
                .iter()
                .find_map(|member| cast_into(value, from, member).ok())
                .ok_or_else(|| {
                    TypeError::new(value, from, to, "no member of the union accepts the value")
                });
        }
        PropertyType::Any => Ok(value.clone()),
        PropertyType::Null => match value {
            Value::Null => Ok(Value::Null),
            _ => Err("only null can be cast to null".to_string()),
        },
        PropertyType::String => to_string(value),
        PropertyType::Integer => to_integer(value),
        PropertyType::Float => to_float(value),
        PropertyType::Boolean => to_boolean(value),
        PropertyType::List { item } => match (&from.kind, value) {
            (PropertyType::List { item: from_item }, Value::Array(items)) => items
                .iter()
                .map(|v| cast_into(v, from_item, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
                .map_err(|e| e.reason),
            _ => Err("only lists can be cast to lists".to_string()),
        },
        PropertyType::Map { key, value: value_type } => match (&from.kind, value) {
            (PropertyType::Map { key: from_key, value: from_value }, Value::Object(entries)) => {
                cast_map(
                    entries,
                    |_| Some((from_key.as_ref(), from_value.as_ref())),
                    key,
                    value_type,
                )
            }
            (PropertyType::Object { fields: from_fields }, Value::Object(entries)) => {
                let string_key = Property::string("key");
                cast_map(
                    entries,
                    |name| {
                        from_fields
                            .iter()
                            .find(|f| f.name == name)
                            .map(|f| (&string_key, f))
                    },
                    key,
                    value_type,
                )
            }
            _ => Err("only maps and objects can be cast to maps".to_string()),
        },
        PropertyType::Object { fields } => match (&from.kind, value) {
            (PropertyType::Object { fields: from_fields }, Value::Object(entries)) => {
                cast_object(entries, |name| from_fields.iter().find(|f| f.name == name), fields)
            }
            (PropertyType::Map { value: from_value, .. }, Value::Object(entries)) => {
                cast_object(entries, |_| Some(from_value.as_ref()), fields)
            }
            _ => Err("only objects and maps can be cast to objects".to_string()),
        },
    };

    let cast = cast.map_err(|reason| TypeError::new(value, from, to, reason))?;
    if to.allows(&cast) {
        Ok(cast)
    } else {
        Err(TypeError::new(value, from, to, "value is not one of the allowed enum values"))
    }
}

fn to_string(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Array(_) | Value::Object(_) => Ok(Value::String(value.to_string())),
        Value::Null => Err("null has no textual form".to_string()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_integer(f: f64) -> Result<Value, String> {
    if !f.is_finite() || f.trunc() > i64::MAX as f64 || f.trunc() < i64::MIN as f64 {
        return Err(format!("{f} is out of integer range"));
    }
    Ok(Value::Number(Number::from(f.trunc() as i64)))
}

fn to_integer(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(b) => Ok(Value::Number(Number::from(i64::from(*b)))),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Value::Number(n.clone())),
        Value::Number(n) => float_to_integer(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Ok(Value::Number(Number::from(i)))
            } else if let Ok(f) = trimmed.parse::<f64>() {
                float_to_integer(f)
            } else {
                Err(format!("'{s}' is not a number"))
            }
        }
        _ => Err("only scalars can be cast to integer".to_string()),
    }
}

fn to_float(value: &Value) -> Result<Value, String> {
    let f = match value {
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not representable as float"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number"))?,
        _ => return Err("only scalars can be cast to float".to_string()),
    };
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("{f} is not a finite number"))
}

fn to_boolean(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        _ => Err("only scalars can be cast to boolean".to_string()),
    }
}

fn cast_map<'a>(
    entries: &Map<String, Value>,
    source_entry: impl Fn(&str) -> Option<(&'a Property, &'a Property)>,
    key: &Property,
    value_type: &Property,
) -> Result<Value, String> {
    let mut out = Map::new();
    for (k, v) in entries {
        let (from_key, from_value) =
            source_entry(k).ok_or_else(|| format!("entry '{k}' has no declared type"))?;
        let cast_key = cast_into(&Value::String(k.clone()), from_key, key).map_err(|e| e.reason)?;
        let cast_key = match cast_key {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let cast_value = cast_into(v, from_value, value_type).map_err(|e| e.reason)?;
        out.insert(cast_key, cast_value);
    }
    Ok(Value::Object(out))
}

fn cast_object<'a>(
    entries: &Map<String, Value>,
    source_field: impl Fn(&str) -> Option<&'a Property>,
    fields: &[Property],
) -> Result<Value, String> {
    let mut out = Map::new();
    for field in fields {
        let cast_field = match (entries.get(&field.name), source_field(&field.name)) {
            (Some(v), Some(source)) => cast_into(v, source, field).map_err(|e| e.reason)?,
            _ => field
                .default
                .clone()
                .ok_or_else(|| format!("missing field '{}'", field.name))?,
        };
        out.insert(field.name.clone(), cast_field);
    }
    Ok(Value::Object(out))
}
