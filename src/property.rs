//! Typed value descriptors
//!
//! A [`Property`] describes a named value flowing between steps: its declared
//! type, an optional default (which makes the value optional) and an optional
//! enumeration of allowed values. Runtime values are plain `serde_json::Value`s.
//!
//! Compatibility between descriptors is decided on declared types only. A value
//! declared [`PropertyType::Any`] never satisfies a concrete input, whatever it
//! holds at runtime.

mod cast;

pub use cast::cast;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Named runtime values (step inputs/outputs, flow inputs/outputs)
pub type Values = BTreeMap<String, Value>;

/// A value could not be converted to a declared type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot cast {value} from {from} to {to}: {reason}")]
pub struct TypeError {
    pub value: String,
    pub from: String,
    pub to: String,
    pub reason: String,
}

impl TypeError {
    pub(crate) fn new(
        value: &Value,
        from: &Property,
        to: &Property,
        reason: impl Into<String>,
    ) -> Self {
        let mut rendered = value.to_string();
        if rendered.chars().count() > 80 {
            rendered = rendered.chars().take(77).collect::<String>() + "...";
        }
        Self {
            value: rendered,
            from: from.type_name(),
            to: to.type_name(),
            reason: reason.into(),
        }
    }
}

/// Declared type of a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Integer,
    Float,
    Boolean,
    List { item: Box<Property> },
    Map { key: Box<Property>, value: Box<Property> },
    Object { fields: Vec<Property> },
    Union { any_of: Vec<Property> },
    Any,
    Null,
}

/// A typed, named value descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(flatten)]
    pub kind: PropertyType,
}

impl Property {
    pub fn new(name: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default: None,
            enum_values: None,
            kind,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Boolean)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Any)
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Null)
    }

    pub fn list(name: impl Into<String>, item: Property) -> Self {
        Self::new(name, PropertyType::List { item: Box::new(item) })
    }

    /// Map with string keys
    /// Map with string keys
    pub fn map(name: impl Into<String>, value: Property) -> Self {
        Self::map_with_key(name, Property::string("key"), value)
    }

    pub fn map_with_key(name: impl Into<String>, key: Property, value: Property) -> Self {
        Self::new(
            name,
            PropertyType::Map {
                key: Box::new(key),
                value: Box::new(value),
            },
        )
    }

    pub fn object(name: impl Into<String>, fields: Vec<Property>) -> Self {
        Self::new(name, PropertyType::Object { fields })
    }

    pub fn union(name: impl Into<String>, any_of: Vec<Property>) -> Self {
        Self::new(name, PropertyType::Union { any_of })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn with_enum(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.enum_values = Some(values.into_iter().collect());
        self
    }

    /// Same descriptor under another name
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut p = self.clone();
        p.name = name.into();
        p
    }

    /// A property with a default is an optional input
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, PropertyType::Any)
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> String {
        match &self.kind {
            PropertyType::String => "string".to_string(),
            PropertyType::Integer => "integer".to_string(),
            PropertyType::Float => "float".to_string(),
            PropertyType::Boolean => "boolean".to_string(),
            PropertyType::List { item } => format!("list<{}>", item.type_name()),
            PropertyType::Map { key, value } => {
                format!("map<{}, {}>", key.type_name(), value.type_name())
            }
            PropertyType::Object { fields } => {
                let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
                format!("object{{{}}}", names.join(", "))
            }
            PropertyType::Union { any_of } => {
                let members: Vec<_> = any_of.iter().map(Property::type_name).collect();
                format!("union<{}>", members.join(" | "))
            }
            PropertyType::Any => "any".to_string(),
            PropertyType::Null => "null".to_string(),
        }
    }

    /// Check a runtime value against this descriptor (shape and enum)
    pub fn validate(&self, value: &Value) -> bool {
        self.matches_shape(value) && self.allows(value)
    }

    fn allows(&self, value: &Value) -> bool {
        self.enum_values
            .as_ref()
            .map_or(true, |allowed| allowed.contains(value))
    }

    fn matches_shape(&self, value: &Value) -> bool {
        match &self.kind {
            PropertyType::Any => true,
            PropertyType::Null => value.is_null(),
            PropertyType::String => value.is_string(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Float => value.is_number(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::List { item } => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| item.validate(v))),
            PropertyType::Map {
                key,
                value: value_type,
            } => value.as_object().is_some_and(|entries| {
                entries.iter().all(|(k, v)| {
                    let key_ok = match key.kind {
                        PropertyType::String | PropertyType::Any => true,
                        _ => cast(&Value::String(k.clone()), key).is_ok(),
                    };
                    key_ok && value_type.validate(v)
                })
            }),
            PropertyType::Object { fields } => value.as_object().is_some_and(|entries| {
                fields.iter().all(|f| match entries.get(&f.name) {
                    Some(v) => f.validate(v),
                    None => f.has_default(),
                })
            }),
            PropertyType::Union { any_of } => any_of.iter().any(|m| m.validate(value)),
        }
    }

    /// Static, declared-type compatibility: can a value declared as `self` be
    /// fed into an input declared as `target`?
    pub fn is_castable_to(&self, target: &Property) -> bool {
        use PropertyType as T;
        match (&self.kind, &target.kind) {
            (_, T::Any) => true,
            (T::Any, _) => false,
            (T::Union { any_of }, _) => any_of.iter().all(|m| m.is_castable_to(target)),
            (_, T::Union { any_of }) => any_of.iter().any(|m| self.is_castable_to(m)),
            (T::Null, T::Null) => true,
            (T::Null, _) | (_, T::Null) => false,
            (
                T::String | T::Integer | T::Float | T::Boolean,
                T::String | T::Integer | T::Float | T::Boolean,
            )
            | (T::List { .. } | T::Map { .. } | T::Object { .. }, T::String) => true,
            (T::List { item: from }, T::List { item: to }) => from.is_castable_to(to),
            (T::Map { key: fk, value: fv }, T::Map { key: tk, value: tv }) => {
                fk.is_castable_to(tk) && fv.is_castable_to(tv)
            }
            (T::Object { fields: from }, T::Object { fields: to }) => to.iter().all(|t| {
                from.iter()
                    .find(|f| f.name == t.name)
                    .map_or(t.has_default(), |f| f.is_castable_to(t))
            }),
            (T::Object { fields }, T::Map { value, .. }) => {
                fields.iter().all(|f| f.is_castable_to(value))
            }
            (T::Map { value, .. }, T::Object { fields }) => {
                fields.iter().all(|t| value.is_castable_to(t))
            }
            _ => false,
        }
    }

    /// Cast a value declared as `self` into `target`
    pub fn cast_value(&self, value: &Value, target: &Property) -> Result<Value, TypeError> {
        cast::cast_into(value, self, target)
    }

    /// Infer a concrete descriptor from a runtime value. Never yields `Any`.
    pub fn infer(name: impl Into<String>, value: &Value) -> Self {
        let kind = match value {
            Value::Null => PropertyType::Null,
            Value::Bool(_) => PropertyType::Boolean,
            Value::Number(n) if n.is_f64() => PropertyType::Float,
            Value::Number(_) => PropertyType::Integer,
            Value::String(_) => PropertyType::String,
            Value::Array(items) => {
                let mut members: Vec<Property> = Vec::new();
                for item in items {
                    let inferred = Property::infer("item", item);
                    if !members.contains(&inferred) {
                        members.push(inferred);
                    }
                }
                let item = match members.len() {
                    0 => Property::null("item"),
                    1 => members.remove(0),
                    _ => Property::union("item", members),
                };
                PropertyType::List { item: Box::new(item) }
            }
            Value::Object(entries) => PropertyType::Object {
                fields: entries.iter().map(|(k, v)| Property::infer(k.clone(), v)).collect(),
            },
        };
        Property::new(name, kind)
    }

    /// JSON schema rendering, used for tool catalogues
    pub fn to_json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            PropertyType::String => json!({ "type": "string" }),
            PropertyType::Integer => json!({ "type": "integer" }),
            PropertyType::Float => json!({ "type": "number" }),
            PropertyType::Boolean => json!({ "type": "boolean" }),
            PropertyType::Null => json!({ "type": "null" }),
            PropertyType::Any => json!({}),
            PropertyType::List { item } => json!({
                "type": "array",
                "items": item.to_json_schema(),
            }),
            PropertyType::Map { value, .. } => json!({
                "type": "object",
                "additionalProperties": value.to_json_schema(),
            }),
            PropertyType::Object { fields } => object_schema(fields),
            PropertyType::Union { any_of } => json!({
                "anyOf": any_of.iter().map(Property::to_json_schema).collect::<Vec<_>>(),
            }),
        };
        if let Value::Object(map) = &mut schema {
            if !self.name.is_empty() {
                map.insert("title".to_string(), Value::String(self.name.clone()));
            }
            if !self.description.is_empty() {
                map.insert("description".to_string(), Value::String(self.description.clone()));
            }
            if let Some(default) = &self.default {
                map.insert("default".to_string(), default.clone());
            }
            if let Some(values) = &self.enum_values {
                map.insert("enum".to_string(), Value::Array(values.clone()));
            }
        }
        schema
    }
}

/// Object schema for a set of named properties (tool parameters, object fields)
pub fn object_schema(fields: &[Property]) -> Value {
    let properties: Map<String, Value> = fields
        .iter()
        .map(|f| (f.name.clone(), f.to_json_schema()))
        .collect();
    let required: Vec<Value> = fields
        .iter()
        .filter(|f| !f.has_default())
        .map(|f| Value::String(f.name.clone()))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Fill in defaults and cast every provided value to its descriptor.
///
/// Fails on the first value that cannot be cast, or when a descriptor without
/// a default has no value.
pub fn resolve_values(descriptors: &[Property], provided: &Values) -> Result<Values, ResolveError> {
    let mut resolved = Values::new();
    for descriptor in descriptors {
        match provided.get(&descriptor.name) {
            Some(value) => {
                resolved.insert(descriptor.name.clone(), cast(value, descriptor)?);
            }
            None => match &descriptor.default {
                Some(default) => {
                    resolved.insert(descriptor.name.clone(), default.clone());
                }
                None => return Err(ResolveError::Missing(descriptor.name.clone())),
            },
        }
    }
    Ok(resolved)
}

/// Failure of [`resolve_values`]
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no value for `{0}`")]
    Missing(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_shapes() {
        assert!(Property::integer("a").validate(&json!(3)));
        assert!(!Property::integer("a").validate(&json!(3.5)));
        assert!(Property::float("a").validate(&json!(3)));
        assert!(Property::list("l", Property::string("s")).validate(&json!(["a", "b"])));
        assert!(!Property::list("l", Property::string("s")).validate(&json!(["a", 1])));
        assert!(Property::any("x").validate(&json!({"anything": [1, 2]})));
        assert!(!Property::null("n").validate(&json!(0)));
    }

    #[test]
    fn test_validate_enum() {
        let p = Property::string("color").with_enum([json!("red"), json!("blue")]);
        assert!(p.validate(&json!("red")));
        assert!(!p.validate(&json!("green")));
    }

    #[test]
    fn test_validate_object_defaults() {
        let p = Property::object(
            "person",
            vec![
                Property::string("name"),
                Property::integer("age").with_default(0),
            ],
        );
        assert!(p.validate(&json!({"name": "ada"})));
        assert!(!p.validate(&json!({"age": 3})));
    }

    #[test]
    fn test_any_is_never_castable_to_concrete() {
        let any = Property::any("x");
        assert!(!any.is_castable_to(&Property::list("l", Property::any("i"))));
        assert!(!any.is_castable_to(&Property::string("s")));
        assert!(any.is_castable_to(&Property::any("y")));
    }

    #[test]
    fn test_static_compatibility() {
        let ints = Property::list("l", Property::integer("i"));
        let strings = Property::list("l", Property::string("s"));
        assert!(ints.is_castable_to(&strings));
        assert!(!Property::null("n").is_castable_to(&Property::string("s")));
        assert!(Property::integer("i")
            .is_castable_to(&Property::union(
                "u",
                vec![Property::null("n"), Property::float("f")]
            )));
        let source = Property::object("o", vec![Property::string("a")]);
        let target = Property::object(
            "o",
            vec![Property::string("a"), Property::integer("b").with_default(1)],
        );
        assert!(source.is_castable_to(&target));
        assert!(!target.is_castable_to(&Property::object("o", vec![Property::string("c")])));
    }

    #[test]
    fn test_infer_never_any() {
        let p = Property::infer("v", &json!([1, "a", 2]));
        match p.kind {
            PropertyType::List { item } => {
                assert!(matches!(
                    item.kind,
                    PropertyType::Union { ref any_of } if any_of.len() == 2
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_json_schema() {
        let p = Property::object(
            "args",
            vec![
                Property::string("query").with_description("What to look for"),
                Property::integer("limit").with_default(10),
            ],
        );
        let schema = p.to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["query"]));
        assert_eq!(schema["properties"]["limit"]["default"], json!(10));
        assert_eq!(schema["properties"]["query"]["description"], "What to look for");
    }

    #[test]
    fn test_resolve_values_fills_defaults() {
        let descriptors = vec![
            Property::integer("a"),
            Property::string("b").with_default("nothing"),
        ];
        let provided: Values = [("a".to_string(), json!("7"))].into_iter().collect();
        let resolved = resolve_values(&descriptors, &provided).unwrap();
        assert_eq!(resolved["a"], json!(7));
        assert_eq!(resolved["b"], json!("nothing"));

        let err = resolve_values(&descriptors, &Values::new()).unwrap_err();
        assert!(matches!(err, ResolveError::Missing(ref name) if name == "a"));
    }

    #[test]
    fn test_property_serde_shape() {
        let p = Property::list("names", Property::string("name")).with_description("all names");
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "list");
        assert_eq!(v["item"]["type"], "string");
        let back: Property = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    proptest! {
        #[test]
        fn prop_into_any_is_identity(n in any::<i64>(), s in "[a-z]{0,10}", b in any::<bool>()) {
            let value = json!({"n": n, "s": s, "b": b});
            prop_assert_eq!(cast(&value, &Property::any("x")).unwrap(), value);
        }

        #[test]
        fn prop_integers_validate_after_cast(n in any::<i32>()) {
            let as_string = cast(&json!(n), &Property::string("s")).unwrap();
            let back = cast(&as_string, &Property::integer("i")).unwrap();
            prop_assert!(Property::integer("i").validate(&back));
            prop_assert_eq!(back, json!(n));
        }
    }
}
