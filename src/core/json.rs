// Dynamic JSON column values and their adaptation from generic serde trees.
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::core::error::{Error, ErrorCode};

#[derive(Clone, Debug, PartialEq)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

impl JsonValue {
    /// Adapts a generic value tree. Object keys keep their insertion order.
    pub fn adapt(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(flag) => Ok(JsonValue::Bool(*flag)),
            Value::Number(number) => adapt_number(number),
            Value::String(text) => Ok(JsonValue::String(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(JsonValue::adapt)
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, value)| Ok((key.clone(), JsonValue::adapt(value)?)))
                .collect::<Result<Vec<_>, Error>>()
                .map(JsonValue::Object),
        }
    }

    /// Adapts any serializable host value: structs and maps become objects (field
    /// order preserved), sequences and tuples become arrays.
    pub fn from_serialize<T>(value: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let tree = serde_json::to_value(value).map_err(|err| {
            Error::from_code(ErrorCode::UnsupportedJsonShape)
                .with_message("value cannot be represented as json")
                .with_source(err)
        })?;
        JsonValue::adapt(&tree)
    }

    pub fn to_serde(&self) -> Value {
        match self {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(flag) => Value::Bool(*flag),
            JsonValue::Int(number) => Value::Number(Number::from(*number)),
            JsonValue::Float(number) => Number::from_f64(*number)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            JsonValue::String(text) => Value::String(text.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(JsonValue::to_serde).collect()),
            JsonValue::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), value.to_serde());
                }
                Value::Object(map)
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsonValue::Null)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        match self {
            JsonValue::Object(fields) => fields
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

fn adapt_number(number: &Number) -> Result<JsonValue, Error> {
    if let Some(value) = number.as_i64() {
        return Ok(JsonValue::Int(value));
    }
    if number.is_u64() {
        return Err(Error::from_code(ErrorCode::UnsupportedJsonShape)
            .with_message(format!("integer {number} exceeds the signed 64-bit range")));
    }
    match number.as_f64() {
        Some(value) => Ok(JsonValue::Float(value)),
        None => Err(Error::from_code(ErrorCode::UnsupportedJsonShape)
            .with_message(format!("number {number} is not representable"))),
    }
}

impl From<bool> for JsonValue {
    fn from(value: bool) -> Self {
        JsonValue::Bool(value)
    }
}

impl From<i64> for JsonValue {
    fn from(value: i64) -> Self {
        JsonValue::Int(value)
    }
}

impl From<f64> for JsonValue {
    fn from(value: f64) -> Self {
        JsonValue::Float(value)
    }
}

impl From<&str> for JsonValue {
    fn from(value: &str) -> Self {
        JsonValue::String(value.to_string())
    }
}

impl From<String> for JsonValue {
    fn from(value: String) -> Self {
        JsonValue::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::JsonValue;
    use crate::core::error::ErrorCode;
    use serde::Serialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Person {
        #[serde(rename = "Age")]
        age: i32,
        #[serde(rename = "Name")]
        name: String,
    }

    #[test]
    fn adapts_scalars() {
        assert_eq!(JsonValue::from_serialize(&()).expect("unit"), JsonValue::Null);
        assert_eq!(JsonValue::from_serialize(&None::<i32>).expect("none"), JsonValue::Null);
        assert_eq!(JsonValue::from_serialize(&true).expect("bool"), JsonValue::Bool(true));
        assert_eq!(JsonValue::from_serialize(&123456).expect("int"), JsonValue::Int(123456));
        assert_eq!(
            JsonValue::from_serialize(&123.456).expect("float"),
            JsonValue::Float(123.456)
        );
    }

    #[test]
    fn empty_string_is_not_null() {
        let value = JsonValue::from_serialize("").expect("string");
        assert_eq!(value, JsonValue::String(String::new()));
        assert!(!value.is_null());
    }

    #[test]
    fn adapts_sequences_recursively() {
        let value = JsonValue::from_serialize(&vec!["abc", "dfg"]).expect("array");
        assert_eq!(
            value,
            JsonValue::Array(vec![JsonValue::from("abc"), JsonValue::from("dfg")])
        );

        let mixed = JsonValue::adapt(&json!([1, [2.5, null], {"k": "v"}])).expect("mixed");
        assert_eq!(
            mixed,
            JsonValue::Array(vec![
                JsonValue::Int(1),
                JsonValue::Array(vec![JsonValue::Float(2.5), JsonValue::Null]),
                JsonValue::Object(vec![("k".to_string(), JsonValue::from("v"))]),
            ])
        );
    }

    #[test]
    fn adapts_structs_in_field_order() {
        let person = Person {
            age: 20,
            name: "Ali".to_string(),
        };
        let value = JsonValue::from_serialize(&person).expect("object");
        assert_eq!(
            value,
            JsonValue::Object(vec![
                ("Age".to_string(), JsonValue::Int(20)),
                ("Name".to_string(), JsonValue::from("Ali")),
            ])
        );
        assert_eq!(value.get("Name"), Some(&JsonValue::from("Ali")));
    }

    #[test]
    fn object_keys_keep_insertion_order() {
        let value = JsonValue::adapt(&json!({"zeta": 1, "alpha": 2})).expect("object");
        let JsonValue::Object(fields) = value else {
            panic!("expected object");
        };
        let keys: Vec<_> = fields.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn rejects_unrepresentable_shapes() {
        let mut map = BTreeMap::new();
        map.insert((1, 2), "pair-keyed");
        let err = JsonValue::from_serialize(&map).expect_err("tuple keys");
        assert_eq!(err.code(), Some(ErrorCode::UnsupportedJsonShape));

        let err = JsonValue::from_serialize(&u64::MAX).expect_err("u64 overflow");
        assert_eq!(err.code(), Some(ErrorCode::UnsupportedJsonShape));
    }

    #[test]
    fn converts_back_to_serde() {
        let source = json!({"a": [1, 2.5, "x", null, true]});
        let value = JsonValue::adapt(&source).expect("adapt");
        assert_eq!(value.to_serde(), source);
    }
}
