//! Ordered key-value configuration tree.
//!
//! `Document` is the single representation used for workflow definitions,
//! task configs, state params, carry params, reports and error payloads.
//! Keys keep their insertion order, which matters for workflow definitions:
//! the order of `+child` keys decides the default dependency chain.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A JSON object with typed accessors that fail with [`ConfigError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a document from an arbitrary JSON value. Fails unless it is an object.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(ConfigError::invalid(format!(
                "expected an object but got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(v) if !v.is_null())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    // -----------------------------------------------------------------------
    // Typed getters
    // -----------------------------------------------------------------------

    pub fn get_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_optional_str(key)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn get_optional_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(wrong_type(key, "a string")),
        }
    }

    /// Boolean getter. Accepts `"true"` / `"false"` strings as well.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(wrong_type(key, "a boolean")),
            },
            Some(_) => Err(wrong_type(key, "a boolean")),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ConfigError> {
        self.get_optional_i64(key)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Integer getter. Numeric strings are accepted since templated values
    /// arrive as text.
    pub fn get_optional_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| wrong_type(key, "an integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| wrong_type(key, "an integer")),
            Some(_) => Err(wrong_type(key, "an integer")),
        }
    }

    pub fn get_nested(&self, key: &str) -> Result<Document, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::MissingKey(key.to_string())),
            Some(Value::Object(map)) => Ok(Document(map.clone())),
            Some(_) => Err(wrong_type(key, "an object")),
        }
    }

    pub fn get_nested_or_empty(&self, key: &str) -> Result<Document, ConfigError> {
        match self.get(key) {
            None => Ok(Document::new()),
            Some(Value::Object(map)) => Ok(Document(map.clone())),
            Some(_) => Err(wrong_type(key, "an object")),
        }
    }

    /// List-of-strings getter. A single string is treated as a one-element list.
    pub fn get_string_list_or_empty(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        match self.get(key) {
            None => Ok(Vec::new()),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(wrong_type(key, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(wrong_type(key, "a list of strings")),
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Builder-style `set`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Overwrite every top-level key of `self` with the keys of `other`.
    pub fn merge(&mut self, other: &Document) -> &mut Self {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    /// Recursive merge: nested objects are merged key by key, everything else
    /// is overwritten by `other`.
    pub fn deep_merge(&mut self, other: &Document) -> &mut Self {
        for (k, v) in other.0.iter() {
            match (self.0.get_mut(k), v) {
                (Some(Value::Object(dst)), Value::Object(src)) => {
                    let mut nested = Document(std::mem::take(dst));
                    nested.deep_merge(&Document(src.clone()));
                    *dst = nested.0;
                }
                _ => {
                    self.0.insert(k.clone(), v.clone());
                }
            }
        }
        self
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = ConfigError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Document::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("{...}"),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::WrongType {
        key: key.to_string(),
        expected,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_keys_keep_insertion_order() {
        let d = doc(json!({"+b": {}, "+a": {}, "+c": {}}));
        let keys: Vec<&String> = d.keys().collect();
        assert_eq!(keys, vec!["+b", "+a", "+c"]);
    }

    #[test]
    fn test_from_value_rejects_scalars() {
        assert!(Document::from_value(json!("text")).is_err());
        assert!(Document::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_typed_getters() {
        let d = doc(json!({
            "name": "etl",
            "flag": "true",
            "limit": "3",
            "count": 7,
            "nested": {"x": 1},
            "after": "+a",
        }));
        assert_eq!(d.get_str("name").unwrap(), "etl");
        assert!(d.get_bool_or("flag", false).unwrap());
        assert!(!d.get_bool_or("missing", false).unwrap());
        assert_eq!(d.get_i64("limit").unwrap(), 3);
        assert_eq!(d.get_i64("count").unwrap(), 7);
        assert_eq!(d.get_nested("nested").unwrap().get_i64("x").unwrap(), 1);
        assert_eq!(d.get_string_list_or_empty("after").unwrap(), vec!["+a"]);
        assert!(d.get_string_list_or_empty("none").unwrap().is_empty());
    }

    #[test]
    fn test_wrong_type_errors() {
        let d = doc(json!({"count": "many", "nested": 3, "flag": 1}));
        assert!(matches!(
            d.get_i64("count"),
            Err(ConfigError::WrongType { expected: "an integer", .. })
        ));
        assert!(d.get_nested_or_empty("nested").is_err());
        assert!(d.get_bool_or("flag", false).is_err());
        assert_eq!(
            d.get_str("absent"),
            Err(ConfigError::MissingKey("absent".to_string()))
        );
    }

    #[test]
    fn test_null_counts_as_absent() {
        let d = doc(json!({"x": null}));
        assert!(!d.has("x"));
        assert!(d.get_nested_or_empty("x").unwrap().is_empty());
    }

    #[test]
    fn test_merge_overwrites_top_level() {
        let mut base = doc(json!({"a": 1, "n": {"x": 1, "y": 2}}));
        base.merge(&doc(json!({"n": {"x": 9}, "b": 2})));
        assert_eq!(base.into_value(), json!({"a": 1, "n": {"x": 9}, "b": 2}));
    }

    #[test]
    fn test_deep_merge_recurses_into_objects() {
        let mut base = doc(json!({"a": 1, "n": {"x": 1, "y": 2}}));
        base.deep_merge(&doc(json!({"n": {"x": 9}, "b": 2})));
        assert_eq!(base.into_value(), json!({"a": 1, "n": {"x": 9, "y": 2}, "b": 2}));
    }

    #[test]
    fn test_remove_preserves_order_of_rest() {
        let mut d = doc(json!({"a": 1, "b": 2, "c": 3}));
        d.remove("b");
        let keys: Vec<&String> = d.keys().collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
