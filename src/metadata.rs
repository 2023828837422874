//! Typed key→value metadata attached to every [`crate::message::Message`].
//!
//! Grounded on `multio::message::Metadata` from the original C++ implementation: the access
//! surface (`get`, `getOpt`, `set`, `trySet`, `merge`, `update`) is reproduced with Rust
//! ownership semantics in place of C++ reference-qualified overloads.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A metadata value. Lists are homogeneous by convention but not enforced at the type level,
/// matching the original's dynamically-typed `MetadataValue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Nested(Metadata),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Nested(_) => "nested",
            Value::List(_) => "list",
        }
    }
}

macro_rules! value_conversions {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_conversions! {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Metadata> for Value {
    fn from(v: Metadata) -> Self {
        Value::Nested(v)
    }
}

/// Extracts a `&T` out of a [`Value`], returning [`MetadataError::TypeMismatch`] on mismatch.
/// Implemented per concrete type rather than generically, since the mapping from Rust type to
/// `Value` variant is not uniform (e.g. `i64` vs `&str`).
pub trait FromValue<'a>: Sized {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError>;
}

impl<'a> FromValue<'a> for bool {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch(key, "bool", other)),
        }
    }
}

impl<'a> FromValue<'a> for i64 {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::Int(i) => Ok(*i),
            other => Err(mismatch(key, "int", other)),
        }
    }
}

impl<'a> FromValue<'a> for f64 {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::Double(d) => Ok(*d),
            other => Err(mismatch(key, "double", other)),
        }
    }
}

impl<'a> FromValue<'a> for &'a str {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::String(s) => Ok(s.as_str()),
            other => Err(mismatch(key, "string", other)),
        }
    }
}

impl<'a> FromValue<'a> for &'a Metadata {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::Nested(m) => Ok(m),
            other => Err(mismatch(key, "nested", other)),
        }
    }
}

impl<'a> FromValue<'a> for &'a [Value] {
    fn from_value(key: &str, value: &'a Value) -> Result<Self, MetadataError> {
        match value {
            Value::List(l) => Ok(l.as_slice()),
            other => Err(mismatch(key, "list", other)),
        }
    }
}

fn mismatch(key: &str, expected: &'static str, found: &Value) -> MetadataError {
    MetadataError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

/// Mapping from string keys to tagged [`Value`]s. Iteration order is not part of the contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    values: HashMap<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Typed-get-or-throw.
    pub fn get<'a, T: FromValue<'a>>(&'a self, key: &str) -> Result<T, MetadataError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| MetadataError::MissingKey(key.to_string()))?;
        T::from_value(key, value)
    }

    /// Raw, untyped access.
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed-get-optional: `None` if the key is absent, `Err` if present with the wrong type.
    pub fn get_opt<'a, T: FromValue<'a>>(&'a self, key: &str) -> Result<Option<T>, MetadataError> {
        match self.values.get(key) {
            Some(value) => T::from_value(key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Insert-or-assign.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Insert-if-absent. Returns `true` if the value was inserted.
    pub fn try_set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if self.values.contains_key(&key) {
            false
        } else {
            self.values.insert(key, value.into());
            true
        }
    }

    /// Moves every key in `other` that is not already present in `self` out of `other`.
    /// Both maps are modified: `self` gains the non-colliding keys, `other` loses them.
    pub fn merge(&mut self, other: &mut Metadata) {
        let incoming: Vec<String> = other
            .values
            .keys()
            .filter(|k| !self.values.contains_key(*k))
            .cloned()
            .collect();
        for key in incoming {
            if let Some(v) = other.values.remove(&key) {
                self.values.insert(key, v);
            }
        }
    }

    /// Overwrites `self` with every key/value in `other`, returning a `Metadata` of the prior
    /// values that were shadowed (absent keys in `other` are left untouched in `self` and do
    /// not appear in the returned map).
    pub fn update(&mut self, other: &Metadata) -> Metadata {
        let mut shadowed = Metadata::new();
        for (key, value) in other.values.iter() {
            if let Some(prev) = self.values.insert(key.clone(), value.clone()) {
                shadowed.values.insert(key.clone(), prev);
            }
        }
        shadowed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_get_or_throw_round_trips() {
        let mut m = Metadata::new();
        m.set("level", 850_i64);
        assert_eq!(m.get::<i64>("level").unwrap(), 850);
        assert!(matches!(
            m.get::<i64>("missing"),
            Err(MetadataError::MissingKey(_))
        ));
        assert!(matches!(
            m.get::<&str>("level"),
            Err(MetadataError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn get_opt_distinguishes_absent_from_wrong_type() {
        let mut m = Metadata::new();
        m.set("name", "sst");
        assert_eq!(m.get_opt::<&str>("name").unwrap(), Some("sst"));
        assert_eq!(m.get_opt::<&str>("missing").unwrap(), None);
        assert!(m.get_opt::<i64>("name").is_err());
    }

    #[test]
    fn try_set_on_existing_key_is_a_no_op() {
        let mut m = Metadata::new();
        m.set("category", "ocean");
        assert!(!m.try_set("category", "atmos"));
        assert_eq!(m.get::<&str>("category").unwrap(), "ocean");
        assert!(m.try_set("new-key", "value"));
    }

    #[test]
    fn merge_preserves_a_keys_and_moves_only_absent_b_keys() {
        let mut a = Metadata::new();
        a.set("category", "ocean");
        a.set("level", 1_i64);

        let mut b = Metadata::new();
        b.set("level", 2_i64); // colliding, should not overwrite a
        b.set("name", "sst"); // absent in a, should move in

        a.merge(&mut b);

        assert_eq!(a.get::<&str>("category").unwrap(), "ocean");
        assert_eq!(a.get::<i64>("level").unwrap(), 1);
        assert_eq!(a.get::<&str>("name").unwrap(), "sst");
        // moved keys are gone from other
        assert!(b.get_opt::<&str>("name").unwrap().is_none());
        // colliding key is left behind in other
        assert_eq!(b.get::<i64>("level").unwrap(), 2);
    }

    #[test]
    fn update_overwrites_and_returns_shadowed_values() {
        let mut a = Metadata::new();
        a.set("level", 1_i64);
        a.set("category", "ocean");

        let mut overlay = Metadata::new();
        overlay.set("level", 2_i64);

        let shadowed = a.update(&overlay);
        assert_eq!(a.get::<i64>("level").unwrap(), 2);
        assert_eq!(a.get::<&str>("category").unwrap(), "ocean");
        assert_eq!(shadowed.get::<i64>("level").unwrap(), 1);
        assert!(shadowed.get_opt::<&str>("category").unwrap().is_none());
    }

    #[test]
    fn update_is_idempotent() {
        let mut a = Metadata::new();
        a.set("level", 1_i64);

        let mut overlay = Metadata::new();
        overlay.set("level", 2_i64);

        let mut twice = a.clone();
        twice.update(&overlay);
        twice.update(&overlay);

        let mut once = a.clone();
        once.update(&overlay);

        assert_eq!(twice, once);
    }
}
