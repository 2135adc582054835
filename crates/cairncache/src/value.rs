//! Type-erased cache values and the type registry
//!
//! A single cache instance can hold values of different types. Each value
//! carries the name of its type; persisted backends record that name next to
//! the encoded value and use a [`TypeRegistry`] to rebuild the value on read.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// A type that can be stored in a cache.
///
/// `TYPE_NAME` is persisted alongside encoded values and must be unique
/// within a [`TypeRegistry`].
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable name recorded in persisted roots and buckets
    const TYPE_NAME: &'static str;
}

macro_rules! cacheable {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(impl Cacheable for $ty {
            const TYPE_NAME: &'static str = $name;
        })*
    };
}

cacheable! {
    String => "string",
    Vec<u8> => "bytes",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    serde_json::Value => "json",
}

trait ErasedValue: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Cacheable> ErasedValue for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A cached value of any registered type. Cloning is cheap.
#[derive(Clone)]
pub struct Value(Arc<dyn ErasedValue>);

impl Value {
    /// Wrap a typed value
    pub fn new<T: Cacheable>(value: T) -> Self {
        Value(Arc::new(value))
    }

    /// Name of the wrapped value's type
    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Whether the wrapped value is a `T`
    pub fn is<T: Cacheable>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    /// Borrow the wrapped value as a `T`
    pub fn downcast_ref<T: Cacheable>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Clone the wrapped value out as a `T`
    pub fn downcast<T: Cacheable>(&self) -> Result<T> {
        self.downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| Error::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.type_name().to_string(),
            })
    }

    /// Encode the wrapped value as JSON
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(self.0.to_json()?)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.to_json() {
            Ok(json) => write!(f, "Value<{}>({})", self.type_name(), json),
            Err(_) => write!(f, "Value<{}>(..)", self.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.type_name() == other.type_name()
            && matches!((self.0.to_json(), other.0.to_json()), (Ok(a), Ok(b)) if a == b)
    }
}

type DecodeFn = fn(serde_json::Value) -> serde_json::Result<Value>;

fn decode_as<T: Cacheable>(json: serde_json::Value) -> serde_json::Result<Value> {
    serde_json::from_value::<T>(json).map(Value::new)
}

/// Maps persisted type names back to decoders.
///
/// The default registry knows every built-in [`Cacheable`] type; register
/// application types with [`TypeRegistry::register`].
#[derive(Clone)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    /// A registry with no types at all
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `T` under its `TYPE_NAME`
    pub fn register<T: Cacheable>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE_NAME, decode_as::<T> as DecodeFn);
        self
    }

    /// Builder form of [`TypeRegistry::register`]
    pub fn with<T: Cacheable>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Whether a type name can be resolved
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Rebuild a value from its type name and JSON form
    pub fn decode(&self, type_name: &str, json: serde_json::Value) -> Result<Value> {
        let decode = self
            .decoders
            .get(type_name)
            .ok_or_else(|| Error::UnresolvedType(type_name.to_string()))?;
        Ok(decode(json)?)
    }

    /// Rebuild a value from its type name and encoded JSON bytes
    pub fn decode_slice(&self, type_name: &str, bytes: &[u8]) -> Result<Value> {
        if !self.contains(type_name) {
            return Err(Error::UnresolvedType(type_name.to_string()));
        }
        let json: serde_json::Value = serde_json::from_slice(bytes)?;
        self.decode(type_name, json)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::empty()
            .with::<String>()
            .with::<Vec<u8>>()
            .with::<bool>()
            .with::<i32>()
            .with::<i64>()
            .with::<u32>()
            .with::<u64>()
            .with::<f64>()
            .with::<serde_json::Value>()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.decoders.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
    }

    impl Cacheable for Point {
        const TYPE_NAME: &'static str = "test.Point";
    }

    #[test]
    fn test_downcast() {
        let value = Value::new("hello".to_string());

        assert_eq!(value.type_name(), "string");
        assert!(value.is::<String>());
        assert_eq!(value.downcast::<String>().unwrap(), "hello");
        assert!(matches!(
            value.downcast::<i64>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_registry_decodes_custom_type() {
        let registry = TypeRegistry::default().with::<Point>();
        let json = Value::new(Point { x: 1, y: -2 }).to_json().unwrap();

        let decoded = registry.decode("test.Point", json).unwrap();
        assert_eq!(decoded.downcast::<Point>().unwrap(), Point { x: 1, y: -2 });
    }

    #[test]
    fn test_unresolved_type() {
        let registry = TypeRegistry::default();
        let result = registry.decode_slice("test.Point", b"{\"x\":1,\"y\":2}");
        assert!(matches!(result, Err(Error::UnresolvedType(name)) if name == "test.Point"));
    }

    #[test]
    fn test_malformed_content() {
        let registry = TypeRegistry::default();
        let result = registry.decode_slice("i64", b"{not json");
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::new(7i64), Value::new(7i64));
        assert_ne!(Value::new(7i64), Value::new(7u64));
        assert_ne!(Value::new(7i64), Value::new(8i64));
    }
}
