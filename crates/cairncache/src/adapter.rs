//! Single-type views over heterogeneous caches and back

use std::collections::HashSet;
use std::marker::PhantomData;
use std::time::Duration;

use crate::cache::{Backend, CacheExt, Supplier, Updater};
use crate::error::Result;
use crate::value::{Cacheable, Value};

/// A cache whose values all share the type `T`
pub trait SingleTypeCache<T>: Send + Sync {
    /// Look up a value
    fn get(&self, key: &str) -> Result<Option<T>>;

    /// Insert or replace a value
    fn put(&self, key: &str, value: T) -> Result<()>;

    /// Return the current value, or store and return the supplier's value
    fn compute_if_absent(&self, key: &str, supplier: &mut dyn FnMut() -> Result<T>) -> Result<T>;

    /// Store `update(current)` if present, otherwise `supplier()`
    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: &mut dyn FnMut() -> Result<T>,
        update: &mut dyn FnMut(T) -> Result<T>,
    ) -> Result<T>;

    /// Delete a key
    fn remove(&self, key: &str) -> Result<()>;

    /// Delete several keys
    fn remove_all(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// All present keys
    fn key_set(&self) -> Result<HashSet<String>>;

    /// Number of present keys
    fn size(&self) -> Result<usize> {
        Ok(self.key_set()?.len())
    }

    /// Whether no key is present
    fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Remove every entry
    fn clear(&self) -> Result<()>;

    /// Time since the entry was last written
    fn age(&self, key: &str) -> Result<Option<Duration>>;
}

/// Binds a [`Backend`] to one value type.
///
/// Reading a key that holds another type yields [`crate::Error::TypeMismatch`].
pub struct TypedCache<T, B> {
    backend: B,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Cacheable, B: Backend> TypedCache<T, B> {
    /// Wrap a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    /// The wrapped backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Unwrap the adapter
    pub fn into_inner(self) -> B {
        self.backend
    }
}

impl<T: Cacheable, B: Backend> SingleTypeCache<T> for TypedCache<T, B> {
    fn get(&self, key: &str) -> Result<Option<T>> {
        self.backend.get_as(key)
    }

    fn put(&self, key: &str, value: T) -> Result<()> {
        self.backend.put_as(key, value)
    }

    fn compute_if_absent(&self, key: &str, supplier: &mut dyn FnMut() -> Result<T>) -> Result<T> {
        self.backend
            .compute_if_absent(key, &mut || supplier().map(Value::new))?
            .downcast()
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: &mut dyn FnMut() -> Result<T>,
        update: &mut dyn FnMut(T) -> Result<T>,
    ) -> Result<T> {
        self.backend
            .compute_if_absent_or_update(
                key,
                &mut || supplier().map(Value::new),
                &mut |current| update(current.downcast()?).map(Value::new),
            )?
            .downcast()
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key)
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.backend.remove_all(keys)
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        self.backend.key_set()
    }

    fn size(&self) -> Result<usize> {
        self.backend.size()
    }

    fn clear(&self) -> Result<()> {
        self.backend.clear()
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        self.backend.age(key)
    }
}

/// Exposes a [`SingleTypeCache`] as a heterogeneous [`Backend`].
///
/// Values of any type other than `T` are rejected with
/// [`crate::Error::TypeMismatch`].
pub struct DynamicCache<T, C> {
    cache: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Cacheable, C: SingleTypeCache<T>> DynamicCache<T, C> {
    /// Wrap a single-type cache
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            _marker: PhantomData,
        }
    }

    /// The wrapped cache
    pub fn cache(&self) -> &C {
        &self.cache
    }
}

impl<T: Cacheable, C: SingleTypeCache<T>> Backend for DynamicCache<T, C> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.cache.get(key)?.map(Value::new))
    }

    fn get_type(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key)?.map(|_| T::TYPE_NAME.to_string()))
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.cache.put(key, value.downcast()?)
    }

    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let typed = entries
            .into_iter()
            .map(|(key, value)| Ok((key, value.downcast::<T>()?)))
            .collect::<Result<Vec<_>>>()?;
        for (key, value) in typed {
            self.cache.put(&key, value)?;
        }
        Ok(())
    }

    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
        self.cache
            .compute_if_absent(key, &mut || supplier()?.downcast())
            .map(Value::new)
    }

    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value> {
        self.cache
            .compute_if_absent_or_update(
                key,
                &mut || supplier()?.downcast(),
                &mut |current| update(Value::new(current))?.downcast(),
            )
            .map(Value::new)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.cache.remove(key)
    }

    fn remove_all(&self, keys: &[String]) -> Result<()> {
        self.cache.remove_all(keys)
    }

    fn key_set(&self) -> Result<HashSet<String>> {
        self.cache.key_set()
    }

    fn size(&self) -> Result<usize> {
        self.cache.size()
    }

    fn clear(&self) -> Result<()> {
        self.cache.clear()
    }

    fn age(&self, key: &str) -> Result<Option<Duration>> {
        self.cache.age(key)
    }
}

impl<T, C> std::fmt::Debug for DynamicCache<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCache")
            .field("type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}
