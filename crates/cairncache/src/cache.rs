//! The cache contract shared by every backend and decorator

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::value::{Cacheable, Value};

/// Produces a value for an absent key
pub type Supplier<'a> = &'a mut dyn FnMut() -> Result<Value>;

/// Produces a replacement for a present key from its current value
pub type Updater<'a> = &'a mut dyn FnMut(Value) -> Result<Value>;

/// Operations every storage backend and decorator provides.
///
/// Absent or unreadable entries read as `Ok(None)`. `Err` is reserved for
/// stored content that cannot be rebuilt (unknown type name, malformed
/// encoding), failed writes and failing suppliers.
///
/// Suppliers and update functions may run while the backend holds its write
/// lock; they must not call back into the same cache.
pub trait Backend: Send + Sync {
    /// Look up a value
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Type name recorded for a key
    fn get_type(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value, stamping a fresh creation time
    fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Insert or replace several values
    fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }

    /// Return the current value, or store and return the supplier's value
    fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value>;

    /// Store `update(current)` if present, otherwise `supplier()`, and return it.
    ///
    /// Exactly one of the two functions is invoked.
    fn compute_if_absent_or_update(
        &self,
        key: &str,
        supplier: Supplier<'_>,
        update: Updater<'_>,
    ) -> Result<Value>;

    /// Delete a key. Deleting an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Delete several keys
    fn remove_all(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Whether a key is present
    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.key_set()?.contains(key))
    }

    /// All present keys
    fn key_set(&self) -> Result<HashSet<String>>;

    /// Number of present keys; always equal to `key_set().len()`
    fn size(&self) -> Result<usize> {
        Ok(self.key_set()?.len())
    }

    /// Whether no key is present
    fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Remove every entry and reset internal counters
    fn clear(&self) -> Result<()>;

    /// Time since the entry was last written
    fn age(&self, key: &str) -> Result<Option<Duration>>;
}

macro_rules! forward_through_pointer {
    ($ptr:ident) => {
        impl<B: Backend + ?Sized> Backend for $ptr<B> {
            fn get(&self, key: &str) -> Result<Option<Value>> {
                (**self).get(key)
            }

            fn get_type(&self, key: &str) -> Result<Option<String>> {
                (**self).get_type(key)
            }

            fn put(&self, key: &str, value: Value) -> Result<()> {
                (**self).put(key, value)
            }

            fn put_all(&self, entries: Vec<(String, Value)>) -> Result<()> {
                (**self).put_all(entries)
            }

            fn compute_if_absent(&self, key: &str, supplier: Supplier<'_>) -> Result<Value> {
                (**self).compute_if_absent(key, supplier)
            }

            fn compute_if_absent_or_update(
                &self,
                key: &str,
                supplier: Supplier<'_>,
                update: Updater<'_>,
            ) -> Result<Value> {
                (**self).compute_if_absent_or_update(key, supplier, update)
            }

            fn remove(&self, key: &str) -> Result<()> {
                (**self).remove(key)
            }

            fn remove_all(&self, keys: &[String]) -> Result<()> {
                (**self).remove_all(keys)
            }

            fn contains_key(&self, key: &str) -> Result<bool> {
                (**self).contains_key(key)
            }

            fn key_set(&self) -> Result<HashSet<String>> {
                (**self).key_set()
            }

            fn size(&self) -> Result<usize> {
                (**self).size()
            }

            fn is_empty(&self) -> Result<bool> {
                (**self).is_empty()
            }

            fn clear(&self) -> Result<()> {
                (**self).clear()
            }

            fn age(&self, key: &str) -> Result<Option<Duration>> {
                (**self).age(key)
            }
        }
    };
}

forward_through_pointer!(Arc);
forward_through_pointer!(Box);

/// Typed convenience methods over any [`Backend`].
///
/// Values are downcast to the requested type; a stored value of another type
/// yields [`crate::Error::TypeMismatch`].
pub trait CacheExt: Backend {
    /// Look up a value as a `T`
    fn get_as<T: Cacheable>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?.map(|value| value.downcast::<T>()).transpose()
    }

    /// Store a `T`
    fn put_as<T: Cacheable>(&self, key: &str, value: T) -> Result<()> {
        self.put(key, Value::new(value))
    }

    /// Typed [`Backend::compute_if_absent`]
    fn compute_if_absent_as<T, F>(&self, key: &str, mut supplier: F) -> Result<T>
    where
        T: Cacheable,
        F: FnMut() -> T,
    {
        self.compute_if_absent(key, &mut || Ok(Value::new(supplier())))?
            .downcast()
    }

    /// Typed [`Backend::compute_if_absent_or_update`]
    fn compute_if_absent_or_update_as<T, S, U>(
        &self,
        key: &str,
        mut supplier: S,
        mut update: U,
    ) -> Result<T>
    where
        T: Cacheable,
        S: FnMut() -> T,
        U: FnMut(T) -> T,
    {
        self.compute_if_absent_or_update(
            key,
            &mut || Ok(Value::new(supplier())),
            &mut |current| Ok(Value::new(update(current.downcast::<T>()?))),
        )?
        .downcast()
    }
}

impl<B: Backend + ?Sized> CacheExt for B {}
