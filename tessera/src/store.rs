//! Credential persistence
//!
//! A [`CredentialStore`] serializes values as JSON and keeps them in one of
//! two tiers. The durable tier is any [`Storage`] implementation, such as
//! [`FileStorage`]. The store probes it once at construction and uses it
//! only if it works. Otherwise, or once the durable tier fails later on,
//! values are kept in a process-local [`MemoryStorage`] under the same
//! keys. Callers are never told which tier is in use.

use std::error;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::transport::BoxError;

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FileStorage;
pub use memory::MemoryStorage;

const PROBE_KEY: &str = "__tessera_probe__";

/// A string key/value storage backend
pub trait Storage: Send + Sync {
    /// Reads the value stored under `key`
    fn get_item(&self, key: &str) -> Result<Option<String>, BoxError>;

    /// Stores `value` under `key`, replacing any previous value
    fn set_item(&self, key: &str, value: &str) -> Result<(), BoxError>;

    /// Removes the value under `key`; removing a missing key succeeds
    fn remove_item(&self, key: &str) -> Result<(), BoxError>;
}

enum Tier {
    Durable(Box<dyn Storage>),
    Memory(MemoryStorage),
}

impl Tier {
    fn name(&self) -> &'static str {
        match self {
            Self::Durable(_) => "durable",
            Self::Memory(_) => "memory",
        }
    }

    fn run<R, F>(&mut self, action: &'static str, key: &str, op: F) -> R
    where
        R: Default,
        F: Fn(&dyn Storage) -> Result<R, BoxError>,
    {
        if let Self::Durable(storage) = self {
            let error = match op(&**storage) {
                Ok(result) => return result,
                Err(error) => error,
            };

            tracing::warn!(
                key,
                action,
                error = (&*error as &dyn error::Error),
                "durable storage failed, falling back to memory"
            );
            *self = Self::Memory(MemoryStorage::new());
        }

        let outcome = match self {
            Self::Durable(storage) => op(&**storage),
            Self::Memory(memory) => op(&*memory),
        };

        outcome.unwrap_or_else(|error| {
            tracing::warn!(
                key,
                action,
                error = (&*error as &dyn error::Error),
                "memory storage failed"
            );
            R::default()
        })
    }
}

/// A JSON value store with a transparent in-memory fallback
pub struct CredentialStore {
    tier: Mutex<Tier>,
}

impl CredentialStore {
    /// Constructs a store backed by `durable` storage, if it is usable
    ///
    /// The backend is probed by writing and removing a scratch key. If the
    /// probe fails, the store keeps its values in memory instead.
    pub fn new(durable: impl Storage + 'static) -> Self {
        let tier = match try_durable(&durable) {
            Ok(()) => {
                tracing::debug!("durable storage available");
                Tier::Durable(Box::new(durable))
            }
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn error::Error),
                    "durable storage unavailable, using memory"
                );
                Tier::Memory(MemoryStorage::new())
            }
        };

        Self {
            tier: Mutex::new(tier),
        }
    }

    /// Constructs a store that only keeps values in memory
    pub fn in_memory() -> Self {
        Self {
            tier: Mutex::new(Tier::Memory(MemoryStorage::new())),
        }
    }

    /// Whether values currently reach the durable backend
    pub fn is_durable(&self) -> bool {
        matches!(*self.tier.lock(), Tier::Durable(_))
    }

    /// Serializes and stores `value` under `key`
    pub fn persist<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let mut tier = self.tier.lock();
        write(&mut tier, key, value);
    }

    /// Reads and deserializes the value under `key`
    ///
    /// Missing values and stored text that does not deserialize as `T`
    /// both read as `None`.
    pub fn retrieve<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut tier = self.tier.lock();
        read(&mut tier, key)
    }

    /// Removes the value under `key`
    pub fn delete(&self, key: &str) {
        self.tier
            .lock()
            .run("remove", key, |storage| storage.remove_item(key));
    }

    /// Replaces the value under `key` with `f(current)` in a single step
    pub fn update<T, F>(&self, key: &str, f: F)
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let mut tier = self.tier.lock();
        let current = read(&mut tier, key);
        let next = f(current);
        write(&mut tier, key, &next);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("tier", &self.tier.lock().name())
            .finish()
    }
}

fn try_durable(storage: &dyn Storage) -> Result<(), BoxError> {
    storage.set_item(PROBE_KEY, PROBE_KEY)?;
    storage.remove_item(PROBE_KEY)
}

fn read<T: DeserializeOwned>(tier: &mut Tier, key: &str) -> Option<T> {
    let raw = tier.run("get", key, |storage| storage.get_item(key))?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(key, %error, "ignoring malformed stored value");
            None
        }
    }
}

fn write<T: Serialize + ?Sized>(tier: &mut Tier, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => tier.run("set", key, |storage| storage.set_item(key, &raw)),
        Err(error) => tracing::warn!(key, %error, "unable to serialize value for storage"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        io,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
    };

    use serde_json::{json, Value};

    use super::*;

    /// Storage that refuses every call, like a disabled browser store
    struct Unavailable;

    impl Storage for Unavailable {
        fn get_item(&self, _: &str) -> Result<Option<String>, BoxError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "disabled").into())
        }

        fn set_item(&self, _: &str, _: &str) -> Result<(), BoxError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "disabled").into())
        }

        fn remove_item(&self, _: &str) -> Result<(), BoxError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "disabled").into())
        }
    }

    /// Storage that works until told to break
    #[derive(Clone, Default)]
    struct Flaky {
        inner: Arc<MemoryStorage>,
        broken: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl Flaky {
        fn check(&self) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.load(Ordering::SeqCst) {
                Err(io::Error::new(io::ErrorKind::Other, "quota exceeded").into())
            } else {
                Ok(())
            }
        }
    }

    impl Storage for Flaky {
        fn get_item(&self, key: &str) -> Result<Option<String>, BoxError> {
            self.check()?;
            self.inner.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> Result<(), BoxError> {
            self.check()?;
            self.inner.set_item(key, value)
        }

        fn remove_item(&self, key: &str) -> Result<(), BoxError> {
            self.check()?;
            self.inner.remove_item(key)
        }
    }

    #[test]
    fn round_trips_values_in_memory() {
        let store = CredentialStore::in_memory();
        let value = json!({ "Authorization": "Bearer abc", "nested": { "n": [1, 2] } });

        store.persist("auth_headers", &value);

        assert_eq!(store.retrieve::<Value>("auth_headers"), Some(value));
    }

    #[test]
    fn round_trips_values_through_durable_storage() {
        let durable = Flaky::default();
        let store = CredentialStore::new(durable.clone());
        assert!(store.is_durable());

        store.persist("auth_headers", &json!({ "Authorization": "Bearer abc" }));

        assert_eq!(
            durable.inner.get_item("auth_headers").unwrap().as_deref(),
            Some(r#"{"Authorization":"Bearer abc"}"#)
        );
        assert_eq!(
            store.retrieve::<Value>("auth_headers"),
            Some(json!({ "Authorization": "Bearer abc" }))
        );
        assert_eq!(durable.inner.get_item(PROBE_KEY).unwrap(), None);
    }

    #[test]
    fn unavailable_durable_storage_falls_back_to_memory() {
        let store = CredentialStore::new(Unavailable);
        assert!(!store.is_durable());

        store.persist("auth_headers", &json!({ "Authorization": "Bearer abc" }));
        assert_eq!(
            store.retrieve::<Value>("auth_headers"),
            Some(json!({ "Authorization": "Bearer abc" }))
        );

        store.delete("auth_headers");
        assert_eq!(store.retrieve::<Value>("auth_headers"), None);
    }

    #[test]
    fn failing_durable_storage_is_demoted_transparently() {
        let durable = Flaky::default();
        let store = CredentialStore::new(durable.clone());

        durable.broken.store(true, Ordering::SeqCst);
        store.persist("auth_headers", &json!({ "a": "1" }));

        assert!(!store.is_durable());
        assert_eq!(store.retrieve::<Value>("auth_headers"), Some(json!({ "a": "1" })));

        let calls = durable.calls.load(Ordering::SeqCst);
        store.delete("auth_headers");
        assert_eq!(durable.calls.load(Ordering::SeqCst), calls);
        assert_eq!(store.retrieve::<Value>("auth_headers"), None);
    }

    #[test]
    fn malformed_values_read_as_absent() {
        let durable = Flaky::default();
        durable.inner.set_item("auth_headers", "{not json").unwrap();
        let store = CredentialStore::new(durable);

        assert_eq!(store.retrieve::<Value>("auth_headers"), None);
    }

    #[test]
    fn values_of_the_wrong_shape_read_as_absent() {
        let store = CredentialStore::in_memory();
        store.persist("auth_headers", &json!(["not", "a", "map"]));

        assert_eq!(store.retrieve::<BTreeMap<String, String>>("auth_headers"), None);
    }

    #[test]
    fn update_merges_with_the_current_value() {
        let store = CredentialStore::in_memory();
        store.persist("auth_headers", &json!({ "a": "1", "b": "2" }));

        store.update("auth_headers", |current: Option<BTreeMap<String, String>>| {
            let mut headers = current.unwrap_or_default();
            headers.insert("b".to_owned(), "3".to_owned());
            headers
        });

        assert_eq!(
            store.retrieve::<Value>("auth_headers"),
            Some(json!({ "a": "1", "b": "3" }))
        );
    }

    #[test]
    fn deleting_a_missing_key_is_harmless() {
        let store = CredentialStore::in_memory();
        store.delete("auth_headers");
        store.delete("auth_headers");
        assert_eq!(store.retrieve::<Value>("auth_headers"), None);
    }
}
