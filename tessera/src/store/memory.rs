//! An in-memory storage tier

use std::collections::HashMap;

use parking_lot::Mutex;

use super::Storage;
use crate::transport::BoxError;

/// A process-local storage backend
///
/// Values live only as long as the backend itself.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Constructs an empty in-memory storage backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BoxError> {
        self.items.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), BoxError> {
        self.items.lock().remove(key);
        Ok(())
    }
}
