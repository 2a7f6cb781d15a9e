//! A durable storage tier backed by the local filesystem

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use super::Storage;
use crate::transport::BoxError;

/// A storage backend that keeps one file per key inside a directory
///
/// The directory is created on first write. On unix, files are only
/// readable by the current user.
///
/// Keys are percent-encoded into file names: ASCII letters, digits, `-`
/// and `_` are kept, every other byte becomes `%XX`. Distinct keys never
/// share a file.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Constructs a new file storage backend rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding stored values
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 5);
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, BoxError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BoxError> {
        fs::create_dir_all(&self.dir)?;

        let mut file_opts = OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            file_opts.mode(0o600);
        }

        let mut file = file_opts.open(self.path_for(key))?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), BoxError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::store::CredentialStore;

    #[test]
    fn values_survive_a_new_store() {
        let dir = tempfile::tempdir().unwrap();

        let store = CredentialStore::new(FileStorage::new(dir.path()));
        assert!(store.is_durable());
        store.persist("auth_headers", &json!({ "Authorization": "Bearer abc" }));
        drop(store);

        let reopened = CredentialStore::new(FileStorage::new(dir.path()));
        assert_eq!(
            reopened.retrieve::<Value>("auth_headers"),
            Some(json!({ "Authorization": "Bearer abc" }))
        );
    }

    #[test]
    fn missing_keys_read_as_none_and_remove_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested"));

        assert_eq!(storage.get_item("auth_headers").unwrap(), None);
        storage.remove_item("auth_headers").unwrap();
    }

    #[test]
    fn keys_are_confined_to_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.set_item("../escape", "1").unwrap();

        assert!(dir.path().join("%2E%2E%2Fescape.json").exists());
        assert_eq!(storage.get_item("../escape").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn similar_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.set_item("a.b", "dot").unwrap();
        storage.set_item("a_b", "underscore").unwrap();
        storage.set_item("a%2Eb", "escaped").unwrap();

        assert_eq!(storage.get_item("a.b").unwrap().as_deref(), Some("dot"));
        assert_eq!(storage.get_item("a_b").unwrap().as_deref(), Some("underscore"));
        assert_eq!(storage.get_item("a%2Eb").unwrap().as_deref(), Some("escaped"));

        storage.remove_item("a.b").unwrap();
        assert_eq!(storage.get_item("a_b").unwrap().as_deref(), Some("underscore"));
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private_to_the_user() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.set_item("auth_headers", "{}").unwrap();

        let mode = fs::metadata(dir.path().join("auth_headers.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn a_directory_that_cannot_be_created_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let store = CredentialStore::new(FileStorage::new(blocker.join("store")));

        assert!(!store.is_durable());
        store.persist("auth_headers", &json!({ "a": "b" }));
        assert_eq!(store.retrieve::<Value>("auth_headers"), Some(json!({ "a": "b" })));
    }
}
