use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use wire::payload::Credentials;

/// Possible credential store errors.
#[derive(Debug)]
pub enum CredentialStoreError {
    PoisonedStoreLock,
    /// The store is corrupt and the repair attempt failed too.
    CorruptStore,
    WriteError(io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRow {
    username: String,
    password_hex: String,
    #[serde(default)]
    download_count: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    users: Vec<UserRow>,
}

#[derive(Debug)]
struct StoreState {
    rows: Vec<UserRow>,
    corrupt: bool,
}

/// Persistent user table `users(username, password_hex, download_count)`
/// kept as a JSON file. Every access is serialised by one mutex; a
/// corrupt file refuses reads and writes until `fix_schema` repairs it,
/// and every operation retries the repair first so the store self-heals
/// on the next request.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl CredentialStore {
    /// Opens a store over the given file. Nothing is read until
    /// `fix_schema` runs, so a fresh store starts out corrupt.
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState {
                rows: Vec::new(),
                corrupt: true,
            }),
        }
    }

    /// Idempotently repairs the backing file: a missing file is created
    /// empty, unreadable content or duplicate usernames are dropped and
    /// recreated empty. Returns whether the store is usable afterwards.
    pub fn fix_schema(&self) -> bool {
        match self.lock_state() {
            Ok(mut state) => Self::fix_schema_locked(&self.path, &mut state),
            Err(_) => false,
        }
    }

    fn fix_schema_locked(path: &Path, state: &mut StoreState) -> bool {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<StoreFile>(&bytes) {
                Ok(file) if !Self::has_duplicate_usernames(&file.users) => {
                    state.rows = file.users;
                    state.corrupt = false;
                    true
                }
                Ok(_) => {
                    warn!("credential store holds duplicate usernames, recreating it empty");
                    Self::recreate_empty(path, state)
                }
                Err(err) => {
                    warn!("credential store is unreadable ({}), recreating it empty", err);
                    Self::recreate_empty(path, state)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::recreate_empty(path, state),
            Err(err) => {
                warn!("could not read the credential store: {}", err);
                state.corrupt = true;
                false
            }
        }
    }

    fn recreate_empty(path: &Path, state: &mut StoreState) -> bool {
        state.rows.clear();
        match Self::persist_rows(path, &state.rows) {
            Ok(()) => {
                state.corrupt = false;
                true
            }
            Err(err) => {
                warn!("could not recreate the credential store: {:?}", err);
                state.corrupt = true;
                false
            }
        }
    }

    fn has_duplicate_usernames(rows: &[UserRow]) -> bool {
        let mut seen = HashSet::new();
        rows.iter().any(|row| !seen.insert(row.username.as_str()))
    }

    /// Returns the stored credentials (the password field carries the
    /// hex digest) and the download counter, or `None` for an unknown
    /// username.
    pub fn get_user(
        &self,
        username: &str,
    ) -> Result<Option<(Credentials, i64)>, CredentialStoreError> {
        let mut state = self.lock_state()?;
        self.heal_if_corrupt(&mut state)?;
        Ok(state
            .rows
            .iter()
            .find(|row| row.username == username)
            .map(|row| {
                (
                    Credentials::new(&row.username, &row.password_hex),
                    row.download_count,
                )
            }))
    }

    /// Inserts a new user with a zero download counter. Returns false
    /// when the username is already present.
    pub fn set_user(
        &self,
        username: &str,
        password_hex: &str,
    ) -> Result<bool, CredentialStoreError> {
        let mut state = self.lock_state()?;
        self.heal_if_corrupt(&mut state)?;
        if state.rows.iter().any(|row| row.username == username) {
            return Ok(false);
        }
        state.rows.push(UserRow {
            username: username.to_string(),
            password_hex: password_hex.to_string(),
            download_count: 0,
        });
        if let Err(err) = Self::persist_rows(&self.path, &state.rows) {
            state.rows.pop();
            return Err(err);
        }
        Ok(true)
    }

    /// Atomic `+1` on the user's download counter. Returns false when
    /// the row does not exist.
    pub fn add_download(&self, username: &str) -> Result<bool, CredentialStoreError> {
        let mut state = self.lock_state()?;
        self.heal_if_corrupt(&mut state)?;
        let row_index = match state.rows.iter().position(|row| row.username == username) {
            Some(index) => index,
            None => return Ok(false),
        };
        state.rows[row_index].download_count += 1;
        if let Err(err) = Self::persist_rows(&self.path, &state.rows) {
            state.rows[row_index].download_count -= 1;
            return Err(err);
        }
        Ok(true)
    }

    fn heal_if_corrupt(
        &self,
        state: &mut MutexGuard<StoreState>,
    ) -> Result<(), CredentialStoreError> {
        if state.corrupt && !Self::fix_schema_locked(&self.path, state) {
            return Err(CredentialStoreError::CorruptStore);
        }
        Ok(())
    }

    fn persist_rows(path: &Path, rows: &[UserRow]) -> Result<(), CredentialStoreError> {
        let file = StoreFile {
            users: rows.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|err| {
            CredentialStoreError::WriteError(io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        fs::write(path, bytes).map_err(CredentialStoreError::WriteError)
    }

    fn lock_state(&self) -> Result<MutexGuard<StoreState>, CredentialStoreError> {
        self.state
            .lock()
            .map_err(|_| CredentialStoreError::PoisonedStoreLock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_fix_schema_creates_missing_file() {
        let path = test_path("store_missing.json");
        let _ = fs::remove_file(&path);
        let store = CredentialStore::open(&path);

        assert!(store.fix_schema());
        assert!(path.exists());
        assert!(store.get_user("u1").unwrap().is_none());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_fix_schema_is_idempotent() {
        let path = test_path("store_idempotent.json");
        let _ = fs::remove_file(&path);
        let store = CredentialStore::open(&path);
        store.fix_schema();
        store.set_user("u1", "abc").unwrap();

        assert!(store.fix_schema());
        assert!(store.fix_schema());

        let (credentials, downloads) = store.get_user("u1").unwrap().unwrap();
        assert_eq!(credentials.password, "abc");
        assert_eq!(downloads, 0);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_unreadable_file_is_recreated_empty() {
        let path = test_path("store_unreadable.json");
        fs::write(&path, b"not json at all").unwrap();
        let store = CredentialStore::open(&path);

        assert!(store.fix_schema());
        assert!(store.get_user("u1").unwrap().is_none());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_duplicate_usernames_are_corruption() {
        let path = test_path("store_duplicates.json");
        fs::write(
            &path,
            br#"{"users":[{"username":"u1","password_hex":"a"},{"username":"u1","password_hex":"b"}]}"#,
        )
        .unwrap();
        let store = CredentialStore::open(&path);

        assert!(store.fix_schema());

        // The corrupt table was dropped and recreated empty.
        assert!(store.get_user("u1").unwrap().is_none());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_set_user_inserts_only_if_absent() {
        let path = test_path("store_insert.json");
        let _ = fs::remove_file(&path);
        let store = CredentialStore::open(&path);
        store.fix_schema();

        assert!(store.set_user("u1", "aa").unwrap());
        assert!(!store.set_user("u1", "bb").unwrap());

        let (credentials, _) = store.get_user("u1").unwrap().unwrap();
        assert_eq!(credentials.password, "aa");

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_add_download_counts_and_persists() {
        let path = test_path("store_downloads.json");
        let _ = fs::remove_file(&path);
        let store = CredentialStore::open(&path);
        store.fix_schema();
        store.set_user("u1", "aa").unwrap();

        assert!(store.add_download("u1").unwrap());
        assert!(store.add_download("u1").unwrap());
        assert!(!store.add_download("nobody").unwrap());

        // A reopened store sees the persisted counter.
        let reopened = CredentialStore::open(&path);
        let (_, downloads) = reopened.get_user("u1").unwrap().unwrap();
        assert_eq!(downloads, 2);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_download_count_defaults_to_zero() {
        let path = test_path("store_default_count.json");
        fs::write(
            &path,
            br#"{"users":[{"username":"u1","password_hex":"aa"}]}"#,
        )
        .unwrap();
        let store = CredentialStore::open(&path);

        let (_, downloads) = store.get_user("u1").unwrap().unwrap();

        assert_eq!(downloads, 0);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_operations_self_heal_a_corrupt_store() {
        let path = test_path("store_self_heal.json");
        fs::write(&path, b"garbage").unwrap();
        let store = CredentialStore::open(&path);

        // No explicit fix_schema: the first operation repairs the file.
        assert!(store.set_user("u1", "aa").unwrap());
        assert!(store.get_user("u1").unwrap().is_some());

        fs::remove_file(path).unwrap();
    }

    // Auxiliary functions

    fn test_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }
}
