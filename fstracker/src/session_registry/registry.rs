use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;

use wire::payload::{FileDescription, PeerContact};

use super::session::Session;

const MAX_ID_TRIES: u32 = 10;
// Above this population random allocation degrades; give up instead.
const MAX_LIVE_SESSIONS: usize = 1 << 30;

/// Possible session registry errors.
#[derive(Debug)]
pub enum SessionRegistryError {
    PoisonedRegistryLock,
    SessionIdAlreadyLive(i32),
    UsernameAlreadyLive(String),
    SessionNotFound(i32),
    /// A removal found the reverse index out of step with the sessions
    /// map; the registry is considered corrupt.
    CorruptFileIndex(i32),
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<i32, Session>,
    usernames: HashSet<String>,
    locked_ids: HashSet<i32>,
    file_index: HashMap<String, HashSet<i32>>,
}

impl RegistryState {
    fn generate_id(&self) -> Option<i32> {
        if self.sessions.len() >= MAX_LIVE_SESSIONS {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ID_TRIES {
            let candidate: i32 = rng.gen();
            if candidate != 0
                && !self.sessions.contains_key(&candidate)
                && !self.locked_ids.contains(&candidate)
            {
                return Some(candidate);
            }
        }
        None
    }

    fn session_id_for(&self, username: &str) -> Option<i32> {
        // Linear scan; this is only consulted on logins.
        self.sessions
            .values()
            .find(|session| session.username == username)
            .map(|session| session.session_id)
    }
}

/// The authoritative map of live peers plus the filename reverse index,
/// the in-use username set and the locked-id set, all mutated together
/// under a single mutex so no observer ever sees one without the others.
#[derive(Debug, Default)]
pub struct AtomicSessionRegistry {
    state: Mutex<RegistryState>,
}

impl AtomicSessionRegistry {
    /// Draws random non-zero ids until one is free among both live and
    /// locked sessions. Gives up after a fixed number of tries; callers
    /// surface that as a login failure and the peer may retry later.
    pub fn generate_id(&self) -> Result<Option<i32>, SessionRegistryError> {
        Ok(self.lock_state()?.generate_id())
    }

    /// Reserves `id` so no other login can take it. Idempotent for an
    /// already locked id.
    ///
    /// # Errors
    /// - `SessionIdAlreadyLive` if the id belongs to a live session.
    pub fn lock_id(&self, id: i32) -> Result<(), SessionRegistryError> {
        let mut state = self.lock_state()?;
        if state.sessions.contains_key(&id) {
            return Err(SessionRegistryError::SessionIdAlreadyLive(id));
        }
        state.locked_ids.insert(id);
        Ok(())
    }

    pub fn unlock_id(&self, id: i32) -> Result<(), SessionRegistryError> {
        self.lock_state()?.locked_ids.remove(&id);
        Ok(())
    }

    /// The login step-1 composite: under one lock, finds the username's
    /// current id or draws a fresh one, then locks it. `None` means the
    /// login must fail: no id could be allocated, or the id is live
    /// (a second login for an already logged-in user).
    pub fn reserve_login_id(&self, username: &str) -> Result<Option<i32>, SessionRegistryError> {
        let mut state = self.lock_state()?;
        let id = match state.session_id_for(username) {
            Some(existing) => existing,
            None => match state.generate_id() {
                Some(fresh) => fresh,
                None => return Ok(None),
            },
        };
        if state.sessions.contains_key(&id) {
            return Ok(None);
        }
        state.locked_ids.insert(id);
        Ok(Some(id))
    }

    /// Promotes a session to live and posts every one of its files in
    /// the reverse index. The id may still be in the locked set; callers
    /// unlock right before this call.
    ///
    /// # Errors
    /// - `SessionIdAlreadyLive` / `UsernameAlreadyLive` if either key is
    ///   already taken, in which case nothing is inserted.
    pub fn add_session(&self, session: Session) -> Result<(), SessionRegistryError> {
        let mut state = self.lock_state()?;
        if state.sessions.contains_key(&session.session_id) {
            return Err(SessionRegistryError::SessionIdAlreadyLive(
                session.session_id,
            ));
        }
        if state.usernames.contains(&session.username) {
            return Err(SessionRegistryError::UsernameAlreadyLive(
                session.username.clone(),
            ));
        }
        state.usernames.insert(session.username.clone());
        for file in &session.files {
            state
                .file_index
                .entry(file.filename.clone())
                .or_insert_with(HashSet::new)
                .insert(session.session_id);
        }
        state.sessions.insert(session.session_id, session);
        Ok(())
    }

    /// Removes a live session together with its username and every one
    /// of its postings; an emptied posting set is dropped entirely.
    ///
    /// # Errors
    /// - `SessionNotFound` if the id is not live.
    /// - `CorruptFileIndex` if a posting or the username was already
    ///   missing; the registry removed what it could but must be
    ///   considered corrupt.
    pub fn remove_session(&self, id: i32) -> Result<(), SessionRegistryError> {
        let mut state = self.lock_state()?;
        let session = state
            .sessions
            .remove(&id)
            .ok_or(SessionRegistryError::SessionNotFound(id))?;

        let mut consistent = true;
        for file in &session.files {
            match state.file_index.get_mut(&file.filename) {
                Some(posting) => {
                    consistent &= posting.remove(&id);
                    if posting.is_empty() {
                        state.file_index.remove(&file.filename);
                    }
                }
                None => consistent = false,
            }
        }
        consistent &= state.usernames.remove(&session.username);

        if !consistent {
            return Err(SessionRegistryError::CorruptFileIndex(id));
        }
        Ok(())
    }

    /// One contact per live session holding `filename`, defensive
    /// copies. An unknown filename yields an empty list, not an error.
    pub fn search(&self, filename: &str) -> Result<Vec<PeerContact>, SessionRegistryError> {
        let state = self.lock_state()?;
        let contacts = match state.file_index.get(filename) {
            Some(posting) => posting
                .iter()
                .filter_map(|id| state.sessions.get(id))
                .map(Session::contact)
                .collect(),
            None => Vec::new(),
        };
        Ok(contacts)
    }

    pub fn session_id_for(&self, username: &str) -> Result<Option<i32>, SessionRegistryError> {
        Ok(self.lock_state()?.session_id_for(username))
    }

    pub fn is_active(&self, id: i32) -> Result<bool, SessionRegistryError> {
        Ok(self.lock_state()?.sessions.contains_key(&id))
    }

    pub fn is_user_active(&self, username: &str) -> Result<bool, SessionRegistryError> {
        Ok(self.lock_state()?.usernames.contains(username))
    }

    pub fn is_locked(&self, id: i32) -> Result<bool, SessionRegistryError> {
        Ok(self.lock_state()?.locked_ids.contains(&id))
    }

    pub fn session_count(&self) -> Result<usize, SessionRegistryError> {
        Ok(self.lock_state()?.sessions.len())
    }

    /// Defensive copy of a live session's contact, for validation.
    pub fn contact_for(&self, id: i32) -> Result<Option<PeerContact>, SessionRegistryError> {
        Ok(self.lock_state()?.sessions.get(&id).map(Session::contact))
    }

    /// Adds a freshly downloaded file to the session that acknowledged
    /// it, so later searches return the downloader as a holder too.
    pub fn record_holding(
        &self,
        id: i32,
        file: FileDescription,
    ) -> Result<bool, SessionRegistryError> {
        let mut state = self.lock_state()?;
        if !state.sessions.contains_key(&id) {
            return Ok(false);
        }
        state
            .file_index
            .entry(file.filename.clone())
            .or_insert_with(HashSet::new)
            .insert(id);
        if let Some(session) = state.sessions.get_mut(&id) {
            session.files.insert(file);
        }
        Ok(true)
    }

    fn lock_state(&self) -> Result<MutexGuard<RegistryState>, SessionRegistryError> {
        self.state
            .lock()
            .map_err(|_| SessionRegistryError::PoisonedRegistryLock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_non_zero_and_unlocked() {
        let registry = AtomicSessionRegistry::default();

        for _ in 0..100 {
            let id = registry.generate_id().unwrap().unwrap();
            assert_ne!(id, 0);
            assert!(!registry.is_locked(id).unwrap());
            assert!(!registry.is_active(id).unwrap());
        }
    }

    #[test]
    fn test_lock_id_is_idempotent() {
        let registry = AtomicSessionRegistry::default();

        registry.lock_id(7).unwrap();
        registry.lock_id(7).unwrap();

        assert!(registry.is_locked(7).unwrap());
        registry.unlock_id(7).unwrap();
        assert!(!registry.is_locked(7).unwrap());
    }

    #[test]
    fn test_lock_id_rejects_live_session() {
        let registry = AtomicSessionRegistry::default();
        registry.add_session(test_session(1, "u1", &[])).unwrap();

        assert!(matches!(
            registry.lock_id(1),
            Err(SessionRegistryError::SessionIdAlreadyLive(1))
        ));
    }

    #[test]
    fn test_generate_id_skips_locked_and_live() {
        let registry = AtomicSessionRegistry::default();
        // The odds of colliding with two specific values are negligible;
        // what matters is that the draw never returns a taken id.
        registry.lock_id(42).unwrap();
        registry.add_session(test_session(43, "u1", &[])).unwrap();

        for _ in 0..100 {
            let id = registry.generate_id().unwrap().unwrap();
            assert_ne!(id, 42);
            assert_ne!(id, 43);
        }
    }

    #[test]
    fn test_add_session_rejects_duplicate_username() {
        let registry = AtomicSessionRegistry::default();
        registry.add_session(test_session(1, "u1", &[])).unwrap();

        let result = registry.add_session(test_session(2, "u1", &[]));

        assert!(matches!(
            result,
            Err(SessionRegistryError::UsernameAlreadyLive(_))
        ));
        assert_eq!(registry.session_count().unwrap(), 1);
        // The failed insert must not leave stray state behind.
        assert!(!registry.is_active(2).unwrap());
    }

    #[test]
    fn test_add_session_rejects_duplicate_id() {
        let registry = AtomicSessionRegistry::default();
        registry.add_session(test_session(1, "u1", &[])).unwrap();

        let result = registry.add_session(test_session(1, "u2", &[]));

        assert!(matches!(
            result,
            Err(SessionRegistryError::SessionIdAlreadyLive(1))
        ));
        assert!(!registry.is_user_active("u2").unwrap());
    }

    #[test]
    fn test_add_session_while_id_is_locked_is_allowed() {
        let registry = AtomicSessionRegistry::default();
        registry.lock_id(5).unwrap();

        registry.unlock_id(5).unwrap();
        registry.add_session(test_session(5, "u1", &[])).unwrap();

        assert!(registry.is_active(5).unwrap());
    }

    #[test]
    fn test_search_finds_exactly_the_holders() {
        let registry = AtomicSessionRegistry::default();
        registry
            .add_session(test_session(1, "u1", &["a.bin", "b.bin"]))
            .unwrap();
        registry
            .add_session(test_session(2, "u2", &["b.bin", "c.bin"]))
            .unwrap();
        registry.add_session(test_session(3, "u3", &[])).unwrap();

        assert_eq!(usernames(registry.search("a.bin").unwrap()), vec!["u1"]);
        let mut holders = usernames(registry.search("b.bin").unwrap());
        holders.sort();
        assert_eq!(holders, vec!["u1", "u2"]);
        assert_eq!(usernames(registry.search("c.bin").unwrap()), vec!["u2"]);
        assert!(registry.search("d.bin").unwrap().is_empty());
    }

    #[test]
    fn test_remove_session_clears_postings() {
        let registry = AtomicSessionRegistry::default();
        registry
            .add_session(test_session(1, "u1", &["a.bin", "b.bin"]))
            .unwrap();
        registry
            .add_session(test_session(2, "u2", &["b.bin"]))
            .unwrap();

        registry.remove_session(1).unwrap();

        assert!(registry.search("a.bin").unwrap().is_empty());
        assert_eq!(usernames(registry.search("b.bin").unwrap()), vec!["u2"]);
        assert!(!registry.is_user_active("u1").unwrap());
        assert_eq!(registry.session_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_unknown_session() {
        let registry = AtomicSessionRegistry::default();

        assert!(matches!(
            registry.remove_session(9),
            Err(SessionRegistryError::SessionNotFound(9))
        ));
    }

    #[test]
    fn test_username_is_reusable_after_removal() {
        let registry = AtomicSessionRegistry::default();
        registry.add_session(test_session(1, "u1", &[])).unwrap();
        registry.remove_session(1).unwrap();

        registry.add_session(test_session(2, "u1", &[])).unwrap();

        assert!(registry.is_user_active("u1").unwrap());
    }

    #[test]
    fn test_reserve_login_id_locks_a_fresh_id() {
        let registry = AtomicSessionRegistry::default();

        let id = registry.reserve_login_id("u1").unwrap().unwrap();

        assert!(registry.is_locked(id).unwrap());
        assert!(!registry.is_active(id).unwrap());
    }

    #[test]
    fn test_reserve_login_id_rejects_live_username() {
        let registry = AtomicSessionRegistry::default();
        registry.add_session(test_session(1, "u1", &[])).unwrap();

        let id = registry.reserve_login_id("u1").unwrap();

        assert!(id.is_none());
        assert!(!registry.is_locked(1).unwrap());
    }

    #[test]
    fn test_search_returns_defensive_copies() {
        let registry = AtomicSessionRegistry::default();
        registry
            .add_session(test_session(1, "u1", &["a.bin"]))
            .unwrap();

        let mut contacts = registry.search("a.bin").unwrap();
        contacts[0].username = "tampered".to_string();

        assert_eq!(usernames(registry.search("a.bin").unwrap()), vec!["u1"]);
    }

    #[test]
    fn test_record_holding_updates_index_and_session() {
        let registry = AtomicSessionRegistry::default();
        registry
            .add_session(test_session(1, "u1", &["b.bin"]))
            .unwrap();
        registry.add_session(test_session(2, "u2", &[])).unwrap();

        assert!(registry
            .record_holding(2, FileDescription::new("b.bin", 0))
            .unwrap());

        let mut holders = usernames(registry.search("b.bin").unwrap());
        holders.sort();
        assert_eq!(holders, vec!["u1", "u2"]);

        // The posting must disappear with the session.
        registry.remove_session(2).unwrap();
        assert_eq!(usernames(registry.search("b.bin").unwrap()), vec!["u1"]);
    }

    #[test]
    fn test_record_holding_for_dead_session() {
        let registry = AtomicSessionRegistry::default();

        assert!(!registry
            .record_holding(1, FileDescription::new("b.bin", 0))
            .unwrap());
        assert!(registry.search("b.bin").unwrap().is_empty());
    }

    #[test]
    fn test_reverse_index_matches_sessions_after_churn() {
        let registry = AtomicSessionRegistry::default();
        registry
            .add_session(test_session(1, "u1", &["a.bin", "b.bin"]))
            .unwrap();
        registry
            .add_session(test_session(2, "u2", &["b.bin", "c.bin"]))
            .unwrap();
        registry.remove_session(1).unwrap();
        registry
            .add_session(test_session(3, "u3", &["a.bin", "c.bin"]))
            .unwrap();
        registry.remove_session(2).unwrap();

        assert_eq!(usernames(registry.search("a.bin").unwrap()), vec!["u3"]);
        assert!(registry.search("b.bin").unwrap().is_empty());
        assert_eq!(usernames(registry.search("c.bin").unwrap()), vec!["u3"]);
    }

    // Auxiliary functions

    fn test_session(id: i32, username: &str, filenames: &[&str]) -> Session {
        let files = filenames
            .iter()
            .map(|filename| FileDescription::new(filename, 1))
            .collect();
        Session::new(id, username, "127.0.0.1", 4000, files)
    }

    fn usernames(contacts: Vec<PeerContact>) -> Vec<String> {
        contacts
            .into_iter()
            .map(|contact| contact.username)
            .collect()
    }
}
