use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tracing::{info, warn};

use server::server_manager::Handler;
use server::tracked_stream::TrackedStream;
use wire::message::{read_request, Message, MessageError, Reply, Request, RequestKind};
use wire::payload::{
    decode_session_id, encode_contacts, encode_session_id, AcknowledgeRequest, Credentials,
    FileDescription, PayloadError, PeerAnnouncement, SearchRequest,
};

use crate::config::cfg::Cfg;
use crate::credential_store::store::{CredentialStore, CredentialStoreError};
use crate::session_registry::registry::{AtomicSessionRegistry, SessionRegistryError};
use crate::session_registry::session::Session;

/// Possible request handler errors.
#[derive(Debug)]
pub enum RequestHandlerError {
    MessageError(MessageError),
    PayloadError(PayloadError),
    RegistryError(SessionRegistryError),
    StoreError(CredentialStoreError),
    GettingPeerAddrError(io::Error),
    /// The follow-up message of a login handshake was not a LOGIN.
    UnexpectedFollowUp,
}

/// Lowercase hex SHA-1 digest, the at-rest form of every password.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha1::digest(password.as_bytes()))
}

/// Dispatches every tracker-side request type and enforces the login
/// two-step handshake. One request per connection, except LOGIN which
/// reads its follow-up announcement on the same socket.
pub struct TrackerRequestHandler {
    registry: Arc<AtomicSessionRegistry>,
    store: Arc<CredentialStore>,
    config: Cfg,
}

impl Handler for TrackerRequestHandler {
    fn handle(&self, request: Request, stream: &mut TrackedStream) {
        let reply = match request.kind {
            RequestKind::Register => self.handle_register(&request.payload),
            RequestKind::Login => self.handle_login(&request.payload, stream),
            RequestKind::Logout => self.handle_logout(&request.payload, stream),
            RequestKind::Search => self.handle_search(&request.payload, stream),
            RequestKind::Acknowledge => self.handle_acknowledge(&request.payload, stream),
            // Not tracker operations; answered negatively instead of
            // leaving the peer to time out.
            RequestKind::SimpleDownload | RequestKind::CheckAlive => Ok(Reply::failure()),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!("request {:?} failed: {:?}", request.kind, err);
                Reply::failure()
            }
        };
        if let Err(err) = Message::Reply(reply).write_to(stream) {
            warn!("could not write a reply: {:?}", err);
        }
    }
}

impl TrackerRequestHandler {
    pub fn new(
        registry: Arc<AtomicSessionRegistry>,
        store: Arc<CredentialStore>,
        config: Cfg,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// REGISTER: succeeds iff the username is free and the row with the
    /// hashed password could be inserted.
    fn handle_register(&self, payload: &[u8]) -> Result<Reply, RequestHandlerError> {
        let credentials =
            Credentials::from_bytes(payload).map_err(RequestHandlerError::PayloadError)?;
        if self
            .store
            .get_user(&credentials.username)
            .map_err(RequestHandlerError::StoreError)?
            .is_some()
        {
            return Ok(Reply::failure());
        }
        let inserted = self
            .store
            .set_user(&credentials.username, &hash_password(&credentials.password))
            .map_err(RequestHandlerError::StoreError)?;
        if inserted {
            info!("registered user {}", credentials.username);
            Ok(Reply::success_empty())
        } else {
            Ok(Reply::failure())
        }
    }

    /// LOGIN, the one two-message handshake of the protocol.
    ///
    /// Step 1 checks the credentials and reserves a locked session id;
    /// step 2 reads the peer announcement and promotes the session. The
    /// locked id is released on every exit path after step 1, including
    /// a peer that closes the socket instead of announcing.
    fn handle_login(
        &self,
        payload: &[u8],
        stream: &mut TrackedStream,
    ) -> Result<Reply, RequestHandlerError> {
        let credentials =
            Credentials::from_bytes(payload).map_err(RequestHandlerError::PayloadError)?;

        if !self.credentials_match(&credentials)? {
            return Ok(Reply::failure());
        }

        let session_id = match self
            .registry
            .reserve_login_id(&credentials.username)
            .map_err(RequestHandlerError::RegistryError)?
        {
            Some(session_id) => session_id,
            // No free id, or the username is already live.
            None => return Ok(Reply::failure()),
        };

        Message::Reply(Reply::success(encode_session_id(session_id)))
            .write_to(stream)
            .map_err(|err| {
                let _ = self.registry.unlock_id(session_id);
                RequestHandlerError::MessageError(err)
            })?;

        match self.finish_login(session_id, &credentials.username, stream) {
            Ok(()) => {
                info!(
                    "user {} logged in with session {}",
                    credentials.username, session_id
                );
                Ok(Reply::success_empty())
            }
            Err(err) => {
                // The abandonment path: whatever went wrong after step
                // 1, the id must not stay locked.
                let _ = self.registry.unlock_id(session_id);
                warn!(
                    "login step two failed for {}: {:?}",
                    credentials.username, err
                );
                Ok(Reply::failure())
            }
        }
    }

    fn credentials_match(&self, credentials: &Credentials) -> Result<bool, RequestHandlerError> {
        let stored = self
            .store
            .get_user(&credentials.username)
            .map_err(RequestHandlerError::StoreError)?;
        Ok(match stored {
            Some((stored_credentials, _)) => stored_credentials
                .password
                .eq_ignore_ascii_case(&hash_password(&credentials.password)),
            None => false,
        })
    }

    fn finish_login(
        &self,
        session_id: i32,
        username: &str,
        stream: &mut TrackedStream,
    ) -> Result<(), RequestHandlerError> {
        let follow_up = read_request(stream).map_err(RequestHandlerError::MessageError)?;
        if follow_up.kind != RequestKind::Login {
            return Err(RequestHandlerError::UnexpectedFollowUp);
        }
        let announcement = PeerAnnouncement::from_bytes(&follow_up.payload)
            .map_err(RequestHandlerError::PayloadError)?;

        let host = if self.config.peer_remote_host {
            announcement.host
        } else {
            // The socket peer address is the safer truth.
            self.peer_ip(stream)?
        };

        self.registry
            .unlock_id(session_id)
            .map_err(RequestHandlerError::RegistryError)?;
        self.registry
            .add_session(Session::new(
                session_id,
                username,
                &host,
                announcement.port,
                announcement.files,
            ))
            .map_err(RequestHandlerError::RegistryError)?;
        Ok(())
    }

    /// SEARCH: validates the session, optionally delays non-seeders,
    /// replies with one contact per holder of the filename.
    fn handle_search(
        &self,
        payload: &[u8],
        stream: &TrackedStream,
    ) -> Result<Reply, RequestHandlerError> {
        let request =
            SearchRequest::from_bytes(payload).map_err(RequestHandlerError::PayloadError)?;

        let requester = match self.validate_session(request.session_id, stream)? {
            Some(username) => username,
            None => return Ok(Reply::failure()),
        };

        self.apply_non_seeder_penalty(&requester)?;

        let contacts = self
            .registry
            .search(&request.filename)
            .map_err(RequestHandlerError::RegistryError)?;
        Ok(Reply::success(encode_contacts(&contacts)))
    }

    fn apply_non_seeder_penalty(&self, username: &str) -> Result<(), RequestHandlerError> {
        if self.config.peer_penalty_ms == 0 {
            return Ok(());
        }
        let downloads = self
            .store
            .get_user(username)
            .map_err(RequestHandlerError::StoreError)?
            .map(|(_, downloads)| downloads)
            .unwrap_or(0);
        if downloads == 0 {
            thread::sleep(Duration::from_millis(self.config.peer_penalty_ms));
        }
        Ok(())
    }

    /// ACKNOWLEDGE: counts the download for the provider and records the
    /// new holding for the acknowledging session.
    fn handle_acknowledge(
        &self,
        payload: &[u8],
        stream: &TrackedStream,
    ) -> Result<Reply, RequestHandlerError> {
        let request =
            AcknowledgeRequest::from_bytes(payload).map_err(RequestHandlerError::PayloadError)?;

        if self.validate_session(request.session_id, stream)?.is_none() {
            return Ok(Reply::failure());
        }

        let counted = self
            .store
            .add_download(&request.provider_username)
            .map_err(RequestHandlerError::StoreError)?;
        if !counted {
            return Ok(Reply::failure());
        }

        // The downloader now holds the file as well; size is
        // informational only and unknown here.
        self.registry
            .record_holding(
                request.session_id,
                FileDescription::new(&request.filename, 0),
            )
            .map_err(RequestHandlerError::RegistryError)?;
        Ok(Reply::success_empty())
    }

    /// LOGOUT: validates the session and destroys it.
    fn handle_logout(
        &self,
        payload: &[u8],
        stream: &TrackedStream,
    ) -> Result<Reply, RequestHandlerError> {
        let session_id =
            decode_session_id(payload).map_err(RequestHandlerError::PayloadError)?;

        let username = match self.validate_session(session_id, stream)? {
            Some(username) => username,
            None => return Ok(Reply::failure()),
        };

        self.registry
            .remove_session(session_id)
            .map_err(RequestHandlerError::RegistryError)?;
        info!("user {} logged out of session {}", username, session_id);
        Ok(Reply::success_empty())
    }

    /// A session is valid when it is live and, under the strict host
    /// policy, registered with the same address the request comes from.
    /// Returns the session's username on success.
    fn validate_session(
        &self,
        session_id: i32,
        stream: &TrackedStream,
    ) -> Result<Option<String>, RequestHandlerError> {
        let contact = match self
            .registry
            .contact_for(session_id)
            .map_err(RequestHandlerError::RegistryError)?
        {
            Some(contact) => contact,
            None => return Ok(None),
        };
        if !self.config.peer_remote_host && contact.host != self.peer_ip(stream)? {
            return Ok(None);
        }
        Ok(Some(contact.username))
    }

    fn peer_ip(&self, stream: &TrackedStream) -> Result<String, RequestHandlerError> {
        Ok(stream
            .peer_addr()
            .map_err(RequestHandlerError::GettingPeerAddrError)?
            .ip()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_is_stable_and_lowercase() {
        let first = hash_password("p");
        let second = hash_password("p");

        assert_eq!(first, second);
        assert_eq!(first, first.to_lowercase());
        assert_eq!(first.len(), 40);
    }

    #[test]
    fn test_hash_password_known_digest() {
        // SHA-1("abc"), a published test vector.
        assert_eq!(
            hash_password("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_empty_password_hashes_like_empty_string() {
        assert_eq!(
            hash_password(""),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn test_password_comparison_is_case_insensitive_on_the_hex() {
        let store_path = std::env::temp_dir().join("handler_hex_case_users.json");
        let _ = std::fs::remove_file(&store_path);
        let store = Arc::new(CredentialStore::open(&store_path));
        store.fix_schema();
        // A store written by another implementation may carry uppercase
        // digests; the login must still succeed.
        store
            .set_user("u1", &hash_password("p").to_uppercase())
            .unwrap();
        let handler = TrackerRequestHandler::new(
            Arc::new(AtomicSessionRegistry::default()),
            store,
            Cfg::default(),
        );

        assert!(handler
            .credentials_match(&Credentials::new("u1", "p"))
            .unwrap());
        assert!(!handler
            .credentials_match(&Credentials::new("u1", "wrong"))
            .unwrap());

        std::fs::remove_file(store_path).unwrap();
    }
}
