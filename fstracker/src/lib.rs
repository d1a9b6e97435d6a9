pub mod config;
pub mod credential_store;
pub mod fs_tracker;
pub mod request_handler;
pub mod session_registry;
