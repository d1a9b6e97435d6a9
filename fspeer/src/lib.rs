pub mod config;
pub mod download;
pub mod file_server;
pub mod fs_peer;
pub mod shared_dir;
pub mod tracker_client;
