pub mod cleaner;
pub mod server_error;
pub mod server_manager;
pub mod tracked_stream;
pub mod worker;
