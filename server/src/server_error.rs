use std::io;

/// Possible server manager errors.
#[derive(Debug)]
pub enum ServerError {
    BindError(io::Error),
    LocalAddrError(io::Error),
    SpawnError(io::Error),
    PoisonedGroupLock,
}
