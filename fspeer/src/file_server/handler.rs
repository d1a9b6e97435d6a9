use std::path::PathBuf;

use tracing::{info, warn};

use server::server_manager::Handler;
use server::tracked_stream::TrackedStream;
use wire::message::{Message, Reply, Request, RequestKind};
use wire::payload::decode_filename;

use crate::shared_dir::manager::read_shared_file;

/// The serving side of a peer: answers SIMPLE_DOWNLOAD with the whole
/// file, FAILURE for anything it does not hold or that tries to escape
/// the shared directory. No ranges, no checksums.
pub struct FileServerHandler {
    shared_dir: PathBuf,
}

impl FileServerHandler {
    pub fn new(shared_dir: PathBuf) -> Self {
        Self { shared_dir }
    }

    fn handle_download(&self, payload: &[u8]) -> Reply {
        let filename = match decode_filename(payload) {
            Ok(filename) => filename,
            Err(err) => {
                warn!("malformed download request: {:?}", err);
                return Reply::failure();
            }
        };
        match read_shared_file(&self.shared_dir, &filename) {
            Ok(bytes) => {
                info!("serving {} ({} bytes)", filename, bytes.len());
                Reply::success(bytes)
            }
            Err(err) => {
                warn!("cannot serve {}: {}", filename, err);
                Reply::failure()
            }
        }
    }
}

impl Handler for FileServerHandler {
    fn handle(&self, request: Request, stream: &mut TrackedStream) {
        let reply = match request.kind {
            RequestKind::SimpleDownload => self.handle_download(&request.payload),
            // A peer serves files and answers probes, nothing else.
            _ => Reply::failure(),
        };
        if let Err(err) = Message::Reply(reply).write_to(stream) {
            warn!("could not write a download reply: {:?}", err);
        }
    }
}
