use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path};

use wire::payload::FileDescription;

/// True for a bare filename: one normal path component, nothing that
/// could climb out of the shared directory.
fn is_plain_filename(filename: &str) -> bool {
    if filename.is_empty() {
        return false;
    }
    let mut components = Path::new(filename).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn reject_traversal(filename: &str) -> io::Result<()> {
    if !is_plain_filename(filename) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("filename escapes the shared directory: {}", filename),
        ));
    }
    Ok(())
}

/// Lists the shared directory as the set of file descriptions a login
/// announces. Only top-level regular files are shared.
pub fn scan_directory(dir: &Path) -> io::Result<HashSet<FileDescription>> {
    let mut files = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        if let Some(filename) = entry.file_name().to_str() {
            files.insert(FileDescription::new(filename, metadata.len() as i64));
        }
    }
    Ok(files)
}

/// Reads a whole shared file into memory for a SIMPLE_DOWNLOAD reply.
pub fn read_shared_file(dir: &Path, filename: &str) -> io::Result<Vec<u8>> {
    reject_traversal(filename)?;
    fs::read(dir.join(filename))
}

/// Writes downloaded bytes under the shared directory. Refuses to
/// overwrite: the path must not exist yet.
pub fn save_downloaded_file(dir: &Path, filename: &str, bytes: &[u8]) -> io::Result<()> {
    reject_traversal(filename)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dir.join(filename))?;
    file.write_all(bytes)?;
    file.flush()
}

/// Whether the peer already holds this filename in its shared dir.
pub fn holds_file(dir: &Path, filename: &str) -> bool {
    is_plain_filename(filename) && dir.join(filename).is_file()
}
