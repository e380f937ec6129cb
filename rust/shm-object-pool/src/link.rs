//! The rendezvous link file: a tiny regular file whose sole content is the
//! current segment's shared-memory name, letting unrelated processes find
//! each other.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::PoolError;

/// Atomically publish `segment_name` at `link_path` (write to a sibling temp
/// file, then rename over the destination).
pub fn write(link_path: &Path, segment_name: &str) -> Result<(), PoolError> {
    let tmp_path = tmp_sibling(link_path);
    fs::write(&tmp_path, segment_name.as_bytes())?;
    fs::rename(&tmp_path, link_path)?;
    Ok(())
}

/// Read the segment name published at `link_path`.
///
/// Missing or empty files are treated as "pool not running" (`NotFound`).
pub fn read(link_path: &Path) -> Result<String, PoolError> {
    let contents = match fs::read_to_string(link_path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PoolError::NotFound),
        Err(e) => return Err(PoolError::Io(e)),
    };
    let name = contents.trim();
    if name.is_empty() {
        return Err(PoolError::NotFound);
    }
    Ok(name.to_string())
}

/// Remove the link file. Idempotent: a missing file is success.
pub fn remove(link_path: &Path) -> Result<(), PoolError> {
    match fs::remove_file(link_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PoolError::Io(e)),
    }
}

/// Whether `link_path` currently names a segment that is actually alive.
pub fn resolves_to_live_segment(link_path: &Path) -> bool {
    match read(link_path) {
        Ok(name) => crate::segment::Segment::exists(&name),
        Err(_) => false,
    }
}

fn tmp_sibling(link_path: &Path) -> std::path::PathBuf {
    let mut tmp = link_path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", std::process::id()));
    std::path::PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("shm-object-pool-link-test-{}.link", std::process::id()));
        let _ = fs::remove_file(&path);

        write(&path, "/my-segment-name").unwrap();
        assert_eq!(read(&path).unwrap(), "/my-segment-name");

        remove(&path).unwrap();
        assert!(matches!(read(&path), Err(PoolError::NotFound)));
        // idempotent
        remove(&path).unwrap();
    }

    #[test]
    fn missing_link_is_not_found() {
        let path = std::env::temp_dir().join("shm-object-pool-link-missing-xyz.link");
        let _ = fs::remove_file(&path);
        assert!(matches!(read(&path), Err(PoolError::NotFound)));
    }
}
