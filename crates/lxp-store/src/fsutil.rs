use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use crate::config::SyncMode;

/// Write `data` to `path` so that readers see either the old file or the
/// complete new one, never a torn write.
///
/// The bytes go to a temp file in the same directory which is then renamed
/// over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8], sync: SyncMode) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    if sync == SyncMode::EveryWrite {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    if sync == SyncMode::EveryWrite {
        sync_dir(dir)?;
    }
    Ok(())
}

/// `fsync` a directory so renames and unlinks inside it are durable.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        write_atomic(&path, b"one", SyncMode::OsDefault).unwrap();
        write_atomic(&path, b"two", SyncMode::EveryWrite).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_if_exists(&dir.path().join("nothing")).unwrap());
    }
}
