//! Crash-safe single-file primitives
//!
//! `write_safely` replaces a file through a staged sibling and a ready marker,
//! `delete_all_safely` brackets a recursive delete with a marker. After a crash
//! the markers tell [`integrity_check`] whether to finish or undo the step:
//!
//! ```text
//! <p>.$   staged replacement content
//! <p>.R   staged content is complete, replace is in progress
//! <p>.RM  recursive delete of <p> is in progress
//! ```

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tessera_common::{Result, SyncMode};
use tracing::{debug, info};

const STAGED_SUFFIX: &str = ".$";
const READY_SUFFIX: &str = ".R";
const REMOVING_SUFFIX: &str = ".RM";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write a whole file, optionally fsyncing it
pub fn write_file(path: &Path, data: &[u8], sync: SyncMode) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    if sync.should_sync() {
        file.sync_all()?;
    }
    Ok(())
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(path: &Path, sync: SyncMode) -> io::Result<()> {
    // Directories cannot be opened as files on Windows
    if cfg!(unix) && sync.should_sync() {
        File::open(path)?.sync_all()?;
    }
    Ok(())
}

/// Remove a file or directory tree; absent paths are not an error
pub fn remove_all(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove a single file, ignoring absence
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Atomically replace `path` with `data`
pub fn write_safely(path: &Path, data: &[u8], sync: SyncMode) -> Result<()> {
    let staged = with_suffix(path, STAGED_SUFFIX);
    let ready = with_suffix(path, READY_SUFFIX);

    write_file(&staged, data, sync)?;
    write_file(&ready, &[], sync)?;

    remove_file_if_exists(path)?;
    fs::rename(&staged, path)?;
    fs::remove_file(&ready)?;

    if let Some(parent) = path.parent() {
        sync_dir(parent, sync)?;
    }
    Ok(())
}

/// Recursively delete `path` behind a removal marker
pub fn delete_all_safely(path: &Path, sync: SyncMode) -> Result<()> {
    let marker = with_suffix(path, REMOVING_SUFFIX);

    write_file(&marker, &[], sync)?;
    remove_all(path)?;
    fs::remove_file(&marker)?;

    if let Some(parent) = path.parent() {
        sync_dir(parent, sync)?;
    }
    Ok(())
}

/// Walk `root` and resolve every interrupted safe write or safe delete
///
/// Returns the number of leftovers that were repaired.
pub fn integrity_check(root: &Path) -> Result<usize> {
    let repaired = check_dir(root)?;
    if repaired > 0 {
        info!("Integrity check repaired {} leftover(s) under {:?}", repaired, root);
    }
    Ok(repaired)
}

fn list_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Ok(name) = entry?.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

fn check_dir(dir: &Path) -> Result<usize> {
    let mut repaired = 0;
    let names = list_names(dir)?;

    // Interrupted deletes first, they may cover other leftovers
    for name in names.iter().filter(|n| n.ends_with(REMOVING_SUFFIX)) {
        let marker = dir.join(name);
        let target = dir.join(&name[..name.len() - REMOVING_SUFFIX.len()]);
        debug!("Finishing interrupted delete of {:?}", target);
        remove_all(&target)?;
        remove_file_if_exists(&marker)?;
        repaired += 1;
    }

    for name in names.iter().filter(|n| n.ends_with(STAGED_SUFFIX)) {
        let staged = dir.join(name);
        if !staged.exists() {
            continue;
        }
        let target = dir.join(&name[..name.len() - STAGED_SUFFIX.len()]);
        let ready = with_suffix(&target, READY_SUFFIX);
        if ready.exists() {
            debug!("Finishing interrupted replace of {:?}", target);
            remove_all(&target)?;
            fs::rename(&staged, &target)?;
            fs::remove_file(&ready)?;
        } else {
            debug!("Discarding incomplete replacement {:?}", staged);
            remove_all(&staged)?;
        }
        repaired += 1;
    }

    // A lone ready marker means the rename already happened
    for name in names.iter().filter(|n| n.ends_with(READY_SUFFIX)) {
        let ready = dir.join(name);
        if ready.exists() {
            remove_file_if_exists(&ready)?;
            repaired += 1;
        }
    }

    for name in list_names(dir)? {
        let path = dir.join(&name);
        if fs::symlink_metadata(&path)?.is_dir() {
            repaired += check_dir(&path)?;
        }
    }

    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_safely_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials");

        write_safely(&path, b"one", SyncMode::Always).unwrap();
        write_safely(&path, b"two", SyncMode::Always).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!with_suffix(&path, STAGED_SUFFIX).exists());
        assert!(!with_suffix(&path, READY_SUFFIX).exists());
    }

    #[test]
    fn test_delete_all_safely() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("tables");
        fs::create_dir_all(tree.join("a/b")).unwrap();
        fs::write(tree.join("a/b/c"), b"x").unwrap();

        delete_all_safely(&tree, SyncMode::Never).unwrap();
        assert!(!tree.exists());
        assert!(!with_suffix(&tree, REMOVING_SUFFIX).exists());

        // Deleting again is fine
        delete_all_safely(&tree, SyncMode::Never).unwrap();
    }

    #[test]
    fn test_integrity_finishes_ready_replace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("creds");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"old").unwrap();
        fs::write(with_suffix(&path, STAGED_SUFFIX), b"new").unwrap();
        fs::write(with_suffix(&path, READY_SUFFIX), b"").unwrap();

        assert_eq!(integrity_check(dir.path()).unwrap(), 1);
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!with_suffix(&path, READY_SUFFIX).exists());
    }

    #[test]
    fn test_integrity_discards_unready_replace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds");
        fs::write(&path, b"old").unwrap();
        fs::write(with_suffix(&path, STAGED_SUFFIX), b"partial").unwrap();

        assert_eq!(integrity_check(dir.path()).unwrap(), 1);
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert!(!with_suffix(&path, STAGED_SUFFIX).exists());
    }

    #[test]
    fn test_integrity_removes_lone_ready_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("creds");
        fs::write(&path, b"new").unwrap();
        fs::write(with_suffix(&path, READY_SUFFIX), b"").unwrap();

        assert_eq!(integrity_check(dir.path()).unwrap(), 1);
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_integrity_finishes_delete() {
        let dir = tempdir().unwrap();
        let tree = dir.path().join("p");
        fs::create_dir_all(tree.join("x")).unwrap();
        fs::write(tree.join("x/y"), b"1").unwrap();
        fs::write(with_suffix(&tree, REMOVING_SUFFIX), b"").unwrap();

        assert_eq!(integrity_check(dir.path()).unwrap(), 1);
        assert!(!tree.exists());
    }

    #[test]
    fn test_integrity_clean_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/file"), b"data").unwrap();
        assert_eq!(integrity_check(dir.path()).unwrap(), 0);
    }
}
