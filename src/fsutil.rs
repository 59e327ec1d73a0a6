// src/fsutil.rs

//! Crash-safe filesystem primitives
//!
//! Every durable write in the daemon goes through one of these helpers. The
//! pattern is always write-new-then-replace: content lands in a temporary
//! file in the destination directory, is fsynced, and is then renamed over
//! the destination. A crash leaves either the old or the new file, never a
//! partial one.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// fsync a directory so a rename inside it is durable
fn sync_dir(dir: &Path) {
    // Not all filesystems support fsync on directories
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

/// Atomically replace `path` with `content`
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::IoError(format!("No parent directory for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    sync_dir(parent);
    Ok(())
}

/// Atomically copy `src` to `dst`
///
/// The copy is staged next to `dst`, so the final rename never crosses a
/// filesystem boundary.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| Error::IoError(format!("No parent directory for {}", dst.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = NamedTempFile::new_in(parent)?;
    fs::copy(src, tmp.path())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| Error::Io(e.error))?;
    sync_dir(parent);
    Ok(())
}

/// Atomically point the symlink `link` at `target`
///
/// A new symlink is created under a temporary name and renamed over `link`.
/// rename(2) replaces the old link in one step, so readers resolving `link`
/// see either the old or the new target.
#[cfg(unix)]
pub fn swap_symlink(link: &Path, target: &Path) -> Result<()> {
    let parent = link
        .parent()
        .ok_or_else(|| Error::IoError(format!("No parent directory for {}", link.display())))?;
    fs::create_dir_all(parent)?;

    let file_name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_link = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    std::os::unix::fs::symlink(target, &tmp_link)?;
    if let Err(e) = fs::rename(&tmp_link, link) {
        let _ = fs::remove_file(&tmp_link);
        return Err(e.into());
    }
    sync_dir(parent);
    Ok(())
}

/// Recursively copy a directory tree
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link_target = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link_target, &target)?;
            }
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Sorted names of the direct entries of a directory
pub fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sub/record");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temporary files left behind
        assert_eq!(list_dir_names(&temp_dir.path().join("sub")).unwrap(), vec!["record"]);
    }

    #[test]
    fn test_swap_symlink() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();
        fs::write(b.join("marker"), "b").unwrap();
        let link = temp_dir.path().join("current");

        swap_symlink(&link, &a).unwrap();
        assert!(list_dir_names(&link).unwrap().is_empty());

        swap_symlink(&link, &b).unwrap();
        assert_eq!(list_dir_names(&link).unwrap(), vec!["marker"]);
    }

    #[test]
    fn test_copy_dir_all() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "#!/bin/sh\n").unwrap();
        fs::write(src.join("README"), "hi").unwrap();

        let dst = temp_dir.path().join("dst");
        copy_dir_all(&src, &dst).unwrap();

        assert_eq!(list_dir_names(&dst).unwrap(), vec!["README", "bin"]);
        assert_eq!(fs::read_to_string(dst.join("bin/tool")).unwrap(), "#!/bin/sh\n");
    }
}
