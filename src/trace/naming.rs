//! File name sequencing and atomic saves.

use std::fs::File;
use std::path::{Path, PathBuf};

use regex::Regex;
use tempfile::NamedTempFile;

use crate::error::TraceError;

/// Next free `name_NNN.ext` for base `name.ext` in `dir`.
///
/// `NNN` is one more than the largest sequence number already present,
/// zero-padded to at least three digits. Creates `dir` if needed.
pub fn next_sequenced_path(dir: &Path, base: &str) -> Result<PathBuf, TraceError> {
    std::fs::create_dir_all(dir)?;
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (base, String::new()),
    };
    let pattern = format!(
        "^{}_(\\d+){}$",
        regex::escape(stem),
        regex::escape(&ext)
    );
    let re = Regex::new(&pattern).map_err(|e| TraceError::Format(e.to_string()))?;

    let mut max = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(n) = re
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            max = max.max(n);
        }
    }
    Ok(dir.join(format!("{stem}_{:03}{ext}", max + 1)))
}

/// Write `path` through a temporary file in the same directory: the closure
/// fills the file, which is then synced and renamed over `path`.
pub fn atomic_write<F>(path: &Path, fill: F) -> Result<(), TraceError>
where
    F: FnOnce(&mut File) -> Result<(), TraceError>,
{
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;
    let mut temp = NamedTempFile::new_in(&dir)?;
    fill(temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| TraceError::Io(e.error))?;
    Ok(())
}

/// Like [`atomic_write`], for writers that need a path instead of a handle.
pub fn atomic_write_path<F>(path: &Path, fill: F) -> Result<(), TraceError>
where
    F: FnOnce(&Path) -> Result<(), TraceError>,
{
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)?;
    let temp = NamedTempFile::new_in(&dir)?;
    fill(temp.path())?;
    File::open(temp.path())?.sync_all()?;
    temp.persist(path).map_err(|e| TraceError::Io(e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sequence_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = next_sequenced_path(dir.path(), "rabi.txt").unwrap();
        assert_eq!(path, dir.path().join("rabi_001.txt"));
    }

    #[test]
    fn sequence_follows_largest_existing() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["rabi_001.txt", "rabi_007.txt", "rabi_1200.txt", "rabi_x.txt", "other_050.txt", "rabi_009.zip"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let path = next_sequenced_path(dir.path(), "rabi.txt").unwrap();
        assert_eq!(path, dir.path().join("rabi_1201.txt"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "old").unwrap();
        atomic_write(&path, |f| {
            f.write_all(b"new")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn failed_fill_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "old").unwrap();
        let result = atomic_write(&path, |_| Err(TraceError::Format("boom".into())));
        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
