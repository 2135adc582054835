//! File read/write helpers shared by the file-backed cache backends

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Bounded retry budget for reads racing an external writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total read attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Read a whole file, retrying transient failures and blank content.
///
/// Returns `Ok(None)` when the file does not exist. Blank content that stays
/// blank for the whole budget is returned as-is; an I/O error that persists
/// is returned as the error.
pub fn read_with_retry(path: &Path, policy: &RetryPolicy) -> Result<Option<Vec<u8>>> {
    read_retrying(path, policy, true)
}

/// Read a whole file whose content may legitimately be empty.
///
/// Only I/O failures are retried; a blank file is returned on the first read.
pub fn read_content_with_retry(path: &Path, policy: &RetryPolicy) -> Result<Option<Vec<u8>>> {
    read_retrying(path, policy, false)
}

fn read_retrying(path: &Path, policy: &RetryPolicy, retry_blank: bool) -> Result<Option<Vec<u8>>> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = fs::read(path);
        let last = attempt >= attempts;

        match outcome {
            Ok(bytes) if !retry_blank || !bytes.is_empty() || last => return Ok(Some(bytes)),
            Ok(_) => debug!(path = %path.display(), attempt, "blank read, retrying"),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if last => return Err(e.into()),
            Err(e) => debug!(path = %path.display(), attempt, error = %e, "read failed, retrying"),
        }

        thread::sleep(policy.backoff);
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Replace a file's content atomically.
///
/// The bytes go to a uniquely named sibling temporary file which is synced
/// and then renamed over `path`; readers observe either the old or the new
/// content. The directory is synced after the rename so successive
/// replacements reach the disk in order.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut prefix = std::ffi::OsString::from(".");
    if let Some(name) = path.file_name() {
        prefix.push(name);
    }
    prefix.push(".");

    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    // a failed persist hands the temp file back and dropping it deletes it
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing() {
        let dir = TempDir::new().unwrap();
        let result = read_with_retry(&dir.path().join("nope"), &RetryPolicy::none()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("root.json");

        write_atomic(&path, b"{\"a\":1}").unwrap();
        let bytes = read_with_retry(&path, &RetryPolicy::default()).unwrap();

        assert_eq!(bytes.as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_blank_file_exhausts_budget() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blank");
        fs::write(&path, b"").unwrap();

        let policy = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        };
        assert_eq!(read_with_retry(&path, &policy).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_blank_content_returned_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        let policy = RetryPolicy {
            attempts: 50,
            backoff: Duration::from_millis(100),
        };
        let started = std::time::Instant::now();
        assert_eq!(read_content_with_retry(&path, &policy).unwrap(), Some(Vec::new()));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(read_content_with_retry(&dir.path().join("nope"), &policy)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_concurrent_writers_same_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.json");

        thread::scope(|scope| {
            for writer in 0..8u8 {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..50 {
                        write_atomic(path, &[writer; 64]).unwrap();
                    }
                });
            }
        });

        let content = fs::read(&path).unwrap();
        assert_eq!(content.len(), 64);
        assert!(content.iter().all(|b| *b == content[0]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_relative_path() {
        assert_eq!(parent_dir(Path::new("cache.json")), Path::new("."));
        assert_eq!(parent_dir(Path::new("a/cache.json")), Path::new("a"));
    }

    #[test]
    fn test_blank_file_filled_by_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("late");
        fs::write(&path, b"").unwrap();

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            write_atomic(&writer_path, b"ready").unwrap();
        });

        let policy = RetryPolicy {
            attempts: 200,
            backoff: Duration::from_millis(5),
        };
        let bytes = read_with_retry(&path, &policy).unwrap();
        writer.join().unwrap();

        assert_eq!(bytes.as_deref(), Some(&b"ready"[..]));
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v");

        write_atomic(&path, b"old content that is long").unwrap();
        write_atomic(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        fs::write(&path, b"x").unwrap();

        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
