//! Filesystem helpers shared by the catalog and the dataset writer.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_RETRY: Duration = Duration::from_millis(20);

/// Escape a value for use as one path component. Bytes outside
/// `[A-Za-z0-9._-]` become `%XX`, which keeps the mapping injective.
pub fn escape_component(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{byte:02X}")),
        }
    }
    escaped
}

/// Advisory lock held by creating a file with `create_new`. Any process
/// that uses the same path is excluded until the holder drops it.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Take the lock if it is free. `Ok(None)` means someone else holds it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<LockFile>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };
        let lock = LockFile {
            path: path.to_path_buf(),
        };
        writeln!(
            file,
            "pid={} since={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        file.sync_all()?;
        Ok(Some(lock))
    }

    /// Retry until the lock is taken or `wait` has elapsed.
    pub fn acquire(path: &Path, wait: Duration) -> io::Result<Option<LockFile>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }

    /// Contents of the lock file at `path`, naming its holder.
    pub fn holder(path: &Path) -> Option<String> {
        fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = env::temp_dir().join(format!("quotelake_fsutil_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn lock_excludes_until_dropped() {
        let dir = temp_dir();
        let path = dir.join("locks").join("t.lock");

        let held = LockFile::try_acquire(&path).unwrap().unwrap();
        assert!(LockFile::try_acquire(&path).unwrap().is_none());
        assert!(LockFile::holder(&path).unwrap().starts_with("pid="));
        assert!(LockFile::acquire(&path, Duration::from_millis(50))
            .unwrap()
            .is_none());

        drop(held);
        assert!(!path.exists());
        assert!(LockFile::try_acquire(&path).unwrap().is_some());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn escaping_is_injective_on_separators() {
        assert_eq!(escape_component("GS-PI"), "GS-PI");
        assert_eq!(escape_component("a/b"), "a%2Fb");
        assert_eq!(escape_component("a%2Fb"), "a%252Fb");
        assert_ne!(escape_component("a/b"), escape_component("a_b"));
    }
}
