use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use tracing::{trace, warn};

/// Exclusive advisory lease on a named lock file.
///
/// Acquisition blocks until every other holder in any process has released the
/// same name. The file exists only while the lease is held: dropping the lease
/// removes it and then releases the lock.
#[derive(Debug)]
pub struct Lease {
    file: File,
    path: PathBuf,
}

impl Lease {
    /// Block until the lease at `path` is granted.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock file cannot be created, opened or locked.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .with_context(|| format!("failed to open lock {}", path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("failed to lock {}", path.display()))?;
            // a previous holder may have unlinked the file while we waited
            if still_linked(&file, path)? {
                trace!(path = %path.display(), "lease acquired");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }
            trace!(path = %path.display(), "lock file replaced while waiting; retrying");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove lock file");
            }
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), %err, "failed to release lock");
        }
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file
        .metadata()
        .with_context(|| format!("failed to stat lock {}", path.display()))?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to stat lock {}", path.display())),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn lock_file_lives_only_while_held() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("locks").join("chain.lock");
        {
            let lease = Lease::acquire(&path)?;
            assert_eq!(lease.path(), path.as_path());
            assert!(path.exists());
        }
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn holders_of_one_name_are_serialized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Arc::new(dir.path().join("same.lock"));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                let start = Arc::clone(&start);
                thread::spawn(move || -> Result<()> {
                    start.wait();
                    for _ in 0..5 {
                        let _lease = Lease::acquire(&path)?;
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("lease thread panicked")?;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn different_names_do_not_block() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _first = Lease::acquire(&dir.path().join("a.lock"))?;
        let _second = Lease::acquire(&dir.path().join("b.lock"))?;
        Ok(())
    }
}
