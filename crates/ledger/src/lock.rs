use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::LedgerError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Advisory lock guarding every mutating ledger operation.
///
/// The lock is a sibling file `.{csv_name}.lock` in the ledger's directory
/// (so `.evolution.csv.lock` for the default name) containing the holder's
/// PID.  Acquisition busy-waits with 10 ms polling; expiry is fatal to the
/// caller.  Dropping the guard releases the OS lock and unlinks the file.
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

/// Lock-file path for a given ledger path.
pub fn lock_path(csv_path: &Path) -> PathBuf {
    let name = csv_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "evolution.csv".to_string());
    let dir = csv_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{name}.lock"))
}

impl LedgerLock {
    pub fn acquire(csv_path: &Path, timeout: Duration) -> Result<Self, LedgerError> {
        let path = lock_path(csv_path);
        let deadline = Instant::now() + timeout;

        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut file = file;
                    file.set_len(0)?;
                    let _ = write!(file, "{}", std::process::id());
                    let _ = file.flush();
                    return Ok(Self { file, path });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(_) => {
                    return Err(LedgerError::LockTimeout {
                        path: path.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_hidden_sibling() {
        let p = lock_path(Path::new("/tmp/evo/evolution.csv"));
        assert_eq!(p, PathBuf::from("/tmp/evo/.evolution.csv.lock"));
    }

    #[test]
    fn acquire_writes_pid_and_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("evolution.csv");

        let lock = LedgerLock::acquire(&csv, Duration::from_secs(1)).unwrap();
        let on_disk = fs::read_to_string(lock_path(&csv)).unwrap();
        assert_eq!(on_disk, std::process::id().to_string());

        drop(lock);
        assert!(!lock_path(&csv).exists());
    }

    #[test]
    fn second_acquire_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("evolution.csv");

        let first = LedgerLock::acquire(&csv, Duration::from_secs(1)).unwrap();
        drop(first);
        let second = LedgerLock::acquire(&csv, Duration::from_secs(1));
        assert!(second.is_ok());
    }
}
