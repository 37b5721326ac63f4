// Cross-process lock around report printing.  The lock is a marker file created with O_EXCL; the
// holder removes it when the `ReportLock` is dropped.  Waiters poll every 100ms until the timeout
// runs out, and a timeout is an error, never an indefinite wait.
//
// A lock file left behind by a killed process will make every later waiter time out.  The file
// holds the pid of its creator to make such cases easy to diagnose.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ReportLock {
    path: PathBuf,
}

impl ReportLock {
    /// Take the lock at `path`, waiting at most `timeout`.  One attempt is always made, even with a
    /// zero timeout.

    pub fn acquire(path: &Path, timeout: Duration) -> Result<ReportLock> {
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // The pid is informational, the lock is held whether or not it gets written.
                    let _ = writeln!(file, "{}", process::id());
                    debug!("Acquired {}", path.display());
                    return Ok(ReportLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(Error::io(path, e)),
            }
        }
    }
}

impl Drop for ReportLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove lock {}: {e}", self.path.display());
        }
    }
}

#[test]
fn test_acquire_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sprofile.4711.lock");
    {
        let _lock = ReportLock::acquire(&path, Duration::ZERO).unwrap();
        assert!(path.exists());
        let pid = fs::read_to_string(&path).unwrap();
        assert!(pid.trim() == process::id().to_string());
    }
    assert!(!path.exists());
    let _again = ReportLock::acquire(&path, Duration::ZERO).unwrap();
}

#[test]
fn test_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sprofile.4711.lock");
    let _held = ReportLock::acquire(&path, Duration::ZERO).unwrap();
    let t0 = Instant::now();
    let r = ReportLock::acquire(&path, Duration::from_millis(250));
    assert!(matches!(r, Err(Error::Timeout { .. })));
    assert!(t0.elapsed() >= Duration::from_millis(250));
    // The loser must not have removed the winner's lock
    assert!(path.exists());
}

#[test]
fn test_no_such_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonexistent/sprofile.4711.lock");
    assert!(matches!(
        ReportLock::acquire(&path, Duration::from_secs(5)),
        Err(Error::Io { .. })
    ));
}

#[test]
fn test_reports_do_not_interleave() {
    use std::sync::{Arc, Mutex};

    let dir = tempfile::tempdir().unwrap();
    let path = Arc::new(dir.path().join("sprofile.4711.lock"));
    let output = Arc::new(Mutex::new(Vec::<String>::new()));
    let workers = (0..2)
        .map(|w| {
            let path = Arc::clone(&path);
            let output = Arc::clone(&output);
            thread::spawn(move || {
                let _lock = ReportLock::acquire(&path, Duration::from_secs(10)).unwrap();
                for line in 0..5 {
                    output.lock().unwrap().push(format!("{w}:{line}"));
                    thread::sleep(Duration::from_millis(20));
                }
            })
        })
        .collect::<Vec<_>>();
    for w in workers {
        w.join().unwrap();
    }
    let lines = output.lock().unwrap();
    assert!(lines.len() == 10);
    // Each worker's five lines are contiguous
    let first = &lines[0][..1];
    assert!(lines[..5].iter().all(|l| l.starts_with(first)));
    assert!(lines[5..].iter().all(|l| !l.starts_with(first)));
}
