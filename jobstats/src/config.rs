// Run-time configuration.  The binary fills this in from switches and the environment; the library
// only consumes it.

use crate::context::JobContext;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding snapshots and lock files.  Created on demand.
    pub cache_dir: PathBuf,

    /// Mount point of the cgroup v1 hierarchies (cpuacct, cpuset, memory).
    pub cgroup_root: PathBuf,

    /// How long `stop` waits for the report lock.
    pub lock_timeout: Duration,

    /// Leave the snapshot in place after a successful `stop`.
    pub keep_snapshot: bool,
}

impl Config {
    /// A configuration with default values for everything but the cache directory.

    pub fn new(cache_dir: &Path) -> Config {
        Config {
            cache_dir: cache_dir.to_path_buf(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            keep_snapshot: false,
        }
    }

    pub fn snapshot_path(&self, ctx: &JobContext) -> PathBuf {
        self.cache_dir
            .join(format!("sprofile.{}.{}.json", ctx.job_id, ctx.hostname))
    }

    // The lock is per job, not per host: the cache directory is usually a shared home directory and
    // the point of the lock is to keep reports from different nodes apart.
    pub fn lock_path(&self, ctx: &JobContext) -> PathBuf {
        self.cache_dir.join(format!("sprofile.{}.lock", ctx.job_id))
    }
}

#[test]
fn test_paths() {
    let ctx = crate::context::test_context(60);
    let config = Config::new(Path::new("/home/alice/.cache"));
    assert!(config.snapshot_path(&ctx) == Path::new("/home/alice/.cache/sprofile.4711.c7-3.json"));
    assert!(config.lock_path(&ctx) == Path::new("/home/alice/.cache/sprofile.4711.lock"));
    assert!(config.cgroup_root == Path::new("/sys/fs/cgroup"));
    assert!(!config.keep_snapshot);
}
