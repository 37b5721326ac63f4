// The snapshot: counters captured at job start, stored as JSON in the cache directory, one file per
// job and host.  The file is written once by `start` and read once by `stop`.

use crate::config::Config;
use crate::context::JobContext;
use crate::error::{Error, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Cumulative ns per logical core at start, index = core id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_baseline: Option<Vec<u64>>,

    /// Cumulative mJ per GPU at start, index = device index.  Absent on nodes without GPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_energy_baseline: Option<Vec<u64>>,
}

pub struct SnapshotStore {
    path: PathBuf,
    job_id: String,
    hostname: String,
}

impl SnapshotStore {
    pub fn new(config: &Config, ctx: &JobContext) -> SnapshotStore {
        SnapshotStore {
            path: config.snapshot_path(ctx),
            job_id: ctx.job_id.clone(),
            hostname: ctx.hostname.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the snapshot, creating the cache directory if necessary.  The file is written under a
    /// temporary name and renamed, so a reader never sees a partial snapshot.

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        let text = serde_json::to_string(snapshot).map_err(|e| Error::parse("snapshot", e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))?;
        info!("Saved snapshot {}", self.path.display());
        Ok(())
    }

    /// Read the snapshot back.  A missing file means `start` never ran (or its snapshot was already
    /// consumed) and is reported as such, not as an I/O error.

    pub fn load(&self) -> Result<Snapshot> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::MissingBaseline {
                    job_id: self.job_id.clone(),
                    hostname: self.hostname.clone(),
                })
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        serde_json::from_str(&text)
            .map_err(|e| Error::parse(format!("snapshot {}", self.path.display()), e))
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path).map_err(|e| Error::io(&self.path, e))?;
        info!("Removed snapshot {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
fn test_store(dir: &Path) -> SnapshotStore {
    let ctx = crate::context::test_context(60);
    SnapshotStore::new(&Config::new(&dir.join("cache")), &ctx)
}

#[test]
fn test_save_load_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = test_store(dir.path());
    let snapshot = Snapshot {
        cpu_usage_baseline: Some(vec![1, 2, 3]),
        gpu_energy_baseline: None,
    };
    // The cache directory does not exist yet
    store.save(&snapshot).unwrap();
    assert!(store.path().ends_with("cache/sprofile.4711.c7-3.json"));
    assert!(store.load().unwrap() == snapshot);

    // No GPU field is written when there are no GPUs
    let text = fs::read_to_string(store.path()).unwrap();
    assert!(!text.contains("gpu_energy_baseline"));

    store.remove().unwrap();
    assert!(matches!(store.load(), Err(Error::MissingBaseline { .. })));
}

#[test]
fn test_missing_and_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = test_store(dir.path());
    match store.load() {
        Err(Error::MissingBaseline { job_id, hostname }) => {
            assert!(job_id == "4711");
            assert!(hostname == "c7-3");
        }
        _ => panic!("expected MissingBaseline"),
    }

    fs::create_dir_all(store.path().parent().unwrap()).unwrap();
    fs::write(store.path(), "{\"cpu_usage_baseline\": [1, ").unwrap();
    assert!(matches!(store.load(), Err(Error::Parse { .. })));
}
