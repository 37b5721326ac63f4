// CPU and memory counters from the cgroup v1 hierarchy that Slurm sets up.
//
// File                                                       Content
// ---------------------------------------------------------  -----------------------------------------
// cpuacct/cpuacct.usage_percpu                               Cumulative ns per logical core, node wide
// cpuset/slurm/uid_<uid>/job_<job>/cpuset.cpus               Cores of the job, eg "0-3,8,10-11"
// memory/slurm/uid_<uid>/job_<job>/memory.max_usage_in_bytes High-water mark of the job
// memory/slurm/uid_<uid>/job_<job>/memory.limit_in_bytes     Limit of the job
//
// All paths are relative to the cgroup root, normally /sys/fs/cgroup.  The per-core usage is read
// from the root cgroup, so it includes other jobs on the node; restricting the sum to the job's
// cpuset is what makes the number per-job.

use crate::context::JobContext;
use crate::error::{Error, Result};
use log::debug;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Core numbers at or above this are rejected when parsing a cpuset, well above any real node.
pub const MAX_CORES: usize = 1 << 16;

pub struct CgroupCounters {
    root: PathBuf,
    job_dir: PathBuf,
}

impl CgroupCounters {
    pub fn new(root: &Path, ctx: &JobContext) -> CgroupCounters {
        CgroupCounters {
            root: root.to_path_buf(),
            job_dir: PathBuf::from(format!("slurm/uid_{}/job_{}", ctx.uid, ctx.job_id)),
        }
    }

    /// Cumulative CPU time in nanoseconds for every logical core on the node, index = core id.

    pub fn read_per_core_cpu_usage(&self) -> Result<Vec<u64>> {
        let path = self.root.join("cpuacct/cpuacct.usage_percpu");
        let usage = parse_per_core_usage(&read_counter_file(&path)?)?;
        debug!("{} cores in {}", usage.len(), path.display());
        Ok(usage)
    }

    /// The set of cores assigned to the job.

    pub fn read_cpu_set(&self) -> Result<BTreeSet<usize>> {
        parse_cpu_set(&read_counter_file(&self.job_file("cpuset", "cpuset.cpus"))?)
    }

    pub fn read_memory_peak(&self) -> Result<u64> {
        read_u64(&self.job_file("memory", "memory.max_usage_in_bytes"))
    }

    pub fn read_memory_limit(&self) -> Result<u64> {
        read_u64(&self.job_file("memory", "memory.limit_in_bytes"))
    }

    fn job_file(&self, controller: &str, name: &str) -> PathBuf {
        self.root.join(controller).join(&self.job_dir).join(name)
    }
}

fn read_counter_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

fn read_u64(path: &Path) -> Result<u64> {
    let text = read_counter_file(path)?;
    let value = u64::from_str(text.trim())
        .map_err(|_| Error::parse(path.display().to_string(), format!("`{}` is not an integer", text.trim())))?;
    debug!("{} = {value}", path.display());
    Ok(value)
}

pub(crate) fn parse_per_core_usage(s: &str) -> Result<Vec<u64>> {
    s.split_whitespace()
        .map(|x| {
            u64::from_str(x)
                .map_err(|_| Error::parse("cpuacct.usage_percpu", format!("`{x}` is not an integer")))
        })
        .collect()
}

// Grammar: empty | item ("," item)* where item ::= n | n "-" m, with n <= m < MAX_CORES.

pub(crate) fn parse_cpu_set(s: &str) -> Result<BTreeSet<usize>> {
    let s = s.trim();
    let mut cpus = BTreeSet::new();
    if s.is_empty() {
        return Ok(cpus);
    }
    let num = |x: &str| match usize::from_str(x) {
        Ok(n) if n < MAX_CORES => Ok(n),
        _ => Err(Error::parse("cpuset.cpus", format!("`{x}` in `{s}` is not a core number"))),
    };
    for item in s.split(',') {
        if let Some((lo, hi)) = item.split_once('-') {
            let (lo, hi) = (num(lo)?, num(hi)?);
            if lo > hi {
                return Err(Error::parse("cpuset.cpus", format!("bad range `{item}`")));
            }
            cpus.extend(lo..=hi);
        } else {
            cpus.insert(num(item)?);
        }
    }
    Ok(cpus)
}

// Lay out a cgroup tree the way Slurm does, for tests.  Returns the root.

#[cfg(test)]
pub(crate) fn fake_cgroup_tree(
    dir: &Path,
    ctx: &JobContext,
    usage_percpu: &str,
    cpus: &str,
    max_usage: &str,
    limit: &str,
) -> PathBuf {
    let job = format!("slurm/uid_{}/job_{}", ctx.uid, ctx.job_id);
    fs::create_dir_all(dir.join("cpuacct")).unwrap();
    fs::create_dir_all(dir.join("cpuset").join(&job)).unwrap();
    fs::create_dir_all(dir.join("memory").join(&job)).unwrap();
    fs::write(dir.join("cpuacct/cpuacct.usage_percpu"), usage_percpu).unwrap();
    fs::write(dir.join("cpuset").join(&job).join("cpuset.cpus"), cpus).unwrap();
    fs::write(dir.join("memory").join(&job).join("memory.max_usage_in_bytes"), max_usage).unwrap();
    fs::write(dir.join("memory").join(&job).join("memory.limit_in_bytes"), limit).unwrap();
    dir.to_path_buf()
}

#[test]
fn test_parse_cpu_set() {
    assert!(parse_cpu_set("").unwrap().is_empty());
    assert!(parse_cpu_set("\n").unwrap().is_empty());
    assert!(parse_cpu_set("5\n").unwrap() == BTreeSet::from([5]));
    assert!(parse_cpu_set("0-3,8,10-11").unwrap() == BTreeSet::from([0, 1, 2, 3, 8, 10, 11]));
    assert!(parse_cpu_set("4-4").unwrap() == BTreeSet::from([4]));

    assert!(parse_cpu_set("3-1").is_err());
    assert!(parse_cpu_set("1,,2").is_err());
    assert!(parse_cpu_set("a-b").is_err());
    assert!(parse_cpu_set("1-").is_err());

    // Corrupt upper bounds are rejected before anything is expanded
    assert!(matches!(parse_cpu_set("0-99999999999"), Err(Error::Parse { .. })));
    assert!(parse_cpu_set(&format!("{MAX_CORES}")).is_err());
    assert!(parse_cpu_set(&format!("0-{}", MAX_CORES - 1)).unwrap().len() == MAX_CORES);
}

#[test]
fn test_parse_per_core_usage() {
    assert!(parse_per_core_usage("10 20  30\n").unwrap() == vec![10, 20, 30]);
    assert!(parse_per_core_usage("").unwrap().is_empty());
    assert!(matches!(parse_per_core_usage("10 x 30"), Err(Error::Parse { .. })));
}

#[test]
fn test_read_counters() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(60);
    let root = fake_cgroup_tree(dir.path(), &ctx, "1 2 3 4\n", "1-2\n", "4096\n", "8192\n");
    let counters = CgroupCounters::new(&root, &ctx);
    assert!(counters.read_per_core_cpu_usage().unwrap() == vec![1, 2, 3, 4]);
    assert!(counters.read_cpu_set().unwrap() == BTreeSet::from([1, 2]));
    assert!(counters.read_memory_peak().unwrap() == 4096);
    assert!(counters.read_memory_limit().unwrap() == 8192);

    // Wrong job: the job-specific files are not there
    let mut other = ctx.clone();
    other.job_id = "4712".to_string();
    let counters = CgroupCounters::new(&root, &other);
    assert!(matches!(counters.read_memory_peak(), Err(Error::Io { .. })));
    assert!(counters.read_per_core_cpu_usage().is_ok());
}

#[test]
fn test_malformed_memory() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = crate::context::test_context(60);
    let root = fake_cgroup_tree(dir.path(), &ctx, "1 2\n", "0\n", "lots\n", "-1\n");
    let counters = CgroupCounters::new(&root, &ctx);
    assert!(matches!(counters.read_memory_peak(), Err(Error::Parse { .. })));
    assert!(matches!(counters.read_memory_limit(), Err(Error::Parse { .. })));
}
