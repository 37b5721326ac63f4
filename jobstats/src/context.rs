// The job context: what we know about the job, built once at process entry from the environment and
// from the scheduler's description of the job, and passed to everyone who needs it.
//
// The scheduler description is the output of `scontrol show job <id> -o`, a single line of
// space-separated Key=Value tokens.  We consume three of them:
//
//  Key        Format                    Gloss
//  ---------  ------------------------  ------------------------------------------------
//  StartTime  YYYY-MM-DDTHH:MM:SS       Node-local time the job started
//  TimeLimit  [D-]HH:MM:SS | UNLIMITED  The reservation
//  RunTime    [D-]HH:MM:SS              Elapsed time at the moment the query was made
//
// Everything else on the line is ignored.

use crate::error::{Error, Result};
use chrono::{Duration, Local, NaiveDateTime, TimeZone};
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct JobContext {
    /// Slurm job ID, kept as a string since it's only ever used as a key.
    pub job_id: String,

    /// Name of this node as reported by the OS.
    pub hostname: String,

    /// Owner of the job; part of the cgroup paths.
    pub uid: u32,

    /// Job start in microseconds since the epoch, comparable with GPU accounting timestamps.
    pub start_time: u64,

    /// The reservation, None for UNLIMITED.
    pub time_limit: Option<Duration>,

    /// Elapsed run time of the job.  Never negative.
    pub run_time: Duration,
}

impl JobContext {
    /// Build the context from the job description line.

    pub fn from_job_info(job_id: &str, hostname: &str, uid: u32, job_info: &str) -> Result<JobContext> {
        let start_time = parse_start_time(job_field(job_info, "StartTime")?)?;
        let time_limit = match job_field(job_info, "TimeLimit")? {
            "UNLIMITED" => None,
            s => Some(parse_slurm_duration("TimeLimit", s)?),
        };
        let run_time = parse_slurm_duration("RunTime", job_field(job_info, "RunTime")?)?;
        Ok(JobContext {
            job_id: job_id.to_string(),
            hostname: hostname.to_string(),
            uid,
            start_time,
            time_limit,
            run_time,
        })
    }
}

/// Run `scontrol show job <job_id> -o` and return its output.

pub fn query_scheduler(job_id: &str) -> Result<String> {
    let output = Command::new("scontrol")
        .args(["show", "job", job_id, "-o"])
        .output()
        .map_err(|e| Error::io(Path::new("scontrol"), e))?;
    if !output.status.success() {
        return Err(Error::parse(
            "scontrol output",
            format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    String::from_utf8(output.stdout).map_err(|e| Error::parse("scontrol output", e))
}

fn job_field<'a>(job_info: &'a str, key: &str) -> Result<&'a str> {
    job_info
        .split_whitespace()
        .find_map(|token| {
            token
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .ok_or_else(|| Error::parse("job description", format!("no {key} field")))
}

// StartTime is in node-local time without an offset.  An ambiguous local time (DST fold) resolves
// to the earlier instant.

fn parse_start_time(s: &str) -> Result<u64> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| Error::parse("StartTime", format!("`{s}`: {e}")))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| Error::parse("StartTime", format!("`{s}` does not exist in local time")))?;
    u64::try_from(local.timestamp_micros())
        .map_err(|_| Error::parse("StartTime", format!("`{s}` is before the epoch")))
}

/// Parse Slurm's `[D-]HH:MM:SS`.  `what` names the field for the error message.

pub fn parse_slurm_duration(what: &str, s: &str) -> Result<Duration> {
    let bad = || Error::parse(what, format!("`{s}` is not [D-]HH:MM:SS"));
    let (days, hms) = match s.split_once('-') {
        Some((d, rest)) => (u64::from_str(d).map_err(|_| bad())?, rest),
        None => (0, s),
    };
    let parts = hms
        .split(':')
        .map(u64::from_str)
        .collect::<std::result::Result<Vec<u64>, _>>()
        .map_err(|_| bad())?;
    if parts.len() != 3 || parts[1] >= 60 || parts[2] >= 60 {
        return Err(bad());
    }
    let seconds = days
        .checked_mul(86400)
        .and_then(|d| parts[0].checked_mul(3600).and_then(|h| h.checked_add(d)))
        .and_then(|t| t.checked_add(parts[1] * 60 + parts[2]))
        .ok_or_else(bad)?;
    let seconds = i64::try_from(seconds).map_err(|_| bad())?;
    Duration::try_seconds(seconds).ok_or_else(bad)
}

#[cfg(test)]
pub(crate) fn test_context(run_seconds: i64) -> JobContext {
    JobContext {
        job_id: "4711".to_string(),
        hostname: "c7-3".to_string(),
        uid: 1000,
        start_time: 1_000_000,
        time_limit: Some(Duration::hours(2)),
        run_time: Duration::seconds(run_seconds),
    }
}

#[cfg(test)]
const JOB_INFO: &str = "JobId=4711 JobName=train.sh UserId=alice(1000) GroupId=alice(1000) \
    Priority=1 JobState=COMPLETING RunTime=01:02:03 TimeLimit=1-00:00:00 TimeMin=N/A \
    SubmitTime=2023-08-15T12:40:00 EligibleTime=2023-08-15T12:40:00 StartTime=2023-08-15T12:46:53 \
    EndTime=2023-08-16T12:46:53 Partition=accel NodeList=c7-3 NumNodes=1 NumCPUs=8";

#[test]
fn test_from_job_info() {
    let ctx = JobContext::from_job_info("4711", "c7-3", 1000, JOB_INFO).unwrap();
    assert!(ctx.job_id == "4711");
    assert!(ctx.hostname == "c7-3");
    assert!(ctx.run_time.num_seconds() == 3723);
    assert!(ctx.time_limit == Some(Duration::days(1)));

    // StartTime is local, so compare against another local time rather than a fixed epoch value.
    let later = JOB_INFO.replace("StartTime=2023-08-15T12:46:53", "StartTime=2023-08-15T13:46:53");
    let ctx2 = JobContext::from_job_info("4711", "c7-3", 1000, &later).unwrap();
    assert!(ctx2.start_time - ctx.start_time == 3600 * 1_000_000);
}

#[test]
fn test_unlimited_and_missing() {
    let unlimited = JOB_INFO.replace("TimeLimit=1-00:00:00", "TimeLimit=UNLIMITED");
    let ctx = JobContext::from_job_info("4711", "c7-3", 1000, &unlimited).unwrap();
    assert!(ctx.time_limit.is_none());

    // OverTimeLimit must not be mistaken for TimeLimit
    let missing = JOB_INFO.replace("TimeLimit=1-00:00:00", "OverTimeLimit=NONE");
    assert!(matches!(
        JobContext::from_job_info("4711", "c7-3", 1000, &missing),
        Err(Error::Parse { .. })
    ));

    let bad_start = JOB_INFO.replace("StartTime=2023-08-15T12:46:53", "StartTime=Unknown");
    assert!(JobContext::from_job_info("4711", "c7-3", 1000, &bad_start).is_err());
}

#[test]
fn test_parse_slurm_duration() {
    assert!(parse_slurm_duration("RunTime", "00:00:00").unwrap().num_seconds() == 0);
    assert!(parse_slurm_duration("RunTime", "00:01:05").unwrap().num_seconds() == 65);
    assert!(parse_slurm_duration("RunTime", "3-04:05:06").unwrap().num_seconds() == ((3 * 24 + 4) * 60 + 5) * 60 + 6);

    assert!(parse_slurm_duration("RunTime", "").is_err());
    assert!(parse_slurm_duration("RunTime", "12:00").is_err());
    assert!(parse_slurm_duration("RunTime", "01:60:00").is_err());
    assert!(parse_slurm_duration("RunTime", "x-01:00:00").is_err());
    assert!(parse_slurm_duration("RunTime", "-01:00:00").is_err());

    // Too large to represent
    assert!(matches!(
        parse_slurm_duration("RunTime", "300000000000000-00:00:00"),
        Err(Error::Parse { .. })
    ));
    assert!(matches!(
        parse_slurm_duration("TimeLimit", "9999999999999999:00:00"),
        Err(Error::Parse { .. })
    ));
    assert!(matches!(
        parse_slurm_duration("TimeLimit", "106751991168-00:00:00"),
        Err(Error::Parse { .. })
    ));
}

#[test]
fn test_scheduler_not_runnable() {
    // Without scontrol on the PATH the failure is an I/O error, not a parse error
    if Command::new("scontrol").arg("--version").output().is_err() {
        assert!(matches!(query_scheduler("4711"), Err(Error::Io { .. })));
    }
}
