// Error taxonomy for the accounting library.  Every error is fatal to the invocation; the variants
// exist so that the message can say which counter source failed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A file or directory could not be read, written or removed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Counter file or job description content was not what we expected.
    #[error("Malformed {what}: {detail}")]
    Parse { what: String, detail: String },

    /// `stop` found no snapshot for this job on this host.
    #[error("No baseline snapshot for job {job_id} on {hostname}, was `sprofile start` run?")]
    MissingBaseline { job_id: String, hostname: String },

    /// The report lock was held by somebody else for longer than the timeout.
    #[error("Timed out after {timeout:?} waiting for lock {}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    /// The GPU library returned an error.
    #[error("GPU query failed ({what}): {detail}")]
    DeviceQuery { what: String, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: &Path, source: io::Error) -> Error {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, detail: impl ToString) -> Error {
        Error::Parse {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn device(what: impl Into<String>, detail: impl ToString) -> Error {
        Error::DeviceQuery {
            what: what.into(),
            detail: detail.to_string(),
        }
    }
}

#[test]
fn test_error_messages() {
    let e = Error::MissingBaseline {
        job_id: "1234".to_string(),
        hostname: "c1-5".to_string(),
    };
    assert!(e.to_string().contains("job 1234 on c1-5"));

    let e = Error::parse("cpuset.cpus", "bad range `7-3`");
    assert!(e.to_string() == "Malformed cpuset.cpus: bad range `7-3`");

    let e = Error::io(
        Path::new("/nonexistent/cpuacct.usage_percpu"),
        io::Error::new(io::ErrorKind::NotFound, "gone"),
    );
    assert!(e.to_string().starts_with("I/O error on /nonexistent/cpuacct.usage_percpu"));
}
