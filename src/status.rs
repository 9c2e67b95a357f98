//! The status taxonomy, exit-code mapping, and the advisory timing cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spec::TestSpecId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Created,
    Ready,
    Pending,
    Running,
    Cancelled,
    Skipped,
    Diffed,
    Failed,
    Timeout,
    Success,
    Xfail,
    Xdiff,
    NotRun,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Created | Status::Ready | Status::Pending | Status::Running)
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Status::Success | Status::Xfail | Status::Xdiff | Status::Skipped)
    }
}

/// Map a test subprocess exit code to a base status, per the subprocess
/// contract: 0 success, 63 skipped, 64 diffed, anything else non-zero
/// failed. Termination by signal after timeout is handled by the caller
/// (the runner observes the timeout directly, not the exit code).
pub fn status_for_exit_code(code: i32) -> Status {
    match code {
        0 => Status::Success,
        63 => Status::Skipped,
        64 => Status::Diffed,
        _ => Status::Failed,
    }
}

/// Apply a spec's `xfail`/`xdiff` declaration to a base status computed from
/// its exit code.
pub fn apply_expected_outcome(
    base: Status,
    exit_code: i32,
    expected: &crate::spec::ExpectedOutcome,
) -> Status {
    match base {
        Status::Failed if expected.xfail => {
            match expected.xfail_code {
                Some(code) if code != exit_code => Status::Failed,
                _ => Status::Xfail,
            }
        }
        Status::Diffed if expected.xdiff => Status::Xdiff,
        Status::Success if expected.xfail || expected.xdiff => Status::Failed,
        other => other,
    }
}

/// One observed duration for a spec, used only to seed the batcher's
/// runtime estimates. Never affects correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimingRecord {
    spec_id: TestSpecId,
    duration_secs: f64,
}

/// Append-only, atomic-rename-on-flush timing cache. Readers tolerate a
/// truncated last line.
pub struct TimeKeeper {
    path: PathBuf,
    observed: HashMap<TestSpecId, Duration>,
}

impl TimeKeeper {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut observed = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                if let Ok(record) = serde_json::from_str::<TimingRecord>(line) {
                    observed.insert(record.spec_id, Duration::from_secs_f64(record.duration_secs));
                }
            }
        }
        Self { path, observed }
    }

    pub fn estimate(&self, id: &TestSpecId) -> Option<Duration> {
        self.observed.get(id).copied()
    }

    /// Append one observation and atomically replace the cache file.
    pub fn record(&mut self, id: TestSpecId, duration: Duration) -> std::io::Result<()> {
        self.observed.insert(id.clone(), duration);

        let tmp = tmp_path(&self.path);
        let mut buf = String::new();
        for (spec_id, d) in &self.observed {
            let record = TimingRecord {
                spec_id: spec_id.clone(),
                duration_secs: d.as_secs_f64(),
            };
            buf.push_str(&serde_json::to_string(&record).unwrap());
            buf.push('\n');
        }
        std::fs::write(&tmp, buf)?;
        std::fs::rename(&tmp, &self.path)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
