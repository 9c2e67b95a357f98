//! Submission backends for the batch scheduler: a narrow interface over
//! `shell` (local subprocess), `slurm`, `pbs`, and `flux`. Each adapter
//! parses only the fields needed to implement the trait — job id, state,
//! log path — not a full client library for its workload manager.

pub mod flux;
pub mod pbs;
pub mod shell;
pub mod slurm;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::ResourceAllocation;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error("failed to poll job {0}: {1}")]
    PollFailed(String, String),
    #[error("failed to cancel job {0}: {1}")]
    CancelFailed(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// An opaque handle a backend hands back from `submit` and consumes in
/// every subsequent call.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub log_path: PathBuf,
}

/// What a batch submission needs: the command that re-invokes the driver
/// on the batch's sub-DAG, the working directory to run it from, and the
/// resources the workload manager should grant it.
pub struct SubmissionRequest<'a> {
    pub command: Vec<String>,
    pub work_dir: &'a std::path::Path,
    pub resources: &'a ResourceAllocation,
    pub extra_args: &'a [String],
}

#[async_trait]
pub trait SubmissionBackend: Send + Sync {
    async fn submit(&self, request: SubmissionRequest<'_>) -> BackendResult<JobHandle>;
    async fn poll(&self, handle: &JobHandle) -> BackendResult<JobState>;
    async fn cancel(&self, handle: &JobHandle) -> BackendResult<()>;
    fn logs(&self, handle: &JobHandle) -> PathBuf {
        handle.log_path.clone()
    }
}

/// Resolve a named backend (`"shell"`, `"slurm"`, `"pbs"`, `"flux"`) to a
/// boxed implementation, or `None` for an unrecognized name.
pub fn by_name(name: &str) -> Option<Box<dyn SubmissionBackend>> {
    match name {
        "shell" => Some(Box::new(shell::ShellBackend::default())),
        "slurm" => Some(Box::new(slurm::SlurmBackend::default())),
        "pbs" => Some(Box::new(pbs::PbsBackend::default())),
        "flux" => Some(Box::new(flux::FluxBackend::default())),
        _ => None,
    }
}
