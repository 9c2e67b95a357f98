//! Slurm backend: `sbatch` to submit, `squeue` to poll, `scancel` to cancel.
//! Parses only the job id out of `sbatch`'s `Submitted batch job <id>` line
//! and the job state column out of `squeue`.

use async_trait::async_trait;

use super::{BackendError, BackendResult, JobHandle, JobState, SubmissionBackend, SubmissionRequest};

pub struct SlurmBackend {
    pub sbatch: String,
    pub squeue: String,
    pub scancel: String,
}

impl Default for SlurmBackend {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scancel: "scancel".to_string(),
        }
    }
}

#[async_trait]
impl SubmissionBackend for SlurmBackend {
    async fn submit(&self, request: SubmissionRequest<'_>) -> BackendResult<JobHandle> {
        let log_path = request.work_dir.join("batch-out.txt");
        let nodes = request
            .resources
            .grants
            .iter()
            .map(|g| g.node_id.clone())
            .collect::<std::collections::HashSet<_>>()
            .len()
            .max(1);

        let output = tokio::process::Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(format!("--nodes={nodes}"))
            .arg(format!("--output={}", log_path.display()))
            .current_dir(request.work_dir)
            .args(request.extra_args)
            .arg("--wrap")
            .arg(request.command.join(" "))
            .output()
            .await
            .map_err(|e| BackendError::SubmissionFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(BackendError::SubmissionFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let job_id = String::from_utf8_lossy(&output.stdout)
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(JobHandle { job_id, log_path })
    }

    async fn poll(&self, handle: &JobHandle) -> BackendResult<JobState> {
        let output = tokio::process::Command::new(&self.squeue)
            .arg("-j")
            .arg(&handle.job_id)
            .arg("-h")
            .arg("-o")
            .arg("%T")
            .output()
            .await
            .map_err(|e| BackendError::PollFailed(handle.job_id.clone(), e.to_string()))?;

        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(parse_state(&state))
    }

    async fn cancel(&self, handle: &JobHandle) -> BackendResult<()> {
        let output = tokio::process::Command::new(&self.scancel)
            .arg(&handle.job_id)
            .output()
            .await
            .map_err(|e| BackendError::CancelFailed(handle.job_id.clone(), e.to_string()))?;
        if !output.status.success() {
            return Err(BackendError::CancelFailed(
                handle.job_id.clone(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }
}

/// An empty `squeue` result means the job has left the queue, which we
/// treat as completed (the caller is expected to check the log/exit code
/// for the true outcome; this backend reports scheduling state only).
fn parse_state(raw: &str) -> JobState {
    match raw {
        "" => JobState::Completed,
        "PENDING" | "CONFIGURING" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "CANCELLED" => JobState::Cancelled,
        _ => JobState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(parse_state("PENDING"), JobState::Pending);
        assert_eq!(parse_state("RUNNING"), JobState::Running);
        assert_eq!(parse_state(""), JobState::Completed);
        assert_eq!(parse_state("FAILED"), JobState::Failed);
        assert_eq!(parse_state("CANCELLED"), JobState::Cancelled);
    }
}
