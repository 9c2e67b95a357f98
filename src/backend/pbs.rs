//! PBS/Torque backend: `qsub` to submit, `qstat` to poll, `qdel` to cancel.

use async_trait::async_trait;

use super::{BackendError, BackendResult, JobHandle, JobState, SubmissionBackend, SubmissionRequest};

pub struct PbsBackend {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
}

impl Default for PbsBackend {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
        }
    }
}

#[async_trait]
impl SubmissionBackend for PbsBackend {
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

        let script = format!("#!/bin/sh\ncd {}\n{}\n", request.work_dir.display(), request.command.join(" "));
        let script_path = request.work_dir.join("batch-submit.sh");
        tokio::fs::write(&script_path, script).await?;

        let output = tokio::process::Command::new(&self.qsub)
            .arg("-l")
            .arg(format!("nodes={nodes}"))
            .arg("-o")
            .arg(&log_path)
            .args(request.extra_args)
            .arg(&script_path)
            .output()
            .await
            .map_err(|e| BackendError::SubmissionFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(BackendError::SubmissionFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(JobHandle { job_id, log_path })
    }

    async fn poll(&self, handle: &JobHandle) -> BackendResult<JobState> {
        let output = tokio::process::Command::new(&self.qstat)
            .arg("-f")
            .arg(&handle.job_id)
            .output()
            .await
            .map_err(|e| BackendError::PollFailed(handle.job_id.clone(), e.to_string()))?;

        if !output.status.success() {
            // qstat exits non-zero once a job has left the queue.
            return Ok(JobState::Completed);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let state = text
            .lines()
            .find_map(|l| l.trim().strip_prefix("job_state =").map(|v| v.trim().to_string()));
        Ok(parse_state(state.as_deref().unwrap_or("")))
    }

    async fn cancel(&self, handle: &JobHandle) -> BackendResult<()> {
        let output = tokio::process::Command::new(&self.qdel)
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

fn parse_state(raw: &str) -> JobState {
    match raw {
        "Q" | "H" | "W" => JobState::Pending,
        "R" | "E" | "S" => JobState::Running,
        "C" => JobState::Completed,
        "" => JobState::Completed,
        _ => JobState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(parse_state("Q"), JobState::Pending);
        assert_eq!(parse_state("R"), JobState::Running);
        assert_eq!(parse_state("C"), JobState::Completed);
    }
}
