//! Flux backend: `flux submit` / `flux jobs` / `flux cancel`. Flux's JSON
//! job-status output makes this the one adapter that parses structured
//! output rather than a fixed-width column.

use async_trait::async_trait;
use serde::Deserialize;

use super::{BackendError, BackendResult, JobHandle, JobState, SubmissionBackend, SubmissionRequest};

pub struct FluxBackend {
    pub flux: String,
}

impl Default for FluxBackend {
    fn default() -> Self {
        Self { flux: "flux".to_string() }
    }
}

#[derive(Debug, Deserialize)]
struct FluxJobsOutput {
    jobs: Vec<FluxJobEntry>,
}

#[derive(Debug, Deserialize)]
struct FluxJobEntry {
    state: String,
}

#[async_trait]
impl SubmissionBackend for FluxBackend {
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

        let output = tokio::process::Command::new(&self.flux)
            .arg("submit")
            .arg(format!("--nodes={nodes}"))
            .arg(format!("--output={}", log_path.display()))
            .current_dir(request.work_dir)
            .args(request.extra_args)
            .args(&request.command)
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
        let output = tokio::process::Command::new(&self.flux)
            .arg("jobs")
            .arg("--json")
            .arg(&handle.job_id)
            .output()
            .await
            .map_err(|e| BackendError::PollFailed(handle.job_id.clone(), e.to_string()))?;

        if !output.status.success() {
            return Ok(JobState::Completed);
        }

        let parsed: Result<FluxJobsOutput, _> = serde_json::from_slice(&output.stdout);
        let state = parsed
            .ok()
            .and_then(|o| o.jobs.into_iter().next())
            .map(|j| j.state)
            .unwrap_or_default();
        Ok(parse_state(&state))
    }

    async fn cancel(&self, handle: &JobHandle) -> BackendResult<()> {
        let output = tokio::process::Command::new(&self.flux)
            .arg("cancel")
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
        "DEPEND" | "PRIORITY" | "SCHED" => JobState::Pending,
        "RUN" | "CLEANUP" => JobState::Running,
        "INACTIVE" => JobState::Completed,
        "" => JobState::Completed,
        _ => JobState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_states() {
        assert_eq!(parse_state("SCHED"), JobState::Pending);
        assert_eq!(parse_state("RUN"), JobState::Running);
        assert_eq!(parse_state("INACTIVE"), JobState::Completed);
    }

    #[test]
    fn deserializes_flux_jobs_json() {
        let raw = r#"{"jobs":[{"state":"RUN"}]}"#;
        let parsed: FluxJobsOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.jobs[0].state, "RUN");
    }
}
