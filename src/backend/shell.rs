//! Local-subprocess backend: a batch "submission" is just spawning the
//! nested driver invocation directly, with no queueing. Grounded on the
//! teacher's direct-subprocess connector pattern — one shell, no polling
//! loop beyond checking whether the process has exited.

use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Child;

use super::{BackendError, BackendResult, JobHandle, JobState, SubmissionBackend, SubmissionRequest};

#[derive(Default)]
pub struct ShellBackend {
    children: Mutex<std::collections::HashMap<String, Child>>,
}

#[async_trait]
impl SubmissionBackend for ShellBackend {
    async fn submit(&self, request: SubmissionRequest<'_>) -> BackendResult<JobHandle> {
        let log_path = request.work_dir.join("batch-out.txt");
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_err = log_file.try_clone()?;

        let mut command = tokio::process::Command::new(
            request.command.first().cloned().unwrap_or_else(|| "true".to_string()),
        );
        command
            .args(request.command.iter().skip(1))
            .args(request.extra_args)
            .current_dir(request.work_dir)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        let child = command
            .spawn()
            .map_err(|e| BackendError::SubmissionFailed(e.to_string()))?;
        let job_id = child.id().map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());

        self.children.lock().insert(job_id.clone(), child);
        Ok(JobHandle { job_id, log_path })
    }

    async fn poll(&self, handle: &JobHandle) -> BackendResult<JobState> {
        let mut children = self.children.lock();
        let Some(child) = children.get_mut(&handle.job_id) else {
            return Ok(JobState::Completed);
        };
        match child.try_wait() {
            Ok(Some(status)) => Ok(if status.success() { JobState::Completed } else { JobState::Failed }),
            Ok(None) => Ok(JobState::Running),
            Err(e) => Err(BackendError::PollFailed(handle.job_id.clone(), e.to_string())),
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> BackendResult<()> {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&handle.job_id) {
            child
                .start_kill()
                .map_err(|e| BackendError::CancelFailed(handle.job_id.clone(), e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_and_poll_until_completed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ShellBackend::default();
        let allocation = crate::resource::ResourceAllocation::default();
        let handle = backend
            .submit(SubmissionRequest {
                command: vec!["true".to_string()],
                work_dir: dir.path(),
                resources: &allocation,
                extra_args: &[],
            })
            .await
            .unwrap();

        let mut state = backend.poll(&handle).await.unwrap();
        for _ in 0..50 {
            if state == JobState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            state = backend.poll(&handle).await.unwrap();
        }
        assert_eq!(state, JobState::Completed);
    }
}
