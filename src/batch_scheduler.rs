//! Drives a DAG *of batches* over a pluggable [`SubmissionBackend`]. Each
//! batch is submitted once all its batch-level dependencies are terminal;
//! up to `workers` batches may be in flight at once; polling is bounded by
//! the batch's runtime estimate plus a grace factor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendError, BackendResult, JobHandle, JobState, SubmissionBackend, SubmissionRequest};
use crate::batch::Batch;
use crate::resource::ResourceAllocation;

pub type BatchSchedulerResult<T> = Result<T, BatchSchedulerError>;

#[derive(Debug, Error)]
pub enum BatchSchedulerError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    /// Submission to the workload manager itself failed.
    SubmissionFailed,
    /// The batch exceeded its runtime + grace bound and was cancelled.
    TimedOut,
    /// A batch dependency did not complete, so this batch never ran.
    NotRun,
}

pub struct BatchSchedulerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub grace_factor: f64,
    pub default_runtime: Duration,
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_secs(1),
            grace_factor: 1.5,
            default_runtime: Duration::from_secs(3600),
        }
    }
}

pub struct BatchScheduler {
    pub backend: Arc<dyn SubmissionBackend>,
    pub config: BatchSchedulerConfig,
}

/// Derive batch-level edges from the per-case dependency graph: batch `i`
/// depends on batch `j` if any member of `i` depends on a member of `j`
/// in a different batch.
pub fn batch_dependencies(batches: &[Batch], case_deps: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut owner: HashMap<usize, usize> = HashMap::new();
    for (b, batch) in batches.iter().enumerate() {
        for &m in &batch.members {
            owner.insert(m, b);
        }
    }

    batches
        .iter()
        .enumerate()
        .map(|(b, batch)| {
            let mut deps: Vec<usize> = batch
                .members
                .iter()
                .flat_map(|&m| case_deps[m].iter().copied())
                .filter_map(|d| owner.get(&d).copied())
                .filter(|&ob| ob != b)
                .collect();
            deps.sort();
            deps.dedup();
            deps
        })
        .collect()
}

impl BatchScheduler {
    /// Run every batch in dependency order. `batch_command` builds the
    /// nested driver invocation for a batch (normally `canary run` scoped
    /// to that batch's sub-DAG); `work_dir_for`/`resources_for` supply the
    /// per-batch working directory and resource allocation to submit with.
    pub async fn run(
        &self,
        batches: &[Batch],
        batch_deps: &[Vec<usize>],
        batch_command: impl Fn(usize) -> Vec<String>,
        work_dir_for: impl Fn(usize) -> PathBuf,
        resources_for: impl Fn(usize) -> ResourceAllocation,
    ) -> BatchSchedulerResult<Vec<BatchOutcome>> {
        let n = batches.len();
        let mut outcomes: Vec<Option<BatchOutcome>> = vec![None; n];
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.workers));

        let mut handles: Vec<Option<JobHandle>> = vec![None; n];
        let mut started = vec![false; n];
        let mut deadlines: Vec<Option<tokio::time::Instant>> = vec![None; n];

        loop {
            if outcomes.iter().all(|o| o.is_some()) {
                break;
            }

            for i in 0..n {
                if started[i] || outcomes[i].is_some() {
                    continue;
                }
                if !batch_deps[i].iter().all(|&d| outcomes[d].is_some()) {
                    continue;
                }

                // A non-Completed ancestor does not block submission: the
                // descendant still runs, it just proceeds without whatever
                // the ancestor would have contributed.
                let Ok(_permit) = semaphore.clone().try_acquire_owned() else {
                    continue;
                };
                started[i] = true;

                let resources = resources_for(i);
                let work_dir = work_dir_for(i);
                let command = batch_command(i);
                std::fs::create_dir_all(&work_dir).ok();

                match self
                    .backend
                    .submit(SubmissionRequest {
                        command,
                        work_dir: &work_dir,
                        resources: &resources,
                        extra_args: &[],
                    })
                    .await
                {
                    Ok(handle) => {
                        info!(batch = i, job = %handle.job_id, "submitted");
                        let bound = self.config.default_runtime.mul_f64(self.config.grace_factor);
                        deadlines[i] = Some(tokio::time::Instant::now() + bound);
                        handles[i] = Some(handle);
                    }
                    Err(e) => {
                        warn!("batch {i} submission failed: {e}");
                        outcomes[i] = Some(BatchOutcome::SubmissionFailed);
                    }
                }
            }

            let mut any_in_flight = false;
            for i in 0..n {
                let Some(handle) = handles[i].as_ref() else { continue };
                if outcomes[i].is_some() {
                    continue;
                }
                any_in_flight = true;

                if let Some(deadline) = deadlines[i]
                    && tokio::time::Instant::now() >= deadline
                {
                    let _ = self.backend.cancel(handle).await;
                    outcomes[i] = Some(BatchOutcome::TimedOut);
                    continue;
                }

                match self.backend.poll(handle).await {
                    Ok(JobState::Completed) => outcomes[i] = Some(BatchOutcome::Completed),
                    Ok(JobState::Failed | JobState::Cancelled) => {
                        outcomes[i] = Some(BatchOutcome::SubmissionFailed)
                    }
                    Ok(JobState::Pending | JobState::Running) => {}
                    Err(e) => warn!("poll of batch {i} failed: {e}"),
                }
            }

            if !any_in_flight && outcomes.iter().any(|o| o.is_none()) && !started.iter().any(|&s| s) {
                break;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        Ok(outcomes.into_iter().map(|o| o.unwrap_or(BatchOutcome::NotRun)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shell::ShellBackend;
    use async_trait::async_trait;

    /// Fails submission for any command starting with `"fail"`, succeeds
    /// (and immediately completes) otherwise.
    struct FlakyBackend;

    #[async_trait]
    impl SubmissionBackend for FlakyBackend {
        async fn submit(&self, request: SubmissionRequest<'_>) -> BackendResult<JobHandle> {
            if request.command.first().map(String::as_str) == Some("fail") {
                return Err(BackendError::SubmissionFailed("boom".to_string()));
            }
            Ok(JobHandle { job_id: "1".to_string(), log_path: request.work_dir.join("out.txt") })
        }

        async fn poll(&self, _handle: &JobHandle) -> BackendResult<JobState> {
            Ok(JobState::Completed)
        }

        async fn cancel(&self, _handle: &JobHandle) -> BackendResult<()> {
            Ok(())
        }
    }

    #[test]
    fn batch_dependencies_cross_batch_edges_only() {
        let batches = vec![
            Batch { members: vec![0], node_count: 1 },
            Batch { members: vec![1], node_count: 1 },
        ];
        // case 1 depends on case 0.
        let case_deps = vec![vec![], vec![0]];
        let deps = batch_dependencies(&batches, &case_deps);
        assert_eq!(deps[0], Vec::<usize>::new());
        assert_eq!(deps[1], vec![0]);
    }

    #[test]
    fn intra_batch_dependency_produces_no_edge() {
        let batches = vec![Batch { members: vec![0, 1], node_count: 1 }];
        let case_deps = vec![vec![], vec![0]];
        let deps = batch_dependencies(&batches, &case_deps);
        assert_eq!(deps[0], Vec::<usize>::new());
    }

    #[tokio::test]
    async fn runs_batches_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = BatchScheduler {
            backend: Arc::new(ShellBackend::default()),
            config: BatchSchedulerConfig {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        };

        let batches = vec![
            Batch { members: vec![0], node_count: 1 },
            Batch { members: vec![1], node_count: 1 },
        ];
        let deps = vec![vec![], vec![0]];

        let dir_path = dir.path().to_path_buf();
        let outcomes = scheduler
            .run(
                &batches,
                &deps,
                |_| vec!["true".to_string()],
                |i| dir_path.join(i.to_string()),
                |_| ResourceAllocation::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes, vec![BatchOutcome::Completed, BatchOutcome::Completed]);
    }

    #[tokio::test]
    async fn descendant_still_submits_after_ancestor_submission_failure() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = BatchScheduler {
            backend: Arc::new(FlakyBackend),
            config: BatchSchedulerConfig {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        };

        let batches = vec![
            Batch { members: vec![0], node_count: 1 },
            Batch { members: vec![1], node_count: 1 },
        ];
        let deps = vec![vec![], vec![0]];

        let dir_path = dir.path().to_path_buf();
        let outcomes = scheduler
            .run(
                &batches,
                &deps,
                |i| if i == 0 { vec!["fail".to_string()] } else { vec!["true".to_string()] },
                |i| dir_path.join(i.to_string()),
                |_| ResourceAllocation::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[0], BatchOutcome::SubmissionFailed);
        assert_eq!(outcomes[1], BatchOutcome::Completed);
    }
}
