//! The direct scheduler: drives one session's DAG to completion by
//! repeatedly computing the ready set, dispatching to a bounded worker
//! pool, and feeding completions back into readiness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::case::{TestCase, sibling_parameters_for};
use crate::graph::Graph;
use crate::report::Reporter;
use crate::resource::{AcquireOutcome, ResourcePool, ResourceRequest};
use crate::runner::{CaseRunner, RunContext};
use crate::spec::TestSpec;
use crate::status::Status;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("deadlock: {0} case(s) remain but none are ready and none are running")]
    Deadlock(usize),
    #[error("session timed out after {0:?}")]
    SessionTimeout(Duration),
}

/// Tie-break order among simultaneously ready cases: longer estimated
/// runtime first, then name, for a stable and throughput-favoring pick.
fn ready_order(specs: &[TestSpec], ready: &[usize]) -> Vec<usize> {
    let mut ordered = ready.to_vec();
    ordered.sort_by(|&a, &b| {
        let ra = specs[a].runtime_estimate.unwrap_or(Duration::ZERO);
        let rb = specs[b].runtime_estimate.unwrap_or(Duration::ZERO);
        rb.cmp(&ra).then_with(|| specs[a].name.cmp(&specs[b].name))
    });
    ordered
}

enum Event {
    Completed { index: usize, status: Status, exit_code: Option<i32> },
}

pub struct DirectScheduler {
    pub workers: usize,
    pub session_timeout: Option<Duration>,
    /// Poll interval used when the ready set is empty but cases are still
    /// in flight; also the bound on the deadlock-detection wait.
    pub idle_poll: Duration,
}

impl Default for DirectScheduler {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            session_timeout: None,
            idle_poll: Duration::from_millis(100),
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl DirectScheduler {
    /// Run every case in `specs` (in the same order, by index) to
    /// completion, respecting dependency readiness and resource
    /// availability. `exec_dir_for` maps a spec index to the directory its
    /// case should run in.
    pub async fn run(
        &self,
        specs: &[TestSpec],
        pool: Arc<ResourcePool>,
        ctx: Arc<RunContext>,
        reporter: &dyn Reporter,
        exec_dir_for: impl Fn(usize) -> std::path::PathBuf,
    ) -> SchedulerResult<Vec<TestCase>> {
        let deps: Vec<Vec<usize>> = specs
            .iter()
            .map(|s| {
                s.dependencies
                    .iter()
                    .map(|(id, _)| specs.iter().position(|s2| &s2.id == id).unwrap())
                    .collect()
            })
            .collect();
        let graph = Graph::new(deps);

        let mut cases: Vec<TestCase> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| TestCase::new(spec, exec_dir_for(i)))
            .collect();

        for (i, case) in cases.iter_mut().enumerate() {
            case.sibling_parameters = sibling_parameters_for(&specs[i], specs);
            if specs[i].masked {
                case.mark_terminal(Status::Skipped, None).ok();
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) = mpsc::channel::<Event>(specs.len().max(1));
        let mut in_flight: usize = 0;

        let deadline = self
            .session_timeout
            .map(|d| tokio::time::Instant::now() + d);

        loop {
            if ctx.cancellation.is_cancelled() {
                for case in cases.iter_mut() {
                    if !case.status.is_terminal() {
                        case.mark_terminal(Status::Cancelled, None).ok();
                    }
                }
                break;
            }

            let is_terminal = |i: usize| cases[i].status.is_terminal();
            let result_ok = |dependent: usize, dep: usize| {
                let predicate = specs[dependent]
                    .dependencies
                    .iter()
                    .find(|(id, _)| id == &specs[dep].id)
                    .map(|(_, r)| r.clone())
                    .unwrap_or_default();
                predicate.accepts(cases[dep].status)
            };
            let (ready, gated) = graph.ready(is_terminal, result_ok);

            for &i in &gated {
                if !cases[i].status.is_terminal() {
                    cases[i].mark_terminal(Status::Skipped, None).ok();
                    cases[i].mask_reason = Some("dependency failed".to_string());
                }
            }

            if ready.is_empty() && in_flight == 0 {
                let remaining = cases.iter().filter(|c| !c.status.is_terminal()).count();
                if remaining > 0 {
                    for case in cases.iter_mut() {
                        if !case.status.is_terminal() {
                            case.mark_terminal(Status::NotRun, None).ok();
                        }
                    }
                    return Err(SchedulerError::Deadlock(remaining));
                }
                break;
            }

            if let Some(deadline) = deadline
                && tokio::time::Instant::now() >= deadline
            {
                for case in cases.iter_mut() {
                    if !case.status.is_terminal() {
                        case.mark_terminal(Status::Timeout, None).ok();
                    }
                }
                return Err(SchedulerError::SessionTimeout(self.session_timeout.unwrap()));
            }

            let ordered = ready_order(specs, &ready);
            for i in ordered {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let request = resource_request(&specs[i]);
                let allocation = match pool.acquire(&request) {
                    Ok(AcquireOutcome::Granted(a)) => a,
                    Ok(AcquireOutcome::NoFitNow) => continue,
                    Err(e) => {
                        warn!("resource request for '{}' is unsatisfiable: {e}", specs[i].name);
                        cases[i].mark_terminal(Status::Skipped, None).ok();
                        cases[i].mask_reason = Some("resource request exceeds pool capacity".to_string());
                        continue;
                    }
                };

                cases[i].mark_ready();
                cases[i].mark_running().ok();
                cases[i].allocation = Some(allocation.clone());
                in_flight += 1;
                reporter.on_case_start(&cases[i]);

                let spec = specs[i].clone();
                let exec_dir = cases[i].exec_dir.clone();
                let pool = pool.clone();
                let ctx = ctx.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let result = CaseRunner::run(&spec, &exec_dir, &allocation, &pool, &ctx).await;
                    pool.release(&allocation).expect("releasing an allocation this case was holding");
                    let (status, exit_code) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("case '{}' failed to run: {e}", spec.name);
                            (Status::Failed, None)
                        }
                    };
                    let _ = tx.send(Event::Completed { index: i, status, exit_code }).await;
                });
            }

            let recv = tokio::time::timeout(self.idle_poll, rx.recv()).await;
            match recv {
                Ok(Some(Event::Completed { index, status, exit_code })) => {
                    cases[index].mark_terminal(status, exit_code).ok();
                    in_flight -= 1;
                    reporter.on_case_complete(&cases[index], &specs[index]);
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        Ok(cases)
    }
}

fn resource_request(spec: &TestSpec) -> ResourceRequest {
    let mut counts = HashMap::new();
    for (kind, count) in &spec.resource_request {
        counts.insert(kind.clone(), *count);
    }
    ResourceRequest {
        counts,
        node_count: None,
        policy: crate::resource::NodePolicy::Auto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ConsoleReporter;
    use crate::resource::{ResourceInstance, ResourceNode};
    use crate::spec::{EnvModifiers, ExpectedOutcome, ResultPredicate, TestSpecId, WorkingDirHints};
    use std::collections::{BTreeMap, HashSet};

    fn spec(name: &str, deps: Vec<(&str, ResultPredicate)>, command: Vec<&str>) -> TestSpec {
        TestSpec {
            id: TestSpecId(name.into()),
            name: name.into(),
            family: name.into(),
            keywords: HashSet::new(),
            parameters: BTreeMap::new(),
            dependencies: deps.into_iter().map(|(d, r)| (TestSpecId(d.into()), r)).collect(),
            timeout: Some(Duration::from_secs(5)),
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            enabled: true,
            expected: ExpectedOutcome::default(),
            command: command.into_iter().map(String::from).collect(),
            masked: false,
            mask_reason: None,
            is_composite_base: false,
        }
    }

    #[tokio::test]
    async fn runs_dependency_before_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            spec("a", vec![], vec!["true"]),
            spec("b", vec![("a", ResultPredicate::PassOrDiff)], vec!["true"]),
        ];
        let pool = Arc::new(ResourcePool::new(vec![ResourceNode::new("0")]));
        let ctx = Arc::new(RunContext::default());
        let scheduler = DirectScheduler { workers: 2, ..Default::default() };

        let dir_path = dir.path().to_path_buf();
        let cases = scheduler
            .run(&specs, pool, ctx, &ConsoleReporter, |i| dir_path.join(i.to_string()))
            .await
            .unwrap();

        assert_eq!(cases[0].status, Status::Success);
        assert_eq!(cases[1].status, Status::Success);
    }

    #[tokio::test]
    async fn dependent_is_skipped_when_dependency_fails() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            spec("a", vec![], vec!["false"]),
            spec("b", vec![("a", ResultPredicate::PassOrDiff)], vec!["true"]),
        ];
        let pool = Arc::new(ResourcePool::new(vec![ResourceNode::new("0")]));
        let ctx = Arc::new(RunContext::default());
        let scheduler = DirectScheduler { workers: 2, ..Default::default() };

        let dir_path = dir.path().to_path_buf();
        let cases = scheduler
            .run(&specs, pool, ctx, &ConsoleReporter, |i| dir_path.join(i.to_string()))
            .await
            .unwrap();

        assert_eq!(cases[0].status, Status::Failed);
        assert_eq!(cases[1].status, Status::Skipped);
        assert_eq!(cases[1].mask_reason.as_deref(), Some("dependency failed"));
    }

    #[tokio::test]
    async fn resource_gated_case_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = spec("a", vec![], vec!["true"]);
        a.resource_request.insert("cpus".into(), 1);
        let mut b = spec("b", vec![], vec!["true"]);
        b.resource_request.insert("cpus".into(), 1);
        let specs = vec![a, b];

        let pool = Arc::new(ResourcePool::new(vec![
            ResourceNode::new("0").with_resource("cpus", vec![ResourceInstance::new("0", 1)]),
        ]));
        let ctx = Arc::new(RunContext::default());
        let scheduler = DirectScheduler { workers: 2, idle_poll: Duration::from_millis(20), ..Default::default() };

        let dir_path = dir.path().to_path_buf();
        let cases = scheduler
            .run(&specs, pool, ctx, &ConsoleReporter, |i| dir_path.join(i.to_string()))
            .await
            .unwrap();

        assert!(cases.iter().all(|c| c.status == Status::Success));
    }

    #[test]
    fn ready_order_prefers_longer_estimate_then_name() {
        let mut a = spec("a", vec![], vec!["true"]);
        a.runtime_estimate = Some(Duration::from_secs(1));
        let mut b = spec("b", vec![], vec!["true"]);
        b.runtime_estimate = Some(Duration::from_secs(10));
        let specs = vec![a, b];
        let ordered = ready_order(&specs, &[0, 1]);
        assert_eq!(ordered, vec![1, 0]);
    }
}
