//! Executes one [`TestCase`] as an isolated subprocess: directory
//! population, environment construction, process-group launch, timeout
//! enforcement, output capture, and exit-code status inference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resource::{ResourceAllocation, ResourcePool};
use crate::spec::{EnvModifiers, TestSpec};
use crate::status::{self, Status};

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create execution directory {0}: {1}")]
    DirectoryCreate(PathBuf, std::io::Error),
    #[error("failed to populate working directory: {0}")]
    Populate(std::io::Error),
    #[error("failed to launch subprocess: {0}")]
    Spawn(std::io::Error),
}

/// Session-level context every case runs under: inherited environment
/// modifiers, resource-id env var prefix, and the grace period between
/// SIGTERM and SIGKILL on timeout.
pub struct RunContext {
    pub session_env: EnvModifiers,
    pub env_prefix: String,
    pub grace_period: Duration,
    pub cancellation: CancellationToken,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            session_env: EnvModifiers::default(),
            env_prefix: "CANARY".to_string(),
            grace_period: Duration::from_secs(5),
            cancellation: CancellationToken::new(),
        }
    }
}

pub struct CaseRunner;

impl CaseRunner {
    /// Run `spec` in `exec_dir` with `allocation` already granted by the
    /// pool. Returns the terminal status; the caller (the scheduler) is
    /// responsible for releasing `allocation` back to `pool` afterwards —
    /// the runner only uses the pool to read allocated resource ids.
    pub async fn run(
        spec: &TestSpec,
        exec_dir: &Path,
        allocation: &ResourceAllocation,
        _pool: &ResourcePool,
        ctx: &RunContext,
    ) -> RunnerResult<(Status, Option<i32>)> {
        populate_dir(spec, exec_dir).await?;

        let env = build_environment(spec, allocation, ctx);
        let stdout_path = exec_dir.join(format!("{}-out.txt", spec.family));

        let mut command = build_command(spec, exec_dir, &env);
        let mut child = command.spawn().map_err(RunnerError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut capture = tokio::fs::File::create(&stdout_path)
            .await
            .map_err(RunnerError::Populate)?;

        let stdout_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines());
        let stderr_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines());
        let mut merged = stream::select(stdout_stream, stderr_stream);

        let timeout = spec.timeout.unwrap_or(Duration::from_secs(3600));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let exit_code;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => {
                    terminate(&mut child, ctx.grace_period).await;
                    return Ok((Status::Cancelled, None));
                }
                _ = &mut deadline => {
                    terminate(&mut child, ctx.grace_period).await;
                    return Ok((Status::Timeout, None));
                }
                line = merged.next() => {
                    match line {
                        Some(Ok(text)) => {
                            let _ = capture.write_all(text.as_bytes()).await;
                            let _ = capture.write_all(b"\n").await;
                        }
                        Some(Err(e)) => {
                            warn!("error reading case output: {e}");
                        }
                        None => break,
                    }
                }
            }
        }

        let status_result = child.wait().await.map_err(RunnerError::Spawn)?;
        exit_code = status_result.code().unwrap_or(-1);

        let base = status::status_for_exit_code(exit_code);
        let final_status = status::apply_expected_outcome(base, exit_code, &spec.expected);
        debug!(case = %spec.name, exit_code, ?final_status, "case finished");

        Ok((final_status, Some(exit_code)))
    }
}

async fn populate_dir(spec: &TestSpec, exec_dir: &Path) -> RunnerResult<()> {
    tokio::fs::create_dir_all(exec_dir)
        .await
        .map_err(|e| RunnerError::DirectoryCreate(exec_dir.to_path_buf(), e))?;

    for path in &spec.working_dir.copy {
        let src = PathBuf::from(path);
        let dst = exec_dir.join(src.file_name().unwrap_or_default());
        if src.is_dir() {
            copy_dir_all(&src, &dst).await.map_err(RunnerError::Populate)?;
        } else if src.exists() {
            tokio::fs::copy(&src, &dst).await.map_err(RunnerError::Populate)?;
        }
    }

    for path in &spec.working_dir.link {
        let src = PathBuf::from(path);
        let dst = exec_dir.join(src.file_name().unwrap_or_default());
        symlink_asset(&src, &dst).map_err(RunnerError::Populate)?;
    }

    let helper = serde_json::json!({
        "name": spec.name,
        "family": spec.family,
        "parameters": spec.parameters,
        "dependencies": spec.dependencies.iter().map(|(id, _)| id.0.clone()).collect::<Vec<_>>(),
    });
    tokio::fs::write(
        exec_dir.join("canary-case.json"),
        serde_json::to_vec_pretty(&helper).unwrap_or_default(),
    )
    .await
    .map_err(RunnerError::Populate)?;

    Ok(())
}

#[cfg(unix)]
fn symlink_asset(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink_asset(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }
    Ok(())
}

/// Build the subprocess environment: inherited -> session set/unset/path
/// modifiers -> case-level modifiers -> `%(<type>_ids)s` placeholder
/// substitution -> `<PREFIX>_<TYPE>_IDS` exports.
fn build_environment(
    spec: &TestSpec,
    allocation: &ResourceAllocation,
    ctx: &RunContext,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    apply_modifiers(&mut env, &ctx.session_env);
    apply_modifiers(&mut env, &spec.env);

    let mut ids_by_type: HashMap<String, Vec<String>> = HashMap::new();
    for grant in &allocation.grants {
        ids_by_type.entry(grant.kind.clone()).or_default().push(grant.instance_id.clone());
    }
    for ids in ids_by_type.values_mut() {
        ids.sort();
    }

    for value in env.values_mut() {
        for (kind, ids) in &ids_by_type {
            let placeholder = format!("%({kind}_ids)s");
            if value.contains(&placeholder) {
                *value = value.replace(&placeholder, &ids.join(","));
            }
        }
    }

    for (kind, ids) in &ids_by_type {
        let var = format!("{}_{}_IDS", ctx.env_prefix, kind.to_uppercase());
        env.insert(var, ids.join(","));
    }

    env
}

fn apply_modifiers(env: &mut HashMap<String, String>, modifiers: &EnvModifiers) {
    for key in &modifiers.unset {
        env.remove(key);
    }
    for (k, v) in &modifiers.set {
        env.insert(k.clone(), v.clone());
    }
    for (k, prefix) in &modifiers.prepend_path {
        let existing = env.get(k).cloned().unwrap_or_default();
        env.insert(k.clone(), format!("{prefix}:{existing}"));
    }
    for (k, suffix) in &modifiers.append_path {
        let existing = env.get(k).cloned().unwrap_or_default();
        env.insert(k.clone(), format!("{existing}:{suffix}"));
    }
}

fn build_command(spec: &TestSpec, exec_dir: &Path, env: &HashMap<String, String>) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(
        spec.command.first().cloned().unwrap_or_else(|| "true".to_string()),
    );
    command.args(spec.command.iter().skip(1));
    command.current_dir(exec_dir);
    command.env_clear();
    command.envs(env);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    command
}

/// Signal the process group (graceful first, hard kill after the grace
/// period) so a test's own children are reaped too.
async fn terminate(child: &mut tokio::process::Child, grace_period: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        if tokio::time::timeout(grace_period, child.wait()).await.is_err() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        return;
    }

    let _ = child.start_kill();
    let _ = tokio::time::timeout(grace_period, child.wait()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Grant;
    use crate::spec::{ExpectedOutcome, ResultPredicate, TestSpecId, WorkingDirHints};
    use std::collections::{BTreeMap, HashSet};

    fn spec(command: Vec<&str>) -> TestSpec {
        TestSpec {
            id: TestSpecId("x".into()),
            name: "x".into(),
            family: "x".into(),
            keywords: HashSet::new(),
            parameters: BTreeMap::new(),
            dependencies: Vec::new(),
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

    #[test]
    fn environment_exports_resource_ids() {
        let s = spec(vec!["true"]);
        let allocation = ResourceAllocation {
            grants: vec![Grant {
                node_id: "0".into(),
                kind: "cpus".into(),
                instance_id: "3".into(),
                slots: 1,
            }],
        };
        let ctx = RunContext::default();
        let env = build_environment(&s, &allocation, &ctx);
        assert_eq!(env.get("CANARY_CPUS_IDS"), Some(&"3".to_string()));
    }

    #[test]
    fn placeholder_substitution_applies() {
        let mut s = spec(vec!["true"]);
        s.env.set.insert("MY_CPUS".into(), "%(cpus_ids)s".into());
        let allocation = ResourceAllocation {
            grants: vec![Grant {
                node_id: "0".into(),
                kind: "cpus".into(),
                instance_id: "1".into(),
                slots: 1,
            }],
        };
        let ctx = RunContext::default();
        let env = build_environment(&s, &allocation, &ctx);
        assert_eq!(env.get("MY_CPUS"), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn exit_code_zero_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec(vec!["true"]);
        let allocation = ResourceAllocation::default();
        let pool = ResourcePool::new(vec![]);
        let ctx = RunContext::default();

        let (status, code) = CaseRunner::run(&s, dir.path(), &allocation, &pool, &ctx)
            .await
            .unwrap();
        assert_eq!(status, Status::Success);
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn exit_code_sixty_three_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let s = spec(vec!["sh", "-c", "exit 63"]);
        let allocation = ResourceAllocation::default();
        let pool = ResourcePool::new(vec![]);
        let ctx = RunContext::default();

        let (status, _) = CaseRunner::run(&s, dir.path(), &allocation, &pool, &ctx)
            .await
            .unwrap();
        assert_eq!(status, Status::Skipped);
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec(vec!["sleep", "5"]);
        s.timeout = Some(Duration::from_millis(50));
        let allocation = ResourceAllocation::default();
        let pool = ResourcePool::new(vec![]);
        let mut ctx = RunContext::default();
        ctx.grace_period = Duration::from_millis(50);

        let (status, code) = CaseRunner::run(&s, dir.path(), &allocation, &pool, &ctx)
            .await
            .unwrap();
        assert_eq!(status, Status::Timeout);
        assert_eq!(code, None);
    }

    #[test]
    fn result_predicate_default_accepts_diff() {
        assert!(ResultPredicate::PassOrDiff.accepts(Status::Diffed));
        assert!(!ResultPredicate::PassOnly.accepts(Status::Diffed));
    }
}
