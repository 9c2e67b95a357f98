//! `canary` — dependency-aware test execution: resource pooling, batching,
//! and scheduling across direct and batch-queue backends.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use canary::backend;
use canary::batch::{self, BatchSpec};
use canary::batch_scheduler::{BatchScheduler, BatchSchedulerConfig};
use canary::config::{self, Config, load_config};
use canary::generator::GeneratorRegistry;
use canary::resource::{ResourceAllocation, ResourcePool};
use canary::runner::RunContext;
use canary::scheduler::DirectScheduler;
use canary::selector;
use canary::spec::{self, EnvModifiers, TestSpec};
use canary::status::Status;
use canary::workspace::{Session, Workspace};

#[derive(Parser)]
#[command(name = "canary", about = "Dependency-aware test execution core")]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Path to a TOML configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Discover, freeze, schedule, and execute the cases found under `paths`.
    Run {
        paths: Vec<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        /// Session-wide wall-clock timeout, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Keyword filter expression, e.g. `-k "fast and not slow"`.
        #[arg(short = 'k')]
        keywords: Option<String>,
    },
    /// Show the status of every case in the latest (or a named) session.
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// Print a one-line description of each spec a path would generate.
    Describe { paths: Vec<PathBuf> },
    /// Print the execution directory of a named case.
    Location {
        case_name: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Re-run the cases that did not pass in the latest (or a named) session.
    Rerun {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Submit the cases found under `paths` as batches to a workload
    /// manager instead of running them in-process.
    Submit {
        paths: Vec<PathBuf>,
        /// One of `shell`, `slurm`, `pbs`, `flux`.
        #[arg(short = 'b', long = "backend", default_value = "shell")]
        backend: String,
    },
}

fn main() -> Result<()> {
    canary::profiling::init();
    canary::profiling::set_env_start_time();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let workspace_root = cli.workspace.unwrap_or_else(|| PathBuf::from("."));
    let workspace = Workspace::open(&workspace_root);

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Run { paths, workers, timeout, keywords } => {
            cmd_run(&workspace, &config, paths, workers, timeout, keywords).await
        }
        Command::Status { session } => cmd_status(&workspace, session),
        Command::Describe { paths } => cmd_describe(paths),
        Command::Location { case_name, session } => cmd_location(&workspace, session, &case_name),
        Command::Rerun { session, workers } => cmd_rerun(&workspace, &config, session, workers).await,
        Command::Submit { paths, backend } => cmd_submit(&workspace, &config, paths, &backend).await,
    }
}

fn build_universe(paths: &[PathBuf]) -> Result<Vec<TestSpec>> {
    let registry = GeneratorRegistry::new().register(Box::new(canary::generator::json::JsonGenerator::default()));

    let mut universe = Vec::new();
    for path in paths {
        let Some(generator) = registry.find(path) else {
            tracing::warn!(path = %path.display(), "no generator matched, skipping");
            continue;
        };
        universe
            .extend(generator.lock(path).with_context(|| format!("generating specs from {}", path.display()))?);
    }

    let resolved = spec::resolve(&universe).context("resolving spec dependencies")?;
    Ok(spec::freeze_all(resolved))
}

async fn cmd_run(
    workspace: &Workspace,
    config: &Config,
    paths: Vec<PathBuf>,
    workers: Option<usize>,
    timeout: Option<u64>,
    keywords: Option<String>,
) -> Result<()> {
    let mut specs = build_universe(&paths)?;

    if let Some(expr) = &keywords {
        let parsed = selector::parse(expr).context("parsing filter expression")?;
        selector::apply_filter(&mut specs, &parsed);
    }

    let session = workspace.create_session(&specs).context("creating session")?;
    session.save_config(config).context("saving session config")?;

    let cases = schedule_direct(&session, config, &specs, workers, timeout).await?;

    session.finish(&cases, &config.workspace.view).context("finishing session")?;
    report_summary(&cases);

    let worst = cases.iter().map(|c| c.status).max_by_key(exit_rank).unwrap_or(Status::Success);
    std::process::exit(exit_code_for(worst));
}

async fn schedule_direct(
    session: &Session,
    config: &Config,
    specs: &[TestSpec],
    workers: Option<usize>,
    timeout: Option<u64>,
) -> Result<Vec<canary::TestCase>> {
    let pool = Arc::new(ResourcePool::new(config.resource_nodes()));
    let mut ctx = RunContext { session_env: to_env_modifiers(&config.environment), ..RunContext::default() };
    ctx.cancellation = install_cancellation_handler();
    let ctx = Arc::new(ctx);

    let scheduler = DirectScheduler {
        workers: workers.unwrap_or_else(default_workers),
        session_timeout: timeout.map(std::time::Duration::from_secs),
        ..DirectScheduler::default()
    };

    let reporter = canary::report::ConsoleReporter;
    reporter.on_session_start(specs.len());

    let cases = scheduler
        .run(specs, pool, ctx, &reporter, |i| session.exec_dir_for("", &canary::case::case_name(&specs[i])))
        .await
        .context("scheduling session")?;

    reporter.on_session_complete(&cases);
    Ok(cases)
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn install_cancellation_handler() -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, cancelling in-flight cases");
            child.cancel();
        }
    });
    token
}

fn cmd_status(workspace: &Workspace, session: Option<String>) -> Result<()> {
    let session = resolve_session(workspace, session)?;
    let specs = session.load_specs().context("loading session specs")?;
    for spec in &specs {
        let label = if spec.masked { spec.mask_reason.as_deref().unwrap_or("masked") } else { "pending" };
        println!("{}\t{}", spec.name, label);
    }
    Ok(())
}

fn cmd_describe(paths: Vec<PathBuf>) -> Result<()> {
    let registry = GeneratorRegistry::new().register(Box::new(canary::generator::json::JsonGenerator::default()));
    for path in &paths {
        match registry.find(path) {
            Some(generator) => println!("{}: {}", path.display(), generator.describe(path)?),
            None => println!("{}: no generator matched", path.display()),
        }
    }
    Ok(())
}

fn cmd_location(workspace: &Workspace, session: Option<String>, case_name: &str) -> Result<()> {
    let session = resolve_session(workspace, session)?;
    println!("{}", session.exec_dir_for("", case_name).display());
    Ok(())
}

async fn cmd_rerun(
    workspace: &Workspace,
    config: &Config,
    session: Option<String>,
    workers: Option<usize>,
) -> Result<()> {
    let session = resolve_session(workspace, session)?;
    let specs = session.load_specs().context("loading session specs")?;

    let cases = schedule_direct(&session, config, &specs, workers, None).await?;
    session.finish(&cases, &config.workspace.view).context("finishing rerun session")?;
    report_summary(&cases);
    Ok(())
}

/// Submits the whole case set as batches through a workload-manager backend
/// instead of running cases in-process. Each batch re-invokes `canary rerun`
/// against the shared session, so cases see identical scheduling semantics
/// whether run directly or through a batch queue.
async fn cmd_submit(workspace: &Workspace, config: &Config, paths: Vec<PathBuf>, backend_name: &str) -> Result<()> {
    let specs = build_universe(&paths)?;
    let session = workspace.create_session(&specs).context("creating session")?;
    session.save_config(config).context("saving session config")?;

    let submission_backend = backend::by_name(backend_name)
        .ok_or_else(|| anyhow::anyhow!("unknown backend '{backend_name}', expected shell/slurm/pbs/flux"))?;

    let batch_spec = BatchSpec::default();
    let case_inputs: Vec<batch::CaseInput> = specs
        .iter()
        .map(|s| batch::CaseInput {
            runtime_estimate: s.runtime_estimate.unwrap_or(std::time::Duration::from_secs(60)),
            dependencies: s
                .dependencies
                .iter()
                .filter_map(|(id, _)| specs.iter().position(|s2| &s2.id == id))
                .collect(),
            node_count: 1,
        })
        .collect();
    let batches = batch::partition(&case_inputs, &batch_spec);
    tracing::info!(batches = batches.len(), "partitioned session into batches");

    let case_deps: Vec<Vec<usize>> = case_inputs.iter().map(|c| c.dependencies.clone()).collect();
    let batch_deps = canary::batch_scheduler::batch_dependencies(&batches, &case_deps);

    let scheduler =
        BatchScheduler { backend: Arc::from(submission_backend), config: BatchSchedulerConfig::default() };

    let batches_dir = session.batches_dir();
    let exe = std::env::current_exe().context("resolving current executable")?;
    let workspace_root = workspace.root.clone();
    let session_id = session.id.clone();

    let outcomes = scheduler
        .run(
            &batches,
            &batch_deps,
            |i| {
                vec![
                    exe.to_string_lossy().to_string(),
                    "--workspace".to_string(),
                    workspace_root.to_string_lossy().to_string(),
                    "rerun".to_string(),
                    "--session".to_string(),
                    session_id.clone(),
                    "--workers".to_string(),
                    batches[i].node_count.max(1).to_string(),
                ]
            },
            |i| batches_dir.join(i.to_string()),
            |_| ResourceAllocation::default(),
        )
        .await
        .context("running batch scheduler")?;

    for (i, outcome) in outcomes.iter().enumerate() {
        println!("batch {i}: {outcome:?}");
    }
    Ok(())
}

fn report_summary(cases: &[canary::TestCase]) {
    let total = cases.len();
    let failed = cases.iter().filter(|c| !c.status.is_success_like()).count();
    println!("{total} case(s), {failed} did not pass");
}

fn resolve_session(workspace: &Workspace, session: Option<String>) -> Result<Session> {
    let id = match session {
        Some(id) => id,
        None => workspace
            .latest_session_id()
            .context("looking up latest session")?
            .ok_or_else(|| anyhow::anyhow!("no sessions found in this workspace"))?,
    };
    workspace.load_session(&id).context("loading session")
}

fn exit_rank(status: &Status) -> u8 {
    match status {
        Status::Success | Status::Xfail | Status::Xdiff | Status::Skipped => 0,
        Status::Diffed => 1,
        Status::Failed | Status::NotRun => 2,
        Status::Timeout => 3,
        Status::Cancelled => 4,
        Status::Created | Status::Ready | Status::Pending | Status::Running => {
            unreachable!("terminal status expected")
        }
    }
}

/// Exit codes are distinct per failure class so callers (CI wrappers) can
/// tell a session abort from ordinary test failures without parsing output.
/// The exact integers are local policy; see DESIGN.md.
fn exit_code_for(status: Status) -> i32 {
    match exit_rank(&status) {
        0 => 0,
        1 => 30,
        2 => 31,
        3 => 32,
        _ => 33,
    }
}

fn to_env_modifiers(env: &config::EnvironmentConfig) -> EnvModifiers {
    EnvModifiers {
        set: env.set.clone(),
        unset: env.unset.clone(),
        prepend_path: env.prepend_path.clone(),
        append_path: env.append_path.clone(),
    }
}
