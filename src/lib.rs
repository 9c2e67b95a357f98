//! # canary
//!
//! Execution core of a test framework for scientific and HPC software. Given a
//! set of frozen test specs, this crate resolves their dependency graph,
//! allocates CPU/GPU/custom resources, and schedules execution either
//! directly on the local machine or via batch submission to an HPC workload
//! manager (Slurm, PBS, Flux, plain shell).
//!
//! ## Architecture
//!
//! ### Data model ([`spec`], [`case`])
//!
//! [`spec::UnresolvedSpec`] → [`spec::ResolvedSpec`] → [`spec::TestSpec`] is the
//! pipeline from a generator's raw output to a frozen, content-addressed spec.
//! [`case::TestCase`] binds a `TestSpec` to a workspace directory and carries
//! its mutable runtime state.
//!
//! ### Graph and selection ([`graph`], [`selector`])
//!
//! [`graph::Graph`] answers dependency queries (ready set, toposort, cycle
//! detection). [`selector`] parses and evaluates filter expressions against
//! specs before scheduling.
//!
//! ### Resources ([`resource`])
//!
//! [`resource::ResourcePool`] accounts for CPU/GPU/custom resource instances
//! across nodes and serializes acquire/release under concurrency.
//!
//! ### Execution ([`runner`], [`scheduler`], [`batch`], [`batch_scheduler`])
//!
//! [`runner::CaseRunner`] executes one case as an isolated subprocess.
//! [`scheduler::DirectScheduler`] drives a DAG of cases to completion with a
//! worker pool. [`batch::partition`] splits a DAG into batches, which are
//! submitted to the HPC workload manager by
//! [`batch_scheduler::BatchScheduler`] through the [`backend::SubmissionBackend`]
//! trait.
//!
//! ### Persistence ([`workspace`], [`status`])
//!
//! [`workspace::Workspace`]/[`workspace::Session`] own the on-disk layout
//! described in the configuration schema. [`status::TimeKeeper`] maps exit
//! codes to statuses and maintains the advisory timing cache.
//!
//! ### External collaborators ([`generator`], [`config`], [`report`])
//!
//! [`generator::Generator`] is the narrow trait through which test-file
//! parsers plug in; this crate ships one reference implementation
//! ([`generator::json::JsonGenerator`]). [`config`] loads the stable
//! configuration schema. [`report::Reporter`] receives execution events.

pub mod backend;
pub mod batch;
pub mod batch_scheduler;
pub mod case;
pub mod config;
pub mod generator;
pub mod graph;
pub mod profiling;
pub mod report;
pub mod resource;
pub mod runner;
pub mod scheduler;
pub mod selector;
pub mod spec;
pub mod status;
pub mod workspace;

pub use case::{TestCase, TestCaseError};
pub use config::{Config, load_config};
pub use graph::Graph;
pub use resource::{ResourceAllocation, ResourcePool, ResourceRequest};
pub use scheduler::DirectScheduler;
pub use spec::{ResolvedSpec, TestSpec, UnresolvedSpec};
pub use status::Status;
pub use workspace::{Session, Workspace};
