//! [`TestCase`]: the runtime binding of a [`TestSpec`] to a workspace
//! execution directory.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::ResourceAllocation;
use crate::spec::{ParamValue, TestSpec, TestSpecId};
use crate::status::Status;

pub type TestCaseResult<T> = Result<T, TestCaseError>;

#[derive(Debug, Error)]
pub enum TestCaseError {
    #[error("case '{0}' transitioned to running more than once")]
    AlreadyRan(String),
    #[error("case '{0}' transitioned out of a terminal state ({1:?})")]
    TerminalTransition(String, Status),
}

/// Runtime state of a bound [`TestSpec`]. Holds mutable status, timing,
/// resource allocation, captured output paths, and the dependency-result
/// view used by composite base cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub spec_id: TestSpecId,
    /// `family[.<k>=<v>...]`, unique within a session.
    pub case_name: String,
    pub exec_dir: PathBuf,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub allocation: Option<ResourceAllocation>,
    pub stdout_path: Option<PathBuf>,
    pub mask_reason: Option<String>,
    /// For a composite base case: parameters of its siblings, in dependency
    /// order, projected onto a single axis name -> ordered values.
    pub sibling_parameters: Vec<(TestSpecId, std::collections::BTreeMap<String, ParamValue>)>,
    has_run: bool,
}

impl TestCase {
    pub fn new(spec: &TestSpec, exec_dir: PathBuf) -> Self {
        Self {
            spec_id: spec.id.clone(),
            case_name: case_name(spec),
            exec_dir,
            status: if spec.masked { Status::Skipped } else { Status::Created },
            exit_code: None,
            started_at: None,
            finished_at: None,
            allocation: None,
            stdout_path: None,
            mask_reason: spec.mask_reason.clone(),
            sibling_parameters: Vec::new(),
            has_run: false,
        }
    }

    pub fn mark_ready(&mut self) {
        if !self.status.is_terminal() {
            self.status = Status::Ready;
        }
    }

    pub fn mark_running(&mut self) -> TestCaseResult<()> {
        if self.status.is_terminal() {
            return Err(TestCaseError::TerminalTransition(self.case_name.clone(), self.status));
        }
        if self.has_run {
            return Err(TestCaseError::AlreadyRan(self.case_name.clone()));
        }
        self.has_run = true;
        self.status = Status::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_terminal(&mut self, status: Status, exit_code: Option<i32>) -> TestCaseResult<()> {
        if !matches!(self.status, Status::Running | Status::Created | Status::Ready | Status::Pending) {
            return Err(TestCaseError::TerminalTransition(self.case_name.clone(), self.status));
        }
        debug_assert!(status.is_terminal());
        self.status = status;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }
}

/// For a composite base case, the dependency specs' parameter maps in
/// dependency order — the value `TestCase.sibling_parameters` is populated
/// with. Empty for any non-composite-base spec.
pub fn sibling_parameters_for(
    spec: &TestSpec,
    all_specs: &[TestSpec],
) -> Vec<(TestSpecId, std::collections::BTreeMap<String, ParamValue>)> {
    if !spec.is_composite_base {
        return Vec::new();
    }
    spec.dependencies
        .iter()
        .filter_map(|(dep_id, _)| {
            all_specs
                .iter()
                .find(|s| &s.id == dep_id)
                .map(|dep| (dep_id.clone(), dep.parameters.clone()))
        })
        .collect()
}

/// `family[.<k>=<v>...]`, sorted by parameter name for stability.
pub fn case_name(spec: &TestSpec) -> String {
    if spec.parameters.is_empty() {
        return spec.family.clone();
    }
    let parts: Vec<String> = spec
        .parameters
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    format!("{}.{}", spec.family, parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EnvModifiers, ExpectedOutcome, WorkingDirHints};
    use std::collections::{BTreeMap, HashMap, HashSet};

    fn spec() -> TestSpec {
        TestSpec {
            id: TestSpecId("abc".into()),
            name: "foo".into(),
            family: "foo".into(),
            keywords: HashSet::new(),
            parameters: BTreeMap::new(),
            dependencies: Vec::new(),
            timeout: None,
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            enabled: true,
            expected: ExpectedOutcome::default(),
            command: vec!["true".into()],
            masked: false,
            mask_reason: None,
            is_composite_base: false,
        }
    }

    #[test]
    fn case_name_includes_sorted_parameters() {
        let mut s = spec();
        s.parameters.insert("b".into(), ParamValue::Int(2));
        s.parameters.insert("a".into(), ParamValue::Int(1));
        assert_eq!(case_name(&s), "foo.a=1.b=2");
    }

    #[test]
    fn running_transition_is_exactly_once() {
        let mut case = TestCase::new(&spec(), PathBuf::from("/tmp/foo"));
        case.mark_ready();
        case.mark_running().unwrap();
        assert!(matches!(case.mark_running(), Err(TestCaseError::AlreadyRan(_))));
    }

    #[test]
    fn terminal_transition_is_final() {
        let mut case = TestCase::new(&spec(), PathBuf::from("/tmp/foo"));
        case.mark_ready();
        case.mark_running().unwrap();
        case.mark_terminal(Status::Success, Some(0)).unwrap();
        assert!(matches!(
            case.mark_terminal(Status::Failed, Some(1)),
            Err(TestCaseError::TerminalTransition(_, Status::Success))
        ));
    }
}
