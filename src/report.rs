//! Ambient observability over a session's progress. Full reporter
//! implementations (CDash, JUnit, HTML, Markdown, JSON) are external
//! collaborators; this crate carries only the trait and a console
//! implementation backed by `tracing`.

use crate::case::TestCase;
use crate::spec::TestSpec;

/// Receives execution events as a session runs. Implementations must not
/// block the scheduler — do I/O fire-and-forget or buffer internally.
pub trait Reporter: Send + Sync {
    fn on_session_start(&self, total_cases: usize) {
        let _ = total_cases;
    }

    fn on_case_start(&self, case: &TestCase) {
        let _ = case;
    }

    fn on_case_complete(&self, case: &TestCase, spec: &TestSpec) {
        let _ = (case, spec);
    }

    fn on_session_complete(&self, cases: &[TestCase]) {
        let _ = cases;
    }
}

/// Logs every transition through `tracing`, at a level proportional to
/// how interesting the outcome is.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn on_session_start(&self, total_cases: usize) {
        tracing::info!(total_cases, "session starting");
    }

    fn on_case_start(&self, case: &TestCase) {
        tracing::debug!(case = %case.case_name, "case starting");
    }

    fn on_case_complete(&self, case: &TestCase, _spec: &TestSpec) {
        if case.status.is_success_like() {
            tracing::info!(case = %case.case_name, status = ?case.status, "case completed");
        } else {
            tracing::warn!(case = %case.case_name, status = ?case.status, reason = ?case.mask_reason, "case completed");
        }
    }

    fn on_session_complete(&self, cases: &[TestCase]) {
        let failed = cases.iter().filter(|c| !c.status.is_success_like()).count();
        tracing::info!(total = cases.len(), failed, "session complete");
    }
}

/// Fans events out to every reporter in the list.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }
}

impl Reporter for MultiReporter {
    fn on_session_start(&self, total_cases: usize) {
        for r in &self.reporters {
            r.on_session_start(total_cases);
        }
    }

    fn on_case_start(&self, case: &TestCase) {
        for r in &self.reporters {
            r.on_case_start(case);
        }
    }

    fn on_case_complete(&self, case: &TestCase, spec: &TestSpec) {
        for r in &self.reporters {
            r.on_case_complete(case, spec);
        }
    }

    fn on_session_complete(&self, cases: &[TestCase]) {
        for r in &self.reporters {
            r.on_session_complete(cases);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{EnvModifiers, ExpectedOutcome, TestSpecId, WorkingDirHints};
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        completed: AtomicUsize,
    }

    impl Reporter for CountingReporter {
        fn on_case_complete(&self, _case: &TestCase, _spec: &TestSpec) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spec() -> TestSpec {
        TestSpec {
            id: TestSpecId("a".into()),
            name: "a".into(),
            family: "a".into(),
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
            command: vec![],
            masked: false,
            mask_reason: None,
            is_composite_base: false,
        }
    }

    #[test]
    fn multi_reporter_fans_out_to_every_member() {
        let spec = spec();
        let case = TestCase::new(&spec, std::path::PathBuf::from("/tmp/a"));
        let multi = MultiReporter::new()
            .add(Box::new(CountingReporter { completed: AtomicUsize::new(0) }))
            .add(Box::new(CountingReporter { completed: AtomicUsize::new(0) }));
        multi.on_case_complete(&case, &spec);
        // Exercise the default console reporter path too, since it is the
        // one actually wired into main.rs.
        ConsoleReporter.on_case_complete(&case, &spec);
    }
}
