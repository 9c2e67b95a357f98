//! The spec pipeline: [`UnresolvedSpec`] (generator output) → [`ResolvedSpec`]
//! (dependency patterns bound to explicit references) → [`TestSpec`] (frozen,
//! content-addressed, immutable).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use globset::Glob;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SpecResult<T> = Result<T, SpecError>;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("dependency pattern '{pattern}' on '{spec}' expected {expected} matches, found {found}")]
    ExpectMismatch {
        spec: String,
        pattern: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid glob pattern '{0}': {1}")]
    BadGlob(String, String),
    #[error("dependency cycle detected: {0:?}")]
    Cycle(Vec<String>),
}

/// A parameter value: string, integer, floating point, or boolean. The
/// originating type is preserved through serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    /// Safe coercion for comparison in the filter language: numeric types
    /// compare numerically, everything else compares as strings. Never
    /// panics on mismatched types.
    pub fn compare(&self, other: &ParamValue) -> Option<std::cmp::Ordering> {
        use ParamValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Bool(a), Bool(b)) => a.partial_cmp(b),
            _ => self.to_string_repr().partial_cmp(&other.to_string_repr()),
        }
    }

    pub fn to_string_repr(&self) -> String {
        match self {
            ParamValue::String(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_repr())
    }
}

/// How a dependency's terminal result gates the dependent's readiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultPredicate {
    /// Default: dependency must be `success` or `diffed`.
    PassOrDiff,
    /// Dependency must be exactly `success`.
    PassOnly,
}

impl Default for ResultPredicate {
    fn default() -> Self {
        ResultPredicate::PassOrDiff
    }
}

impl ResultPredicate {
    pub fn accepts(&self, status: crate::status::Status) -> bool {
        use crate::status::Status::*;
        match self {
            ResultPredicate::PassOrDiff => matches!(status, Success | Diffed | Xfail | Xdiff),
            ResultPredicate::PassOnly => matches!(status, Success | Xfail),
        }
    }
}

/// A dependency declaration on an [`UnresolvedSpec`]: a name glob, an
/// optional parameter predicate, an optional expected-count, and the result
/// predicate gating readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPattern {
    pub name_glob: String,
    pub param_predicate: Option<HashMap<String, ParamValue>>,
    pub expect: Option<usize>,
    #[serde(default)]
    pub result: ResultPredicate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingDirHints {
    pub copy: Vec<String>,
    pub link: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvModifiers {
    pub set: HashMap<String, String>,
    pub unset: Vec<String>,
    pub prepend_path: HashMap<String, String>,
    pub append_path: HashMap<String, String>,
}

/// Declares that a failed/diffed status should be reinterpreted as an
/// expected outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub xfail: bool,
    pub xfail_code: Option<i32>,
    pub xdiff: bool,
}

/// A candidate test produced by a generator, before dependency resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedSpec {
    pub source_file: String,
    pub name: String,
    pub family: String,
    #[serde(default)]
    pub keywords: HashSet<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub dependency_patterns: Vec<DependencyPattern>,
    pub timeout: Option<Duration>,
    pub runtime_estimate: Option<Duration>,
    #[serde(default)]
    pub resource_request: HashMap<String, u32>,
    #[serde(default)]
    pub working_dir: WorkingDirHints,
    #[serde(default)]
    pub env: EnvModifiers,
    pub when: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub expected: ExpectedOutcome,
    pub command: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// An [`UnresolvedSpec`] whose dependency patterns have been bound to
/// explicit references. Still mutable w.r.t. mask/filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSpec {
    pub source: UnresolvedSpec,
    pub dependencies: Vec<ResolvedDependency>,
    pub masked: bool,
    pub mask_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub index: usize,
    pub result: ResultPredicate,
}

/// Resolve every unresolved spec's dependency patterns against the full
/// universe. Resolution is deterministic: matches are ordered by spec name
/// then parameter tuple.
pub fn resolve(universe: &[UnresolvedSpec]) -> SpecResult<Vec<ResolvedSpec>> {
    let mut ordered: Vec<usize> = (0..universe.len()).collect();
    ordered.sort_by(|&a, &b| {
        universe[a]
            .name
            .cmp(&universe[b].name)
            .then_with(|| format!("{:?}", universe[a].parameters).cmp(&format!("{:?}", universe[b].parameters)))
    });

    let mut resolved = Vec::with_capacity(universe.len());

    for spec in universe {
        let mut dependencies = Vec::new();
        for pattern in &spec.dependency_patterns {
            let glob = Glob::new(&pattern.name_glob)
                .map_err(|e| SpecError::BadGlob(pattern.name_glob.clone(), e.to_string()))?
                .compile_matcher();

            let mut matches: Vec<usize> = ordered
                .iter()
                .copied()
                .filter(|&i| glob.is_match(&universe[i].name))
                .filter(|&i| matches_param_predicate(&universe[i], &pattern.param_predicate))
                .collect();
            matches.sort();

            if let Some(expected) = pattern.expect
                && matches.len() != expected
            {
                return Err(SpecError::ExpectMismatch {
                    spec: spec.name.clone(),
                    pattern: pattern.name_glob.clone(),
                    expected,
                    found: matches.len(),
                });
            }

            for m in matches {
                dependencies.push(ResolvedDependency {
                    index: m,
                    result: pattern.result.clone(),
                });
            }
        }

        resolved.push(ResolvedSpec {
            source: spec.clone(),
            dependencies,
            masked: !spec.enabled,
            mask_reason: if spec.enabled {
                None
            } else {
                Some("disabled".to_string())
            },
        });
    }

    check_acyclic(&resolved)?;
    Ok(resolved)
}

fn matches_param_predicate(spec: &UnresolvedSpec, predicate: &Option<HashMap<String, ParamValue>>) -> bool {
    match predicate {
        None => true,
        Some(pred) => pred
            .iter()
            .all(|(k, v)| spec.parameters.get(k).map(|sv| sv == v).unwrap_or(false)),
    }
}

/// Tarjan's SCC over the resolved dependency graph; any component with more
/// than one member (or a self-loop) is a cycle.
fn check_acyclic(resolved: &[ResolvedSpec]) -> SpecResult<()> {
    let n = resolved.len();
    let mut index = vec![None; n];
    let mut lowlink = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut counter = 0usize;

    fn strongconnect(
        v: usize,
        resolved: &[ResolvedSpec],
        index: &mut Vec<Option<usize>>,
        lowlink: &mut Vec<usize>,
        on_stack: &mut Vec<bool>,
        stack: &mut Vec<usize>,
        counter: &mut usize,
    ) -> SpecResult<()> {
        index[v] = Some(*counter);
        lowlink[v] = *counter;
        *counter += 1;
        stack.push(v);
        on_stack[v] = true;

        for dep in &resolved[v].dependencies {
            let w = dep.index;
            if index[w].is_none() {
                strongconnect(w, resolved, index, lowlink, on_stack, stack, counter)?;
                lowlink[v] = lowlink[v].min(lowlink[w]);
            } else if on_stack[w] {
                lowlink[v] = lowlink[v].min(index[w].unwrap());
            }
        }

        if lowlink[v] == index[v].unwrap() {
            let mut component = Vec::new();
            loop {
                let w = stack.pop().unwrap();
                on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            if component.len() > 1 || resolved[v].dependencies.iter().any(|d| d.index == v) {
                return Err(SpecError::Cycle(
                    component.iter().map(|&i| resolved[i].source.name.clone()).collect(),
                ));
            }
        }
        Ok(())
    }

    for v in 0..n {
        if index[v].is_none() {
            strongconnect(v, resolved, &mut index, &mut lowlink, &mut on_stack, &mut stack, &mut counter)?;
        }
    }
    Ok(())
}

/// Stable content-addressed id for a frozen [`TestSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestSpecId(pub String);

impl std::fmt::Display for TestSpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frozen [`ResolvedSpec`]: all identifiers, parameters, and dependency ids
/// are final and addressable by a stable content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: TestSpecId,
    pub name: String,
    pub family: String,
    pub keywords: HashSet<String>,
    pub parameters: BTreeMap<String, ParamValue>,
    pub dependencies: Vec<(TestSpecId, ResultPredicate)>,
    pub timeout: Option<Duration>,
    pub runtime_estimate: Option<Duration>,
    pub resource_request: HashMap<String, u32>,
    pub working_dir: WorkingDirHints,
    pub env: EnvModifiers,
    pub enabled: bool,
    pub expected: ExpectedOutcome,
    pub command: Vec<String>,
    pub masked: bool,
    pub mask_reason: Option<String>,
    /// `true` for the synthetic composite base case created for an
    /// `analyze`-marked family.
    pub is_composite_base: bool,
}

impl TestSpec {
    fn content_hash(
        name: &str,
        parameters: &BTreeMap<String, ParamValue>,
        mut dep_ids: Vec<String>,
        timeout: Option<Duration>,
        keywords: &HashSet<String>,
        resource_request: &HashMap<String, u32>,
    ) -> TestSpecId {
        dep_ids.sort();
        let mut sorted_keywords: Vec<&String> = keywords.iter().collect();
        sorted_keywords.sort();
        let mut sorted_resources: Vec<(&String, &u32)> = resource_request.iter().collect();
        sorted_resources.sort_by_key(|(k, _)| k.clone());

        let canonical = format!(
            "{name}|{parameters:?}|{dep_ids:?}|{timeout:?}|{sorted_keywords:?}|{sorted_resources:?}"
        );
        TestSpecId(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }
}

/// Freeze a resolved universe into content-addressed [`TestSpec`]s,
/// generating composite base cases for `analyze`-marked families.
pub fn freeze_all(resolved: Vec<ResolvedSpec>) -> Vec<TestSpec> {
    let mut ids = vec![None; resolved.len()];
    let mut frozen: Vec<TestSpec> = Vec::with_capacity(resolved.len());

    // First pass: assign ids independent of dependency ids by iterating in
    // dependency order (dependencies always precede dependents because the
    // universe is acyclic).
    let order = crate::graph::toposort_indices(resolved.iter().map(|r| r.dependencies.iter().map(|d| d.index).collect()).collect());

    for &i in &order {
        let spec = &resolved[i];
        let dep_ids: Vec<String> = spec
            .dependencies
            .iter()
            .map(|d| ids[d.index].clone().unwrap())
            .collect();

        let id = TestSpec::content_hash(
            &spec.source.name,
            &spec.source.parameters,
            dep_ids.clone(),
            spec.source.timeout,
            &spec.source.keywords,
            &spec.source.resource_request,
        );
        ids[i] = Some(id.0.clone());

        frozen.push(TestSpec {
            id,
            name: spec.source.name.clone(),
            family: spec.source.family.clone(),
            keywords: spec.source.keywords.clone(),
            parameters: spec.source.parameters.clone(),
            dependencies: spec
                .dependencies
                .iter()
                .map(|d| (TestSpecId(ids[d.index].clone().unwrap()), d.result.clone()))
                .collect(),
            timeout: spec.source.timeout,
            runtime_estimate: spec.source.runtime_estimate,
            resource_request: spec.source.resource_request.clone(),
            working_dir: spec.source.working_dir.clone(),
            env: spec.source.env.clone(),
            enabled: spec.source.enabled,
            expected: spec.source.expected.clone(),
            command: spec.source.command.clone(),
            masked: spec.masked,
            mask_reason: spec.mask_reason.clone(),
            is_composite_base: false,
        });
    }

    // Second pass: one composite base case per family that has an
    // `analyze`-marked member, depending on every parameterized sibling from
    // the same source file.
    let mut families: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, spec) in resolved.iter().enumerate() {
        if spec.source.analyze {
            families
                .entry((spec.source.source_file.clone(), spec.source.family.clone()))
                .or_default();
        }
    }
    for (i, spec) in resolved.iter().enumerate() {
        if let Some(siblings) = families.get_mut(&(spec.source.source_file.clone(), spec.source.family.clone())) {
            siblings.push(i);
        }
    }

    for ((_, family), siblings) in families {
        let dep_ids: Vec<String> = siblings.iter().map(|&i| ids[i].clone().unwrap()).collect();
        let params: BTreeMap<String, ParamValue> = BTreeMap::new();
        let id = TestSpec::content_hash(&family, &params, dep_ids.clone(), None, &HashSet::new(), &HashMap::new());

        frozen.push(TestSpec {
            id,
            name: family.clone(),
            family,
            keywords: HashSet::new(),
            parameters: params,
            dependencies: dep_ids
                .into_iter()
                .map(|d| (TestSpecId(d), ResultPredicate::PassOrDiff))
                .collect(),
            timeout: None,
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            enabled: true,
            expected: ExpectedOutcome::default(),
            command: Vec::new(),
            masked: false,
            mask_reason: None,
            is_composite_base: true,
        });
    }

    frozen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: Vec<DependencyPattern>) -> UnresolvedSpec {
        UnresolvedSpec {
            source_file: "t.pyt".into(),
            name: name.into(),
            family: name.into(),
            keywords: HashSet::new(),
            parameters: BTreeMap::new(),
            dependency_patterns: deps,
            timeout: None,
            runtime_estimate: None,
            resource_request: HashMap::new(),
            working_dir: WorkingDirHints::default(),
            env: EnvModifiers::default(),
            when: None,
            enabled: true,
            analyze: false,
            expected: ExpectedOutcome::default(),
            command: vec!["true".into()],
        }
    }

    fn dep(glob: &str) -> DependencyPattern {
        DependencyPattern {
            name_glob: glob.into(),
            param_predicate: None,
            expect: None,
            result: ResultPredicate::PassOrDiff,
        }
    }

    #[test]
    fn freeze_is_deterministic_on_identical_input() {
        let universe = vec![spec("a", vec![]), spec("b", vec![dep("a")])];
        let frozen1 = freeze_all(resolve(&universe).unwrap());
        let frozen2 = freeze_all(resolve(&universe).unwrap());
        assert_eq!(
            frozen1.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            frozen2.iter().map(|s| s.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let universe = vec![spec("a", vec![dep("b")]), spec("b", vec![dep("a")])];
        assert!(matches!(resolve(&universe), Err(SpecError::Cycle(_))));
    }

    #[test]
    fn expect_mismatch_is_an_error() {
        let mut d = dep("a");
        d.expect = Some(2);
        let universe = vec![spec("a", vec![]), spec("b", vec![d])];
        assert!(matches!(resolve(&universe), Err(SpecError::ExpectMismatch { .. })));
    }

    #[test]
    fn disabled_spec_is_masked() {
        let mut s = spec("a", vec![]);
        s.enabled = false;
        let resolved = resolve(&[s]).unwrap();
        assert!(resolved[0].masked);
    }

    #[test]
    fn composite_base_projects_sibling_parameters_in_dependency_order() {
        let mut children = Vec::new();
        for (i, v) in [1i64, 2, 3].into_iter().enumerate() {
            let mut s = spec(&format!("c{i}"), vec![]);
            s.family = "c".into();
            s.analyze = true;
            s.parameters.insert("a".into(), ParamValue::Int(v));
            children.push(s);
        }

        let frozen = freeze_all(resolve(&children).unwrap());
        let base = frozen.iter().find(|s| s.is_composite_base).expect("composite base created");
        assert_eq!(base.dependencies.len(), 3);

        let sibling_parameters = crate::case::sibling_parameters_for(base, &frozen);
        let values: Vec<i64> = sibling_parameters
            .iter()
            .map(|(_, params)| match params.get("a") {
                Some(ParamValue::Int(v)) => *v,
                other => panic!("expected an int parameter 'a', got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }
}
