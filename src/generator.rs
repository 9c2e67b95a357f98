//! The generator boundary: turns a source file on disk into zero or more
//! [`UnresolvedSpec`]s. Framework-specific generators (pytest-style,
//! CTest-style, a YAML DSL) are external collaborators; this crate ships
//! only the narrow trait and one reference implementation.

pub mod json;

use std::path::Path;

use thiserror::Error;

use crate::spec::UnresolvedSpec;

pub type GeneratorResult<T> = Result<T, GeneratorError>;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("io error reading {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(std::path::PathBuf, String),
}

/// A pluggable producer of test specs from a source file.
pub trait Generator: Send + Sync {
    /// Does this generator claim `path` as a source file it can read?
    fn matches(&self, path: &Path) -> bool;

    /// A one-line human-readable description of what `path` would produce,
    /// without fully resolving dependencies — used by the `describe` CLI
    /// subcommand.
    fn describe(&self, path: &Path) -> GeneratorResult<String>;

    /// Fully parse `path` into the specs it declares.
    fn lock(&self, path: &Path) -> GeneratorResult<Vec<UnresolvedSpec>>;
}

/// Registry of generators tried in order; the first whose `matches`
/// returns `true` handles the file.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: Vec<Box<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, generator: Box<dyn Generator>) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn find(&self, path: &Path) -> Option<&dyn Generator> {
        self.generators.iter().find(|g| g.matches(path)).map(|g| g.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct AlwaysMatches;
    impl Generator for AlwaysMatches {
        fn matches(&self, _path: &Path) -> bool {
            true
        }
        fn describe(&self, _path: &Path) -> GeneratorResult<String> {
            Ok("always".to_string())
        }
        fn lock(&self, _path: &Path) -> GeneratorResult<Vec<UnresolvedSpec>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_finds_first_matching_generator() {
        let registry = GeneratorRegistry::new().register(Box::new(AlwaysMatches));
        assert!(registry.find(&PathBuf::from("anything.txt")).is_some());
    }
}
