//! Reference generator: a `.specs.json` file is a JSON array of
//! [`UnresolvedSpec`] objects, read verbatim. This stands in for a real
//! framework-specific generator (pytest collection, a CTest listing, ...)
//! the way the teacher's default/generic integration stands in for one.

use std::path::Path;

use globset::Glob;

use super::{Generator, GeneratorError, GeneratorResult};
use crate::spec::UnresolvedSpec;

pub struct JsonGenerator {
    extension_glob: String,
}

impl Default for JsonGenerator {
    fn default() -> Self {
        Self { extension_glob: "*.specs.json".to_string() }
    }
}

impl Generator for JsonGenerator {
    fn matches(&self, path: &Path) -> bool {
        Glob::new(&self.extension_glob)
            .map(|g| g.compile_matcher())
            .map(|m| path.file_name().map(|n| m.is_match(n)).unwrap_or(false))
            .unwrap_or(false)
    }

    fn describe(&self, path: &Path) -> GeneratorResult<String> {
        let specs = self.lock(path)?;
        Ok(format!("{} spec(s) declared in {}", specs.len(), path.display()))
    }

    fn lock(&self, path: &Path) -> GeneratorResult<Vec<UnresolvedSpec>> {
        let content = std::fs::read_to_string(path).map_err(|e| GeneratorError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| GeneratorError::Parse(path.to_path_buf(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn matches_specs_json_extension() {
        let g = JsonGenerator::default();
        assert!(g.matches(&PathBuf::from("foo.specs.json")));
        assert!(!g.matches(&PathBuf::from("foo.pyt")));
    }

    #[test]
    fn lock_parses_spec_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.specs.json");
        std::fs::write(
            &path,
            r#"[{"source_file":"a.specs.json","name":"a","family":"a","timeout":null,"runtime_estimate":null,"when":null,"command":["true"]}]"#,
        )
        .unwrap();

        let g = JsonGenerator::default();
        let specs = g.lock(&path).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "a");
    }
}
