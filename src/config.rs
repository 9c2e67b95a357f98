//! Configuration loading and schema definitions for `canary`.
//!
//! Covers the stable config keys from the specification: `config`,
//! `environment`, `resource_pool`, `timeout`, `workspace`. Loaded from TOML
//! with `${VAR}`/`${VAR:-default}` environment expansion applied to every
//! string value in `environment` and `workspace`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceInstance, ResourceNode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub set: HashMap<String, String>,
    #[serde(default)]
    pub unset: Vec<String>,
    #[serde(default, rename = "prepend-path")]
    pub prepend_path: HashMap<String, String>,
    #[serde(default, rename = "append-path")]
    pub append_path: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInstanceSpec {
    pub id: String,
    pub slots: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceNodeSpec {
    pub id: String,
    #[serde(default)]
    pub cpus: Vec<ResourceInstanceSpec>,
    #[serde(default)]
    pub gpus: Vec<ResourceInstanceSpec>,
    #[serde(flatten)]
    pub custom: HashMap<String, Vec<ResourceInstanceSpec>>,
}

impl ResourceNodeSpec {
    pub fn to_runtime(&self) -> ResourceNode {
        let mut node = ResourceNode::new(self.id.clone());
        if !self.cpus.is_empty() {
            node = node.with_resource("cpus", instances(&self.cpus));
        }
        if !self.gpus.is_empty() {
            node = node.with_resource("gpus", instances(&self.gpus));
        }
        for (kind, specs) in &self.custom {
            if kind == "id" {
                continue;
            }
            node = node.with_resource(kind.clone(), instances(specs));
        }
        node
    }
}

fn instances(specs: &[ResourceInstanceSpec]) -> Vec<ResourceInstance> {
    specs.iter().map(|s| ResourceInstance::new(s.id.clone(), s.slots)).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default, with = "duration_opt")]
    pub fast: Option<Duration>,
    #[serde(default, with = "duration_opt")]
    pub long: Option<Duration>,
    #[serde(default, with = "duration_opt")]
    pub default: Option<Duration>,
    #[serde(flatten, default)]
    pub keyword: HashMap<String, String>,
}

impl TimeoutConfig {
    /// Resolve the timeout for a case given its keywords, falling back to
    /// `default`, then `fast` — a keyword timeout always wins when present.
    pub fn resolve(&self, keywords: &std::collections::HashSet<String>) -> Option<Duration> {
        for kw in keywords {
            if let Some(raw) = self.keyword.get(kw)
                && let Some(d) = parse_duration(raw)
            {
                return Some(d);
            }
        }
        self.default.or(self.fast)
    }
}

/// Parses durations like `30s`, `5m`, `2h`, or a bare integer of seconds.
/// No external crate — one unit suffix, matching the simplicity of the
/// config values this schema actually carries.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (number, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(raw.len()));
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "ms" => 0.001,
        _ => return None,
    };
    Some(Duration::from_secs_f64(value * multiplier))
}

fn format_duration(d: Duration) -> String {
    format!("{}s", d.as_secs_f64())
}

mod duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(s) => super::parse_duration(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}")))
                .map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_view")]
    pub view: String,
}

fn default_view() -> String {
    "TestResults".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub config: DebugConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub resource_pool: Vec<ResourceNodeSpec>,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

impl Config {
    pub fn resource_nodes(&self) -> Vec<ResourceNode> {
        self.resource_pool.iter().map(|n| n.to_runtime()).collect()
    }
}

/// Load configuration from a TOML file, applying environment expansion to
/// string values in `environment` and `workspace`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    load_config_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from a TOML string. Useful for tests and for
/// embedding configuration programmatically.
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    expand_env_hashmap(&mut config.environment.set)?;
    expand_env_hashmap(&mut config.environment.prepend_path)?;
    expand_env_hashmap(&mut config.environment.append_path)?;
    config.workspace.view = expand_env_value(&config.workspace.view)
        .map_err(|e| anyhow::anyhow!("Failed to expand workspace.view: {e}"))?;
    Ok(config)
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
///
/// # Errors
/// Returns error if a required variable is not set.
fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next();

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => {
                    result.push('$');
                }
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

fn expand_env_hashmap(env: &mut HashMap<String, String>) -> Result<()> {
    for (key, value) in env.iter_mut() {
        *value = expand_env_value(value)
            .map_err(|e| anyhow::anyhow!("Failed to expand env var '{key}': {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_value_no_variables() -> Result<(), String> {
        let result = expand_env_value("hello world")?;
        assert_eq!(result, "hello world");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_escaped_dollar() -> Result<(), String> {
        let result = expand_env_value("price is $$100")?;
        assert_eq!(result, "price is $100");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_multiple_escaped_dollars() -> Result<(), String> {
        let result = expand_env_value("$$$$")?;
        assert_eq!(result, "$$");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_literal_dollar_no_brace() -> Result<(), String> {
        let result = expand_env_value("$x and $y")?;
        assert_eq!(result, "$x and $y");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_empty_var_name() {
        let result = expand_env_value("${}");
        assert!(matches!(&result, Err(e) if e.contains("Empty variable name")));
    }

    #[test]
    fn test_expand_env_value_unclosed_brace() {
        let result = expand_env_value("${VAR");
        assert!(matches!(&result, Err(e) if e.contains("Unclosed variable reference")));
    }

    #[test]
    fn test_expand_env_value_var_set() -> Result<(), String> {
        let result = expand_env_value("${HOME}")?;
        assert!(!result.is_empty());
        Ok(())
    }

    #[test]
    fn test_expand_env_value_var_unset() {
        let result = expand_env_value("${_CANARY_TEST_NONEXISTENT_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_value_default_used_when_unset() -> Result<(), String> {
        let result = expand_env_value("${_CANARY_TEST_MISSING:-fallback}")?;
        assert_eq!(result, "fallback");
        Ok(())
    }

    #[test]
    fn test_expand_env_value_empty_default() -> Result<(), String> {
        let result = expand_env_value("${_CANARY_TEST_MISSING:-}")?;
        assert_eq!(result, "");
        Ok(())
    }

    #[test]
    fn parses_resource_pool_and_timeout_sections() {
        let toml = r#"
[config]
debug = true

[timeout]
default = "30s"
slow = "5m"

[workspace]
view = "Results"

[[resource_pool]]
id = "0"
cpus = [{ id = "0", slots = 4 }]
gpus = [{ id = "0", slots = 1 }]
"#;
        let config = load_config_str(toml).unwrap();
        assert!(config.config.debug);
        assert_eq!(config.workspace.view, "Results");
        assert_eq!(config.resource_pool.len(), 1);
        assert_eq!(config.resource_pool[0].cpus[0].slots, 4);
        assert_eq!(config.timeout.default, Some(Duration::from_secs(30)));

        let mut kws = std::collections::HashSet::new();
        kws.insert("slow".to_string());
        assert_eq!(config.timeout.resolve(&kws), Some(Duration::from_secs(300)));
    }

    #[test]
    fn environment_values_are_expanded_on_load() {
        std::env::set_var("_CANARY_CFG_TEST", "expanded");
        let toml = r#"
[environment]
set = { FOO = "${_CANARY_CFG_TEST}" }
"#;
        let config = load_config_str(toml).unwrap();
        assert_eq!(config.environment.set.get("FOO"), Some(&"expanded".to_string()));
        std::env::remove_var("_CANARY_CFG_TEST");
    }
}
