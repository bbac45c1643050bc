//! Run configuration files
//!
//! A YAML or JSON document holding the pipelines, fork tuning and
//! aggregator settings. `pipesplit config init` writes [`ConfigFile::example`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{ForkSettings, PipelineConfig, RunConfig, WorkerEnvironment};
use crate::policy::{CompositeMode, SplitPolicy};

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./pipesplit.yaml",
    "./pipesplit.yml",
    "./.pipesplit.yaml",
    "./.pipesplit/config.yaml",
    "~/.config/pipesplit/config.yaml",
];

/// Supported config file versions
const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Full configuration file structure
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Version of config file format
    #[serde(default = "default_version")]
    pub version: String,

    /// Default log level for the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Run settings
    #[serde(flatten)]
    pub run: RunConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: None,
            run: RunConfig::default(),
        }
    }
}

impl ConfigFile {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from file without validating it
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate version and run configuration
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }
        self.run
            .validate()
            .context("Invalid pipeline configuration")?;
        Ok(())
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let worker = WorkerEnvironment::command("./gradlew")
            .arg("-q")
            .arg("testWorker")
            .env("JAVA_OPTS", "-Xmx512m");

        Self {
            version: default_version(),
            log_level: Some("info".to_string()),
            run: RunConfig {
                pipelines: vec![
                    PipelineConfig::new("slow", 2)
                        .with_worker(worker.clone())
                        .with_policy(SplitPolicy::CategoryMatch {
                            categories: vec!["slow".to_string()],
                        }),
                    PipelineConfig::new("integration", 2)
                        .with_worker(worker.clone())
                        .with_policy(SplitPolicy::Composite {
                            mode: CompositeMode::All,
                            policies: vec![
                                SplitPolicy::NameMatch {
                                    patterns: vec!["*IntegrationTest".to_string()],
                                },
                                SplitPolicy::Not {
                                    policy: Box::new(SplitPolicy::CategoryMatch {
                                        categories: vec!["flaky".to_string()],
                                    }),
                                },
                            ],
                        })
                        .with_queue_capacity(64),
                    PipelineConfig::new("default", 4)
                        .with_worker(worker)
                        .with_policy(SplitPolicy::Single)
                        .with_backlog_warning(1_000),
                ],
                fail_fast: false,
                grace_period_ms: 5_000,
                fork: ForkSettings::default(),
                aggregator: Default::default(),
            },
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_file_default() {
        let config = ConfigFile::default();
        assert_eq!(config.version, "1.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_example() {
        let config = ConfigFile::example();
        assert_eq!(config.run.pipelines.len(), 3);
        assert!(config.run.pipelines[2].is_catch_all());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_save_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("pipesplit.yaml");

        let config = ConfigFile::example();
        config.save(&path).unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_file_save_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipesplit.json");

        let config = ConfigFile::example();
        config.save(&path).unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.run.pipelines[0].id, "slow");
    }

    #[test]
    fn test_load_rejects_bad_ordering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            r#"
pipelines:
  - id: everything
    policies: [{ type: single }]
  - id: slow
    policies: [{ type: category_match, categories: [slow] }]
"#,
        )
        .unwrap();

        let err = ConfigFile::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("must be last"));

        // Reading alone still works, so the ordering problem can be shown.
        let raw = ConfigFile::read(&path).unwrap();
        assert_eq!(raw.run.pipelines.len(), 2);
    }

    #[test]
    fn test_unsupported_version() {
        let config = ConfigFile {
            version: "9.9".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path("./test.yaml");
        assert_eq!(path, PathBuf::from("./test.yaml"));
    }
}
