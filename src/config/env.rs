//! `PIPESPLIT_*` environment overrides
//!
//! Values set here win over the configuration file; CLI flags win over both.

use std::env;

use super::RunConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "PIPESPLIT";

/// Overrides read from `PIPESPLIT_*` variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Config file from PIPESPLIT_CONFIG
    pub config_file: Option<String>,
    /// Log level from PIPESPLIT_LOG
    pub log_level: Option<String>,
    /// Fail-fast from PIPESPLIT_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// Grace period from PIPESPLIT_GRACE_MS
    pub grace_period_ms: Option<u64>,
    /// Quiescence timeout from PIPESPLIT_QUIESCENCE_SECS
    pub quiescence_timeout_secs: Option<u64>,
    /// Per-unit timeout from PIPESPLIT_UNIT_TIMEOUT_SECS
    pub unit_timeout_secs: Option<u64>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            config_file: get_env("CONFIG"),
            log_level: get_env("LOG"),
            fail_fast: get_env_bool("FAIL_FAST"),
            grace_period_ms: get_env_parse("GRACE_MS"),
            quiescence_timeout_secs: get_env_parse("QUIESCENCE_SECS"),
            unit_timeout_secs: get_env_parse("UNIT_TIMEOUT_SECS"),
        }
    }

    /// Any override present
    pub fn has_any(&self) -> bool {
        self.config_file.is_some()
            || self.log_level.is_some()
            || self.fail_fast.is_some()
            || self.grace_period_ms.is_some()
            || self.quiescence_timeout_secs.is_some()
            || self.unit_timeout_secs.is_some()
    }

    /// Get log level with fallback
    pub fn log_level_or(&self, default: &str) -> String {
        self.log_level.clone().unwrap_or_else(|| default.to_string())
    }

    /// Overlay the environment values on a loaded run config
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(fail_fast) = self.fail_fast {
            config.fail_fast = fail_fast;
        }
        if let Some(grace) = self.grace_period_ms {
            config.grace_period_ms = grace;
        }
        if let Some(quiescence) = self.quiescence_timeout_secs {
            config.aggregator.quiescence_timeout_secs = Some(quiescence);
        }
        if let Some(timeout) = self.unit_timeout_secs {
            config.fork.unit_timeout_secs = Some(timeout);
        }
    }

    /// Print the overrides currently in effect
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_CONFIG:             {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_LOG:                {:?}", ENV_PREFIX, self.log_level);
        println!("  {}_FAIL_FAST:          {:?}", ENV_PREFIX, self.fail_fast);
        println!("  {}_GRACE_MS:           {:?}", ENV_PREFIX, self.grace_period_ms);
        println!(
            "  {}_QUIESCENCE_SECS:    {:?}",
            ENV_PREFIX, self.quiescence_timeout_secs
        );
        println!(
            "  {}_UNIT_TIMEOUT_SECS:  {:?}",
            ENV_PREFIX, self.unit_timeout_secs
        );
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Sets `PIPESPLIT_*` variables, mostly for tests
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    /// Set config file
    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_CONFIG"), path.into()));
        self
    }

    /// Set fail-fast
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_FAIL_FAST"), fail_fast.to_string()));
        self
    }

    /// Set grace period
    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_GRACE_MS"), ms.to_string()));
        self
    }

    /// Set quiescence timeout
    pub fn quiescence_secs(mut self, secs: u64) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_QUIESCENCE_SECS"), secs.to_string()));
        self
    }

    /// Set per-unit timeout
    pub fn unit_timeout_secs(mut self, secs: u64) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_UNIT_TIMEOUT_SECS"), secs.to_string()));
        self
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all PIPESPLIT environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_CONFIG              Path to configuration file");
    println!("  {ENV_PREFIX}_LOG                 Log level (trace, debug, info, warn, error)");
    println!("  {ENV_PREFIX}_FAIL_FAST           Abort the run when a pipeline aborts (true/false)");
    println!("  {ENV_PREFIX}_GRACE_MS            Grace period for in-flight units on cancel");
    println!("  {ENV_PREFIX}_QUIESCENCE_SECS     Stall timeout without completion progress");
    println!("  {ENV_PREFIX}_UNIT_TIMEOUT_SECS   Liveness bound for a single test unit");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_FAIL_FAST=true");
    println!("  pipesplit run --config pipesplit.yaml --units units.txt");
}
