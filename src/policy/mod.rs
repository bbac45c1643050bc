//! Split policies
//!
//! A split policy decides whether a test unit belongs to a pipeline. Each
//! pipeline's policies compile into one [`SplitPolicyMatcher`], a pure
//! predicate that can be shared freely across threads.

mod engine;

pub use engine::{AssignmentPlan, Route, SplitPolicyEngine};

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::models::TestUnitDescriptor;

/// How a composite policy combines its children
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    /// Every child must accept
    All,
    /// At least one child must accept
    #[default]
    Any,
}

/// Rule deciding which units a pipeline takes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Catch-all: accepts every unit
    Single,
    /// Accepts units carrying any of the listed tags
    CategoryMatch { categories: Vec<String> },
    /// Accepts units whose class name matches any glob pattern
    /// (`*` any run of characters, `?` exactly one). A `regex:` prefix
    /// takes the rest of the pattern as a raw regular expression.
    NameMatch { patterns: Vec<String> },
    /// Boolean combination of other policies
    Composite {
        #[serde(default)]
        mode: CompositeMode,
        policies: Vec<SplitPolicy>,
    },
    /// Accepts exactly the units the inner policy rejects
    Not { policy: Box<SplitPolicy> },
}

impl SplitPolicy {
    /// True when the policy statically accepts every unit.
    ///
    /// Conservative: a `false` answer does not prove the policy rejects
    /// something.
    pub fn is_catch_all(&self) -> bool {
        match self {
            SplitPolicy::Single => true,
            SplitPolicy::CategoryMatch { .. } => false,
            SplitPolicy::NameMatch { patterns } => patterns.iter().any(|p| p == "*"),
            SplitPolicy::Composite {
                mode: CompositeMode::All,
                policies,
            } => !policies.is_empty() && policies.iter().all(SplitPolicy::is_catch_all),
            SplitPolicy::Composite {
                mode: CompositeMode::Any,
                policies,
            } => policies.iter().any(SplitPolicy::is_catch_all),
            SplitPolicy::Not { .. } => false,
        }
    }

    /// Structural checks, run at startup
    pub fn validate(&self, pipeline: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy {
            pipeline: pipeline.to_string(),
            reason: reason.to_string(),
        };

        match self {
            SplitPolicy::Single => Ok(()),
            SplitPolicy::CategoryMatch { categories } => {
                if categories.is_empty() {
                    return Err(invalid("category_match needs at least one category"));
                }
                if categories.iter().any(|c| c.trim().is_empty()) {
                    return Err(invalid("category_match has an empty category"));
                }
                Ok(())
            }
            SplitPolicy::NameMatch { patterns } => {
                if patterns.is_empty() {
                    return Err(invalid("name_match needs at least one pattern"));
                }
                Ok(())
            }
            SplitPolicy::Composite { policies, .. } => {
                if policies.is_empty() {
                    return Err(invalid("composite needs at least one policy"));
                }
                policies.iter().try_for_each(|p| p.validate(pipeline))
            }
            SplitPolicy::Not { policy } => policy.validate(pipeline),
        }
    }

    fn compile(&self, pipeline: &str) -> Result<Predicate, ConfigError> {
        let predicate: Predicate = match self {
            SplitPolicy::Single => Arc::new(|_: &TestUnitDescriptor| true),
            SplitPolicy::CategoryMatch { categories } => {
                let categories = categories.clone();
                Arc::new(move |unit: &TestUnitDescriptor| {
                    categories.iter().any(|c| unit.has_tag(c))
                })
            }
            SplitPolicy::NameMatch { patterns } => {
                let set = compile_globs(pipeline, patterns)?;
                Arc::new(move |unit: &TestUnitDescriptor| set.is_match(unit.name()))
            }
            SplitPolicy::Composite { mode, policies } => {
                let children = policies
                    .iter()
                    .map(|p| p.compile(pipeline))
                    .collect::<Result<Vec<_>, _>>()?;
                match mode {
                    CompositeMode::All => Arc::new(move |unit: &TestUnitDescriptor| {
                        children.iter().all(|c| c(unit))
                    }),
                    CompositeMode::Any => Arc::new(move |unit: &TestUnitDescriptor| {
                        children.iter().any(|c| c(unit))
                    }),
                }
            }
            SplitPolicy::Not { policy } => {
                let inner = policy.compile(pipeline)?;
                Arc::new(move |unit: &TestUnitDescriptor| !inner(unit))
            }
        };
        Ok(predicate)
    }
}

type Predicate = Arc<dyn Fn(&TestUnitDescriptor) -> bool + Send + Sync>;

/// Compiled form of a pipeline's split policies.
///
/// Holds only captured configuration, so cloning and concurrent evaluation
/// are free.
#[derive(Clone)]
pub struct SplitPolicyMatcher {
    predicate: Predicate,
    catch_all: bool,
}

impl SplitPolicyMatcher {
    /// Matcher from an arbitrary predicate
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&TestUnitDescriptor) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            catch_all: false,
        }
    }

    /// Constant-true matcher
    pub fn accept_all() -> Self {
        Self {
            predicate: Arc::new(|_: &TestUnitDescriptor| true),
            catch_all: true,
        }
    }

    pub fn matches(&self, unit: &TestUnitDescriptor) -> bool {
        (self.predicate)(unit)
    }

    pub fn is_catch_all(&self) -> bool {
        self.catch_all
    }
}

impl fmt::Debug for SplitPolicyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitPolicyMatcher")
            .field("catch_all", &self.catch_all)
            .finish_non_exhaustive()
    }
}

/// A pipeline's split policies, bound to that pipeline
#[derive(Clone, Debug)]
pub struct SplitPolicyInstance {
    pipeline_id: String,
    policies: Vec<SplitPolicy>,
}

impl SplitPolicyInstance {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            pipeline_id: config.id.clone(),
            policies: config.policies.clone(),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Compile the policies into a matcher that accepts a unit when any
    /// policy accepts it.
    pub fn create_split_policy_matcher(&self) -> Result<SplitPolicyMatcher, ConfigError> {
        if self.policies.iter().any(SplitPolicy::is_catch_all) {
            return Ok(SplitPolicyMatcher::accept_all());
        }

        let mut compiled = self
            .policies
            .iter()
            .map(|p| p.compile(&self.pipeline_id))
            .collect::<Result<Vec<_>, _>>()?;

        let predicate: Predicate = if compiled.len() == 1 {
            compiled.remove(0)
        } else {
            Arc::new(move |unit: &TestUnitDescriptor| compiled.iter().any(|p| p(unit)))
        };

        Ok(SplitPolicyMatcher {
            predicate,
            catch_all: false,
        })
    }
}

fn compile_globs(pipeline: &str, patterns: &[String]) -> Result<RegexSet, ConfigError> {
    RegexSet::new(patterns.iter().map(|p| glob_to_regex(p))).map_err(|e| {
        ConfigError::InvalidPattern {
            pipeline: pipeline.to_string(),
            pattern: patterns.join(", "),
            reason: e.to_string(),
        }
    })
}

fn glob_to_regex(glob: &str) -> String {
    if let Some(raw) = glob.strip_prefix("regex:") {
        return raw.to_string();
    }

    let mut regex = String::with_capacity(glob.len() + 8);
    regex.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, tags: &[&str]) -> TestUnitDescriptor {
        TestUnitDescriptor::new(name).with_tags(tags.iter().copied())
    }

    fn matcher(policies: Vec<SplitPolicy>) -> SplitPolicyMatcher {
        let mut config = PipelineConfig::new("p", 1);
        config.policies = policies;
        SplitPolicyInstance::new(&config)
            .create_split_policy_matcher()
            .unwrap()
    }

    #[test]
    fn test_single_accepts_everything() {
        let m = matcher(vec![SplitPolicy::Single]);
        assert!(m.is_catch_all());
        assert!(m.matches(&unit("a.B", &[])));
        assert!(m.matches(&unit("", &["anything"])));
    }

    #[test]
    fn test_category_match() {
        let m = matcher(vec![SplitPolicy::CategoryMatch {
            categories: vec!["slow".to_string(), "db".to_string()],
        }]);
        assert!(m.matches(&unit("a.B", &["db"])));
        assert!(!m.matches(&unit("a.B", &["fast"])));
        assert!(!m.matches(&unit("a.B", &["Slow"])));
    }

    #[test]
    fn test_name_match_globs() {
        let m = matcher(vec![SplitPolicy::NameMatch {
            patterns: vec!["com.acme.*IT".to_string(), "org.?ther.Test".to_string()],
        }]);
        assert!(m.matches(&unit("com.acme.db.OrderIT", &[])));
        assert!(m.matches(&unit("org.other.Test", &[])));
        assert!(!m.matches(&unit("com.acme.OrderTest", &[])));
        // dots are literal
        assert!(!m.matches(&unit("comXacme.OrderIT", &[])));
    }

    #[test]
    fn test_name_match_raw_regex() {
        let m = matcher(vec![SplitPolicy::NameMatch {
            patterns: vec![r"regex:^com\.acme\.(db|cache)\.".to_string()],
        }]);
        assert!(m.matches(&unit("com.acme.db.OrderTest", &[])));
        assert!(m.matches(&unit("com.acme.cache.LruTest", &[])));
        assert!(!m.matches(&unit("com.acme.web.PageTest", &[])));
    }

    #[test]
    fn test_composite_and_not() {
        let m = matcher(vec![SplitPolicy::Composite {
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
        }]);
        assert!(m.matches(&unit("a.DbIntegrationTest", &[])));
        assert!(!m.matches(&unit("a.DbIntegrationTest", &["flaky"])));
        assert!(!m.matches(&unit("a.DbTest", &[])));
    }

    #[test]
    fn test_multiple_policies_are_any() {
        let m = matcher(vec![
            SplitPolicy::CategoryMatch {
                categories: vec!["slow".to_string()],
            },
            SplitPolicy::NameMatch {
                patterns: vec!["*Slow*".to_string()],
            },
        ]);
        assert!(m.matches(&unit("a.B", &["slow"])));
        assert!(m.matches(&unit("a.SlowThing", &[])));
        assert!(!m.matches(&unit("a.Fast", &[])));
    }

    #[test]
    fn test_is_catch_all_detection() {
        assert!(SplitPolicy::NameMatch {
            patterns: vec!["*".to_string()]
        }
        .is_catch_all());
        assert!(SplitPolicy::Composite {
            mode: CompositeMode::Any,
            policies: vec![
                SplitPolicy::CategoryMatch {
                    categories: vec!["x".to_string()]
                },
                SplitPolicy::Single,
            ],
        }
        .is_catch_all());
        assert!(!SplitPolicy::Composite {
            mode: CompositeMode::All,
            policies: Vec::new(),
        }
        .is_catch_all());
        assert!(!SplitPolicy::Not {
            policy: Box::new(SplitPolicy::Single)
        }
        .is_catch_all());
    }

    #[test]
    fn test_validate_rejects_empty_lists() {
        let empty_categories = SplitPolicy::CategoryMatch {
            categories: Vec::new(),
        };
        assert!(matches!(
            empty_categories.validate("p"),
            Err(ConfigError::InvalidPolicy { .. })
        ));

        let nested = SplitPolicy::Not {
            policy: Box::new(SplitPolicy::NameMatch {
                patterns: Vec::new(),
            }),
        };
        assert!(nested.validate("p").is_err());
    }

    #[test]
    fn test_policy_serde_tags() {
        let yaml = r#"
- type: single
- type: category_match
  categories: [slow]
- type: composite
  policies:
    - type: name_match
      patterns: ["*IT"]
"#;
        let policies: Vec<SplitPolicy> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policies[0], SplitPolicy::Single);
        assert!(matches!(
            &policies[2],
            SplitPolicy::Composite {
                mode: CompositeMode::Any,
                ..
            }
        ));
    }

    #[test]
    fn test_matcher_shared_across_threads() {
        let m = matcher(vec![SplitPolicy::CategoryMatch {
            categories: vec!["slow".to_string()],
        }]);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let m = m.clone();
                std::thread::spawn(move || {
                    let tag = if i % 2 == 0 { "slow" } else { "fast" };
                    m.matches(&unit("a.B", &[tag]))
                })
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![true, false, true, false]);
    }
}
