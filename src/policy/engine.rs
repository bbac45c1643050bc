//! Split policy engine
//!
//! Routes each test unit to the first pipeline, in configuration order,
//! whose matcher accepts it.

use std::collections::HashMap;

use super::{SplitPolicyInstance, SplitPolicyMatcher};
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::models::{TestUnitDescriptor, UnitId};

/// Where the engine sends a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// Index of the owning pipeline in configuration order
    Pipeline(usize),
    /// No matcher accepted the unit
    Unassigned,
}

/// Ordered (pipeline id, matcher) list.
///
/// Holds no per-run state; share it behind an `Arc` or clone it.
#[derive(Clone, Debug)]
pub struct SplitPolicyEngine {
    entries: Vec<(String, SplitPolicyMatcher)>,
}

impl SplitPolicyEngine {
    /// Engine from already compiled matchers, kept in the given order
    pub fn new(entries: Vec<(String, SplitPolicyMatcher)>) -> Self {
        Self { entries }
    }

    /// Compile every pipeline's policies.
    ///
    /// Ordering is not checked here; see [`crate::config::RunConfig::validate`].
    pub fn from_pipelines(pipelines: &[PipelineConfig]) -> Result<Self, ConfigError> {
        let entries = pipelines
            .iter()
            .map(|config| {
                let instance = SplitPolicyInstance::new(config);
                let matcher = instance.create_split_policy_matcher()?;
                Ok((instance.pipeline_id().to_string(), matcher))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self::new(entries))
    }

    /// First-match-wins assignment
    pub fn assign(&self, unit: &TestUnitDescriptor) -> Route {
        self.entries
            .iter()
            .position(|(_, matcher)| matcher.matches(unit))
            .map(Route::Pipeline)
            .unwrap_or(Route::Unassigned)
    }

    /// Id of the pipeline a unit is routed to, if any
    pub fn assign_id(&self, unit: &TestUnitDescriptor) -> Option<&str> {
        match self.assign(unit) {
            Route::Pipeline(index) => self.pipeline_id(index),
            Route::Unassigned => None,
        }
    }

    pub fn pipeline_id(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pipelines that can never receive a unit because an earlier pipeline
    /// is catch-all
    pub fn shadowed(&self) -> Vec<&str> {
        match self.entries.iter().position(|(_, m)| m.is_catch_all()) {
            Some(index) => self.entries[index + 1..]
                .iter()
                .map(|(id, _)| id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Dry-run assignment of a batch of units
    pub fn plan<'a, I>(&self, units: I) -> AssignmentPlan
    where
        I: IntoIterator<Item = &'a TestUnitDescriptor>,
    {
        let mut counts = vec![0usize; self.entries.len()];
        let mut unassigned = Vec::new();

        for unit in units {
            match self.assign(unit) {
                Route::Pipeline(index) => counts[index] += 1,
                Route::Unassigned => unassigned.push(unit.id().clone()),
            }
        }

        AssignmentPlan {
            counts: self
                .entries
                .iter()
                .map(|(id, _)| id.clone())
                .zip(counts)
                .collect(),
            unassigned,
        }
    }
}

/// Result of [`SplitPolicyEngine::plan`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssignmentPlan {
    /// Units per pipeline, in configuration order
    pub counts: Vec<(String, usize)>,
    pub unassigned: Vec<UnitId>,
}

impl AssignmentPlan {
    pub fn count(&self, pipeline: &str) -> Option<usize> {
        self.counts
            .iter()
            .find(|(id, _)| id == pipeline)
            .map(|(_, count)| *count)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, c)| c).sum::<usize>() + self.unassigned.len()
    }

    pub fn as_map(&self) -> HashMap<&str, usize> {
        self.counts
            .iter()
            .map(|(id, count)| (id.as_str(), *count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SplitPolicy;

    fn category(id: &str, tag: &str) -> PipelineConfig {
        PipelineConfig::new(id, 1).with_policy(SplitPolicy::CategoryMatch {
            categories: vec![tag.to_string()],
        })
    }

    fn catch_all(id: &str) -> PipelineConfig {
        PipelineConfig::new(id, 1).with_policy(SplitPolicy::Single)
    }

    fn units(slow: usize, fast: usize, plain: usize) -> Vec<TestUnitDescriptor> {
        let mut units = Vec::new();
        for i in 0..slow {
            units.push(TestUnitDescriptor::new(format!("com.acme.Slow{i}")).with_tag("slow"));
        }
        for i in 0..fast {
            units.push(TestUnitDescriptor::new(format!("com.acme.Fast{i}")).with_tag("fast"));
        }
        for i in 0..plain {
            units.push(TestUnitDescriptor::new(format!("com.acme.Plain{i}")));
        }
        units
    }

    #[test]
    fn test_first_match_wins() {
        let engine = SplitPolicyEngine::new(vec![
            ("m1".to_string(), SplitPolicyMatcher::from_fn(|_| false)),
            ("m2".to_string(), SplitPolicyMatcher::from_fn(|_| true)),
            ("m3".to_string(), SplitPolicyMatcher::from_fn(|_| true)),
        ]);
        let unit = TestUnitDescriptor::new("a.B");
        assert_eq!(engine.assign(&unit), Route::Pipeline(1));
        assert_eq!(engine.assign_id(&unit), Some("m2"));
    }

    #[test]
    fn test_overlapping_tags_go_to_earlier_pipeline() {
        let engine =
            SplitPolicyEngine::from_pipelines(&[category("slow", "slow"), category("db", "db")])
                .unwrap();
        let unit = TestUnitDescriptor::new("a.B").with_tags(["db", "slow"]);
        assert_eq!(engine.assign_id(&unit), Some("slow"));
    }

    #[test]
    fn test_unassigned_route() {
        let engine = SplitPolicyEngine::from_pipelines(&[category("slow", "slow")]).unwrap();
        let unit = TestUnitDescriptor::new("a.B").with_tag("fast");
        assert_eq!(engine.assign(&unit), Route::Unassigned);
        assert_eq!(engine.assign_id(&unit), None);
    }

    #[test]
    fn test_three_pipeline_plan() {
        let engine = SplitPolicyEngine::from_pipelines(&[
            category("slow", "slow"),
            category("fast", "fast"),
            catch_all("rest"),
        ])
        .unwrap();
        let units = units(10, 20, 70);

        let plan = engine.plan(&units);
        assert_eq!(plan.count("slow"), Some(10));
        assert_eq!(plan.count("fast"), Some(20));
        assert_eq!(plan.count("rest"), Some(70));
        assert!(plan.unassigned.is_empty());
        assert_eq!(plan.total(), 100);
        assert!(engine.shadowed().is_empty());
    }

    #[test]
    fn test_catch_all_first_shadows_everything_after() {
        let engine = SplitPolicyEngine::from_pipelines(&[
            catch_all("everything"),
            category("slow", "slow"),
            category("fast", "fast"),
        ])
        .unwrap();
        let units = units(10, 20, 70);

        let plan = engine.plan(&units);
        assert_eq!(plan.count("everything"), Some(100));
        assert_eq!(plan.count("slow"), Some(0));
        assert_eq!(plan.count("fast"), Some(0));
        assert_eq!(engine.shadowed(), vec!["slow", "fast"]);
    }

    #[test]
    fn test_catch_all_in_middle_shadows_later_only() {
        let engine = SplitPolicyEngine::from_pipelines(&[
            category("slow", "slow"),
            catch_all("everything"),
            category("fast", "fast"),
        ])
        .unwrap();

        let plan = engine.plan(&units(10, 20, 70));
        let counts = plan.as_map();
        assert_eq!(counts["slow"], 10);
        assert_eq!(counts["everything"], 90);
        assert_eq!(counts["fast"], 0);
        assert_eq!(engine.shadowed(), vec!["fast"]);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = PipelineConfig::new("bad", 1).with_policy(SplitPolicy::NameMatch {
            patterns: vec!["regex:(unclosed".to_string()],
        });
        let err = SplitPolicyEngine::from_pipelines(&[config]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
