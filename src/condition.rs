use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::eval::{EvaluationScope, EvaluationStack};
use crate::hash::BUCKETS;
use crate::matcher::Matcher;
use crate::store::{Store, StoreResult};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    #[default]
    Rollout,
    Whitelist,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Combiner {
    #[default]
    And,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub(crate) matchers: Vec<Matcher>,
}

/// A treatment together with the share of buckets, out of 100, that receive it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Partition {
    pub treatment: String,
    pub size: u32,
}

/// Condition is one targeting rule of a flag or rule-based segment.
///
/// A condition matches when every matcher in its group matches. Partitions only matter for flag
/// conditions; rule-based segments use conditions purely as membership tests.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub condition_type: ConditionType,
    pub(crate) matcher_group: MatcherGroup,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub(crate) partitions: Vec<Partition>,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub label: String,
}

impl Condition {
    pub(crate) async fn matches<S: Store>(
        &self,
        scope: &EvaluationScope<'_, S>,
        stack: &mut EvaluationStack,
    ) -> StoreResult<bool> {
        match self.matcher_group.combiner {
            Combiner::And => {
                for matcher in &self.matcher_group.matchers {
                    if !matcher.matches(scope, stack).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    pub(crate) fn unsupported_matcher_type(&self) -> Option<&str> {
        self.matcher_group
            .matchers
            .iter()
            .find_map(Matcher::unsupported_type)
    }

    /// Picks the partition whose cumulative range contains `bucket`, or None when the partitions
    /// leave that bucket uncovered.
    pub(crate) fn treatment_for_bucket(&self, bucket: u32) -> Option<&str> {
        let mut sum: u32 = 0;
        for partition in &self.partitions {
            sum = sum.saturating_add(partition.size);
            if bucket < sum {
                return Some(&partition.treatment);
            }
        }
        None
    }

    /// Returns the treatment when a single partition takes every bucket, so the key does not need
    /// to be hashed.
    pub(crate) fn single_treatment(&self) -> Option<&str> {
        match self.partitions.as_slice() {
            [partition] if partition.size >= BUCKETS => Some(&partition.treatment),
            _ => None,
        }
    }
}
