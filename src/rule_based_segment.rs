use std::collections::HashSet;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::condition::Condition;
use crate::eval::{EvaluationScope, EvaluationStack};
use crate::flag::Status;
use crate::store::{Store, StoreResult};

/// RuleBasedSegment is a named audience defined by targeting conditions instead of an explicit
/// list of keys.
///
/// A key is a member when it is not excluded and at least one condition matches it. Partitions on
/// these conditions are ignored.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleBasedSegment {
    pub name: String,
    #[serde(default)]
    pub change_number: i64,
    #[serde(default)]
    pub traffic_type_name: String,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    excluded: Excluded,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    conditions: Vec<Condition>,
}

#[serde_as]
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Excluded {
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    keys: HashSet<String>,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    segments: Vec<ExcludedSegment>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ExcludedSegment {
    #[serde(rename = "type")]
    pub kind: ExcludedSegmentKind,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub enum ExcludedSegmentKind {
    #[serde(rename = "standard", alias = "regular")]
    Standard,
    #[serde(rename = "rule-based")]
    RuleBased,
    #[serde(rename = "large")]
    Large,
}

impl RuleBasedSegment {
    pub fn is_archived(&self) -> bool {
        self.status == Status::Archived
    }

    async fn is_member<S: Store>(
        &self,
        scope: &EvaluationScope<'_, S>,
        stack: &mut EvaluationStack,
    ) -> StoreResult<bool> {
        let matching_key = scope.key.matching_key();
        if self.excluded.keys.contains(matching_key) {
            return Ok(false);
        }

        for excluded in &self.excluded.segments {
            let excluded_member = match excluded.kind {
                ExcludedSegmentKind::Standard => {
                    scope
                        .store
                        .is_in_segment(&excluded.name, matching_key)
                        .await?
                }
                ExcludedSegmentKind::Large => {
                    scope
                        .store
                        .is_in_large_segment(&excluded.name, matching_key)
                        .await?
                }
                ExcludedSegmentKind::RuleBased => contains(scope, &excluded.name, stack).await?,
            };
            if excluded_member {
                return Ok(false);
            }
        }

        for condition in &self.conditions {
            if condition.matches(scope, stack).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Resolves membership of the evaluated key in the rule-based segment named `segment_name`.
///
/// Unknown and archived segments have no members. A segment that is reached again while its own
/// membership is being resolved is treated as not containing the key.
pub(crate) fn contains<'a, S: Store>(
    scope: &'a EvaluationScope<'a, S>,
    segment_name: &'a str,
    stack: &'a mut EvaluationStack,
) -> BoxFuture<'a, StoreResult<bool>> {
    async move {
        if stack.segment_chain.contains(segment_name) {
            warn!(
                "rule-based segment {} references itself; this is probably a temporary condition due to an incomplete update",
                segment_name
            );
            return Ok(false);
        }

        let segment = match scope.store.rule_based_segment(segment_name).await? {
            Some(segment) => segment,
            None => {
                debug!("rule-based segment {} not found", segment_name);
                return Ok(false);
            }
        };
        if segment.is_archived() {
            return Ok(false);
        }

        stack.segment_chain.insert(segment_name.to_string());
        let member = segment.is_member(scope, stack).await;
        stack.segment_chain.remove(segment_name);
        member
    }
    .boxed()
}
