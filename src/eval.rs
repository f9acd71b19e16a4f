use std::collections::HashSet;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::attribute_value::Attributes;
use crate::condition::ConditionType;
use crate::flag::Flag;
use crate::key::Key;
use crate::store::{Store, StoreResult};
use crate::util::is_false;

/// The treatment returned when no real treatment could be computed.
pub const CONTROL: &str = "control";

/// Labels explaining how a treatment was chosen. Results produced by a matching condition carry
/// that condition's own label instead.
pub mod label {
    pub const DEFINITION_NOT_FOUND: &str = "definition not found";
    pub const ARCHIVED: &str = "archived";
    pub const KILLED: &str = "killed";
    pub const NOT_IN_SPLIT: &str = "not in split";
    pub const DEFAULT_RULE: &str = "default rule";
    pub const PREREQUISITES_NOT_SATISFIED: &str = "prerequisites not satisfied";
    pub const EXCEPTION: &str = "exception";
    pub const UNSUPPORTED_MATCHER: &str = "targeting rule type unsupported by sdk";
    /// Prepended to the original label when a fallback treatment replaces `control`.
    pub const FALLBACK_PREFIX: &str = "fallback - ";
}

/// EvaluationResult is the outcome of evaluating one flag for one key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// The treatment the key receives.
    pub treatment: String,
    /// Why that treatment was chosen.
    pub label: String,
    /// The configuration attached to the treatment by the flag, if any.
    pub config: Option<String>,
    /// The change number of the flag definition that produced the result. Absent when no
    /// definition was involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<i64>,
    /// Whether impressions for this flag should not be recorded.
    #[serde(default, skip_serializing_if = "is_false")]
    pub impressions_disabled: bool,
}

impl EvaluationResult {
    /// A `control` result with the given label and nothing else.
    pub fn control(label: &str) -> Self {
        EvaluationResult {
            treatment: CONTROL.to_string(),
            label: label.to_string(),
            config: None,
            change_number: None,
            impressions_disabled: false,
        }
    }

    pub fn not_found() -> Self {
        Self::control(label::DEFINITION_NOT_FOUND)
    }

    pub fn exception() -> Self {
        Self::control(label::EXCEPTION)
    }

    pub fn is_control(&self) -> bool {
        self.treatment == CONTROL
    }
}

/// The inputs shared by every step of one evaluation.
pub(crate) struct EvaluationScope<'a, S> {
    pub(crate) store: &'a S,
    pub(crate) key: &'a Key,
    pub(crate) attributes: Option<&'a Attributes>,
}

impl<'a, S> EvaluationScope<'a, S> {
    pub(crate) fn new(store: &'a S, key: &'a Key, attributes: Option<&'a Attributes>) -> Self {
        Self {
            store,
            key,
            attributes,
        }
    }
}

const PREALLOCATED_FLAG_CHAIN_SIZE: usize = 20;
const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

/// Names of the flags and rule-based segments currently being resolved, used to break reference
/// cycles between definitions.
pub(crate) struct EvaluationStack {
    pub(crate) flag_chain: HashSet<String>,
    pub(crate) segment_chain: HashSet<String>,
}

impl EvaluationStack {
    fn new() -> Self {
        Self {
            flag_chain: HashSet::with_capacity(PREALLOCATED_FLAG_CHAIN_SIZE),
            segment_chain: HashSet::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
        }
    }
}

impl Default for EvaluationStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate `flag` for the key and attributes in `scope`.
///
/// Storage failures never escape: the flag resolves to `control` with the `exception` label.
pub(crate) async fn evaluate_flag<S: Store>(
    scope: &EvaluationScope<'_, S>,
    flag: &Flag,
    stack: &mut EvaluationStack,
) -> EvaluationResult {
    match evaluate_internal(scope, flag, stack).await {
        Ok(result) => result,
        Err(e) => {
            error!("failed to evaluate flag {}: {}", flag.name, e);
            flag.control(label::EXCEPTION)
        }
    }
}

async fn evaluate_internal<S: Store>(
    scope: &EvaluationScope<'_, S>,
    flag: &Flag,
    stack: &mut EvaluationStack,
) -> StoreResult<EvaluationResult> {
    if flag.is_archived() {
        return Ok(flag.control(label::ARCHIVED));
    }

    if flag.is_killed() {
        return Ok(flag.default_result(label::KILLED));
    }

    stack.flag_chain.insert(flag.name.clone());
    let result = evaluate_rules(scope, flag, stack).await;
    stack.flag_chain.remove(&flag.name);
    result
}

async fn evaluate_rules<S: Store>(
    scope: &EvaluationScope<'_, S>,
    flag: &Flag,
    stack: &mut EvaluationStack,
) -> StoreResult<EvaluationResult> {
    for prerequisite in &flag.prerequisites {
        let treatment = evaluate_dependency(scope, &prerequisite.flag_name, stack).await;
        let satisfied =
            treatment.is_some_and(|treatment| prerequisite.treatments.contains(&treatment));
        if !satisfied {
            debug!(
                "prerequisite {} of flag {} not satisfied",
                prerequisite.flag_name, flag.name
            );
            return Ok(flag.default_result(label::PREREQUISITES_NOT_SATISFIED));
        }
    }

    if let Some(matcher_type) = flag.unsupported_matcher_type() {
        warn!(
            "flag {} uses matcher type {} which is not supported",
            flag.name, matcher_type
        );
        if !in_traffic_allocation(scope, flag) {
            return Ok(flag.default_result(label::NOT_IN_SPLIT));
        }
        return Ok(flag.control(label::UNSUPPORTED_MATCHER));
    }

    // Whitelist conditions ahead of the first rollout apply to every key.
    let mut traffic_checked = false;
    for condition in &flag.conditions {
        if !traffic_checked && condition.condition_type == ConditionType::Rollout {
            traffic_checked = true;
            if !in_traffic_allocation(scope, flag) {
                return Ok(flag.default_result(label::NOT_IN_SPLIT));
            }
        }

        if condition.matches(scope, stack).await? {
            let treatment = condition.single_treatment().or_else(|| {
                let bucket = flag
                    .hash_algorithm()
                    .bucket(scope.key.bucketing_key(), flag.seed);
                condition.treatment_for_bucket(bucket)
            });
            return Ok(match treatment {
                Some(treatment) => flag.result(treatment, &condition.label),
                None => {
                    warn!(
                        "partitions of flag {} do not cover the bucket of key {}",
                        flag.name, scope.key
                    );
                    flag.control(&condition.label)
                }
            });
        }
    }

    Ok(flag.default_result(label::DEFAULT_RULE))
}

fn in_traffic_allocation<S>(scope: &EvaluationScope<'_, S>, flag: &Flag) -> bool {
    if !flag.has_traffic_allocation() {
        return true;
    }
    let bucket = flag
        .hash_algorithm()
        .bucket(scope.key.bucketing_key(), flag.traffic_allocation_seed);
    bucket < flag.traffic_allocation
}

/// Evaluate the flag named `flag_name` for the same key and attributes, returning its treatment.
///
/// Used by prerequisites and dependency matchers. A flag that is missing, cannot be fetched, fails
/// to evaluate or is already being evaluated further up the chain yields None.
pub(crate) fn evaluate_dependency<'a, S: Store>(
    scope: &'a EvaluationScope<'a, S>,
    flag_name: &'a str,
    stack: &'a mut EvaluationStack,
) -> BoxFuture<'a, Option<String>> {
    async move {
        if stack.flag_chain.contains(flag_name) {
            warn!(
                "dependency on flag {} caused a circular reference; this is probably a temporary condition due to an incomplete update",
                flag_name
            );
            return None;
        }

        let flag = match scope.store.flag(flag_name).await {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                debug!("dependency flag {} not found", flag_name);
                return None;
            }
            Err(e) => {
                warn!("failed to fetch dependency flag {}: {}", flag_name, e);
                return None;
            }
        };

        match evaluate_internal(scope, &flag, stack).await {
            Ok(result) => Some(result.treatment),
            Err(e) => {
                warn!("failed to evaluate dependency flag {}: {}", flag_name, e);
                None
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Local, SyncStore};
    use crate::test_common::TestStore;
    use assert_json_diff::assert_json_eq;
    use futures::executor::block_on;
    use maplit::hashmap;
    use proptest::prelude::*;
    use serde_json::json;
    use spectral::prelude::*;
    use test_case::test_case;

    fn eval(
        store: &TestStore,
        flag_name: &str,
        key: Key,
        attributes: Option<&Attributes>,
    ) -> EvaluationResult {
        let store = Local(store.clone());
        let flag = store
            .0
            .flag(flag_name)
            .expect("no store error")
            .expect("flag should exist");
        let scope = EvaluationScope::new(&store, &key, attributes);
        block_on(evaluate_flag(&scope, &flag, &mut EvaluationStack::default()))
    }

    fn eval_key(flag_name: &str, key: &str) -> EvaluationResult {
        eval(&TestStore::new(), flag_name, Key::new(key), None)
    }

    fn assert_result(result: &EvaluationResult, treatment: &str, label: &str) {
        assert_that!(result.treatment.as_str()).is_equal_to(treatment);
        assert_that!(result.label.as_str()).is_equal_to(label);
    }

    #[test_case("alice", "on")]
    #[test_case("bob", "off")]
    #[test_case("carol", "off")]
    #[test_case("dave", "off")]
    fn rollout_partitions(key: &str, treatment: &str) {
        let result = eval_key("on_off", key);
        assert_result(&result, treatment, "in segment all");
        assert_that!(result.change_number).is_equal_to(Some(123));
    }

    #[test]
    fn config_follows_treatment() {
        let on = eval_key("on_off", "alice");
        assert_that!(on.config.as_deref()).is_equal_to(Some(r#"{"color":"blue"}"#));
        let off = eval_key("on_off", "bob");
        assert_that!(off.config).is_none();
    }

    #[test]
    fn bucketing_key_drives_partitions() {
        let store = TestStore::new();
        let result = eval(&store, "on_off", Key::with_bucketing_key("zed", "alice"), None);
        assert_result(&result, "on", "in segment all");
        let result = eval(&store, "on_off", Key::with_bucketing_key("alice", "bob"), None);
        assert_result(&result, "off", "in segment all");
    }

    #[test]
    fn killed_flag_returns_default_treatment() {
        let result = eval_key("killed_flag", "alice");
        assert_result(&result, "off", label::KILLED);
        assert_that!(result.change_number).is_equal_to(Some(7));
    }

    #[test]
    fn archived_flag_returns_control() {
        let result = eval_key("archived_flag", "alice");
        assert_result(&result, CONTROL, label::ARCHIVED);
        assert_that!(result.config).is_none();
    }

    #[test]
    fn archived_takes_precedence_over_killed() {
        let store = TestStore::new().with_flag(
            r#"{
                "name": "archived_and_killed",
                "defaultTreatment": "off",
                "status": "ARCHIVED",
                "killed": true,
                "conditions": []
            }"#,
        );
        let result = eval(&store, "archived_and_killed", Key::new("alice"), None);
        assert_result(&result, CONTROL, label::ARCHIVED);
    }

    #[test]
    fn killed_takes_precedence_over_prerequisites() {
        let store = TestStore::new().with_flag(
            r#"{
                "name": "killed_with_prereq",
                "defaultTreatment": "off",
                "killed": true,
                "prerequisites": [{"n": "missing", "ts": ["on"]}],
                "conditions": []
            }"#,
        );
        let result = eval(&store, "killed_with_prereq", Key::new("alice"), None);
        assert_result(&result, "off", label::KILLED);
    }

    #[test]
    fn prerequisites_take_precedence_over_traffic_allocation() {
        let store = TestStore::new().with_flag(
            r#"{
                "name": "gated",
                "defaultTreatment": "off",
                "trafficAllocation": 0,
                "prerequisites": [{"n": "on_off", "ts": ["on"]}],
                "conditions": [{
                    "conditionType": "ROLLOUT",
                    "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]},
                    "partitions": [{"treatment": "on", "size": 100}],
                    "label": "in segment all"
                }]
            }"#,
        );
        let result = eval(&store, "gated", Key::new("bob"), None);
        assert_result(&result, "off", label::PREREQUISITES_NOT_SATISFIED);
        let result = eval(&store, "gated", Key::new("alice"), None);
        assert_result(&result, "off", label::NOT_IN_SPLIT);
    }

    #[test_case("alice", "off", label::NOT_IN_SPLIT)]
    #[test_case("bob", "vip", "whitelisted")]
    #[test_case("key_3", "on", "in segment all")]
    fn traffic_allocation_after_whitelists(key: &str, treatment: &str, label: &str) {
        assert_result(&eval_key("whitelisted", key), treatment, label);
    }

    #[test]
    fn zero_traffic_allocation_excludes_everyone() {
        for key in ["alice", "bob", "carol", "dave"] {
            assert_result(&eval_key("zero_traffic", key), "off", label::NOT_IN_SPLIT);
        }
    }

    #[test]
    fn satisfied_prerequisites_continue_evaluation() {
        assert_result(&eval_key("with_prereq", "alice"), "enabled", "in segment all");
        assert_result(
            &eval_key("with_prereq", "bob"),
            "disabled",
            label::PREREQUISITES_NOT_SATISFIED,
        );
    }

    #[test]
    fn missing_prerequisite_is_not_satisfied() {
        assert_result(
            &eval_key("prereq_missing", "alice"),
            "off",
            label::PREREQUISITES_NOT_SATISFIED,
        );
    }

    #[test]
    fn prerequisite_cycle_is_not_satisfied() {
        assert_result(
            &eval_key("cycle_a", "alice"),
            "off",
            label::PREREQUISITES_NOT_SATISFIED,
        );
        assert_result(
            &eval_key("cycle_b", "alice"),
            "off",
            label::PREREQUISITES_NOT_SATISFIED,
        );
    }

    #[test]
    fn prerequisite_fetch_failure_is_not_satisfied() {
        let store = TestStore::new().with_failing_flag("on_off");
        let result = eval(&store, "with_prereq", Key::new("alice"), None);
        assert_result(&result, "disabled", label::PREREQUISITES_NOT_SATISFIED);
    }

    #[test]
    fn dependency_matcher_checks_parent_treatment() {
        assert_result(&eval_key("depends_on", "alice"), "on", "dependency");
        assert_result(&eval_key("depends_on", "bob"), "off", label::DEFAULT_RULE);
    }

    #[test]
    fn dependency_accepts_any_listed_treatment() {
        let store = TestStore::new().with_flag(
            r#"{
                "name": "depends_on_either",
                "defaultTreatment": "off",
                "conditions": [{
                    "conditionType": "ROLLOUT",
                    "matcherGroup": {"combiner": "AND", "matchers": [{
                        "matcherType": "IN_SPLIT_TREATMENT",
                        "negate": false,
                        "dependencyMatcherData": {"split": "on_off", "treatments": ["on", "off"]}
                    }]},
                    "partitions": [{"treatment": "on", "size": 100}],
                    "label": "dependency"
                }]
            }"#,
        );
        for key in ["alice", "bob"] {
            let result = eval(&store, "depends_on_either", Key::new(key), None);
            assert_result(&result, "on", "dependency");
        }
    }

    #[test]
    fn self_dependency_never_matches() {
        assert_result(&eval_key("self_dependent", "alice"), "off", label::DEFAULT_RULE);
    }

    #[test]
    fn dependency_on_missing_flag_never_matches() {
        let store = TestStore::new().with_flag(
            r#"{
                "name": "depends_on_nothing",
                "defaultTreatment": "off",
                "conditions": [{
                    "matcherGroup": {"combiner": "AND", "matchers": [{
                        "matcherType": "IN_SPLIT_TREATMENT",
                        "negate": true,
                        "dependencyMatcherData": {"split": "nothing", "treatments": ["on"]}
                    }]},
                    "partitions": [{"treatment": "on", "size": 100}],
                    "label": "not depending"
                }]
            }"#,
        );
        // A failed dependency is a non-match, so the negated matcher matches.
        let result = eval(&store, "depends_on_nothing", Key::new("alice"), None);
        assert_result(&result, "on", "not depending");
    }

    #[test_case("alice", "on", "in segment employees")]
    #[test_case("carol", "off", label::DEFAULT_RULE)]
    fn segment_membership(key: &str, treatment: &str, label: &str) {
        assert_result(&eval_key("segment_flag", key), treatment, label);
    }

    #[test_case("alice", "on", "in beta")]
    #[test_case("mallory", "off", label::DEFAULT_RULE)]
    #[test_case("dave", "off", label::DEFAULT_RULE)]
    fn rule_based_segment_exclusions(key: &str, treatment: &str, label: &str) {
        assert_result(&eval_key("rb_flag", key), treatment, label);
    }

    #[test]
    fn attributes_are_matched() {
        let store = TestStore::new();
        let adult = hashmap! {"age".to_string() => 30_i64.into()};
        let minor = hashmap! {"age".to_string() => 12_i64.into()};
        let result = eval(&store, "attribute_flag", Key::new("alice"), Some(&adult));
        assert_result(&result, "adult", "adults");
        let result = eval(&store, "attribute_flag", Key::new("alice"), Some(&minor));
        assert_result(&result, "minor", label::DEFAULT_RULE);
        let result = eval(&store, "attribute_flag", Key::new("alice"), None);
        assert_result(&result, "minor", label::DEFAULT_RULE);
    }

    #[test]
    fn uncovered_bucket_returns_control_with_condition_label() {
        assert_result(&eval_key("short_partitions", "alice"), "on", "short rollout");
        let result = eval_key("short_partitions", "bob");
        assert_result(&result, CONTROL, "short rollout");
        assert_that!(result.config).is_none();
    }

    #[test]
    fn legacy_hash_is_used_when_requested() {
        // legacy bucket 40, murmur bucket 5
        assert_result(&eval_key("legacy_hash", "alice"), "off", "legacy");
    }

    #[test]
    fn unsupported_matcher_returns_control() {
        let result = eval_key("unsupported", "alice");
        assert_result(&result, CONTROL, label::UNSUPPORTED_MATCHER);
        assert_that!(result.change_number).is_equal_to(Some(99));
    }

    #[test]
    fn storage_failure_is_an_exception() {
        let result = eval_key("failing_segment_flag", "alice");
        assert_result(&result, CONTROL, label::EXCEPTION);
    }

    #[test]
    fn stack_is_unwound_after_evaluation() {
        let store = Local(TestStore::new());
        let key = Key::new("alice");
        let scope = EvaluationScope::new(&store, &key, None);
        let mut stack = EvaluationStack::default();
        for name in ["with_prereq", "rb_flag", "cycle_a", "failing_segment_flag"] {
            let flag = store.0.flag(name).unwrap().unwrap();
            block_on(evaluate_flag(&scope, &flag, &mut stack));
            assert!(stack.flag_chain.is_empty());
            assert!(stack.segment_chain.is_empty());
        }
    }

    #[test]
    fn result_serialization() {
        let result = eval_key("on_off", "alice");
        assert_json_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "treatment": "on",
                "label": "in segment all",
                "config": "{\"color\":\"blue\"}",
                "changeNumber": 123
            })
        );

        assert_json_eq!(
            serde_json::to_value(EvaluationResult::not_found()).unwrap(),
            json!({
                "treatment": "control",
                "label": "definition not found",
                "config": null
            })
        );

        let result = EvaluationResult {
            impressions_disabled: true,
            ..EvaluationResult::exception()
        };
        assert_json_eq!(
            serde_json::to_value(result).unwrap(),
            json!({
                "treatment": "control",
                "label": "exception",
                "config": null,
                "impressionsDisabled": true
            })
        );
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(key in "[a-zA-Z0-9_]{1,24}") {
            let first = eval_key("on_off", &key);
            let second = eval_key("on_off", &key);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.treatment == "on" || first.treatment == "off");
        }
    }
}
