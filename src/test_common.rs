#![cfg(test)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::evaluator::{EmptyFlagSetEvent, FlagSetEventRecorder};
use crate::flag::Flag;
use crate::rule_based_segment::RuleBasedSegment;
use crate::store::{Store, StoreError, StoreResult, SyncStore};

const ALL_KEYS_ON: &str = r#"{
    "conditionType": "ROLLOUT",
    "matcherGroup": {
        "combiner": "AND",
        "matchers": [{"keySelector": {"trafficType": "user", "attribute": null}, "matcherType": "ALL_KEYS", "negate": false}]
    },
    "partitions": [{"treatment": "on", "size": 100}],
    "label": "in segment all"
}"#;

/// An in-memory store preloaded with a fixture set of flags and segments.
#[derive(Clone)]
pub struct TestStore {
    flags: HashMap<String, Arc<Flag>>,
    segments: HashMap<String, HashSet<String>>,
    large_segments: HashMap<String, HashSet<String>>,
    rule_based_segments: HashMap<String, Arc<RuleBasedSegment>>,
    failing_flags: HashSet<String>,
    failing_segments: HashSet<String>,
    failing_batches: bool,
}

impl TestStore {
    pub fn new() -> Self {
        let store = Self {
            flags: HashMap::new(),
            segments: HashMap::new(),
            large_segments: HashMap::new(),
            rule_based_segments: HashMap::new(),
            failing_flags: HashSet::new(),
            failing_segments: HashSet::new(),
            failing_batches: false,
        };

        store
            .with_flag(
                r#"{
                    "name": "on_off",
                    "changeNumber": 123,
                    "trafficTypeName": "user",
                    "killed": false,
                    "defaultTreatment": "off",
                    "status": "ACTIVE",
                    "seed": 12345,
                    "trafficAllocation": 100,
                    "trafficAllocationSeed": 1,
                    "algo": 2,
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {
                            "combiner": "AND",
                            "matchers": [{"keySelector": {"trafficType": "user", "attribute": null}, "matcherType": "ALL_KEYS", "negate": false}]
                        },
                        "partitions": [{"treatment": "on", "size": 50}, {"treatment": "off", "size": 50}],
                        "label": "in segment all"
                    }],
                    "configurations": {"on": "{\"color\":\"blue\"}"},
                    "sets": ["frontend"]
                }"#,
            )
            .with_flag(&format!(
                r#"{{
                    "name": "killed_flag",
                    "changeNumber": 7,
                    "killed": true,
                    "defaultTreatment": "off",
                    "status": "ACTIVE",
                    "conditions": [{}],
                    "sets": ["frontend", "backend"]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(&format!(
                r#"{{
                    "name": "archived_flag",
                    "changeNumber": 8,
                    "defaultTreatment": "off",
                    "status": "ARCHIVED",
                    "conditions": [{}],
                    "sets": ["backend"]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(&format!(
                r#"{{
                    "name": "whitelisted",
                    "defaultTreatment": "off",
                    "trafficAllocation": 50,
                    "trafficAllocationSeed": 7,
                    "conditions": [
                        {{
                            "conditionType": "WHITELIST",
                            "matcherGroup": {{
                                "combiner": "AND",
                                "matchers": [{{
                                    "keySelector": null,
                                    "matcherType": "WHITELIST",
                                    "negate": false,
                                    "whitelistMatcherData": {{"whitelist": ["bob"]}}
                                }}]
                            }},
                            "partitions": [{{"treatment": "vip", "size": 100}}],
                            "label": "whitelisted"
                        }},
                        {}
                    ]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(&format!(
                r#"{{
                    "name": "zero_traffic",
                    "defaultTreatment": "off",
                    "trafficAllocation": 0,
                    "conditions": [{}]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(
                r#"{
                    "name": "with_prereq",
                    "defaultTreatment": "disabled",
                    "prerequisites": [{"n": "on_off", "ts": ["on"]}],
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]},
                        "partitions": [{"treatment": "enabled", "size": 100}],
                        "label": "in segment all"
                    }]
                }"#,
            )
            .with_flag(&format!(
                r#"{{
                    "name": "prereq_missing",
                    "defaultTreatment": "off",
                    "prerequisites": [{{"n": "nope", "ts": ["on"]}}],
                    "conditions": [{}]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(&format!(
                r#"{{
                    "name": "cycle_a",
                    "defaultTreatment": "off",
                    "prerequisites": [{{"n": "cycle_b", "ts": ["on"]}}],
                    "conditions": [{}]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(&format!(
                r#"{{
                    "name": "cycle_b",
                    "defaultTreatment": "off",
                    "prerequisites": [{{"n": "cycle_a", "ts": ["on"]}}],
                    "conditions": [{}]
                }}"#,
                ALL_KEYS_ON
            ))
            .with_flag(
                r#"{
                    "name": "depends_on",
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "keySelector": {"trafficType": "user", "attribute": null},
                            "matcherType": "IN_SPLIT_TREATMENT",
                            "negate": false,
                            "dependencyMatcherData": {"split": "on_off", "treatments": ["on"]}
                        }]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "dependency"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "self_dependent",
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "matcherType": "IN_SPLIT_TREATMENT",
                            "negate": false,
                            "dependencyMatcherData": {"split": "self_dependent", "treatments": ["on", "off"]}
                        }]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "dependency"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "segment_flag",
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "keySelector": {"trafficType": "user", "attribute": null},
                            "matcherType": "IN_SEGMENT",
                            "negate": false,
                            "userDefinedSegmentMatcherData": {"segmentName": "employees"}
                        }]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "in segment employees"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "rb_flag",
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "keySelector": {"trafficType": "user"},
                            "matcherType": "IN_RULE_BASED_SEGMENT",
                            "negate": false,
                            "userDefinedSegmentMatcherData": {"segmentName": "beta_users"}
                        }]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "in beta"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "short_partitions",
                    "defaultTreatment": "off",
                    "seed": 0,
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]},
                        "partitions": [{"treatment": "on", "size": 10}],
                        "label": "short rollout"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "legacy_hash",
                    "defaultTreatment": "off",
                    "seed": 0,
                    "algo": 1,
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]},
                        "partitions": [{"treatment": "on", "size": 10}, {"treatment": "off", "size": 90}],
                        "label": "legacy"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "attribute_flag",
                    "defaultTreatment": "minor",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "keySelector": {"trafficType": "user", "attribute": "age"},
                            "matcherType": "GREATER_THAN_OR_EQUAL_TO",
                            "negate": false,
                            "unaryNumericMatcherData": {"dataType": "NUMBER", "value": 18}
                        }]},
                        "partitions": [{"treatment": "adult", "size": 100}],
                        "label": "adults"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "unsupported",
                    "changeNumber": 99,
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{"matcherType": "IN_THE_FUTURE", "negate": false}]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "future"
                    }]
                }"#,
            )
            .with_flag(
                r#"{
                    "name": "failing_segment_flag",
                    "defaultTreatment": "off",
                    "conditions": [{
                        "conditionType": "ROLLOUT",
                        "matcherGroup": {"combiner": "AND", "matchers": [{
                            "matcherType": "IN_SEGMENT",
                            "negate": false,
                            "userDefinedSegmentMatcherData": {"segmentName": "flaky"}
                        }]},
                        "partitions": [{"treatment": "on", "size": 100}],
                        "label": "flaky"
                    }]
                }"#,
            )
            .with_segment("employees", &["alice", "bob"])
            .with_large_segment("churned", &["dave"])
            .with_failing_segment("flaky")
            .with_rule_based_segment(&format!(
                r#"{{
                    "name": "beta_users",
                    "changeNumber": 3,
                    "status": "ACTIVE",
                    "trafficTypeName": "user",
                    "excluded": {{
                        "keys": ["mallory"],
                        "segments": [{{"type": "large", "name": "churned"}}]
                    }},
                    "conditions": [{}]
                }}"#,
                ALL_KEYS_ON
            ))
    }

    pub fn with_flag(mut self, json: &str) -> Self {
        let flag: Flag = serde_json::from_str(json).unwrap();
        self.flags.insert(flag.name.clone(), Arc::new(flag));
        self
    }

    pub fn with_segment(mut self, name: &str, keys: &[&str]) -> Self {
        self.segments.insert(
            name.to_string(),
            keys.iter().map(|key| key.to_string()).collect(),
        );
        self
    }

    pub fn with_large_segment(mut self, name: &str, keys: &[&str]) -> Self {
        self.large_segments.insert(
            name.to_string(),
            keys.iter().map(|key| key.to_string()).collect(),
        );
        self
    }

    pub fn with_rule_based_segment(mut self, json: &str) -> Self {
        let segment: RuleBasedSegment = serde_json::from_str(json).unwrap();
        self.rule_based_segments
            .insert(segment.name.clone(), Arc::new(segment));
        self
    }

    pub fn with_failing_flag(mut self, name: &str) -> Self {
        self.failing_flags.insert(name.to_string());
        self
    }

    pub fn with_failing_segment(mut self, name: &str) -> Self {
        self.failing_segments.insert(name.to_string());
        self
    }

    pub fn with_failing_batches(mut self) -> Self {
        self.failing_batches = true;
        self
    }

    fn check_segment(&self, name: &str) -> StoreResult<()> {
        if self.failing_segments.contains(name) {
            return Err(StoreError::Backend(format!("segment {} unavailable", name)));
        }
        Ok(())
    }
}

impl SyncStore for TestStore {
    fn flag(&self, name: &str) -> StoreResult<Option<Arc<Flag>>> {
        if self.failing_flags.contains(name) {
            return Err(StoreError::Backend(format!("flag {} unavailable", name)));
        }
        Ok(self.flags.get(name).cloned())
    }

    fn flags(&self, names: &[String]) -> StoreResult<HashMap<String, Option<Arc<Flag>>>> {
        if self.failing_batches {
            return Err(StoreError::Timeout);
        }
        names
            .iter()
            .map(|name| Ok((name.clone(), self.flag(name)?)))
            .collect()
    }

    fn names_by_flag_sets(&self, flag_sets: &[String]) -> StoreResult<Vec<HashSet<String>>> {
        Ok(flag_sets
            .iter()
            .map(|flag_set| {
                self.flags
                    .values()
                    .filter(|flag| flag.sets.contains(flag_set))
                    .map(|flag| flag.name.clone())
                    .collect()
            })
            .collect())
    }

    fn is_in_segment(&self, segment_name: &str, key: &str) -> StoreResult<bool> {
        self.check_segment(segment_name)?;
        Ok(self
            .segments
            .get(segment_name)
            .is_some_and(|keys| keys.contains(key)))
    }

    fn is_in_large_segment(&self, segment_name: &str, key: &str) -> StoreResult<bool> {
        self.check_segment(segment_name)?;
        Ok(self
            .large_segments
            .get(segment_name)
            .is_some_and(|keys| keys.contains(key)))
    }

    fn rule_based_segment(&self, name: &str) -> StoreResult<Option<Arc<RuleBasedSegment>>> {
        Ok(self.rule_based_segments.get(name).cloned())
    }
}

/// Serves the same data as [TestStore], but yields to the executor before answering, the way a
/// remote store would.
pub struct AsyncTestStore(pub TestStore);

impl Store for AsyncTestStore {
    fn flag(&self, name: &str) -> impl Future<Output = StoreResult<Option<Arc<Flag>>>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.flag(name)
        }
    }

    fn flags(
        &self,
        names: &[String],
    ) -> impl Future<Output = StoreResult<HashMap<String, Option<Arc<Flag>>>>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.flags(names)
        }
    }

    fn names_by_flag_sets(
        &self,
        flag_sets: &[String],
    ) -> impl Future<Output = StoreResult<Vec<HashSet<String>>>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.names_by_flag_sets(flag_sets)
        }
    }

    fn is_in_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.is_in_segment(segment_name, key)
        }
    }

    fn is_in_large_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.is_in_large_segment(segment_name, key)
        }
    }

    fn rule_based_segment(
        &self,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<Arc<RuleBasedSegment>>>> + Send {
        async move {
            tokio::task::yield_now().await;
            self.0.rule_based_segment(name)
        }
    }
}

#[derive(Default)]
pub struct InMemoryFlagSetEventRecorder {
    pub events: Mutex<Vec<EmptyFlagSetEvent>>,
}

impl FlagSetEventRecorder for InMemoryFlagSetEventRecorder {
    fn record(&self, event: EmptyFlagSetEvent) {
        self.events.lock().unwrap().push(event);
    }
}
