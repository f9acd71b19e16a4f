use std::collections::HashMap;

use futures::future::{join_all, FutureExt};
use itertools::Itertools;
use log::{debug, error, warn};

use crate::attribute_value::Attributes;
use crate::eval::{evaluate_flag, EvaluationResult, EvaluationScope, EvaluationStack};
use crate::fallback::FallbackTreatmentsConfiguration;
use crate::key::Key;
use crate::store::{Local, Store, SyncStore};

/// Reported when a requested flag set has no flags, either because it is empty or because it is
/// not known to the store.
#[derive(Clone, Debug, PartialEq)]
pub struct EmptyFlagSetEvent {
    pub flag_set: String,
}

/// Trait used by [Evaluator::evaluate_by_flag_sets] to report flag sets that resolved to no flags.
pub trait FlagSetEventRecorder: Sync {
    /// Record that a requested flag set has no flags.
    fn record(&self, event: EmptyFlagSetEvent);
}

/// Evaluator computes treatments for flags held in a [Store].
///
/// Every public operation applies the configured fallback treatments to `control` results before
/// returning them. None of them return errors: storage failures surface as `control` results with
/// the `exception` label.
pub struct Evaluator<S> {
    store: S,
    fallback_treatments: FallbackTreatmentsConfiguration,
}

impl<S> Evaluator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            fallback_treatments: FallbackTreatmentsConfiguration::default(),
        }
    }

    /// Replace `control` results with the given fallbacks. Entries with invalid treatment names
    /// are discarded.
    pub fn with_fallback_treatments(
        mut self,
        configuration: FallbackTreatmentsConfiguration,
    ) -> Self {
        self.fallback_treatments = configuration.sanitized();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fallback_treatments(&self) -> &FallbackTreatmentsConfiguration {
        &self.fallback_treatments
    }

    fn exceptions_for<I: Iterator<Item = String>>(
        &self,
        names: I,
    ) -> HashMap<String, EvaluationResult> {
        names
            .map(|name| {
                let result = self
                    .fallback_treatments
                    .resolve(&name, EvaluationResult::exception());
                (name, result)
            })
            .collect()
    }
}

impl<S: Store> Evaluator<S> {
    /// Evaluate the flag named `flag_name` for `key`.
    pub async fn evaluate(
        &self,
        key: &Key,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> EvaluationResult {
        let result = match self.store.flag(flag_name).await {
            Ok(Some(flag)) => {
                let scope = EvaluationScope::new(&self.store, key, attributes);
                evaluate_flag(&scope, &flag, &mut EvaluationStack::default()).await
            }
            Ok(None) => {
                warn!("flag {} not found", flag_name);
                EvaluationResult::not_found()
            }
            Err(e) => {
                error!("failed to fetch flag {}: {}", flag_name, e);
                EvaluationResult::exception()
            }
        };
        self.fallback_treatments.resolve(flag_name, result)
    }

    /// Evaluate several flags for `key`, fetching their definitions in one batch.
    ///
    /// The result holds one entry per distinct requested name. The flags are evaluated
    /// concurrently and independently: a failure in one does not affect the others.
    pub async fn evaluate_many(
        &self,
        key: &Key,
        flag_names: &[String],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, EvaluationResult> {
        let names: Vec<String> = flag_names.iter().unique().cloned().collect();
        if names.is_empty() {
            return HashMap::new();
        }

        let mut flags = match self.store.flags(&names).await {
            Ok(flags) => flags,
            Err(e) => {
                error!("failed to fetch flags {:?}: {}", names, e);
                return self.exceptions_for(names.into_iter());
            }
        };

        let scope = EvaluationScope::new(&self.store, key, attributes);
        let scope = &scope;
        let evaluations = names.into_iter().map(|name| {
            let flag = flags.remove(&name).flatten();
            async move {
                let result = match flag {
                    Some(flag) => {
                        evaluate_flag(scope, &flag, &mut EvaluationStack::default()).await
                    }
                    None => {
                        warn!("flag {} not found", name);
                        EvaluationResult::not_found()
                    }
                };
                let result = self.fallback_treatments.resolve(&name, result);
                (name, result)
            }
        });

        join_all(evaluations).await.into_iter().collect()
    }

    /// Evaluate every flag belonging to any of `flag_sets` for `key`.
    ///
    /// Flag sets that resolve to no flags are logged and reported to `recorder`.
    pub async fn evaluate_by_flag_sets(
        &self,
        key: &Key,
        flag_sets: &[String],
        attributes: Option<&Attributes>,
        recorder: Option<&dyn FlagSetEventRecorder>,
    ) -> HashMap<String, EvaluationResult> {
        let flag_sets: Vec<String> = flag_sets.iter().unique().cloned().collect();
        if flag_sets.is_empty() {
            return HashMap::new();
        }

        let members = match self.store.names_by_flag_sets(&flag_sets).await {
            Ok(members) => members,
            Err(e) => {
                error!("failed to resolve flag sets {:?}: {}", flag_sets, e);
                return HashMap::new();
            }
        };

        for (flag_set, names) in flag_sets.iter().zip(&members) {
            if names.is_empty() {
                warn!("flag set {} is empty or does not exist", flag_set);
                if let Some(recorder) = recorder {
                    recorder.record(EmptyFlagSetEvent {
                        flag_set: flag_set.clone(),
                    });
                }
            }
        }

        let names: Vec<String> = members.into_iter().flatten().unique().collect();
        if names.is_empty() {
            debug!("no flags found for flag sets {:?}", flag_sets);
            return HashMap::new();
        }

        self.evaluate_many(key, &names, attributes).await
    }
}

/// Blocking entry points for stores that answer immediately.
///
/// These drive the same futures as the async operations. Since every storage future is ready, each
/// evaluation completes on its first poll and no executor is needed.
impl<S: SyncStore> Evaluator<Local<S>> {
    pub fn evaluate_sync(
        &self,
        key: &Key,
        flag_name: &str,
        attributes: Option<&Attributes>,
    ) -> EvaluationResult {
        self.evaluate(key, flag_name, attributes)
            .now_or_never()
            .unwrap_or_else(|| {
                error!("evaluation of flag {} did not complete synchronously", flag_name);
                self.fallback_treatments
                    .resolve(flag_name, EvaluationResult::exception())
            })
    }

    pub fn evaluate_many_sync(
        &self,
        key: &Key,
        flag_names: &[String],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, EvaluationResult> {
        self.evaluate_many(key, flag_names, attributes)
            .now_or_never()
            .unwrap_or_else(|| {
                error!("evaluation of flags {:?} did not complete synchronously", flag_names);
                self.exceptions_for(flag_names.iter().cloned())
            })
    }

    pub fn evaluate_by_flag_sets_sync(
        &self,
        key: &Key,
        flag_sets: &[String],
        attributes: Option<&Attributes>,
        recorder: Option<&dyn FlagSetEventRecorder>,
    ) -> HashMap<String, EvaluationResult> {
        self.evaluate_by_flag_sets(key, flag_sets, attributes, recorder)
            .now_or_never()
            .unwrap_or_else(|| {
                error!(
                    "evaluation of flag sets {:?} did not complete synchronously",
                    flag_sets
                );
                HashMap::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{label, CONTROL};
    use crate::fallback::FallbackTreatment;
    use crate::test_common::{AsyncTestStore, InMemoryFlagSetEventRecorder, TestStore};
    use maplit::hashmap;
    use spectral::prelude::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn evaluator() -> Evaluator<Local<TestStore>> {
        Evaluator::new(Local(TestStore::new()))
    }

    #[test]
    fn evaluate_single_flag() {
        let result = evaluator().evaluate_sync(&Key::new("alice"), "on_off", None);
        assert_that!(result.treatment.as_str()).is_equal_to("on");
        assert_that!(result.label.as_str()).is_equal_to("in segment all");
    }

    #[test]
    fn evaluate_missing_flag() {
        let result = evaluator().evaluate_sync(&Key::new("alice"), "nope", None);
        assert_that!(result).is_equal_to(EvaluationResult::not_found());
    }

    #[test]
    fn evaluate_flag_fetch_failure() {
        let evaluator = Evaluator::new(Local(TestStore::new().with_failing_flag("on_off")));
        let result = evaluator.evaluate_sync(&Key::new("alice"), "on_off", None);
        assert_that!(result).is_equal_to(EvaluationResult::exception());
    }

    #[test]
    fn fallback_applies_to_control_only() {
        let evaluator = evaluator().with_fallback_treatments(
            FallbackTreatmentsConfiguration::default()
                .with_global(FallbackTreatment::new("safe"))
                .with_flag("nope", FallbackTreatment::with_config("off", "{}"))
                .with_flag("archived_flag", FallbackTreatment::new("bad treatment")),
        );
        let key = Key::new("alice");

        let result = evaluator.evaluate_sync(&key, "nope", None);
        assert_that!(result.treatment.as_str()).is_equal_to("off");
        assert_that!(result.label.as_str()).is_equal_to("fallback - definition not found");
        assert_that!(result.config.as_deref()).is_equal_to(Some("{}"));

        // the invalid per-flag entry was dropped, so the global one applies
        let result = evaluator.evaluate_sync(&key, "archived_flag", None);
        assert_that!(result.treatment.as_str()).is_equal_to("safe");
        assert_that!(result.label.as_str()).is_equal_to("fallback - archived");

        let result = evaluator.evaluate_sync(&key, "on_off", None);
        assert_that!(result.treatment.as_str()).is_equal_to("on");
    }

    #[test]
    fn evaluate_many_returns_each_distinct_name() {
        let results = evaluator().evaluate_many_sync(
            &Key::new("alice"),
            &names(&["on_off", "killed_flag", "nope", "on_off"]),
            None,
        );
        assert_that!(results.len()).is_equal_to(3);
        assert_that!(results["on_off"].treatment.as_str()).is_equal_to("on");
        assert_that!(results["killed_flag"].label.as_str()).is_equal_to(label::KILLED);
        assert_that!(results["nope"]).is_equal_to(EvaluationResult::not_found());
    }

    #[test]
    fn evaluate_many_with_no_names() {
        let results = evaluator().evaluate_many_sync(&Key::new("alice"), &[], None);
        assert!(results.is_empty());
    }

    #[test]
    fn evaluate_many_isolates_failures() {
        let results = evaluator().evaluate_many_sync(
            &Key::new("alice"),
            &names(&["failing_segment_flag", "segment_flag"]),
            None,
        );
        assert_that!(results["failing_segment_flag"].treatment.as_str()).is_equal_to(CONTROL);
        assert_that!(results["failing_segment_flag"].label.as_str()).is_equal_to(label::EXCEPTION);
        assert_that!(results["segment_flag"].treatment.as_str()).is_equal_to("on");
    }

    #[test]
    fn evaluate_many_batch_failure() {
        let evaluator = Evaluator::new(Local(TestStore::new().with_failing_batches()))
            .with_fallback_treatments(
                FallbackTreatmentsConfiguration::default()
                    .with_flag("killed_flag", FallbackTreatment::new("off")),
            );
        let results = evaluator.evaluate_many_sync(
            &Key::new("alice"),
            &names(&["on_off", "killed_flag"]),
            None,
        );
        assert_that!(results["on_off"]).is_equal_to(EvaluationResult::exception());
        assert_that!(results["killed_flag"].treatment.as_str()).is_equal_to("off");
        assert_that!(results["killed_flag"].label.as_str()).is_equal_to("fallback - exception");
    }

    #[test]
    fn evaluate_by_flag_sets_unions_members() {
        let recorder = InMemoryFlagSetEventRecorder::default();
        let results = evaluator().evaluate_by_flag_sets_sync(
            &Key::new("alice"),
            &names(&["frontend", "backend"]),
            None,
            Some(&recorder),
        );

        let mut evaluated: Vec<&str> = results.keys().map(String::as_str).collect();
        evaluated.sort_unstable();
        assert_that!(evaluated).is_equal_to(vec!["archived_flag", "killed_flag", "on_off"]);
        assert_that!(results["archived_flag"].label.as_str()).is_equal_to(label::ARCHIVED);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn evaluate_by_flag_sets_reports_empty_sets() {
        let recorder = InMemoryFlagSetEventRecorder::default();
        let results = evaluator().evaluate_by_flag_sets_sync(
            &Key::new("alice"),
            &names(&["frontend", "unknown"]),
            None,
            Some(&recorder),
        );
        assert_that!(results.len()).is_equal_to(2);
        assert_that!(*recorder.events.lock().unwrap()).is_equal_to(vec![EmptyFlagSetEvent {
            flag_set: "unknown".to_string(),
        }]);
    }

    #[test]
    fn evaluate_by_flag_sets_skips_batch_when_nothing_matches() {
        // a batch fetch would fail, so an empty map proves none was made
        let evaluator = Evaluator::new(Local(TestStore::new().with_failing_batches()));
        let recorder = InMemoryFlagSetEventRecorder::default();
        let results = evaluator.evaluate_by_flag_sets_sync(
            &Key::new("alice"),
            &names(&["unknown", "missing"]),
            None,
            Some(&recorder),
        );
        assert!(results.is_empty());
        assert_that!(recorder.events.lock().unwrap().len()).is_equal_to(2);

        let results = evaluator.evaluate_by_flag_sets_sync(&Key::new("alice"), &[], None, None);
        assert!(results.is_empty());
    }

    #[test]
    fn attributes_reach_every_flag_in_a_batch() {
        let attributes = hashmap! {"age".to_string() => 40_i64.into()};
        let results = evaluator().evaluate_many_sync(
            &Key::new("alice"),
            &names(&["attribute_flag", "on_off"]),
            Some(&attributes),
        );
        assert_that!(results["attribute_flag"].treatment.as_str()).is_equal_to("adult");
        assert_that!(results["on_off"].treatment.as_str()).is_equal_to("on");
    }

    #[tokio::test]
    async fn async_store_matches_sync_store() {
        let sync_evaluator = evaluator();
        let async_evaluator = Evaluator::new(AsyncTestStore(TestStore::new()));
        let flags = names(&[
            "on_off",
            "killed_flag",
            "archived_flag",
            "whitelisted",
            "with_prereq",
            "cycle_a",
            "depends_on",
            "segment_flag",
            "rb_flag",
            "short_partitions",
            "legacy_hash",
            "unsupported",
            "failing_segment_flag",
            "nope",
        ]);

        for key in ["alice", "bob", "carol", "dave", "mallory", "key_3"] {
            let key = Key::new(key);
            let expected = sync_evaluator.evaluate_many_sync(&key, &flags, None);
            let actual = async_evaluator.evaluate_many(&key, &flags, None).await;
            assert_that!(actual).is_equal_to(expected);

            for flag in &flags {
                let actual = async_evaluator.evaluate(&key, flag, None).await;
                assert_that!(actual).is_equal_to(&sync_evaluator.evaluate_sync(&key, flag, None));
            }
        }
    }

    #[tokio::test]
    async fn async_evaluation_is_send() {
        let evaluator = std::sync::Arc::new(Evaluator::new(AsyncTestStore(TestStore::new())));
        let handle = tokio::spawn({
            let evaluator = evaluator.clone();
            async move {
                evaluator
                    .evaluate(&Key::new("alice"), "with_prereq", None)
                    .await
            }
        });
        let result = handle.await.unwrap();
        assert_that!(result.treatment.as_str()).is_equal_to("enabled");
    }
}
