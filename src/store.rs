use std::collections::{HashMap, HashSet};
use std::future::{ready, Future};
use std::sync::Arc;

use crate::flag::Flag;
use crate::rule_based_segment::RuleBasedSegment;

/// StoreError is returned by a [Store] or [SyncStore] when a lookup could not be completed.
///
/// Evaluation never surfaces these errors to the caller: a flag whose evaluation hits one resolves
/// to the `control` treatment with the `exception` label.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend did not answer in time.
    #[error("storage operation timed out")]
    Timeout,

    /// The backend answered with an error.
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Store is the interface to the data store holding flag definitions and segment data.
///
/// Every lookup returns a future, so remote stores can suspend. Stores that answer from memory
/// should implement [SyncStore] instead and be wrapped in [Local], which satisfies this trait
/// with futures that are always ready.
pub trait Store: Sync {
    /// Retrieve the flag named `name`.
    fn flag(&self, name: &str) -> impl Future<Output = StoreResult<Option<Arc<Flag>>>> + Send;

    /// Retrieve several flags at once. The result holds an entry for each requested name.
    fn flags(
        &self,
        names: &[String],
    ) -> impl Future<Output = StoreResult<HashMap<String, Option<Arc<Flag>>>>> + Send;

    /// Resolve each flag set to the names of the flags it contains. The result is parallel to
    /// `flag_sets`, with an empty set for unknown names.
    fn names_by_flag_sets(
        &self,
        flag_sets: &[String],
    ) -> impl Future<Output = StoreResult<Vec<HashSet<String>>>> + Send;

    /// Whether `key` is a member of the segment named `segment_name`.
    fn is_in_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Whether `key` is a member of the large segment named `segment_name`.
    fn is_in_large_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Retrieve the rule-based segment named `name`.
    fn rule_based_segment(
        &self,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<Arc<RuleBasedSegment>>>> + Send;
}

/// SyncStore is the interface for stores that answer every lookup immediately, such as the
/// default in-memory store.
pub trait SyncStore: Sync {
    /// Retrieve the flag named `name`.
    fn flag(&self, name: &str) -> StoreResult<Option<Arc<Flag>>>;

    /// Retrieve several flags at once. The default implementation looks them up one at a time.
    fn flags(&self, names: &[String]) -> StoreResult<HashMap<String, Option<Arc<Flag>>>> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.flag(name)?)))
            .collect()
    }

    /// Resolve each flag set to the names of the flags it contains.
    fn names_by_flag_sets(&self, flag_sets: &[String]) -> StoreResult<Vec<HashSet<String>>>;

    /// Whether `key` is a member of the segment named `segment_name`.
    fn is_in_segment(&self, segment_name: &str, key: &str) -> StoreResult<bool>;

    /// Whether `key` is a member of the large segment named `segment_name`. Stores without large
    /// segment support report no membership.
    fn is_in_large_segment(&self, _segment_name: &str, _key: &str) -> StoreResult<bool> {
        Ok(false)
    }

    /// Retrieve the rule-based segment named `name`.
    fn rule_based_segment(&self, name: &str) -> StoreResult<Option<Arc<RuleBasedSegment>>>;
}

/// Local adapts a [SyncStore] to the [Store] interface.
///
/// Its futures are [std::future::Ready], so evaluating against it never suspends and can be
/// driven to completion with a single poll.
#[derive(Clone, Debug, Default)]
pub struct Local<S>(pub S);

impl<S> Local<S> {
    pub fn into_inner(self) -> S {
        self.0
    }
}

impl<S: SyncStore> Store for Local<S> {
    fn flag(&self, name: &str) -> impl Future<Output = StoreResult<Option<Arc<Flag>>>> + Send {
        ready(self.0.flag(name))
    }

    fn flags(
        &self,
        names: &[String],
    ) -> impl Future<Output = StoreResult<HashMap<String, Option<Arc<Flag>>>>> + Send {
        ready(self.0.flags(names))
    }

    fn names_by_flag_sets(
        &self,
        flag_sets: &[String],
    ) -> impl Future<Output = StoreResult<Vec<HashSet<String>>>> + Send {
        ready(self.0.names_by_flag_sets(flag_sets))
    }

    fn is_in_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send {
        ready(self.0.is_in_segment(segment_name, key))
    }

    fn is_in_large_segment(
        &self,
        segment_name: &str,
        key: &str,
    ) -> impl Future<Output = StoreResult<bool>> + Send {
        ready(self.0.is_in_large_segment(segment_name, key))
    }

    fn rule_based_segment(
        &self,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<Arc<RuleBasedSegment>>>> + Send {
        ready(self.0.rule_based_segment(name))
    }
}
