use std::borrow::Cow;
use std::collections::HashSet;

use log::{error, warn};
use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::attribute_value::{
    millis_to_datetime, parse_bool, parse_number, parse_semver, truncate_to_day,
    truncate_to_minute, AttributeValue,
};
use crate::eval::{evaluate_dependency, EvaluationScope, EvaluationStack};
use crate::rule_based_segment;
use crate::store::{Store, StoreResult};

/// A single predicate within a condition.
///
/// Matchers are compiled when the flag definition is deserialized: regular expressions, semantic
/// versions and datetime operands are parsed once, not on every evaluation. A matcher whose data
/// is missing or malformed never matches.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "MatcherWire")]
pub struct Matcher {
    negate: bool,
    // None selects the matching key instead of an attribute.
    attribute: Option<String>,
    kind: MatcherKind,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum DataType {
    #[default]
    Number,
    /// Unix epoch milliseconds.
    Datetime,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Granularity {
    Day,
    Minute,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Numeric {
    data_type: DataType,
    granularity: Granularity,
}

#[derive(Clone, Debug)]
enum MatcherKind {
    AllKeys,
    InSegment(String),
    InLargeSegment(String),
    InRuleBasedSegment(String),
    Whitelist(HashSet<String>),
    EqualTo(Numeric, f64),
    GreaterThanOrEqualTo(Numeric, f64),
    LessThanOrEqualTo(Numeric, f64),
    Between(Numeric, f64, f64),
    EqualToSet(HashSet<String>),
    ContainsAnyOfSet(HashSet<String>),
    ContainsAllOfSet(HashSet<String>),
    PartOfSet(HashSet<String>),
    StartsWith(Vec<String>),
    EndsWith(Vec<String>),
    ContainsString(Vec<String>),
    MatchesString(Regex),
    EqualToBoolean(bool),
    InSplitTreatment {
        split: String,
        treatments: HashSet<String>,
    },
    EqualToSemver(semver::Version),
    GreaterThanOrEqualToSemver(semver::Version),
    LessThanOrEqualToSemver(semver::Version),
    BetweenSemver(semver::Version, semver::Version),
    InListSemver(Vec<semver::Version>),
    // A matcher type this engine does not know about.
    Unsupported(String),
    // A known matcher type whose data could not be used.
    Invalid,
}

impl Matcher {
    /// Returns true if this matcher's type is not one this engine can evaluate.
    pub fn is_unsupported(&self) -> bool {
        self.unsupported_type().is_some()
    }

    /// The wire name of this matcher's type when it is not one this engine can evaluate.
    pub fn unsupported_type(&self) -> Option<&str> {
        match &self.kind {
            MatcherKind::Unsupported(matcher_type) => Some(matcher_type),
            _ => None,
        }
    }

    pub(crate) async fn matches<S: Store>(
        &self,
        scope: &EvaluationScope<'_, S>,
        stack: &mut EvaluationStack,
    ) -> StoreResult<bool> {
        let matched = match &self.kind {
            MatcherKind::AllKeys => true,
            MatcherKind::InSegment(segment_name) => match self.selected_string(scope) {
                Some(value) => scope.store.is_in_segment(segment_name, &value).await?,
                None => false,
            },
            MatcherKind::InLargeSegment(segment_name) => match self.selected_string(scope) {
                Some(value) => scope.store.is_in_large_segment(segment_name, &value).await?,
                None => false,
            },
            MatcherKind::InRuleBasedSegment(segment_name) => {
                rule_based_segment::contains(scope, segment_name, stack).await?
            }
            MatcherKind::InSplitTreatment { split, treatments } => {
                evaluate_dependency(scope, split, stack)
                    .await
                    .is_some_and(|treatment| treatments.contains(&treatment))
            }
            kind => self
                .selected(scope)
                .is_some_and(|value| kind.matches_value(&value)),
        };
        Ok(self.maybe_negate(matched))
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    fn selected<'a, S>(&self, scope: &EvaluationScope<'a, S>) -> Option<Selected<'a>> {
        match &self.attribute {
            None => Some(Selected::Key(scope.key.matching_key())),
            Some(attribute) => scope
                .attributes?
                .get(attribute)
                .map(Selected::Attribute),
        }
    }

    fn selected_string<'a, S>(&self, scope: &EvaluationScope<'a, S>) -> Option<Cow<'a, str>> {
        self.selected(scope).and_then(|value| value.to_str())
    }
}

impl MatcherKind {
    #[allow(clippy::float_cmp)]
    fn matches_value(&self, value: &Selected<'_>) -> bool {
        match self {
            MatcherKind::AllKeys => true,
            MatcherKind::Whitelist(whitelist) => value
                .to_str()
                .is_some_and(|v| whitelist.contains(v.as_ref())),

            // numeric ops
            MatcherKind::EqualTo(numeric, expected) => numeric.compare(value, |v| v == *expected),
            MatcherKind::GreaterThanOrEqualTo(numeric, min) => {
                numeric.compare(value, |v| v >= *min)
            }
            MatcherKind::LessThanOrEqualTo(numeric, max) => numeric.compare(value, |v| v <= *max),
            MatcherKind::Between(numeric, start, end) => {
                numeric.compare(value, |v| *start <= v && v <= *end)
            }

            // set ops
            MatcherKind::EqualToSet(whitelist) => set_op(value, |set| set == whitelist),
            MatcherKind::ContainsAnyOfSet(whitelist) => {
                set_op(value, |set| whitelist.iter().any(|item| set.contains(item)))
            }
            MatcherKind::ContainsAllOfSet(whitelist) => {
                set_op(value, |set| whitelist.is_subset(set))
            }
            MatcherKind::PartOfSet(whitelist) => set_op(value, |set| set.is_subset(whitelist)),

            // string ops
            MatcherKind::StartsWith(prefixes) => string_op(value, |v| {
                prefixes.iter().any(|prefix| v.starts_with(prefix.as_str()))
            }),
            MatcherKind::EndsWith(suffixes) => string_op(value, |v| {
                suffixes.iter().any(|suffix| v.ends_with(suffix.as_str()))
            }),
            MatcherKind::ContainsString(needles) => {
                string_op(value, |v| needles.iter().any(|needle| v.contains(needle.as_str())))
            }
            MatcherKind::MatchesString(regex) => string_op(value, |v| regex.is_match(v)),

            MatcherKind::EqualToBoolean(expected) => value.to_bool() == Some(*expected),

            // semver ops
            MatcherKind::EqualToSemver(expected) => semver_op(value, |v| v == expected),
            MatcherKind::GreaterThanOrEqualToSemver(min) => semver_op(value, |v| v >= min),
            MatcherKind::LessThanOrEqualToSemver(max) => semver_op(value, |v| v <= max),
            MatcherKind::BetweenSemver(start, end) => semver_op(value, |v| start <= v && v <= end),
            MatcherKind::InListSemver(versions) => semver_op(value, |v| versions.contains(v)),

            MatcherKind::InSegment(_)
            | MatcherKind::InLargeSegment(_)
            | MatcherKind::InRuleBasedSegment(_)
            | MatcherKind::InSplitTreatment { .. } => {
                error!("store-backed matchers should be special-cased, shouldn't get here");
                false
            }
            MatcherKind::Unsupported(_) | MatcherKind::Invalid => false,
        }
    }
}

impl Numeric {
    fn new(data_type: Option<DataType>, granularity: Granularity) -> Self {
        Self {
            data_type: data_type.unwrap_or_default(),
            granularity,
        }
    }

    // Datetimes only compare at the matcher's granularity, so both operands are truncated.
    fn normalize(&self, value: f64) -> Option<f64> {
        match self.data_type {
            DataType::Number => Some(value),
            DataType::Datetime => {
                let time = millis_to_datetime(value)?;
                let truncated = match self.granularity {
                    Granularity::Day => truncate_to_day(time)?,
                    Granularity::Minute => truncate_to_minute(time)?,
                };
                Some(truncated.timestamp_millis() as f64)
            }
        }
    }

    fn compare<F: Fn(f64) -> bool>(&self, value: &Selected<'_>, f: F) -> bool {
        value
            .to_f64()
            .and_then(|v| self.normalize(v))
            .is_some_and(f)
    }
}

fn string_op<F: Fn(&str) -> bool>(value: &Selected<'_>, f: F) -> bool {
    value.to_str().is_some_and(|v| f(v.as_ref()))
}

fn set_op<F: Fn(&HashSet<String>) -> bool>(value: &Selected<'_>, f: F) -> bool {
    value.to_string_set().is_some_and(|set| f(&set))
}

fn semver_op<F: Fn(&semver::Version) -> bool>(value: &Selected<'_>, f: F) -> bool {
    value.to_semver().is_some_and(|v| f(&v))
}

/// The value a matcher's key selector points at.
enum Selected<'a> {
    Key(&'a str),
    Attribute(&'a AttributeValue),
}

impl<'a> Selected<'a> {
    fn to_str(&self) -> Option<Cow<'a, str>> {
        match *self {
            Selected::Key(key) => Some(Cow::Borrowed(key)),
            Selected::Attribute(AttributeValue::String(s)) => Some(Cow::Borrowed(s.as_str())),
            Selected::Attribute(value) => value.to_string_lenient().map(Cow::Owned),
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match *self {
            Selected::Key(key) => parse_number(key),
            Selected::Attribute(value) => value.to_f64(),
        }
    }

    fn to_bool(&self) -> Option<bool> {
        match *self {
            Selected::Key(key) => parse_bool(key),
            Selected::Attribute(value) => value.to_bool(),
        }
    }

    fn to_string_set(&self) -> Option<HashSet<String>> {
        match *self {
            Selected::Key(_) => None,
            Selected::Attribute(value) => value.to_string_set(),
        }
    }

    fn to_semver(&self) -> Option<semver::Version> {
        match *self {
            Selected::Key(key) => parse_semver(key),
            Selected::Attribute(value) => value.as_semver(),
        }
    }
}

// Wire format of a matcher as delivered in split change payloads.
#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatcherWire {
    #[serde(default)]
    key_selector: Option<KeySelector>,
    matcher_type: String,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    negate: bool,
    #[serde(default)]
    user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    user_defined_large_segment_matcher_data: Option<LargeSegmentMatcherData>,
    #[serde(default)]
    whitelist_matcher_data: Option<WhitelistMatcherData>,
    #[serde(default)]
    unary_numeric_matcher_data: Option<UnaryNumericMatcherData>,
    #[serde(default)]
    between_matcher_data: Option<BetweenMatcherData>,
    #[serde(default)]
    between_string_matcher_data: Option<BetweenStringMatcherData>,
    #[serde(default)]
    dependency_matcher_data: Option<DependencyMatcherData>,
    #[serde(default)]
    boolean_matcher_data: Option<bool>,
    #[serde(default)]
    string_matcher_data: Option<String>,
}

#[derive(Deserialize)]
struct KeySelector {
    #[serde(default)]
    attribute: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentMatcherData {
    segment_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LargeSegmentMatcherData {
    large_segment_name: String,
}

#[serde_as]
#[derive(Deserialize)]
struct WhitelistMatcherData {
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    whitelist: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnaryNumericMatcherData {
    #[serde(default)]
    data_type: Option<DataType>,
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetweenMatcherData {
    #[serde(default)]
    data_type: Option<DataType>,
    #[serde(default)]
    start: Option<f64>,
    #[serde(default)]
    end: Option<f64>,
}

#[derive(Deserialize)]
struct BetweenStringMatcherData {
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

#[serde_as]
#[derive(Deserialize)]
struct DependencyMatcherData {
    split: String,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    treatments: Vec<String>,
}

impl From<MatcherWire> for Matcher {
    fn from(mut wire: MatcherWire) -> Self {
        let attribute = wire
            .key_selector
            .take()
            .and_then(|selector| selector.attribute);
        let negate = wire.negate;
        Matcher {
            negate,
            attribute,
            kind: compile(wire),
        }
    }
}

fn compile(wire: MatcherWire) -> MatcherKind {
    let whitelist = wire.whitelist_matcher_data.map(|data| data.whitelist);
    let whitelist_set = || {
        whitelist
            .clone()
            .map(|values| values.into_iter().collect::<HashSet<_>>())
    };

    let kind = match wire.matcher_type.as_str() {
        "ALL_KEYS" => Some(MatcherKind::AllKeys),
        "IN_SEGMENT" => wire
            .user_defined_segment_matcher_data
            .map(|data| MatcherKind::InSegment(data.segment_name)),
        "IN_LARGE_SEGMENT" => wire
            .user_defined_large_segment_matcher_data
            .map(|data| MatcherKind::InLargeSegment(data.large_segment_name)),
        "IN_RULE_BASED_SEGMENT" => wire
            .user_defined_segment_matcher_data
            .map(|data| MatcherKind::InRuleBasedSegment(data.segment_name)),
        "WHITELIST" => whitelist_set().map(MatcherKind::Whitelist),
        "EQUAL_TO" => unary(wire.unary_numeric_matcher_data, Granularity::Day)
            .map(|(numeric, value)| MatcherKind::EqualTo(numeric, value)),
        "GREATER_THAN_OR_EQUAL_TO" => {
            unary(wire.unary_numeric_matcher_data, Granularity::Minute)
                .map(|(numeric, value)| MatcherKind::GreaterThanOrEqualTo(numeric, value))
        }
        "LESS_THAN_OR_EQUAL_TO" => unary(wire.unary_numeric_matcher_data, Granularity::Minute)
            .map(|(numeric, value)| MatcherKind::LessThanOrEqualTo(numeric, value)),
        "BETWEEN" => wire.between_matcher_data.and_then(|data| {
            let numeric = Numeric::new(data.data_type, Granularity::Minute);
            let start = numeric.normalize(data.start?)?;
            let end = numeric.normalize(data.end?)?;
            Some(MatcherKind::Between(numeric, start, end))
        }),
        "EQUAL_TO_SET" => whitelist_set().map(MatcherKind::EqualToSet),
        "CONTAINS_ANY_OF_SET" => whitelist_set().map(MatcherKind::ContainsAnyOfSet),
        "CONTAINS_ALL_OF_SET" => whitelist_set().map(MatcherKind::ContainsAllOfSet),
        "PART_OF_SET" => whitelist_set().map(MatcherKind::PartOfSet),
        "STARTS_WITH" => whitelist.clone().map(MatcherKind::StartsWith),
        "ENDS_WITH" => whitelist.clone().map(MatcherKind::EndsWith),
        "CONTAINS_STRING" => whitelist.clone().map(MatcherKind::ContainsString),
        "MATCHES_STRING" => wire
            .string_matcher_data
            .as_deref()
            .and_then(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid regex for MATCHES_STRING matcher ({}): {}", e, pattern);
                    None
                }
            })
            .map(MatcherKind::MatchesString),
        "EQUAL_TO_BOOLEAN" => wire.boolean_matcher_data.map(MatcherKind::EqualToBoolean),
        "IN_SPLIT_TREATMENT" => wire
            .dependency_matcher_data
            .map(|data| MatcherKind::InSplitTreatment {
                split: data.split,
                treatments: data.treatments.into_iter().collect(),
            }),
        "EQUAL_TO_SEMVER" => semver_operand(wire.string_matcher_data.as_deref())
            .map(MatcherKind::EqualToSemver),
        "GREATER_THAN_OR_EQUAL_TO_SEMVER" => {
            semver_operand(wire.string_matcher_data.as_deref())
                .map(MatcherKind::GreaterThanOrEqualToSemver)
        }
        "LESS_THAN_OR_EQUAL_TO_SEMVER" => semver_operand(wire.string_matcher_data.as_deref())
            .map(MatcherKind::LessThanOrEqualToSemver),
        "BETWEEN_SEMVER" => wire.between_string_matcher_data.and_then(|data| {
            let start = semver_operand(data.start.as_deref())?;
            let end = semver_operand(data.end.as_deref())?;
            Some(MatcherKind::BetweenSemver(start, end))
        }),
        "IN_LIST_SEMVER" => whitelist.clone().map(|values| {
            MatcherKind::InListSemver(
                values
                    .iter()
                    .filter_map(|value| semver_operand(Some(value)))
                    .collect(),
            )
        }),
        other => {
            warn!("matcher type {} is not supported", other);
            return MatcherKind::Unsupported(other.to_string());
        }
    };

    kind.unwrap_or_else(|| {
        warn!(
            "{} matcher is missing its data or its data is malformed; it will never match",
            wire.matcher_type
        );
        MatcherKind::Invalid
    })
}

fn unary(
    data: Option<UnaryNumericMatcherData>,
    granularity: Granularity,
) -> Option<(Numeric, f64)> {
    let data = data?;
    let numeric = Numeric::new(data.data_type, granularity);
    let value = numeric.normalize(data.value?)?;
    Some((numeric, value))
}

fn semver_operand(value: Option<&str>) -> Option<semver::Version> {
    let value = value?;
    let version = parse_semver(value);
    if version.is_none() {
        warn!("{} is not a valid semantic version", value);
    }
    version
}
