use std::collections::{HashMap, HashSet};

use chrono::{self, DurationRound, LocalResult, TimeDelta, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::f64_to_i64_safe;

/// The attributes supplied alongside a key when evaluating flags.
pub type Attributes = HashMap<String, AttributeValue>;

/// An attribute value represents the possible values a caller can attach to an evaluation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Stores a string value.
    String(String),
    /// Stores an array of attribute values.
    Array(Vec<AttributeValue>),
    /// Stores a number.
    Number(f64),
    /// Stores a boolean.
    Bool(bool),
    /// Stores a null value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<T> FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
    }
}

impl From<&Value> for AttributeValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(float) => AttributeValue::Number(float),
                None => {
                    warn!("could not interpret '{:?}' as f64", n);
                    AttributeValue::String(n.to_string())
                }
            },
            Value::String(str) => AttributeValue::String(str.clone()),
            Value::Array(arr) => {
                AttributeValue::Array(arr.iter().map(AttributeValue::from).collect())
            }
            Value::Object(_) => {
                warn!("object attributes cannot be used for targeting, treating as null");
                AttributeValue::Null
            }
        }
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a string, rendering numbers and booleans the way string matchers
    /// expect to see them. Arrays and null have no string form.
    pub fn to_string_lenient(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Number(f) => Some(number_to_string(*f)),
            AttributeValue::Bool(b) => Some(b.to_string()),
            AttributeValue::Array(_) | AttributeValue::Null => None,
        }
    }

    /// Returns the value as a float for numbers and numeric strings, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            AttributeValue::String(s) => parse_number(s),
            _ => None,
        }
    }

    /// Returns the value as a boolean. The strings "true" and "false" are accepted in any case.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::String(s) => parse_bool(s),
            _ => None,
        }
    }

    /// Interprets the value as Unix epoch milliseconds.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        self.to_f64().and_then(millis_to_datetime)
    }

    /// Returns the distinct string renderings of an array's elements. Scalars and empty arrays
    /// return None, so set matchers never match them.
    pub fn to_string_set(&self) -> Option<HashSet<String>> {
        match self {
            AttributeValue::Array(values) if !values.is_empty() => Some(
                values
                    .iter()
                    .filter_map(AttributeValue::to_string_lenient)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Attempt to parse a string attribute into a semver version.
    ///
    /// It will return None if it cannot parse it, or for non-string attributes. Build metadata
    /// does not take part in comparisons, so it is dropped.
    pub fn as_semver(&self) -> Option<semver::Version> {
        parse_semver(self.as_str()?)
    }
}

pub(crate) fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub(crate) fn parse_semver(s: &str) -> Option<semver::Version> {
    semver::Version::parse(s.trim()).ok().map(|mut version| {
        version.build = semver::BuildMetadata::EMPTY;
        version
    })
}

pub(crate) fn millis_to_datetime(millis: f64) -> Option<chrono::DateTime<Utc>> {
    f64_to_i64_safe(millis).and_then(|millis| match Utc.timestamp_millis_opt(millis) {
        LocalResult::None | LocalResult::Ambiguous(_, _) => None,
        LocalResult::Single(time) => Some(time),
    })
}

/// Drops the time of day, keeping midnight UTC.
pub(crate) fn truncate_to_day(time: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
    time.duration_trunc(TimeDelta::days(1)).ok()
}

/// Drops seconds and milliseconds.
pub(crate) fn truncate_to_minute(time: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
    time.duration_trunc(TimeDelta::minutes(1)).ok()
}

#[allow(clippy::float_cmp)]
fn number_to_string(f: f64) -> String {
    match f64_to_i64_safe(f) {
        Some(i) if i as f64 == f => i.to_string(),
        _ => f.to_string(),
    }
}
