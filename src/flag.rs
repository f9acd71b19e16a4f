use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::condition::Condition;
use crate::eval::{EvaluationResult, CONTROL};
use crate::hash::{HashAlgorithm, BUCKETS};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Active,
    Archived,
}

/// Flag describes an individual feature flag (a "split") as delivered by the backend.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub name: String,
    #[serde(default)]
    pub change_number: i64,
    #[serde(default)]
    pub traffic_type_name: String,

    #[serde(default)]
    pub(crate) status: Status,
    #[serde(default)]
    pub(crate) killed: bool,
    pub(crate) default_treatment: String,

    #[serde(default)]
    pub(crate) seed: i32,
    #[serde(default = "default_traffic_allocation")]
    pub(crate) traffic_allocation: u32,
    #[serde(default)]
    pub(crate) traffic_allocation_seed: i32,
    #[serde(default)]
    algo: Option<u8>,

    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub(crate) conditions: Vec<Condition>,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub(crate) prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    configurations: HashMap<String, String>,
    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub sets: HashSet<String>,

    #[serde(default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub impressions_disabled: bool,
}

fn default_traffic_allocation() -> u32 {
    BUCKETS
}

/// A flag that must evaluate to one of `treatments` before the dependent flag is evaluated.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Prerequisite {
    #[serde(rename = "n", alias = "flagName")]
    pub(crate) flag_name: String,
    #[serde(rename = "ts", alias = "treatments", default)]
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub(crate) treatments: HashSet<String>,
}

impl Flag {
    pub fn is_archived(&self) -> bool {
        self.status == Status::Archived
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn default_treatment(&self) -> &str {
        &self.default_treatment
    }

    /// Returns the configuration attached to `treatment`, if any.
    pub fn config(&self, treatment: &str) -> Option<&str> {
        self.configurations.get(treatment).map(String::as_str)
    }

    pub(crate) fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::from_algo(self.algo)
    }

    /// Whether traffic allocation can exclude a key at all.
    pub(crate) fn has_traffic_allocation(&self) -> bool {
        self.traffic_allocation < BUCKETS
    }

    pub(crate) fn unsupported_matcher_type(&self) -> Option<&str> {
        self.conditions
            .iter()
            .find_map(Condition::unsupported_matcher_type)
    }

    /// Builds the result for `treatment`, attaching this flag's change number, configuration and
    /// impression setting.
    pub(crate) fn result(&self, treatment: &str, label: &str) -> EvaluationResult {
        let config = match treatment {
            CONTROL => None,
            _ => self.config(treatment).map(str::to_string),
        };
        EvaluationResult {
            treatment: treatment.to_string(),
            label: label.to_string(),
            config,
            change_number: Some(self.change_number),
            impressions_disabled: self.impressions_disabled,
        }
    }

    /// Builds a `control` result that still carries this flag's change number.
    pub(crate) fn control(&self, label: &str) -> EvaluationResult {
        self.result(CONTROL, label)
    }

    pub(crate) fn default_result(&self, label: &str) -> EvaluationResult {
        self.result(&self.default_treatment, label)
    }
}
