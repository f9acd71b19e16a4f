use std::collections::HashMap;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::eval::{label, EvaluationResult, CONTROL};

lazy_static! {
    static ref TREATMENT_REGEX: Regex =
        Regex::new(r"^[0-9]+[.a-zA-Z0-9_-]*$|^[a-zA-Z]+[a-zA-Z0-9_-]*$").unwrap();
}

const MAX_TREATMENT_LENGTH: usize = 100;

/// A treatment, with optional configuration, returned in place of `control`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "FallbackTreatmentVariant")]
pub struct FallbackTreatment {
    pub treatment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

impl FallbackTreatment {
    pub fn new(treatment: impl Into<String>) -> Self {
        Self {
            treatment: treatment.into(),
            config: None,
        }
    }

    pub fn with_config(treatment: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            treatment: treatment.into(),
            config: Some(config.into()),
        }
    }

    fn is_valid(&self) -> bool {
        self.treatment.len() <= MAX_TREATMENT_LENGTH
            && self.treatment != CONTROL
            && TREATMENT_REGEX.is_match(&self.treatment)
    }
}

// Entries are either a bare treatment or an object carrying a configuration too.
#[derive(Deserialize)]
#[serde(untagged)]
enum FallbackTreatmentVariant {
    Plain(String),
    Full {
        treatment: String,
        #[serde(default)]
        config: Option<String>,
    },
}

impl From<FallbackTreatmentVariant> for FallbackTreatment {
    fn from(variant: FallbackTreatmentVariant) -> Self {
        match variant {
            FallbackTreatmentVariant::Plain(treatment) => FallbackTreatment::new(treatment),
            FallbackTreatmentVariant::Full { treatment, config } => {
                FallbackTreatment { treatment, config }
            }
        }
    }
}

/// FallbackTreatmentsConfiguration decides what callers receive instead of `control`.
///
/// A per-flag entry wins over the global one. Results that are not `control` are never touched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackTreatmentsConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<FallbackTreatment>,
    #[serde(default)]
    pub by_flag: HashMap<String, FallbackTreatment>,
}

impl FallbackTreatmentsConfiguration {
    pub fn with_global(mut self, fallback: FallbackTreatment) -> Self {
        self.global = Some(fallback);
        self
    }

    pub fn with_flag(mut self, flag_name: impl Into<String>, fallback: FallbackTreatment) -> Self {
        self.by_flag.insert(flag_name.into(), fallback);
        self
    }

    /// Drops entries whose treatment is not a valid treatment name.
    pub fn sanitized(self) -> Self {
        let global = self.global.filter(|fallback| {
            let valid = fallback.is_valid();
            if !valid {
                warn!(
                    "discarding global fallback treatment {:?}: not a valid treatment name",
                    fallback.treatment
                );
            }
            valid
        });

        let by_flag = self
            .by_flag
            .into_iter()
            .filter(|(flag_name, fallback)| {
                let valid = fallback.is_valid();
                if !valid {
                    warn!(
                        "discarding fallback treatment {:?} for flag {}: not a valid treatment name",
                        fallback.treatment, flag_name
                    );
                }
                valid
            })
            .collect();

        Self { global, by_flag }
    }

    /// Replaces a `control` result for `flag_name` with the configured fallback, if there is one.
    pub fn resolve(&self, flag_name: &str, result: EvaluationResult) -> EvaluationResult {
        if !result.is_control() {
            return result;
        }

        match self.by_flag.get(flag_name).or(self.global.as_ref()) {
            Some(fallback) => EvaluationResult {
                treatment: fallback.treatment.clone(),
                label: format!("{}{}", label::FALLBACK_PREFIX, result.label),
                config: fallback.config.clone(),
                ..result
            },
            None => result,
        }
    }
}
