use std::fmt;

use serde::{Deserialize, Serialize};

/// Key identifies who a flag is being evaluated for.
///
/// The matching key is what matchers compare against (whitelists, segment membership, excluded
/// keys). The bucketing key is what gets hashed to pick a partition; when it is not set, the
/// matching key is used for both.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeyVariant", into = "KeyVariant")]
pub struct Key {
    matching_key: String,
    bucketing_key: Option<String>,
}

impl Key {
    /// Create a key that is used both for matching and bucketing.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            matching_key: key.into(),
            bucketing_key: None,
        }
    }

    /// Create a key that hashes on `bucketing_key` while matching on `matching_key`.
    pub fn with_bucketing_key(
        matching_key: impl Into<String>,
        bucketing_key: impl Into<String>,
    ) -> Self {
        Self {
            matching_key: matching_key.into(),
            bucketing_key: Some(bucketing_key.into()),
        }
    }

    pub fn matching_key(&self) -> &str {
        &self.matching_key
    }

    pub fn bucketing_key(&self) -> &str {
        self.bucketing_key.as_deref().unwrap_or(&self.matching_key)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Key::new(key)
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Key::new(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucketing_key {
            Some(bucketing_key) => write!(f, "{}/{}", self.matching_key, bucketing_key),
            None => f.write_str(&self.matching_key),
        }
    }
}

// Keys arrive either as a bare string or as an object carrying both keys.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum KeyVariant {
    Plain(String),
    #[serde(rename_all = "camelCase")]
    Composite {
        matching_key: String,
        bucketing_key: String,
    },
}

impl TryFrom<KeyVariant> for Key {
    type Error = String;

    fn try_from(variant: KeyVariant) -> Result<Self, Self::Error> {
        let key = match variant {
            KeyVariant::Plain(key) => Key::new(key),
            KeyVariant::Composite {
                matching_key,
                bucketing_key,
            } => Key::with_bucketing_key(matching_key, bucketing_key),
        };
        if key.matching_key.is_empty() {
            return Err("matching key must not be empty".to_string());
        }
        Ok(key)
    }
}

impl From<Key> for KeyVariant {
    fn from(key: Key) -> Self {
        match key.bucketing_key {
            Some(bucketing_key) => KeyVariant::Composite {
                matching_key: key.matching_key,
                bucketing_key,
            },
            None => KeyVariant::Plain(key.matching_key),
        }
    }
}
