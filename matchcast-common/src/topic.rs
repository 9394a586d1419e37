//! Topic identifiers
//!
//! A topic names one live event stream (e.g. one match). Identifiers are
//! opaque to the service; only their shape is validated.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum topic identifier length in bytes
pub const MAX_TOPIC_LEN: usize = 128;

/// Validated topic identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a topic identifier
    ///
    /// Surrounding whitespace is trimmed. The identifier must be non-empty,
    /// at most [`MAX_TOPIC_LEN`] bytes, and free of control characters. It
    /// is passed to the scorer as a command argument, so it may not start
    /// with `-`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("topic must not be empty".to_string()));
        }
        if trimmed.len() > MAX_TOPIC_LEN {
            return Err(Error::InvalidInput(format!(
                "topic exceeds {} bytes",
                MAX_TOPIC_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(Error::InvalidInput(
                "topic must not contain control characters".to_string(),
            ));
        }
        if trimmed.starts_with('-') {
            return Err(Error::InvalidInput(
                "topic must not start with '-'".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Topic::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl std::str::FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Topic::parse(s)
    }
}
