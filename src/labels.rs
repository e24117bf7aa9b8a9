//! Node label validation.
//!
//! A label key is an optional DNS subdomain prefix followed by `/` and a
//! name. Names (and non-empty values) are at most 63 characters of
//! `[A-Za-z0-9_.-]`, starting and ending with an alphanumeric character.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Upper bound on labels attached to a single node.
pub const MAX_LABELS_PER_NODE: usize = 128;

const MAX_NAME_LENGTH: usize = 63;
const MAX_PREFIX_LENGTH: usize = 253;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9_.-]*[A-Za-z0-9])?$").expect("static regex")
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$").expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum LabelError {
    #[snafu(display("label name must not be empty"))]
    EmptyName,

    #[snafu(display("label name '{name}' is longer than {MAX_NAME_LENGTH} characters"))]
    NameTooLong { name: String },

    #[snafu(display("label name '{name}' must be alphanumeric with inner '-', '_' or '.'"))]
    InvalidName { name: String },

    #[snafu(display("label prefix '{prefix}' is not a DNS subdomain of at most {MAX_PREFIX_LENGTH} characters"))]
    InvalidPrefix { prefix: String },
}

/// A key/value pair as carried in requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

fn validate_name(name: &str) -> Result<(), LabelError> {
    if name.is_empty() {
        return Err(LabelError::EmptyName);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(LabelError::NameTooLong { name: name.to_string() });
    }
    if !NAME.is_match(name) {
        return Err(LabelError::InvalidName { name: name.to_string() });
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<(), LabelError> {
    match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH || !DNS_SUBDOMAIN.is_match(prefix) {
                return Err(LabelError::InvalidPrefix {
                    prefix: prefix.to_string(),
                });
            }
            validate_name(name)
        }
        None => validate_name(key),
    }
}

/// Values may be empty; otherwise they follow the name rules.
pub fn validate_value(value: &str) -> Result<(), LabelError> {
    if value.is_empty() {
        return Ok(());
    }
    validate_name(value)
}
