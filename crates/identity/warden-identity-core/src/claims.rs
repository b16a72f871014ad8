//! Mapping provider payloads onto an [`Identity`].
//!
//! A [`ClaimMappings`] table maps a claim type such as `email_claim` to a
//! [path expression](crate::path). Providers may call [`map_claims`] several
//! times with payloads from different endpoints; string fields keep the first
//! non-empty value seen while `email_verified` always takes the latest one.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::Identity;
use crate::path::extract;

pub const SUBJECT_CLAIM: &str = "subject_claim";
pub const EMAIL_CLAIM: &str = "email_claim";
pub const EMAIL_VERIFIED_CLAIM: &str = "email_verified_claim";
pub const NAME_CLAIM: &str = "name_claim";
pub const GIVEN_NAME_CLAIM: &str = "given_name_claim";
pub const FAMILY_NAME_CLAIM: &str = "family_name_claim";
pub const PICTURE_CLAIM: &str = "picture_claim";
pub const GROUPS_CLAIM: &str = "groups_claim";

/// Claim type to path expression.
pub type ClaimMappings = HashMap<String, String>;

const DEFAULT_CLAIM_PATHS: [(&str, &str); 8] = [
    (SUBJECT_CLAIM, "sub"),
    (EMAIL_CLAIM, "email"),
    (EMAIL_VERIFIED_CLAIM, "email_verified"),
    (NAME_CLAIM, "name"),
    (GIVEN_NAME_CLAIM, "given_name"),
    (FAMILY_NAME_CLAIM, "family_name"),
    (PICTURE_CLAIM, "picture"),
    (GROUPS_CLAIM, "groups"),
];

/// The OIDC standard claim names for every claim type.
pub fn default_claim_mappings() -> ClaimMappings {
    DEFAULT_CLAIM_PATHS
        .iter()
        .map(|(claim, path)| (claim.to_string(), path.to_string()))
        .collect()
}

/// Adds a default path for each claim type missing from `mappings`, but only
/// when that path resolves in `payload`. Returns how many were added.
pub fn apply_defaults(mappings: &mut ClaimMappings, payload: &Value) -> usize {
    let mut added = 0;
    for (claim, path) in DEFAULT_CLAIM_PATHS {
        if mappings.contains_key(claim) || extract(payload, path).is_err() {
            continue;
        }
        mappings.insert(claim.to_string(), path.to_string());
        added += 1;
    }
    added
}

/// Copies every resolvable mapping from `payload` into `identity`.
///
/// Paths that do not resolve are skipped; a provider omitting an optional
/// field is routine.
pub fn map_claims(payload: &Value, mappings: &ClaimMappings, identity: &mut Identity) {
    for (claim, path) in mappings {
        let value = match extract(payload, path) {
            Ok(value) => value,
            Err(err) => {
                debug!(claim = %claim, path = %path, "Claim not resolved: {}", err);
                continue;
            }
        };

        match claim.as_str() {
            SUBJECT_CLAIM => set_once(&mut identity.subject, &value),
            EMAIL_CLAIM => set_once(&mut identity.email, &value),
            NAME_CLAIM => set_once(&mut identity.name, &value),
            GIVEN_NAME_CLAIM => set_once(&mut identity.given_name, &value),
            FAMILY_NAME_CLAIM => set_once(&mut identity.family_name, &value),
            PICTURE_CLAIM => set_once(&mut identity.picture, &value),
            EMAIL_VERIFIED_CLAIM => identity.email_verified = value_to_bool(&value),
            GROUPS_CLAIM => {
                if identity.groups.is_empty() {
                    identity.groups = value_to_groups(&value);
                }
            }
            other => debug!("Ignoring unknown claim type '{}'", other),
        }
    }
}

fn set_once(field: &mut String, value: &Value) {
    if field.is_empty() {
        *field = value_to_string(value);
    }
}

/// Renders a claim value as a string.
///
/// Numbers lose their fractional part, so numeric ids such as GitHub's come
/// out as plain integers.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                int.to_string()
            } else if let Some(uint) = n.as_u64() {
                uint.to_string()
            } else {
                format!("{:.0}", n.as_f64().unwrap_or_default())
            }
        }
        other => other.to_string(),
    }
}

pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Accepts a JSON array, a comma separated string or a single scalar.
pub fn value_to_groups(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .filter(|group| !group.is_empty())
            .collect(),
        Value::String(s) if s.contains(',') => s
            .split(',')
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Null => Vec::new(),
        other => {
            let group = value_to_string(other);
            if group.is_empty() { Vec::new() } else { vec![group] }
        }
    }
}
