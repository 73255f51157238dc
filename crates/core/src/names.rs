//! Name validation and server-side name generation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{ObjectMeta, StorageError, StorageResult};

/// Attempts a backend makes to find a free generated name before giving up.
pub const MAX_GENERATE_ATTEMPTS: usize = 8;

const SUFFIX_LEN: usize = 5;
// Same alphabet as Kubernetes: no vowels, no ambiguous digits.
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const MAX_NAME_LEN: usize = 253;

static DNS1123_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::BadRequest("metadata.name is required".into()));
    }
    if name.len() > MAX_NAME_LEN || !DNS1123_SUBDOMAIN.is_match(name) {
        return Err(StorageError::BadRequest(format!(
            "invalid name {name:?}: must be a lowercase RFC 1123 subdomain of at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_generate_name(prefix: &str) -> StorageResult<()> {
    if prefix.is_empty() {
        return Err(StorageError::BadRequest("metadata.generateName must not be empty".into()));
    }
    // A prefix may end in '-' or '.'; check it as if a suffix were already attached.
    let sample = format!("{prefix}{}", "x".repeat(SUFFIX_LEN));
    validate_name(&sample).map_err(|_| StorageError::BadRequest(format!("invalid generateName {prefix:?}")))
}

/// `prefix` plus a random 5 character suffix.
pub fn generate_name(prefix: &str) -> String {
    let entropy = uuid::Uuid::new_v4();
    let suffix: String = entropy
        .as_bytes()
        .iter()
        .take(SUFFIX_LEN)
        .map(|b| SUFFIX_ALPHABET[(*b as usize) % SUFFIX_ALPHABET.len()] as char)
        .collect();
    format!("{prefix}{suffix}")
}

/// Validated name for a create request. Returns `(name, generated)`.
pub fn create_name(meta: &ObjectMeta) -> StorageResult<(String, bool)> {
    if !meta.name.is_empty() {
        validate_name(&meta.name)?;
        return Ok((meta.name.clone(), false));
    }
    match meta.generate_name.as_deref() {
        Some(prefix) => {
            validate_generate_name(prefix)?;
            Ok((generate_name(prefix), true))
        }
        None => Err(StorageError::BadRequest("metadata.name or metadata.generateName is required".into())),
    }
}

pub fn new_uid() -> String { uuid::Uuid::new_v4().to_string() }

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
