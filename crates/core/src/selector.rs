//! Equality-based label and field selectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Resource, StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

/// `k=v`, `k==v`, `k!=v`, `k` and `!k`, comma separated (all must hold).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    reqs: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut reqs = SmallVec::new();
        for raw in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let req = if let Some((k, v)) = raw.split_once("!=") {
                Requirement::NotEquals(key(k, raw)?, v.trim().to_string())
            } else if let Some((k, v)) = raw.split_once("==") {
                Requirement::Equals(key(k, raw)?, v.trim().to_string())
            } else if let Some((k, v)) = raw.split_once('=') {
                Requirement::Equals(key(k, raw)?, v.trim().to_string())
            } else if let Some(k) = raw.strip_prefix('!') {
                Requirement::NotExists(key(k, raw)?)
            } else {
                Requirement::Exists(key(raw, raw)?)
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    pub fn eq(key: &str, value: &str) -> Self {
        let mut reqs = SmallVec::new();
        reqs.push(Requirement::Equals(key.to_string(), value.to_string()));
        Self { reqs }
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

fn key(k: &str, raw: &str) -> StorageResult<String> {
    let k = k.trim();
    if k.is_empty() || k.contains(|c: char| c.is_whitespace() || c == '!' || c == '=') {
        return Err(StorageError::BadRequest(format!("invalid selector requirement: {raw}")));
    }
    Ok(k.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    Name,
    Namespace,
}

/// Field selector over `metadata.name` and `metadata.namespace`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    reqs: SmallVec<[(Field, bool, String); 2]>,
}

impl FieldSelector {
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut reqs = SmallVec::new();
        for raw in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (path, equal, value) = if let Some((k, v)) = raw.split_once("!=") {
                (k, false, v)
            } else if let Some((k, v)) = raw.split_once("==") {
                (k, true, v)
            } else if let Some((k, v)) = raw.split_once('=') {
                (k, true, v)
            } else {
                return Err(StorageError::BadRequest(format!("invalid field selector: {raw}")));
            };
            let field = match path.trim() {
                "metadata.name" => Field::Name,
                "metadata.namespace" => Field::Namespace,
                other => return Err(StorageError::BadRequest(format!("unsupported field selector path: {other}"))),
            };
            reqs.push((field, equal, value.trim().to_string()));
        }
        Ok(Self { reqs })
    }

    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, obj: &Resource) -> bool {
        self.reqs.iter().all(|(field, equal, value)| {
            let actual = match field {
                Field::Name => obj.name(),
                Field::Namespace => obj.namespace(),
            };
            (actual == value) == *equal
        })
    }
}
