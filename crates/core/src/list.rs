//! List options, pages and opaque continuation tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{FieldSelector, LabelSelector, Resource, StorageError, StorageResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// `None` lists across every namespace.
    pub namespace: Option<String>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
    /// Max items per page; `None` or 0 returns everything.
    pub limit: Option<usize>,
    pub continue_token: Option<String>,
}

impl ListOptions {
    pub fn all() -> Self { Self::default() }

    pub fn namespaced(ns: &str) -> Self { Self { namespace: Some(ns.to_string()), ..Default::default() } }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_continue(mut self, token: Option<String>) -> Self {
        self.continue_token = token;
        self
    }

    pub fn with_labels(mut self, sel: LabelSelector) -> Self {
        self.label_selector = Some(sel);
        self
    }

    pub fn with_fields(mut self, sel: FieldSelector) -> Self {
        self.field_selector = Some(sel);
        self
    }

    pub fn page_size(&self) -> Option<usize> { self.limit.filter(|l| *l > 0) }

    /// Decoded continuation position, if any.
    pub fn cursor(&self) -> StorageResult<Option<ContinueToken>> {
        self.continue_token.as_deref().filter(|t| !t.is_empty()).map(ContinueToken::decode).transpose()
    }

    /// Namespace, label and field filters.
    pub fn matches(&self, obj: &Resource) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.namespace() != ns {
                return false;
            }
        }
        if let Some(sel) = &self.label_selector {
            if !sel.matches(&obj.metadata.labels) {
                return false;
            }
        }
        if let Some(sel) = &self.field_selector {
            if !sel.matches(obj) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPage {
    pub items: Vec<Resource>,
    /// Set when more items remain; pass back through `ListOptions::with_continue`.
    pub continue_token: Option<String>,
    /// Backend-local version observed when the page was produced.
    pub resource_version: String,
}

/// Position after the last returned item. Lists resume strictly after it, so a
/// continued list tolerates concurrent inserts and deletes (best effort, not a snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueToken {
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "n")]
    pub name: String,
}

impl ContinueToken {
    pub fn after(obj: &Resource) -> Self {
        Self { namespace: obj.namespace().to_string(), name: obj.name().to_string() }
    }

    pub fn encode(&self) -> String {
        // Serializing two strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> StorageResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| StorageError::BadRequest("invalid continue token".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| StorageError::BadRequest("invalid continue token".into()))
    }
}
