//! `Backend` implementation over the legacy SQLite store.

use std::sync::Arc;

use duet_core::list::ContinueToken;
use duet_core::names::{create_name, new_uid, now_rfc3339, MAX_GENERATE_ATTEMPTS};
use duet_core::{Backend, BackendKind, ListOptions, ListPage, ObjectMeta, Resource, ResourceInfo, StorageError, StorageResult};
use tracing::debug;

use crate::{LegacyError, LegacyRow, Precondition, RowFields, SqliteStore};

const SCAN_BATCH: usize = 256;

/// Org 1 is `default`; every other org is `org-<id>`. Only the canonical
/// spelling maps, so `org-02` or `org-+2` never alias org 2.
pub fn org_for_namespace(namespace: &str) -> Option<i64> {
    if namespace == "default" {
        return Some(1);
    }
    namespace
        .strip_prefix("org-")
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|id| *id > 1 && namespace_for_org(*id) == namespace)
}

pub fn namespace_for_org(org_id: i64) -> String {
    if org_id == 1 { "default".to_string() } else { format!("org-{}", org_id) }
}

/// Serves one resource type out of the legacy store.
pub struct LegacyAdapter {
    store: Arc<SqliteStore>,
    info: ResourceInfo,
}

impl LegacyAdapter {
    pub fn new(store: Arc<SqliteStore>, info: ResourceInfo) -> Self { Self { store, info } }

    fn resource_name(&self) -> String { self.info.group_resource() }

    fn to_resource(&self, row: LegacyRow) -> Resource {
        Resource {
            api_version: self.info.gvr.api_version(),
            kind: self.info.kind.clone(),
            metadata: ObjectMeta {
                name: row.name,
                generate_name: None,
                namespace: namespace_for_org(row.org_id),
                uid: row.uid,
                resource_version: row.version.to_string(),
                generation: row.generation,
                creation_timestamp: Some(row.created),
                labels: row.labels,
                annotations: row.annotations,
            },
            spec: row.spec,
        }
    }

    fn map_err(&self, name: &str, e: LegacyError) -> StorageError {
        let resource = self.resource_name();
        match e {
            LegacyError::Duplicate => StorageError::already_exists(&resource, name),
            LegacyError::Missing => StorageError::not_found(&resource, name),
            LegacyError::VersionMismatch { current } => StorageError::conflict(&resource, name, "", &current.to_string()),
            other => StorageError::unavailable(BackendKind::Legacy, other),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> StorageResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StorageError::Internal(format!("legacy task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl Backend for LegacyAdapter {
    fn kind(&self) -> BackendKind { BackendKind::Legacy }

    fn resource(&self) -> &ResourceInfo { &self.info }

    async fn create(&self, obj: Resource) -> StorageResult<Resource> {
        let org_id = org_for_namespace(obj.namespace()).ok_or_else(|| {
            StorageError::BadRequest(format!("namespace {:?} is not addressable by legacy storage", obj.namespace()))
        })?;
        let kind = self.info.legacy_kind.clone();
        let resource = self.resource_name();
        let row = self
            .blocking(move |store| {
                let uid = if obj.uid().is_empty() { new_uid() } else { obj.metadata.uid.clone() };
                let created = obj.metadata.creation_timestamp.clone().unwrap_or_else(now_rfc3339);
                let mut last = None;
                for _ in 0..MAX_GENERATE_ATTEMPTS {
                    let (name, generated) = create_name(&obj.metadata)?;
                    let row = LegacyRow {
                        org_id,
                        kind: kind.clone(),
                        name: name.clone(),
                        uid: uid.clone(),
                        version: 0,
                        generation: 1,
                        created: created.clone(),
                        labels: obj.metadata.labels.clone(),
                        annotations: obj.metadata.annotations.clone(),
                        spec: obj.spec.clone(),
                    };
                    match store.insert(row) {
                        Ok(row) => return Ok(row),
                        Err(LegacyError::Duplicate) if generated => {
                            debug!(name = %name, "generated name collided; retrying");
                            last = Some(name);
                        }
                        Err(LegacyError::Duplicate) => return Err(StorageError::already_exists(&resource, &name)),
                        Err(e) => return Err(StorageError::unavailable(BackendKind::Legacy, e)),
                    }
                }
                Err(StorageError::already_exists(&resource, &last.unwrap_or_default()))
            })
            .await?;
        Ok(self.to_resource(row))
    }

    async fn get(&self, namespace: &str, name: &str) -> StorageResult<Resource> {
        let Some(org_id) = org_for_namespace(namespace) else {
            return Err(StorageError::not_found(&self.resource_name(), name));
        };
        let kind = self.info.legacy_kind.clone();
        let key = name.to_string();
        let row = self
            .blocking(move |store| store.get(org_id, &kind, &key).map_err(|e| StorageError::unavailable(BackendKind::Legacy, e)))
            .await?;
        match row {
            Some(row) => Ok(self.to_resource(row)),
            None => Err(StorageError::not_found(&self.resource_name(), name)),
        }
    }

    async fn list(&self, opts: &ListOptions) -> StorageResult<ListPage> {
        let org_filter = match opts.namespace.as_deref() {
            Some(ns) => match org_for_namespace(ns) {
                Some(org) => Some(org),
                None => return Ok(ListPage::default()),
            },
            None => None,
        };
        let mut after = match opts.cursor()? {
            Some(tok) => {
                let org = org_for_namespace(&tok.namespace)
                    .ok_or_else(|| StorageError::BadRequest("invalid continue token".into()))?;
                Some((org, tok.name))
            }
            None => None,
        };
        let limit = opts.page_size();
        let mut page = ListPage::default();
        loop {
            let kind = self.info.legacy_kind.clone();
            let cursor = after.clone();
            let batch = self
                .blocking(move |store| {
                    store
                        .scan(&kind, org_filter, cursor.as_ref().map(|(o, n)| (*o, n.as_str())), SCAN_BATCH)
                        .map_err(|e| StorageError::unavailable(BackendKind::Legacy, e))
                })
                .await?;
            let exhausted = batch.len() < SCAN_BATCH;
            for row in batch {
                after = Some((row.org_id, row.name.clone()));
                let obj = self.to_resource(row);
                if !opts.matches(&obj) {
                    continue;
                }
                if limit.is_some_and(|l| page.items.len() >= l) {
                    // One more match exists past the page boundary.
                    page.continue_token = page.items.last().map(|o| ContinueToken::after(o).encode());
                    return self.finish(page).await;
                }
                page.items.push(obj);
            }
            if exhausted {
                return self.finish(page).await;
            }
        }
    }

    async fn update(&self, obj: Resource, expected_rv: Option<&str>) -> StorageResult<Resource> {
        let name = obj.name().to_string();
        let Some(org_id) = org_for_namespace(obj.namespace()) else {
            return Err(StorageError::not_found(&self.resource_name(), &name));
        };
        let expected = match expected_rv.filter(|rv| !rv.is_empty()) {
            Some(rv) => match rv.parse::<i64>() {
                Ok(v) => Some(v),
                // A token this store never minted cannot be current.
                Err(_) => {
                    let current = self.get(obj.namespace(), &name).await?;
                    return Err(StorageError::conflict(&self.resource_name(), &name, rv, current.resource_version()));
                }
            },
            None => None,
        };
        let pre = Precondition {
            version: expected,
            uid: Some(obj.metadata.uid.clone()).filter(|u| !u.is_empty()),
        };
        let kind = self.info.legacy_kind.clone();
        let key = name.clone();
        let fields = RowFields {
            labels: obj.metadata.labels,
            annotations: obj.metadata.annotations,
            spec: obj.spec,
        };
        let res = self.blocking(move |store| Ok(store.update(org_id, &kind, &key, fields, &pre))).await?;
        match res {
            Ok(row) => Ok(self.to_resource(row)),
            Err(LegacyError::VersionMismatch { current }) | Err(LegacyError::UidMismatch { current, .. }) => {
                Err(StorageError::conflict(
                    &self.resource_name(),
                    &name,
                    expected_rv.unwrap_or_default(),
                    &current.to_string(),
                ))
            }
            Err(e) => Err(self.map_err(&name, e)),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> StorageResult<bool> {
        let Some(org_id) = org_for_namespace(namespace) else {
            return Ok(false);
        };
        let kind = self.info.legacy_kind.clone();
        let key = name.to_string();
        self.blocking(move |store| store.delete(org_id, &kind, &key).map_err(|e| StorageError::unavailable(BackendKind::Legacy, e)))
            .await
    }
}

impl LegacyAdapter {
    async fn finish(&self, mut page: ListPage) -> StorageResult<ListPage> {
        let version = self
            .blocking(|store| store.current_version().map_err(|e| StorageError::unavailable(BackendKind::Legacy, e)))
            .await?;
        page.resource_version = version.to_string();
        Ok(page)
    }
}
