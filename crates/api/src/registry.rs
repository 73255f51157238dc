use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use duet_core::{Backend, ResourceInfo};
use duet_dualwrite::{ConfigError, DualWriter, ReconcileQueue, RoutingTable, StorageConfig};
use tracing::info;

use crate::{Authorizer, ResourceStorage};

/// Served resources and their storages, fixed at startup.
pub struct Registry {
    routes: RoutingTable,
    storages: BTreeMap<String, Arc<ResourceStorage>>,
    reconcile: Arc<ReconcileQueue>,
}

struct Served {
    info: ResourceInfo,
    legacy: Arc<dyn Backend>,
    unified: Arc<dyn Backend>,
}

pub struct RegistryBuilder {
    cfg: StorageConfig,
    served: Vec<Served>,
}

impl RegistryBuilder {
    /// Serve `legacy`/`unified` as the two backends of the adapters' resource type.
    pub fn serve(mut self, legacy: Arc<dyn Backend>, unified: Arc<dyn Backend>) -> Self {
        let info = legacy.resource().clone();
        self.served.push(Served { info, legacy, unified });
        self
    }

    /// Validate the configuration against the served set and build every
    /// writer. Any mismatch is a startup error.
    pub fn build(self, authz: Arc<dyn Authorizer>) -> Result<Registry, ConfigError> {
        for s in &self.served {
            if s.unified.resource() != &s.info {
                return Err(ConfigError::Invalid(format!(
                    "legacy and unified adapters disagree on resource {}",
                    s.info.group_resource()
                )));
            }
        }
        let infos: Vec<ResourceInfo> = self.served.iter().map(|s| s.info.clone()).collect();
        let routes = RoutingTable::build(&self.cfg, &infos)?;
        let reconcile = Arc::new(ReconcileQueue::with_capacity(self.cfg.reconcile_capacity));
        let shadow_timeout = Duration::from_millis(self.cfg.shadow_timeout_ms);
        let mut storages = BTreeMap::new();
        for s in self.served {
            let key = s.info.group_resource();
            let policy = routes
                .policy(&key)
                .cloned()
                .ok_or_else(|| ConfigError::MissingResource(key.clone()))?;
            info!(resource = %key, mode = %policy.mode, read = %policy.read_target, both = policy.require_both_succeed, "registry: serving");
            let writer = DualWriter::new(policy, s.legacy, s.unified)
                .with_reconcile_queue(Arc::clone(&reconcile))
                .with_shadow_timeout(shadow_timeout);
            storages.insert(key, Arc::new(ResourceStorage::new(Arc::new(writer), Arc::clone(&authz))));
        }
        Ok(Registry { routes, storages, reconcile })
    }
}

impl Registry {
    pub fn builder(cfg: StorageConfig) -> RegistryBuilder { RegistryBuilder { cfg, served: Vec::new() } }

    /// Storage for `resource.group`.
    pub fn storage(&self, resource: &str) -> Option<Arc<ResourceStorage>> { self.storages.get(resource).cloned() }

    pub fn routes(&self) -> &RoutingTable { &self.routes }

    /// Queue shared by every writer in the registry.
    pub fn reconcile_queue(&self) -> &Arc<ReconcileQueue> { &self.reconcile }

    pub fn resources(&self) -> impl Iterator<Item = &String> { self.storages.keys() }
}
