//! In-memory [`GraphStore`] used by unit tests: same merge semantics as the
//! Neo4j implementation, plus scriptable per-host failures.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use uuid::Uuid;

use crate::server::graph::nodes::{AssetNode, HostWriteBatch, NetworkContainerNode, ServiceNode};
use crate::server::graph::store::GraphStore;

#[derive(Default)]
pub struct MemoryGraphStore {
    pub assets: Mutex<HashMap<Uuid, AssetNode>>,
    pub networks: Mutex<HashMap<Uuid, NetworkContainerNode>>,
    pub services: Mutex<HashMap<Uuid, ServiceNode>>,
    pub contains: Mutex<HashSet<(Uuid, Uuid)>>,
    pub has_service: Mutex<HashSet<(Uuid, Uuid)>>,
    failures: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes for `ip` fail
    pub fn fail_next(&self, ip: Ipv4Addr, count: usize) {
        self.failures.lock().unwrap().insert(ip, count);
    }

    pub fn asset_by_id(&self, node_id: &Uuid) -> Option<AssetNode> {
        self.assets.lock().unwrap().get(node_id).cloned()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.lock().unwrap().len()
    }

    pub fn find_asset_by_identifier(&self, identifier: &str) -> Option<AssetNode> {
        self.assets
            .lock()
            .unwrap()
            .values()
            .find(|a| a.identifiers.iter().any(|i| i == identifier))
            .cloned()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_host(&self, batch: &HostWriteBatch) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&batch.ip) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("injected write failure for {}", batch.ip));
                }
            }
        }

        {
            let mut assets = self.assets.lock().unwrap();
            match assets.get_mut(&batch.asset.node_id) {
                Some(existing) => {
                    // Union identifiers, overwrite the per-scan fields
                    let mut merged = batch.asset.clone();
                    for id in &existing.identifiers {
                        if !merged.identifiers.contains(id) {
                            merged.identifiers.push(id.clone());
                        }
                    }
                    *existing = merged;
                }
                None => {
                    assets.insert(batch.asset.node_id, batch.asset.clone());
                }
            }
        }

        {
            let mut networks = self.networks.lock().unwrap();
            let mut contains = self.contains.lock().unwrap();
            for network in &batch.networks {
                networks.insert(network.node_id, network.clone());
                contains.insert((network.node_id, batch.asset.node_id));
            }
        }

        {
            let mut services = self.services.lock().unwrap();
            let mut has_service = self.has_service.lock().unwrap();
            let current: HashSet<Uuid> = batch.services.iter().map(|s| s.node_id).collect();

            for service in &batch.services {
                services.insert(service.node_id, service.clone());
                has_service.insert((batch.asset.node_id, service.node_id));
            }

            // Disappeared services survive, marked closed
            for service in services.values_mut() {
                if service.asset_node_id == batch.asset.node_id
                    && !current.contains(&service.node_id)
                {
                    service.state = "closed".to_string();
                }
            }
        }

        Ok(())
    }
}

impl MemoryGraphStore {
    pub fn service_states(&self, asset_node_id: &Uuid) -> Vec<(u16, String)> {
        let mut states: Vec<(u16, String)> = self
            .services
            .lock()
            .unwrap()
            .values()
            .filter(|s| &s.asset_node_id == asset_node_id)
            .map(|s| (s.port, s.state.clone()))
            .collect();
        states.sort();
        states
    }
}
