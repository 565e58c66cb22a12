//! Property-graph persistence seam and its Neo4j implementation.
//!
//! One call = one transaction covering a single host: the asset upsert, its
//! CONTAINS memberships and its service nodes. Identity lives in `node_id`,
//! so every statement is a MERGE and re-runs converge instead of
//! duplicating.

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{Graph, query};

use crate::server::graph::nodes::HostWriteBatch;

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_host(&self, batch: &HostWriteBatch) -> Result<()>;
}

pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub async fn connect(url: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(url, user, password).await?;
        tracing::info!(url = %url, "Connected to graph store");
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert_host(&self, batch: &HostWriteBatch) -> Result<()> {
        let asset = &batch.asset;
        let asset_id = asset.node_id.to_string();
        let now = asset.last_seen.to_rfc3339();

        let mut queries = Vec::with_capacity(2 + batch.networks.len() + batch.services.len());

        // Port observations are structured; a graph property cannot hold
        // maps, so they travel as one JSON document
        let ports_json = serde_json::to_string(&asset.ports)?;

        queries.push(
            query(
                "MERGE (a:Asset {node_id: $node_id}) \
                 ON CREATE SET a.first_seen = $now, a.identifiers = $identifiers \
                 ON MATCH SET a.identifiers = a.identifiers + \
                     [x IN $identifiers WHERE NOT x IN a.identifiers] \
                 SET a.hostname = $hostname, a.mac = $mac, a.vendor = $vendor, \
                     a.status = $status, a.lifecycle_state = $lifecycle_state, \
                     a.ports = $ports, a.os_matches = $os_matches, \
                     a.distance = $distance, a.rtt_srtt_us = $rtt_srtt_us, \
                     a.uptime_seconds = $uptime_seconds, a.last_seen = $now",
            )
            .param("node_id", asset_id.clone())
            .param("identifiers", asset.identifiers.clone())
            .param("hostname", asset.hostname.clone())
            .param("mac", asset.mac.clone())
            .param("vendor", asset.vendor.clone())
            .param("status", asset.status.clone())
            .param("lifecycle_state", asset.lifecycle_state.to_string())
            .param("ports", ports_json)
            .param("os_matches", asset.os_matches.clone())
            .param("distance", asset.distance.map(i64::from))
            .param("rtt_srtt_us", asset.rtt_srtt_us.map(|v| v as i64))
            .param("uptime_seconds", asset.uptime_seconds.map(|v| v as i64))
            .param("now", now.clone()),
        );

        for network in &batch.networks {
            queries.push(
                query(
                    "MERGE (n:NetworkContainer {node_id: $node_id}) \
                     SET n.cidr = $cidr, n.name = $name, n.network_type = $network_type \
                     WITH n MATCH (a:Asset {node_id: $asset_id}) \
                     MERGE (n)-[:CONTAINS]->(a)",
                )
                .param("node_id", network.node_id.to_string())
                .param("cidr", network.cidr.clone())
                .param("name", network.name.clone())
                .param("network_type", network.network_type.clone())
                .param("asset_id", asset_id.clone()),
            );
        }

        let current_service_ids: Vec<String> = batch
            .services
            .iter()
            .map(|s| s.node_id.to_string())
            .collect();

        for service in &batch.services {
            queries.push(
                query(
                    "MERGE (s:Service {node_id: $node_id}) \
                     SET s.port = $port, s.protocol = $protocol, s.name = $name, \
                         s.state = 'open', s.last_seen = $now \
                     WITH s MATCH (a:Asset {node_id: $asset_id}) \
                     MERGE (a)-[:HAS_SERVICE]->(s)",
                )
                .param("node_id", service.node_id.to_string())
                .param("port", i64::from(service.port))
                .param("protocol", service.protocol.clone())
                .param("name", service.name.clone())
                .param("asset_id", asset_id.clone())
                .param("now", now.clone()),
            );
        }

        // Services that vanished since the previous scan are kept for
        // history, marked closed
        queries.push(
            query(
                "MATCH (a:Asset {node_id: $asset_id})-[:HAS_SERVICE]->(s:Service) \
                 WHERE NOT s.node_id IN $current_ids \
                 SET s.state = 'closed'",
            )
            .param("asset_id", asset_id)
            .param("current_ids", current_service_ids),
        );

        let mut txn = self.graph.start_txn().await?;
        txn.run_queries(queries).await?;
        txn.commit().await?;

        tracing::debug!(ip = %batch.ip, "Upserted host into graph");
        Ok(())
    }
}
