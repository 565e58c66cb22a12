//! Graph node shapes and their deterministic identities.
//!
//! Node ids are UUIDv5 hashes of a stable primary key, so re-running the
//! same plan merges into the same nodes instead of duplicating them. An
//! asset is keyed by MAC when one is known and non-zero, otherwise by its
//! IP scoped to the containing network.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

use crate::server::planner::types::ScanPlan;
use crate::server::scanner::events::{HostRecord, PortObservation, PortStateKind};

/// Namespace for all Eidolon graph node ids
pub const GRAPH_NS: Uuid = Uuid::from_bytes([
    0x8f, 0x1c, 0x52, 0xe9, 0x3a, 0x07, 0x4b, 0x6d, 0x9e, 0x21, 0xd5, 0x44, 0x7a, 0x90, 0x3b, 0x16,
]);

const ZERO_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Online,
    Idle,
    Offline,
}

/// Render a network as `a.b.c.d/len` (the `/32` form included, which the
/// cidr crate's Display elides)
pub fn cidr_spec(cidr: &Ipv4Cidr) -> String {
    format!("{}/{}", cidr.first_address(), cidr.network_length())
}

/// Stable primary key for an asset: MAC when known and non-zero, else the
/// IP scoped to its network
pub fn asset_primary_key(mac: Option<&str>, ip: Ipv4Addr, scope: &Ipv4Cidr) -> String {
    match mac {
        Some(mac) if !mac.is_empty() && mac != ZERO_MAC => mac.to_ascii_uppercase(),
        _ => format!("{ip}@{}", cidr_spec(scope)),
    }
}

pub fn asset_node_id(primary_key: &str) -> Uuid {
    Uuid::new_v5(&GRAPH_NS, format!("asset:{primary_key}").as_bytes())
}

pub fn network_node_id(cidr: &Ipv4Cidr) -> Uuid {
    Uuid::new_v5(&GRAPH_NS, format!("network:{}", cidr_spec(cidr)).as_bytes())
}

pub fn service_node_id(asset_node_id: &Uuid, port: u16, protocol: &str) -> Uuid {
    Uuid::new_v5(
        &GRAPH_NS,
        format!("service:{asset_node_id}:{port}:{protocol}").as_bytes(),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetNode {
    pub node_id: Uuid,
    pub identifiers: Vec<String>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub status: String,
    pub lifecycle_state: LifecycleState,
    /// The most recent scan's observations, replaced wholesale on re-scan
    pub ports: Vec<PortObservation>,
    pub os_matches: Vec<String>,
    pub distance: Option<u32>,
    pub rtt_srtt_us: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkContainerNode {
    pub node_id: Uuid,
    pub cidr: String,
    pub name: String,
    pub network_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node_id: Uuid,
    pub asset_node_id: Uuid,
    pub port: u16,
    pub protocol: String,
    pub name: Option<String>,
    pub state: String,
    pub last_seen: DateTime<Utc>,
}

/// Everything one host-scoped transaction writes
#[derive(Debug, Clone)]
pub struct HostWriteBatch {
    pub ip: Ipv4Addr,
    pub asset: AssetNode,
    pub networks: Vec<NetworkContainerNode>,
    pub services: Vec<ServiceNode>,
}

impl HostWriteBatch {
    /// Build the write batch for one live host
    pub fn from_record(record: &HostRecord, plan: &ScanPlan, now: DateTime<Utc>) -> Self {
        let scope = plan.scope_for(record.ip);
        let key = asset_primary_key(record.mac.as_deref(), record.ip, &scope);
        let node_id = asset_node_id(&key);

        let mut identifiers = vec![record.ip.to_string()];
        if let Some(mac) = &record.mac {
            identifiers.push(mac.to_ascii_uppercase());
        }
        if let Some(hostname) = &record.hostname {
            identifiers.push(hostname.clone());
        }

        let asset = AssetNode {
            node_id,
            identifiers,
            hostname: record.hostname.clone(),
            mac: record.mac.as_deref().map(str::to_ascii_uppercase),
            vendor: record.vendor.clone(),
            status: "online".to_string(),
            lifecycle_state: LifecycleState::Online,
            ports: record.ports.clone(),
            os_matches: record.os_matches.iter().map(|m| m.name.clone()).collect(),
            distance: record.distance,
            rtt_srtt_us: record.rtt_srtt_us,
            uptime_seconds: record.uptime_seconds,
            last_seen: now,
        };

        let networks = plan
            .containing_networks(record.ip)
            .into_iter()
            .map(|cidr| NetworkContainerNode {
                node_id: network_node_id(cidr),
                cidr: cidr_spec(cidr),
                name: cidr_spec(cidr),
                network_type: "scanned".to_string(),
            })
            .collect();

        let services = record
            .ports
            .iter()
            .filter(|p| p.state == PortStateKind::Open)
            .map(|p| ServiceNode {
                node_id: service_node_id(&node_id, p.port, &p.protocol),
                asset_node_id: node_id,
                port: p.port,
                protocol: p.protocol.clone(),
                name: p.service.clone(),
                state: "open".to_string(),
                last_seen: now,
            })
            .collect();

        Self {
            ip: record.ip,
            asset,
            networks,
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::planner::base::build_plan;
    use crate::server::planner::types::{PortPreset, ScanConfig, ScanOptions};
    use crate::server::scanner::events::OsMatchObservation;

    fn plan() -> ScanPlan {
        build_plan(&ScanConfig {
            network_cidrs: vec!["10.0.0.0/29".into()],
            ports: vec![22, 80],
            port_preset: PortPreset::Custom,
            options: ScanOptions::default(),
        })
        .unwrap()
    }

    fn record(ip: [u8; 4], mac: Option<&str>) -> HostRecord {
        HostRecord {
            ip: Ipv4Addr::from(ip),
            up: true,
            mac: mac.map(str::to_string),
            vendor: None,
            hostname: None,
            ports: vec![
                PortObservation {
                    port: 22,
                    protocol: "tcp".into(),
                    state: PortStateKind::Open,
                    service: Some("ssh".into()),
                },
                PortObservation {
                    port: 80,
                    protocol: "tcp".into(),
                    state: PortStateKind::Closed,
                    service: None,
                },
            ],
            os_matches: vec![OsMatchObservation {
                name: "Linux 5.X".into(),
                accuracy: 95,
            }],
            distance: None,
            rtt_srtt_us: Some(1200),
            uptime_seconds: None,
        }
    }

    #[test]
    fn node_ids_are_deterministic() {
        let plan = plan();
        let now = Utc::now();
        let a = HostWriteBatch::from_record(&record([10, 0, 0, 5], None), &plan, now);
        let b = HostWriteBatch::from_record(&record([10, 0, 0, 5], None), &plan, now);
        assert_eq!(a.asset.node_id, b.asset.node_id);
        assert_eq!(a.services[0].node_id, b.services[0].node_id);
    }

    #[test]
    fn mac_outranks_ip_as_primary_key() {
        let plan = plan();
        let now = Utc::now();
        let by_ip = HostWriteBatch::from_record(&record([10, 0, 0, 5], None), &plan, now);
        let by_mac =
            HostWriteBatch::from_record(&record([10, 0, 0, 5], Some("aa:bb:cc:00:11:22")), &plan, now);
        assert_ne!(by_ip.asset.node_id, by_mac.asset.node_id);

        // A zero MAC falls back to the IP key
        let zero_mac =
            HostWriteBatch::from_record(&record([10, 0, 0, 5], Some(ZERO_MAC)), &plan, now);
        assert_eq!(zero_mac.asset.node_id, by_ip.asset.node_id);
    }

    #[test]
    fn mac_key_is_case_insensitive() {
        let plan = plan();
        let now = Utc::now();
        let lower =
            HostWriteBatch::from_record(&record([10, 0, 0, 5], Some("aa:bb:cc:00:11:22")), &plan, now);
        let upper =
            HostWriteBatch::from_record(&record([10, 0, 0, 5], Some("AA:BB:CC:00:11:22")), &plan, now);
        assert_eq!(lower.asset.node_id, upper.asset.node_id);
    }

    #[test]
    fn only_open_ports_become_services() {
        let plan = plan();
        let batch = HostWriteBatch::from_record(&record([10, 0, 0, 5], None), &plan, Utc::now());
        assert_eq!(batch.services.len(), 1);
        assert_eq!(batch.services[0].port, 22);
        assert_eq!(batch.services[0].name.as_deref(), Some("ssh"));
        // Closed observation still lands in asset metadata
        assert_eq!(batch.asset.ports.len(), 2);
    }

    #[test]
    fn containing_network_produces_contains_edge_source() {
        let plan = plan();
        let batch = HostWriteBatch::from_record(&record([10, 0, 0, 5], None), &plan, Utc::now());
        assert_eq!(batch.networks.len(), 1);
        assert_eq!(batch.networks[0].cidr, "10.0.0.0/29");
        assert_eq!(batch.networks[0].node_id, network_node_id(&plan.networks[0]));
    }

    #[test]
    fn identifiers_cover_known_names() {
        let plan = plan();
        let mut rec = record([10, 0, 0, 5], Some("aa:bb:cc:00:11:22"));
        rec.hostname = Some("web.local".into());
        let batch = HostWriteBatch::from_record(&rec, &plan, Utc::now());
        assert!(batch.asset.identifiers.contains(&"10.0.0.5".to_string()));
        assert!(
            batch
                .asset
                .identifiers
                .contains(&"AA:BB:CC:00:11:22".to_string())
        );
        assert!(batch.asset.identifiers.contains(&"web.local".to_string()));
    }
}
