use std::net::Ipv4Addr;

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Named port selections a user can pick instead of an explicit list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortPreset {
    Fast,
    Normal,
    Full,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub ping_concurrency: u16,
    pub port_scan_workers: u16,
    pub dns_resolution: bool,
    pub aggressive: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ping_concurrency: 128,
            port_scan_workers: 16,
            dns_resolution: false,
            aggressive: false,
        }
    }
}

impl ScanOptions {
    pub const PING_CONCURRENCY_RANGE: (u16, u16) = (32, 512);
    pub const PORT_SCAN_WORKERS_RANGE: (u16, u16) = (8, 64);
}

/// User-facing scan configuration, as stored and as accepted on the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub network_cidrs: Vec<String>,
    pub ports: Vec<u16>,
    pub port_preset: PortPreset,
    pub options: ScanOptions,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            network_cidrs: Vec::new(),
            ports: vec![22, 80, 443, 445, 3389, 8080],
            port_preset: PortPreset::Normal,
            options: ScanOptions::default(),
        }
    }
}

/// Normalized, validated scan plan derived from a [`ScanConfig`].
///
/// `hosts` is the deduplicated union of all target ranges; its length is
/// the denominator reported in progress events. `targets` keeps the
/// normalized target specs for handing to the external scanner, which
/// understands the same single/dash/CIDR forms.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub targets: Vec<String>,
    pub hosts: Vec<Ipv4Addr>,
    pub ports: Vec<u16>,
    pub networks: Vec<Ipv4Cidr>,
    pub options: ScanOptions,
    pub scan_all_ports: bool,
}

impl ScanPlan {
    /// Plan networks whose range contains the given address
    pub fn containing_networks(&self, ip: Ipv4Addr) -> Vec<&Ipv4Cidr> {
        self.networks.iter().filter(|n| n.contains(&ip)).collect()
    }

    /// Network scope used to key an asset when no MAC is known.
    /// Falls back to a /32 when the address came from a bare or dash target.
    pub fn scope_for(&self, ip: Ipv4Addr) -> Ipv4Cidr {
        self.networks
            .iter()
            .find(|n| n.contains(&ip))
            .copied()
            .unwrap_or_else(|| Ipv4Cidr::new(ip, 32).expect("/32 is always valid"))
    }
}
