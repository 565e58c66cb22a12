use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use cidr::{Ipv4Cidr, Ipv4Inet};
use thiserror::Error;

use crate::server::planner::types::{PortPreset, ScanConfig, ScanOptions, ScanPlan};

pub const MAX_TARGETS: usize = 50;
pub const MAX_PORTS: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("invalid target '{0}'")]
    InvalidTarget(String),
    #[error("targets '{0}' and '{1}' overlap")]
    OverlappingTargets(String, String),
    #[error("no targets configured")]
    EmptyTargets,
    #[error("too many targets ({0}, max {MAX_TARGETS})")]
    TooManyTargets(usize),
    #[error("invalid port {0}")]
    InvalidPort(u32),
    #[error("duplicate port {0}")]
    DuplicatePort(u16),
    #[error("too many ports ({0}, max {MAX_PORTS})")]
    TooManyPorts(usize),
}

/// One parsed target: an inclusive span of IPv4 addresses plus the
/// normalized spec it came from
#[derive(Debug, Clone)]
struct TargetRange {
    start: u32,
    end: u32,
    spec: String,
    network: Option<Ipv4Cidr>,
}

/// Validate a [`ScanConfig`] and derive the [`ScanPlan`] for it.
///
/// Every validation failure is reported here, before any subprocess is
/// spawned.
pub fn build_plan(config: &ScanConfig) -> Result<ScanPlan, PlannerError> {
    if config.network_cidrs.is_empty() {
        return Err(PlannerError::EmptyTargets);
    }
    if config.network_cidrs.len() > MAX_TARGETS {
        return Err(PlannerError::TooManyTargets(config.network_cidrs.len()));
    }

    let mut ranges: Vec<TargetRange> = config
        .network_cidrs
        .iter()
        .map(|t| parse_target(t))
        .collect::<Result<_, _>>()?;

    ranges.sort_by_key(|r| r.start);
    for pair in ranges.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(PlannerError::OverlappingTargets(
                pair[0].spec.clone(),
                pair[1].spec.clone(),
            ));
        }
    }

    let ports = validate_ports(config)?;
    let scan_all_ports = config.port_preset == PortPreset::Full;

    let hosts: Vec<Ipv4Addr> = ranges
        .iter()
        .flat_map(|r| (r.start..=r.end).map(Ipv4Addr::from))
        .collect();

    let networks: Vec<Ipv4Cidr> = ranges.iter().filter_map(|r| r.network).collect();

    Ok(ScanPlan {
        targets: ranges.into_iter().map(|r| r.spec).collect(),
        hosts,
        ports,
        networks,
        options: clamp_options(config.options),
        scan_all_ports,
    })
}

/// Parse a single target: `A.B.C.D`, `A.B.C.D-N` (right side inherits the
/// first three octets), or CIDR. CIDR bounds are the masked
/// network/broadcast addresses, inclusive.
fn parse_target(target: &str) -> Result<TargetRange, PlannerError> {
    let target = target.trim();
    let invalid = || PlannerError::InvalidTarget(target.to_string());

    if target.contains('/') {
        let inet = Ipv4Inet::from_str(target).map_err(|_| invalid())?;
        let network = inet.network();
        return Ok(TargetRange {
            start: u32::from(network.first_address()),
            end: u32::from(network.last_address()),
            spec: format!("{}/{}", network.first_address(), network.network_length()),
            network: Some(network),
        });
    }

    if let Some((left, right)) = target.split_once('-') {
        let start_addr = Ipv4Addr::from_str(left).map_err(|_| invalid())?;
        let last_octet: u8 = right.parse().map_err(|_| invalid())?;
        let [a, b, c, d] = start_addr.octets();
        if last_octet < d {
            return Err(invalid());
        }
        let end_addr = Ipv4Addr::new(a, b, c, last_octet);
        return Ok(TargetRange {
            start: u32::from(start_addr),
            end: u32::from(end_addr),
            spec: format!("{start_addr}-{last_octet}"),
            network: None,
        });
    }

    let addr = Ipv4Addr::from_str(target).map_err(|_| invalid())?;
    Ok(TargetRange {
        start: u32::from(addr),
        end: u32::from(addr),
        spec: addr.to_string(),
        network: None,
    })
}

fn validate_ports(config: &ScanConfig) -> Result<Vec<u16>, PlannerError> {
    if config.ports.len() > MAX_PORTS {
        return Err(PlannerError::TooManyPorts(config.ports.len()));
    }
    if config.ports.is_empty() && config.port_preset != PortPreset::Full {
        return Err(PlannerError::InvalidPort(0));
    }

    let mut seen = HashSet::with_capacity(config.ports.len());
    for &port in &config.ports {
        if port == 0 {
            return Err(PlannerError::InvalidPort(0));
        }
        if !seen.insert(port) {
            return Err(PlannerError::DuplicatePort(port));
        }
    }

    // The full preset scans every port; an explicit list is ignored there
    if config.port_preset == PortPreset::Full {
        return Ok(Vec::new());
    }
    Ok(config.ports.clone())
}

/// Options are an input contract; out-of-range values are clamped rather
/// than rejected so stored configs from older versions keep working.
fn clamp_options(options: ScanOptions) -> ScanOptions {
    let (ping_lo, ping_hi) = ScanOptions::PING_CONCURRENCY_RANGE;
    let (port_lo, port_hi) = ScanOptions::PORT_SCAN_WORKERS_RANGE;
    ScanOptions {
        ping_concurrency: options.ping_concurrency.clamp(ping_lo, ping_hi),
        port_scan_workers: options.port_scan_workers.clamp(port_lo, port_hi),
        ..options
    }
}
