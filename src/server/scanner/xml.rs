//! Incremental parse of the external scanner's XML report stream.
//!
//! The report arrives on the child's stdout as one long document. Buffering
//! it whole is not an option for large address spaces, so the parser keeps a
//! carry buffer and extracts elements as they complete: each `<host>`
//! subtree becomes one [`HostRecord`], `<taskprogress>` becomes a progress
//! reading, `<finished>` marks the end of the run. Anything that fails to
//! deserialize is skipped and reported so the run keeps going.

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Deserialize;

use crate::server::scanner::events::{
    HostRecord, OsMatchObservation, PortObservation, PortStateKind,
};

const HOST_OPEN: &str = "<host";
const HOST_CLOSE: &str = "</host>";
const TASKPROGRESS_OPEN: &str = "<taskprogress";
const FINISHED_OPEN: &str = "<finished";
const SELF_CLOSE: &str = "/>";

#[derive(Debug)]
pub enum ParsedItem {
    Host(HostRecord),
    Progress { percent: f32 },
    Finished,
    /// An unparseable fragment; carried as a log line, never fatal
    Skipped(String),
}

#[derive(Debug, Default)]
pub struct ReportParser {
    buf: String,
}

impl ReportParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of scanner stdout, returning every item completed by it
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedItem> {
        self.buf.push_str(chunk);

        let mut items = Vec::new();
        while let Some((kind, start)) = next_element(&self.buf) {
            let close = match kind {
                ElementKind::Host => HOST_CLOSE,
                ElementKind::TaskProgress | ElementKind::Finished => SELF_CLOSE,
            };
            let Some(rel) = self.buf[start..].find(close) else {
                // Element still incomplete; drop the dead prefix and wait
                self.buf.drain(..start);
                return items;
            };
            let end = start + rel + close.len();
            let fragment = self.buf[start..end].to_string();
            self.buf.drain(..end);

            items.push(match kind {
                ElementKind::Host => parse_host(&fragment),
                ElementKind::TaskProgress => parse_taskprogress(&fragment),
                ElementKind::Finished => ParsedItem::Finished,
            });
        }

        items
    }
}

#[derive(Debug, Clone, Copy)]
enum ElementKind {
    Host,
    TaskProgress,
    Finished,
}

/// Earliest element of interest in the buffer, if any has started
fn next_element(buf: &str) -> Option<(ElementKind, usize)> {
    let candidates = [
        (ElementKind::Host, find_host_open(buf)),
        (ElementKind::TaskProgress, buf.find(TASKPROGRESS_OPEN)),
        (ElementKind::Finished, buf.find(FINISHED_OPEN)),
    ];
    candidates
        .into_iter()
        .filter_map(|(kind, idx)| idx.map(|i| (kind, i)))
        .min_by_key(|(_, i)| *i)
}

/// Find `<host` followed by a tag boundary, so `<hostnames>` and
/// `<hosthint>` are not mistaken for a host subtree
fn find_host_open(buf: &str) -> Option<usize> {
    let mut pos = 0;
    while let Some(rel) = buf[pos..].find(HOST_OPEN) {
        let idx = pos + rel;
        match buf.as_bytes().get(idx + HOST_OPEN.len()) {
            Some(b' ') | Some(b'>') | Some(b'\t') | Some(b'\n') => return Some(idx),
            None => return Some(idx), // boundary byte not buffered yet
            _ => pos = idx + HOST_OPEN.len(),
        }
    }
    None
}

fn parse_host(fragment: &str) -> ParsedItem {
    match quick_xml::de::from_str::<XmlHost>(fragment) {
        Ok(host) => match HostRecord::try_from(host) {
            Ok(record) => ParsedItem::Host(record),
            Err(reason) => ParsedItem::Skipped(reason),
        },
        Err(e) => ParsedItem::Skipped(format!("unparseable host element: {e}")),
    }
}

fn parse_taskprogress(fragment: &str) -> ParsedItem {
    match quick_xml::de::from_str::<XmlTaskProgress>(fragment) {
        Ok(progress) => ParsedItem::Progress {
            percent: progress.percent,
        },
        Err(e) => ParsedItem::Skipped(format!("unparseable taskprogress element: {e}")),
    }
}

#[derive(Debug, Deserialize)]
struct XmlTaskProgress {
    #[serde(rename = "@percent")]
    percent: f32,
}

#[derive(Debug, Deserialize)]
struct XmlHost {
    status: XmlStatus,
    #[serde(rename = "address", default)]
    addresses: Vec<XmlAddress>,
    hostnames: Option<XmlHostnames>,
    ports: Option<XmlPorts>,
    os: Option<XmlOs>,
    distance: Option<XmlDistance>,
    uptime: Option<XmlUptime>,
    times: Option<XmlTimes>,
}

#[derive(Debug, Deserialize)]
struct XmlStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct XmlAddress {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype")]
    addrtype: String,
    #[serde(rename = "@vendor")]
    vendor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlHostnames {
    #[serde(rename = "hostname", default)]
    hostnames: Vec<XmlHostname>,
}

#[derive(Debug, Deserialize)]
struct XmlHostname {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct XmlPorts {
    #[serde(rename = "port", default)]
    ports: Vec<XmlPort>,
}

#[derive(Debug, Deserialize)]
struct XmlPort {
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(rename = "@portid")]
    portid: u16,
    state: XmlPortState,
    service: Option<XmlService>,
}

#[derive(Debug, Deserialize)]
struct XmlPortState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct XmlService {
    #[serde(rename = "@name")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlOs {
    #[serde(rename = "osmatch", default)]
    matches: Vec<XmlOsMatch>,
}

#[derive(Debug, Deserialize)]
struct XmlOsMatch {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@accuracy")]
    accuracy: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct XmlDistance {
    #[serde(rename = "@value")]
    value: u32,
}

#[derive(Debug, Deserialize)]
struct XmlUptime {
    #[serde(rename = "@seconds")]
    seconds: u64,
}

#[derive(Debug, Deserialize)]
struct XmlTimes {
    #[serde(rename = "@srtt")]
    srtt: u64,
}

impl TryFrom<XmlHost> for HostRecord {
    type Error = String;

    fn try_from(host: XmlHost) -> Result<Self, Self::Error> {
        let ip = host
            .addresses
            .iter()
            .find(|a| a.addrtype == "ipv4")
            .and_then(|a| Ipv4Addr::from_str(&a.addr).ok())
            .ok_or_else(|| "host element without an ipv4 address".to_string())?;

        let mac_entry = host.addresses.iter().find(|a| a.addrtype == "mac");

        let ports = host
            .ports
            .map(|p| {
                p.ports
                    .into_iter()
                    .map(|port| PortObservation {
                        port: port.portid,
                        protocol: port.protocol,
                        state: PortStateKind::parse(&port.state.state),
                        service: port.service.and_then(|s| s.name),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let os_matches = host
            .os
            .map(|os| {
                os.matches
                    .into_iter()
                    .map(|m| OsMatchObservation {
                        name: m.name,
                        accuracy: m.accuracy.unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(HostRecord {
            ip,
            up: host.status.state == "up",
            mac: mac_entry.map(|a| a.addr.clone()),
            vendor: mac_entry.and_then(|a| a.vendor.clone()),
            hostname: host
                .hostnames
                .and_then(|h| h.hostnames.into_iter().next())
                .map(|h| h.name),
            ports,
            os_matches,
            distance: host.distance.map(|d| d.value),
            rtt_srtt_us: host.times.map(|t| t.srtt),
            uptime_seconds: host.uptime.map(|u| u.seconds),
        })
    }
}
