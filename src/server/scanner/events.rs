use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

use crate::server::tasks::service::TaskStatus;

/// One invocation of the external scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanStage {
    Ping,
    Port,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortStateKind {
    Open,
    Closed,
    Filtered,
}

impl PortStateKind {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "closed" => Self::Closed,
            _ => Self::Filtered,
        }
    }
}

/// Everything the parser learned about one host from one completed
/// `<host>` subtree. This is also the unit handed to the graph writer.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    pub up: bool,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub ports: Vec<PortObservation>,
    pub os_matches: Vec<OsMatchObservation>,
    pub distance: Option<u32>,
    pub rtt_srtt_us: Option<u64>,
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsMatchObservation {
    pub name: String,
    pub accuracy: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortObservation {
    pub port: u16,
    pub protocol: String,
    pub state: PortStateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// Payload variants carried on the event bus. Sum type rather than a
/// hierarchy so handling stays exhaustive and impossible combinations
/// cannot be expressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEventKind {
    HostUp {
        ip: Ipv4Addr,
        #[serde(skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    HostDown {
        ip: Ipv4Addr,
    },
    PortState {
        ip: Ipv4Addr,
        port: u16,
        protocol: String,
        state: PortStateKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    OsMatch {
        ip: Ipv4Addr,
        name: String,
        accuracy: u8,
    },
    ProgressTick {
        stage: ScanStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f32>,
        events_processed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_events: Option<u64>,
    },
    StageComplete {
        stage: ScanStage,
        events_processed: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_events: Option<u64>,
        /// Set only on the terminal event of the task
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LogLine {
        line: String,
    },
}

impl ScanEventKind {
    /// The stream status this event maps to: terminal events carry their
    /// task status, everything else is progress.
    pub fn stream_status(&self) -> &'static str {
        match self {
            Self::StageComplete {
                status: Some(status),
                ..
            } => status.as_stream_status(),
            _ => "progress",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StageComplete { status: Some(_), .. })
    }
}

/// A bus payload: the parser event stamped with its owning task and a
/// per-task strictly increasing sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub task_id: Uuid,
    pub seq: u64,
    pub collector: ScanStage,
    #[serde(flatten)]
    pub kind: ScanEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_with_tag() {
        let kind = ScanEventKind::PortState {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            port: 22,
            protocol: "tcp".into(),
            state: PortStateKind::Open,
            service: Some("ssh".into()),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event"], "port_state");
        assert_eq!(json["port"], 22);
        assert_eq!(json["state"], "open");
    }

    #[test]
    fn terminal_detection_requires_status() {
        let running = ScanEventKind::StageComplete {
            stage: ScanStage::Ping,
            events_processed: 4,
            total_events: Some(4),
            status: None,
            reason: None,
        };
        assert!(!running.is_terminal());
        assert_eq!(running.stream_status(), "progress");

        let done = ScanEventKind::StageComplete {
            stage: ScanStage::Finalizing,
            events_processed: 4,
            total_events: Some(4),
            status: Some(TaskStatus::Complete),
            reason: None,
        };
        assert!(done.is_terminal());
        assert_eq!(done.stream_status(), "complete");
    }
}
