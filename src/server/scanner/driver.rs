//! Ownership of the external scanner process, one invocation per stage.
//!
//! The driver spawns the scanner with arguments derived from the plan,
//! parses its stdout incrementally and forwards typed events over a bounded
//! channel. The channel bound matters: when the consumer falls behind, the
//! driver stops reading and the child is throttled by OS pipe back-pressure.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::server::planner::types::ScanPlan;
use crate::server::scanner::events::{HostRecord, ScanStage};
use crate::server::scanner::xml::{ParsedItem, ReportParser};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to spawn scanner '{bin}': {source}")]
    SpawnFailure {
        bin: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a stage produces, in source order
#[derive(Debug)]
pub enum DriverEvent {
    Host(HostRecord),
    Progress { percent: Option<f32> },
    Log { line: String },
    /// The child exited; `partial` when it failed after producing results
    Completed { partial: bool },
    /// The child exited non-zero without producing any results
    Failed { message: String },
}

/// Seam between the orchestrator and the external scanner
#[async_trait]
pub trait ScanDriver: Send + Sync {
    async fn run_ping(
        &self,
        plan: &ScanPlan,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DriverEvent>, ScanError>;

    async fn run_port(
        &self,
        plan: &ScanPlan,
        live_hosts: &[Ipv4Addr],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DriverEvent>, ScanError>;
}

pub struct NmapDriver {
    bin: String,
}

impl NmapDriver {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn ping_args(plan: &ScanPlan) -> Vec<String> {
        let mut args = vec![
            "-sn".to_string(),
            "-oX".to_string(),
            "-".to_string(),
            "--stats-every".to_string(),
            "1s".to_string(),
            "--min-hostgroup".to_string(),
            plan.options.ping_concurrency.to_string(),
        ];
        if !plan.options.dns_resolution {
            args.push("-n".to_string());
        }
        args.extend(plan.targets.iter().cloned());
        args
    }

    fn port_args(plan: &ScanPlan, live_hosts: &[Ipv4Addr]) -> Vec<String> {
        let mut args = vec![
            "-oX".to_string(),
            "-".to_string(),
            "--stats-every".to_string(),
            "1s".to_string(),
            // Liveness was established by the ping stage
            "-Pn".to_string(),
            "--min-parallelism".to_string(),
            plan.options.port_scan_workers.to_string(),
        ];
        if plan.scan_all_ports {
            args.push("-p-".to_string());
        } else {
            args.push("-p".to_string());
            args.push(plan.ports.iter().map(u16::to_string).collect::<Vec<_>>().join(","));
        }
        if !plan.options.dns_resolution {
            args.push("-n".to_string());
        }
        if plan.options.aggressive {
            args.push("-O".to_string());
            args.push("--osscan-guess".to_string());
            args.push("-sV".to_string());
        }
        args.extend(live_hosts.iter().map(Ipv4Addr::to_string));
        args
    }

    fn spawn_stage(
        &self,
        stage: ScanStage,
        args: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DriverEvent>, ScanError> {
        tracing::debug!(bin = %self.bin, stage = %stage, "Spawning scanner: {}", args.join(" "));

        let child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScanError::SpawnFailure {
                bin: self.bin.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(drive_child(child, stage, tx, cancel));
        Ok(rx)
    }
}

#[async_trait]
impl ScanDriver for NmapDriver {
    async fn run_ping(
        &self,
        plan: &ScanPlan,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DriverEvent>, ScanError> {
        self.spawn_stage(ScanStage::Ping, Self::ping_args(plan), cancel)
    }

    async fn run_port(
        &self,
        plan: &ScanPlan,
        live_hosts: &[Ipv4Addr],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<DriverEvent>, ScanError> {
        self.spawn_stage(ScanStage::Port, Self::port_args(plan, live_hosts), cancel)
    }
}

/// Pump one child process to completion: stdout through the incremental
/// parser, stderr as log lines, cancellation as terminate-then-kill.
async fn drive_child(
    mut child: Child,
    stage: ScanStage,
    tx: mpsc::Sender<DriverEvent>,
    cancel: CancellationToken,
) {
    let mut stdin = child.stdin.take();
    let Some(stdout) = child.stdout.take() else {
        let _ = tx
            .send(DriverEvent::Failed {
                message: "scanner stdout was not captured".to_string(),
            })
            .await;
        return;
    };

    let stderr_task = child.stderr.take().map(|stderr| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(DriverEvent::Log { line }).await.is_err() {
                    break;
                }
            }
        })
    });

    let mut reader = stdout;
    let mut parser = ReportParser::new();
    let mut read_buf = vec![0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    let mut hosts_emitted = 0usize;
    let mut cancelled = false;

    'pump: loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                // Closing stdin first lets a well-behaved scanner wind down
                drop(stdin.take());
                terminate_child(&mut child).await;
            }
            read = reader.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) | Err(_) => break 'pump,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&read_buf[..n]);
                let valid_len = match std::str::from_utf8(&pending) {
                    Ok(s) => s.len(),
                    Err(e) => e.valid_up_to(),
                };
                let chunk = String::from_utf8_lossy(&pending[..valid_len]).into_owned();
                pending.drain(..valid_len);

                for item in parser.feed(&chunk) {
                    let event = match item {
                        ParsedItem::Host(record) => {
                            hosts_emitted += 1;
                            DriverEvent::Host(record)
                        }
                        ParsedItem::Progress { percent } => DriverEvent::Progress {
                            percent: Some(percent),
                        },
                        ParsedItem::Finished => continue,
                        ParsedItem::Skipped(reason) => {
                            tracing::debug!(stage = %stage, "Skipping scanner output: {reason}");
                            DriverEvent::Log { line: reason }
                        }
                    };
                    if tx.send(event).await.is_err() {
                        // Consumer is gone; treat like a cancellation
                        cancelled = true;
                        terminate_child(&mut child).await;
                        break 'pump;
                    }
                }
            }
        }
    }

    let status = child.wait().await;
    if let Some(handle) = stderr_task {
        let _ = handle.await;
    }

    if cancelled {
        tracing::debug!(stage = %stage, "Scanner cancelled after {hosts_emitted} hosts");
        return;
    }

    let event = match status {
        Ok(status) if status.success() => DriverEvent::Completed { partial: false },
        Ok(status) if hosts_emitted > 0 => {
            tracing::warn!(
                stage = %stage,
                "Scanner exited with {status} after {hosts_emitted} hosts, keeping partial results"
            );
            DriverEvent::Completed { partial: true }
        }
        Ok(status) => DriverEvent::Failed {
            message: format!("scanner exited with {status} before producing any results"),
        },
        Err(e) => DriverEvent::Failed {
            message: format!("failed to await scanner exit: {e}"),
        },
    };
    let _ = tx.send(event).await;
}

/// Terminate, give the child a short grace, then kill
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child pid we own
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        tracing::warn!("Scanner ignored terminate, killing");
        let _ = child.start_kill();
    }
}
