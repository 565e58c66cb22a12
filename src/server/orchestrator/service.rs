//! Top-level scan coordination.
//!
//! One task walks `PING → PORT → FINALIZING → terminal`. Each stage pumps
//! driver events into three sinks: the graph writer (host-scoped batches),
//! the registry counters, and the bus (stamped with the task's next
//! sequence number). Cancellation is observed at every dequeue; once seen,
//! nothing but the terminal event is published on the topic.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::server::bus::EventBus;
use crate::server::graph::nodes::HostWriteBatch;
use crate::server::graph::writer::GraphWriter;
use crate::server::planner::types::ScanPlan;
use crate::server::scanner::driver::{DriverEvent, ScanDriver};
use crate::server::scanner::events::{HostRecord, ScanEvent, ScanEventKind, ScanStage};
use crate::server::tasks::service::{Task, TaskRegistry, TaskStatus};

pub const DEFAULT_PING_STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_PORT_STAGE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Per-task event publisher: stamps strictly increasing sequence numbers
/// and goes quiet once cancellation has been observed, so the `cancelled`
/// event is the last thing on the topic.
struct Publisher {
    bus: Arc<EventBus>,
    task_id: Uuid,
    seq: AtomicU64,
    muted: AtomicBool,
}

impl Publisher {
    fn new(bus: Arc<EventBus>, task_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            bus,
            task_id,
            seq: AtomicU64::new(0),
            muted: AtomicBool::new(false),
        })
    }

    fn mute(&self) {
        self.muted.store(true, Ordering::Release);
    }

    async fn publish(&self, collector: ScanStage, kind: ScanEventKind) {
        if self.muted.load(Ordering::Acquire) {
            return;
        }
        self.publish_unmuted(collector, kind).await;
    }

    async fn publish_unmuted(&self, collector: ScanStage, kind: ScanEventKind) {
        let event = ScanEvent {
            task_id: self.task_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            collector,
            kind,
        };
        self.bus.publish(event).await;
    }
}

enum StageEnd {
    Completed { partial: bool },
    Failed(String),
    Cancelled,
    TimedOut,
}

struct StageRun {
    end: StageEnd,
    live_hosts: Vec<Ipv4Addr>,
    assets_seen: u64,
}

pub struct ScanOrchestrator {
    driver: Arc<dyn ScanDriver>,
    writer: Arc<GraphWriter>,
    bus: Arc<EventBus>,
    registry: Arc<TaskRegistry>,
    ping_stage_timeout: Duration,
    port_stage_timeout: Duration,
}

impl ScanOrchestrator {
    pub fn new(
        driver: Arc<dyn ScanDriver>,
        writer: Arc<GraphWriter>,
        bus: Arc<EventBus>,
        registry: Arc<TaskRegistry>,
        ping_stage_timeout: Duration,
        port_stage_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            writer,
            bus,
            registry,
            ping_stage_timeout,
            port_stage_timeout,
        })
    }

    /// Run the scan for an already-registered task in the background
    pub fn spawn_scan(self: &Arc<Self>, task: Task, plan: ScanPlan) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_scan(task, plan).await;
        });
    }

    async fn run_scan(self: Arc<Self>, task: Task, plan: ScanPlan) {
        let publisher = Publisher::new(self.bus.clone(), task.task_id);
        let mut write_handles: Vec<JoinHandle<()>> = Vec::new();

        let (status, reason, final_stage) = self
            .run_stages(&task, &plan, &publisher, &mut write_handles)
            .await;

        // FINALIZING: in-flight writes may finish, new ones were not started
        self.registry
            .set_stage(&task.task_id, ScanStage::Finalizing)
            .await;
        for handle in write_handles {
            let _ = handle.await;
        }

        self.registry.finalize(&task.task_id, status).await;

        let snapshot = self.registry.get(&task.task_id).await;
        let events_processed = snapshot
            .as_ref()
            .map(|t| t.processed(final_stage))
            .unwrap_or(0);
        let total_events = snapshot.and_then(|t| t.total_events);

        // The terminal event is the last one on the topic, always published
        publisher
            .publish_unmuted(
                final_stage,
                ScanEventKind::StageComplete {
                    stage: ScanStage::Finalizing,
                    events_processed,
                    total_events,
                    status: Some(status),
                    reason,
                },
            )
            .await;
        self.bus.close(task.task_id).await;
    }

    async fn run_stages(
        &self,
        task: &Task,
        plan: &ScanPlan,
        publisher: &Arc<Publisher>,
        write_handles: &mut Vec<JoinHandle<()>>,
    ) -> (TaskStatus, Option<String>, ScanStage) {
        let task_id = task.task_id;
        let mut assets_seen = 0u64;

        // PING
        if task.cancel.is_cancelled() {
            return (TaskStatus::Cancelled, None, ScanStage::Ping);
        }
        self.registry
            .set_total(&task_id, plan.hosts.len() as u64)
            .await;

        let driver_cancel = task.cancel.child_token();
        let rx = match self.driver.run_ping(plan, driver_cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(task_id = %task_id, "Ping stage spawn failed: {e}");
                publisher
                    .publish(ScanStage::Ping, ScanEventKind::LogLine {
                        line: e.to_string(),
                    })
                    .await;
                return (
                    TaskStatus::Failed,
                    Some("spawn_failure".to_string()),
                    ScanStage::Ping,
                );
            }
        };

        let ping = self
            .drive_stage(
                task,
                plan,
                ScanStage::Ping,
                rx,
                driver_cancel,
                publisher,
                write_handles,
                self.ping_stage_timeout,
                plan.hosts.len() as u64,
            )
            .await;
        assets_seen += ping.assets_seen;

        let ping_partial = match ping.end {
            StageEnd::Cancelled => return (TaskStatus::Cancelled, None, ScanStage::Ping),
            StageEnd::TimedOut => {
                return (
                    TaskStatus::Failed,
                    Some("timeout".to_string()),
                    ScanStage::Ping,
                );
            }
            StageEnd::Failed(message) => {
                let status = if assets_seen == 0 {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Partial
                };
                return (status, Some(message), ScanStage::Ping);
            }
            StageEnd::Completed { partial } => partial,
        };

        let live_hosts = ping.live_hosts;
        tracing::info!(
            task_id = %task_id,
            "Ping stage complete: {}/{} hosts up",
            live_hosts.len(),
            plan.hosts.len()
        );

        // No live hosts: nothing left to scan or write
        if live_hosts.is_empty() {
            self.registry.set_total(&task_id, 0).await;
            let status = if ping_partial {
                TaskStatus::Partial
            } else {
                TaskStatus::Complete
            };
            return (status, None, ScanStage::Port);
        }

        // PORT
        if task.cancel.is_cancelled() {
            return (TaskStatus::Cancelled, None, ScanStage::Port);
        }
        self.registry.set_stage(&task_id, ScanStage::Port).await;
        self.registry
            .set_total(&task_id, live_hosts.len() as u64)
            .await;

        let driver_cancel = task.cancel.child_token();
        let rx = match self
            .driver
            .run_port(plan, &live_hosts, driver_cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(task_id = %task_id, "Port stage spawn failed: {e}");
                publisher
                    .publish(ScanStage::Port, ScanEventKind::LogLine {
                        line: e.to_string(),
                    })
                    .await;
                let status = if assets_seen == 0 {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Partial
                };
                return (status, Some("spawn_failure".to_string()), ScanStage::Port);
            }
        };

        let port = self
            .drive_stage(
                task,
                plan,
                ScanStage::Port,
                rx,
                driver_cancel,
                publisher,
                write_handles,
                self.port_stage_timeout,
                live_hosts.len() as u64,
            )
            .await;
        assets_seen += port.assets_seen;

        match port.end {
            StageEnd::Cancelled => (TaskStatus::Cancelled, None, ScanStage::Port),
            StageEnd::TimedOut => (
                TaskStatus::Failed,
                Some("timeout".to_string()),
                ScanStage::Port,
            ),
            StageEnd::Failed(message) => {
                let status = if assets_seen == 0 {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Partial
                };
                (status, Some(message), ScanStage::Port)
            }
            StageEnd::Completed { partial } => {
                let status = if partial || ping_partial {
                    TaskStatus::Partial
                } else {
                    TaskStatus::Complete
                };
                (status, None, ScanStage::Port)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stage(
        &self,
        task: &Task,
        plan: &ScanPlan,
        stage: ScanStage,
        mut rx: mpsc::Receiver<DriverEvent>,
        driver_cancel: CancellationToken,
        publisher: &Arc<Publisher>,
        write_handles: &mut Vec<JoinHandle<()>>,
        stage_timeout: Duration,
        total: u64,
    ) -> StageRun {
        let task_id = task.task_id;
        let cancel = task.cancel.clone();

        let mut live_hosts = Vec::new();
        let mut assets_seen = 0u64;
        let mut processed = 0u64;
        let mut last_percent: Option<f32> = None;
        let mut cancelled = false;
        let mut timed_out = false;

        let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(stage_timeout);
        tokio::pin!(deadline);

        let end = loop {
            tokio::select! {
                // Cancellation is observed before any further dequeue
                biased;

                _ = cancel.cancelled(), if !cancelled && !timed_out => {
                    cancelled = true;
                    publisher.mute();
                    tracing::info!(task_id = %task_id, stage = %stage, "Cancellation observed");
                    // The driver token is a child of the task token; keep
                    // draining so already-parsed events are accounted for
                }
                _ = &mut deadline, if !cancelled && !timed_out => {
                    timed_out = true;
                    driver_cancel.cancel();
                    tracing::warn!(task_id = %task_id, stage = %stage, "Stage wall-clock cap reached");
                }
                event = rx.recv() => {
                    match event {
                        None => {
                            // Channel closed without a completion marker:
                            // the child was cancelled or killed
                            if timed_out {
                                break StageEnd::TimedOut;
                            }
                            break StageEnd::Cancelled;
                        }
                        Some(DriverEvent::Host(record)) => {
                            processed = self.registry.record_processed(&task_id, stage).await;
                            if record.up {
                                assets_seen += 1;
                                if stage == ScanStage::Ping {
                                    live_hosts.push(record.ip);
                                }
                            }
                            if !cancelled && !timed_out {
                                self.emit_host_events(stage, &record, publisher).await;
                                if record.up {
                                    self.spawn_host_write(&record, plan, stage, publisher, write_handles).await;
                                }
                            }
                        }
                        Some(DriverEvent::Progress { percent }) => {
                            last_percent = percent;
                            publisher.publish(stage, ScanEventKind::ProgressTick {
                                stage,
                                percent,
                                events_processed: processed,
                                total_events: Some(total),
                            }).await;
                        }
                        Some(DriverEvent::Log { line }) => {
                            publisher.publish(stage, ScanEventKind::LogLine { line }).await;
                        }
                        Some(DriverEvent::Completed { partial }) => {
                            if cancelled {
                                break StageEnd::Cancelled;
                            }
                            publisher.publish(stage, ScanEventKind::StageComplete {
                                stage,
                                events_processed: processed,
                                total_events: Some(total),
                                status: None,
                                reason: None,
                            }).await;
                            break StageEnd::Completed { partial };
                        }
                        Some(DriverEvent::Failed { message }) => {
                            if cancelled {
                                break StageEnd::Cancelled;
                            }
                            tracing::error!(task_id = %task_id, stage = %stage, "Stage failed: {message}");
                            publisher.publish(stage, ScanEventKind::LogLine {
                                line: message.clone(),
                            }).await;
                            break StageEnd::Failed(message);
                        }
                    }
                }
                _ = tick.tick() => {
                    // Liveness for idle subscribers, at least once a second
                    publisher.publish(stage, ScanEventKind::ProgressTick {
                        stage,
                        percent: last_percent,
                        events_processed: processed,
                        total_events: Some(total),
                    }).await;
                }
            }
        };

        let end = if cancelled { StageEnd::Cancelled } else { end };
        StageRun {
            end,
            live_hosts,
            assets_seen,
        }
    }

    async fn emit_host_events(
        &self,
        stage: ScanStage,
        record: &HostRecord,
        publisher: &Arc<Publisher>,
    ) {
        if !record.up {
            publisher
                .publish(stage, ScanEventKind::HostDown { ip: record.ip })
                .await;
            return;
        }

        publisher
            .publish(stage, ScanEventKind::HostUp {
                ip: record.ip,
                mac: record.mac.clone(),
                hostname: record.hostname.clone(),
            })
            .await;

        for port in &record.ports {
            publisher
                .publish(stage, ScanEventKind::PortState {
                    ip: record.ip,
                    port: port.port,
                    protocol: port.protocol.clone(),
                    state: port.state,
                    service: port.service.clone(),
                })
                .await;
        }

        for os_match in &record.os_matches {
            publisher
                .publish(stage, ScanEventKind::OsMatch {
                    ip: record.ip,
                    name: os_match.name.clone(),
                    accuracy: os_match.accuracy,
                })
                .await;
        }
    }

    /// Start one bounded, concurrent host write. The semaphore permit is
    /// taken here so a saturated writer back-pressures the event loop.
    async fn spawn_host_write(
        &self,
        record: &HostRecord,
        plan: &ScanPlan,
        stage: ScanStage,
        publisher: &Arc<Publisher>,
        write_handles: &mut Vec<JoinHandle<()>>,
    ) {
        let permit = self.writer.acquire().await;
        let writer = self.writer.clone();
        let publisher = Arc::clone(publisher);
        let batch = HostWriteBatch::from_record(record, plan, Utc::now());

        write_handles.push(tokio::spawn(async move {
            let result = writer.write_host(&batch).await;
            drop(permit);
            if let Err(e) = result {
                tracing::warn!(ip = %e.ip, "Skipping host after write failure: {e}");
                publisher
                    .publish(stage, ScanEventKind::LogLine {
                        line: e.to_string(),
                    })
                    .await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::graph::memory::MemoryGraphStore;
    use crate::server::planner::base::build_plan;
    use crate::server::planner::types::{PortPreset, ScanConfig, ScanOptions};
    use crate::server::scanner::driver::ScanError;
    use crate::server::scanner::events::{PortObservation, PortStateKind};
    use crate::server::tasks::service::CancelOutcome;
    use std::sync::Mutex;

    enum Ending {
        Complete { partial: bool },
        Fail(String),
        /// Never completes on its own; ends only when cancelled
        Hang,
    }

    struct StageScript {
        events: Vec<DriverEvent>,
        ending: Ending,
        delay: Duration,
    }

    impl StageScript {
        fn completing(events: Vec<DriverEvent>) -> Self {
            Self {
                events,
                ending: Ending::Complete { partial: false },
                delay: Duration::ZERO,
            }
        }
    }

    #[derive(Default)]
    struct FakeDriver {
        ping: Mutex<Option<StageScript>>,
        port: Mutex<Option<StageScript>>,
        fail_ping_spawn: bool,
    }

    impl FakeDriver {
        fn run_script(script: StageScript, cancel: CancellationToken) -> mpsc::Receiver<DriverEvent> {
            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(async move {
                for event in script.events {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if !script.delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(script.delay) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                match script.ending {
                    Ending::Complete { partial } => {
                        if !cancel.is_cancelled() {
                            let _ = tx.send(DriverEvent::Completed { partial }).await;
                        }
                    }
                    Ending::Fail(message) => {
                        let _ = tx.send(DriverEvent::Failed { message }).await;
                    }
                    Ending::Hang => cancel.cancelled().await,
                }
            });
            rx
        }
    }

    #[async_trait::async_trait]
    impl ScanDriver for FakeDriver {
        async fn run_ping(
            &self,
            _plan: &ScanPlan,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<DriverEvent>, ScanError> {
            if self.fail_ping_spawn {
                return Err(ScanError::SpawnFailure {
                    bin: "nmap".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            let script = self
                .ping
                .lock()
                .unwrap()
                .take()
                .expect("ping script not set");
            Ok(Self::run_script(script, cancel))
        }

        async fn run_port(
            &self,
            _plan: &ScanPlan,
            _live_hosts: &[Ipv4Addr],
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<DriverEvent>, ScanError> {
            let script = self
                .port
                .lock()
                .unwrap()
                .take()
                .expect("port script not set");
            Ok(Self::run_script(script, cancel))
        }
    }

    fn host_up(last_octet: u8, ports: &[(u16, PortStateKind)]) -> DriverEvent {
        DriverEvent::Host(HostRecord {
            ip: Ipv4Addr::new(10, 0, 0, last_octet),
            up: true,
            mac: None,
            vendor: None,
            hostname: None,
            ports: ports
                .iter()
                .map(|&(port, state)| PortObservation {
                    port,
                    protocol: "tcp".into(),
                    state,
                    service: None,
                })
                .collect(),
            os_matches: Vec::new(),
            distance: None,
            rtt_srtt_us: None,
            uptime_seconds: None,
        })
    }

    fn host_down(last_octet: u8) -> DriverEvent {
        DriverEvent::Host(HostRecord {
            ip: Ipv4Addr::new(10, 0, 0, last_octet),
            up: false,
            mac: None,
            vendor: None,
            hostname: None,
            ports: Vec::new(),
            os_matches: Vec::new(),
            distance: None,
            rtt_srtt_us: None,
            uptime_seconds: None,
        })
    }

    fn plan_for(targets: &[&str], ports: Vec<u16>) -> ScanPlan {
        build_plan(&ScanConfig {
            network_cidrs: targets.iter().map(|t| t.to_string()).collect(),
            ports,
            port_preset: PortPreset::Custom,
            options: ScanOptions::default(),
        })
        .unwrap()
    }

    struct Harness {
        registry: Arc<TaskRegistry>,
        bus: Arc<EventBus>,
        store: Arc<MemoryGraphStore>,
        orchestrator: Arc<ScanOrchestrator>,
    }

    fn harness(driver: FakeDriver) -> Harness {
        harness_with_timeouts(driver, Duration::from_secs(1800), Duration::from_secs(21600))
    }

    fn harness_with_timeouts(
        driver: FakeDriver,
        ping_timeout: Duration,
        port_timeout: Duration,
    ) -> Harness {
        let registry = TaskRegistry::new(Duration::from_secs(300));
        let bus = EventBus::new(4096);
        let store = Arc::new(MemoryGraphStore::new());
        let writer = GraphWriter::new(store.clone());
        let orchestrator = ScanOrchestrator::new(
            Arc::new(driver),
            writer,
            bus.clone(),
            registry.clone(),
            ping_timeout,
            port_timeout,
        );
        Harness {
            registry,
            bus,
            store,
            orchestrator,
        }
    }

    async fn drain(subscription: &crate::server::bus::Subscription) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
        events
    }

    fn terminal_status(events: &[ScanEvent]) -> Option<TaskStatus> {
        match events.last().map(|e| &e.kind) {
            Some(ScanEventKind::StageComplete { status, .. }) => *status,
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_host_scan_completes_and_writes_asset() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript::completing(vec![
                DriverEvent::Progress {
                    percent: Some(50.0),
                },
                host_up(5, &[]),
            ]))),
            port: Mutex::new(Some(StageScript::completing(vec![host_up(
                5,
                &[(22, PortStateKind::Open), (80, PortStateKind::Closed)],
            )]))),
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.5/32"], vec![22, 80]))
            .await;

        let snapshot = h.registry.get(&task.task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Complete);

        let asset = h.store.find_asset_by_identifier("10.0.0.5").unwrap();
        assert_eq!(asset.status, "online");
        assert_eq!(asset.ports.len(), 2);
        assert_eq!(asset.ports[0].port, 22);
        assert_eq!(asset.ports[0].state, PortStateKind::Open);
        assert_eq!(asset.ports[1].state, PortStateKind::Closed);

        let events = drain(&subscription).await;
        assert_eq!(terminal_status(&events), Some(TaskStatus::Complete));

        // Sequence numbers strictly increase; no event follows the terminal
        for pair in events.windows(2) {
            assert!(pair[1].seq > pair[0].seq);
        }
        assert!(
            events
                .iter()
                .any(|e| matches!(e.kind, ScanEventKind::ProgressTick { .. }))
        );
        assert!(
            events
                .iter()
                .any(|e| matches!(e.kind, ScanEventKind::HostUp { .. }))
        );
        assert!(events.iter().any(|e| matches!(
            e.kind,
            ScanEventKind::PortState {
                port: 22,
                state: PortStateKind::Open,
                ..
            }
        )));

        // events_processed never exceeds the denominator
        assert!(snapshot.processed(ScanStage::Port) <= snapshot.total_events.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ping_short_circuits_to_complete() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript::completing(vec![
                host_down(0),
                host_down(1),
                host_down(2),
                host_down(3),
            ]))),
            // No port script: reaching the port stage would panic the fake
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.0/30"], vec![22]))
            .await;

        let snapshot = h.registry.get(&task.task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Complete);
        assert_eq!(snapshot.total_events, Some(0));
        assert_eq!(h.store.asset_count(), 0);

        let events = drain(&subscription).await;
        assert_eq!(terminal_status(&events), Some(TaskStatus::Complete));
        assert!(
            events
                .iter()
                .all(|e| !matches!(e.kind, ScanEventKind::HostUp { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_silences_the_topic_and_finalizes_cancelled() {
        let hosts: Vec<DriverEvent> = (1..=250).map(|i| host_up(i as u8, &[])).collect();
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript {
                events: hosts,
                ending: Ending::Complete { partial: false },
                delay: Duration::from_millis(10),
            })),
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;

        let orchestrator = h.orchestrator.clone();
        let run_task = task.clone();
        let plan = plan_for(&["10.0.0.0/24"], vec![22]);
        let handle = tokio::spawn(async move {
            orchestrator.run_scan(run_task, plan).await;
        });

        // Wait for the first host event, then cancel
        loop {
            let event = subscription.next().await.expect("stream ended early");
            if matches!(event.kind, ScanEventKind::HostUp { .. }) {
                break;
            }
        }
        assert_eq!(
            h.registry.cancel(&task.task_id).await,
            CancelOutcome::Cancelled
        );
        handle.await.unwrap();

        let snapshot = h.registry.get(&task.task_id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);

        // The cancelled event is the last on the topic
        let remaining = drain(&subscription).await;
        let Some(last) = remaining.last() else {
            panic!("expected at least the terminal event");
        };
        assert!(matches!(
            last.kind,
            ScanEventKind::StageComplete {
                status: Some(TaskStatus::Cancelled),
                ..
            }
        ));

        // A second cancel on the terminal task reports as much
        assert_eq!(
            h.registry.cancel(&task.task_id).await,
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_finalizes_failed() {
        let driver = FakeDriver {
            fail_ping_spawn: true,
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.5"], vec![22]))
            .await;

        assert_eq!(
            h.registry.get(&task.task_id).await.unwrap().status,
            TaskStatus::Failed
        );
        let events = drain(&subscription).await;
        assert_eq!(terminal_status(&events), Some(TaskStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_without_results_is_failed() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript {
                events: vec![host_down(1)],
                ending: Ending::Fail("scanner exited with code 1".into()),
                delay: Duration::ZERO,
            })),
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.0/30"], vec![22]))
            .await;

        assert_eq!(
            h.registry.get(&task.task_id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn driver_failure_after_results_is_partial() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript {
                events: vec![host_up(5, &[])],
                ending: Ending::Fail("scanner exited with code 1".into()),
                delay: Duration::ZERO,
            })),
            ..Default::default()
        };
        let h = harness(driver);

        let task = h.registry.start("alice").await.unwrap();
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.0/30"], vec![22]))
            .await;

        assert_eq!(
            h.registry.get(&task.task_id).await.unwrap().status,
            TaskStatus::Partial
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_finalizes_failed_with_reason() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript {
                events: Vec::new(),
                ending: Ending::Hang,
                delay: Duration::ZERO,
            })),
            ..Default::default()
        };
        let h = harness_with_timeouts(driver, Duration::from_secs(3), Duration::from_secs(3));

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.5"], vec![22]))
            .await;

        assert_eq!(
            h.registry.get(&task.task_id).await.unwrap().status,
            TaskStatus::Failed
        );
        let events = drain(&subscription).await;
        match &events.last().unwrap().kind {
            ScanEventKind::StageComplete { status, reason, .. } => {
                assert_eq!(*status, Some(TaskStatus::Failed));
                assert_eq!(reason.as_deref(), Some("timeout"));
            }
            other => panic!("expected terminal stage_complete, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_skips_host_and_scan_still_completes() {
        let driver = FakeDriver {
            ping: Mutex::new(Some(StageScript::completing(vec![
                host_up(5, &[]),
                host_up(7, &[]),
            ]))),
            port: Mutex::new(Some(StageScript::completing(vec![
                host_up(5, &[(22, PortStateKind::Open)]),
                host_up(7, &[(22, PortStateKind::Open)]),
            ]))),
            ..Default::default()
        };
        let h = harness(driver);
        // S5: this host fails every attempt, in both stages
        h.store.fail_next(Ipv4Addr::new(10, 0, 0, 7), 8);

        let task = h.registry.start("alice").await.unwrap();
        let subscription = h.bus.subscribe(task.task_id).await;
        h.orchestrator
            .clone()
            .run_scan(task.clone(), plan_for(&["10.0.0.0/28"], vec![22]))
            .await;

        assert_eq!(
            h.registry.get(&task.task_id).await.unwrap().status,
            TaskStatus::Complete
        );
        assert!(h.store.find_asset_by_identifier("10.0.0.7").is_none());
        assert!(h.store.find_asset_by_identifier("10.0.0.5").is_some());

        let events = drain(&subscription).await;
        let log_position = events.iter().position(
            |e| matches!(&e.kind, ScanEventKind::LogLine { line } if line.contains("10.0.0.7")),
        );
        assert!(log_position.is_some(), "expected a write-failure log line");
        assert_eq!(terminal_status(&events), Some(TaskStatus::Complete));
    }
}
