//! Supervision of per-device collector subprocesses.
//!
//! One collector process runs per physical device. Each gets a tokio task
//! that waits on three things at once: cancellation, the next stdout line
//! (tag only) and process exit. Tag lines are parsed and recorded into the
//! aggregator; responder output is discarded and the process is watched for
//! liveness only. A process that dies is reported, never restarted.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::DistanceAggregator;
use crate::config::SupervisorConfig;
use crate::error::{PositioningError, Result};
use crate::ranging::MeasurementParser;
use crate::types::{AnchorId, DeviceRole, SessionClock};

/// Liveness and throughput counters shared with a session task
#[derive(Debug, Default)]
struct SessionHealth {
    alive: AtomicBool,
    lines_seen: AtomicU64,
    samples_recorded: AtomicU64,
    exit_code: Mutex<Option<i32>>,
}

impl SessionHealth {
    fn mark_exited(&self, code: Option<i32>) {
        self.alive.store(false, Ordering::SeqCst);
        if let Ok(mut exit_code) = self.exit_code.lock() {
            *exit_code = code;
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|c| *c)
    }
}

/// Snapshot of one supervised device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub role: DeviceRole,
    pub port: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub lines_seen: u64,
    pub samples_recorded: u64,
    pub exit_code: Option<i32>,
}

/// Handle binding a device role to its running collector
pub struct DeviceSession {
    role: DeviceRole,
    port: String,
    pid: Option<u32>,
    health: Arc<SessionHealth>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DeviceSession {
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn is_alive(&self) -> bool {
        self.health.alive.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            role: self.role,
            port: self.port.clone(),
            pid: self.pid,
            alive: self.is_alive(),
            lines_seen: self.health.lines_seen.load(Ordering::SeqCst),
            samples_recorded: self.health.samples_recorded.load(Ordering::SeqCst),
            exit_code: self.health.exit_code(),
        }
    }

    /// Terminate the process, then wait for the session task to finish.
    async fn shutdown(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("{} session task on {} failed to join: {}", self.role, self.port, e);
            }
        }
        self.health.alive.store(false, Ordering::SeqCst);
    }
}

/// State a session task needs to turn lines into samples
struct SessionContext {
    role: DeviceRole,
    port: String,
    parser: MeasurementParser,
    aggregator: Arc<DistanceAggregator>,
    clock: SessionClock,
    health: Arc<SessionHealth>,
}

impl SessionContext {
    fn handle_line(&self, line: &str) {
        self.health.lines_seen.fetch_add(1, Ordering::Relaxed);
        if !self.role.emits_ranging() {
            return;
        }

        let results = self.parser.parse_line(line);
        if results.is_empty() {
            return;
        }

        let timestamp = self.clock.now_secs();
        for result in results {
            if self.aggregator.record(result.anchor, timestamp, result.distance_m) {
                self.health.samples_recorded.fetch_add(1, Ordering::Relaxed);
                log::debug!("[TAG] Distance to {}: {:.3}m", result.anchor, result.distance_m);
            }
        }
    }
}

enum SessionEvent {
    Cancelled,
    Line(std::io::Result<Option<String>>),
    Exited(std::io::Result<ExitStatus>),
}

async fn next_line(
    lines: &mut Option<Lines<BufReader<ChildStdout>>>,
) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut child: Child,
    mut lines: Option<Lines<BufReader<ChildStdout>>>,
    ctx: SessionContext,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => SessionEvent::Cancelled,
            line = next_line(&mut lines) => SessionEvent::Line(line),
            status = child.wait() => SessionEvent::Exited(status),
        };

        match event {
            SessionEvent::Cancelled => {
                // Killing the child closes its pipe and ends any pending read.
                if let Err(e) = child.kill().await {
                    log::debug!("{} collector on {} already gone: {}", ctx.role, ctx.port, e);
                }
                ctx.health.mark_exited(None);
                log::debug!("{} session on {} stopped", ctx.role, ctx.port);
                break;
            }
            SessionEvent::Line(Ok(Some(line))) => ctx.handle_line(&line),
            SessionEvent::Line(Ok(None)) => {
                log::debug!("{} collector on {} closed stdout", ctx.role, ctx.port);
                lines = None;
            }
            SessionEvent::Line(Err(e)) => {
                log::error!("Error reading from {} on {}: {}", ctx.role, ctx.port, e);
                lines = None;
            }
            SessionEvent::Exited(status) => {
                let code = status.as_ref().ok().and_then(|s| s.code());
                match status {
                    Ok(status) => log::warn!(
                        "{} collector on {} exited unexpectedly ({})",
                        ctx.role,
                        ctx.port,
                        status
                    ),
                    Err(e) => log::warn!(
                        "{} collector on {} lost: {}",
                        ctx.role,
                        ctx.port,
                        e
                    ),
                }
                ctx.health.mark_exited(code);
                break;
            }
        }
    }
}

/// Launches and owns one collector process per device
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    parser: MeasurementParser,
    aggregator: Arc<DistanceAggregator>,
    clock: SessionClock,
    sessions: Vec<DeviceSession>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        aggregator: Arc<DistanceAggregator>,
        clock: SessionClock,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            parser: MeasurementParser::new(config.addresses.clone()),
            config,
            aggregator,
            clock,
            sessions: Vec::new(),
        })
    }

    fn command_for(&self, role: DeviceRole, port: &str) -> Command {
        let mut cmd = Command::new(&self.config.collector_program);
        cmd.args(&self.config.collector_args)
            .arg("--port")
            .arg(port)
            .arg("--format")
            .arg(&self.config.output_format)
            .args(role.collector_args())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .stdout(if role.emits_ranging() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        cmd
    }

    /// Launch the collector for `role` on `port` and start reading it.
    /// A role may be started again only after its previous process died.
    pub async fn start(&mut self, role: DeviceRole, port: &str) -> Result<()> {
        if let Some(index) = self.sessions.iter().position(|s| s.role == role) {
            if self.sessions[index].is_alive() {
                return Err(PositioningError::AlreadyRunning);
            }
            let mut dead = self.sessions.remove(index);
            dead.shutdown().await;
        }

        let mut child = self
            .command_for(role, port)
            .spawn()
            .map_err(|source| PositioningError::SpawnFailed {
                role,
                port: port.to_string(),
                source,
            })?;

        let pid = child.id();
        let lines = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());

        let health = Arc::new(SessionHealth::default());
        health.alive.store(true, Ordering::SeqCst);

        let ctx = SessionContext {
            role,
            port: port.to_string(),
            parser: self.parser.clone(),
            aggregator: self.aggregator.clone(),
            clock: self.clock,
            health: health.clone(),
        };
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_session(child, lines, ctx, cancel_token.clone()));

        log::info!("Started {} on {} (pid {:?})", role, port, pid);
        self.sessions.push(DeviceSession {
            role,
            port: port.to_string(),
            pid,
            health,
            cancel_token,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Bring up responders first, then the tag, pausing after each launch so
    /// the firmware can settle. On failure everything started so far is
    /// stopped again.
    pub async fn start_all(&mut self, tag_port: &str, responders: &[(AnchorId, &str)]) -> Result<()> {
        let settle = self.config.settle_delay();

        for (anchor, port) in responders {
            if let Err(e) = self.start(DeviceRole::Responder(*anchor), port).await {
                self.stop().await;
                return Err(e);
            }
            tokio::time::sleep(settle).await;
        }

        if let Err(e) = self.start(DeviceRole::Tag, tag_port).await {
            self.stop().await;
            return Err(e);
        }
        tokio::time::sleep(settle * 2).await;
        Ok(())
    }

    /// Terminate every collector and wait for all readers. No aggregator
    /// write happens after this returns.
    pub async fn stop(&mut self) {
        for session in self.sessions.iter_mut() {
            session.shutdown().await;
        }
        if !self.sessions.is_empty() {
            log::info!("Stopped {} device session(s)", self.sessions.len());
        }
        self.sessions.clear();
    }

    /// Stop a single device's collector.
    pub async fn stop_device(&mut self, role: DeviceRole) -> Result<()> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.role == role)
            .ok_or(PositioningError::NotRunning)?;
        let mut session = self.sessions.remove(index);
        session.shutdown().await;
        log::info!("Stopped {} on {}", role, session.port);
        Ok(())
    }

    pub fn liveness(&self) -> Vec<DeviceStatus> {
        self.sessions.iter().map(|s| s.status()).collect()
    }

    /// Devices whose process exited while still supervised.
    pub fn dead_devices(&self) -> Vec<DeviceStatus> {
        self.sessions
            .iter()
            .filter(|s| !s.is_alive())
            .map(|s| s.status())
            .collect()
    }

    pub fn session(&self, role: DeviceRole) -> Option<&DeviceSession> {
        self.sessions.iter().find(|s| s.role == role)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::aggregator::AnchorAverage;
    use crate::config::PositioningConfig;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    const RANGING_SCRIPT: &str = r#"printf '%s\n' 'Sent command: initf 4 2400 200 25 2 42' '{"Block":1,"results":[{"Addr":"0x0001","Status":"Ok","D_cm":141},{"Addr":"0x0002","Status":"Ok","D_cm":143}]}' 'RAW: {"Block":2,"results":[{"Addr":"0x0001","Status":"Ok","D_cm":143},{"Addr":"0x0002","Status":"Err","D_cm":0},{"Addr":"0x0009","Status":"Ok","D_cm":5}]}'; exec sleep 30"#;

    fn supervisor_with(script: &str) -> (ProcessSupervisor, Arc<DistanceAggregator>, SessionClock) {
        let aggregator = Arc::new(DistanceAggregator::new(&PositioningConfig::default()).unwrap());
        let config = SupervisorConfig {
            collector_program: "sh".to_string(),
            collector_args: vec!["-c".to_string(), script.to_string()],
            settle_delay_ms: 0,
            ..Default::default()
        };
        let clock = SessionClock::new();
        let supervisor = ProcessSupervisor::new(config, aggregator.clone(), clock).unwrap();
        (supervisor, aggregator, clock)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_tag_lines_feed_aggregator() {
        let (mut supervisor, aggregator, clock) = supervisor_with(RANGING_SCRIPT);
        supervisor.start(DeviceRole::Tag, "/dev/ttyTEST0").await.unwrap();

        assert!(wait_until(|| aggregator.sample_count(AnchorId::One) == 2).await);
        assert!(wait_until(|| supervisor.liveness()[0].lines_seen == 3).await);
        assert_eq!(aggregator.sample_count(AnchorId::Two), 1);

        let status = &supervisor.liveness()[0];
        assert!(status.alive);
        assert_eq!(status.samples_recorded, 3);
        assert_eq!(status.port, "/dev/ttyTEST0");

        match aggregator.average(AnchorId::One, clock.now_secs()) {
            AnchorAverage::Fresh { mean, count } => {
                assert_eq!(count, 2);
                assert_abs_diff_eq!(mean, 1.42, epsilon = 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop must not hang");
        assert!(supervisor.liveness().is_empty());

        let count = aggregator.sample_count(AnchorId::One);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(aggregator.sample_count(AnchorId::One), count);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_observable() {
        let (mut supervisor, _aggregator, _clock) = supervisor_with("exit 3");
        supervisor.start(DeviceRole::Tag, "/dev/ttyTEST1").await.unwrap();

        assert!(wait_until(|| !supervisor.liveness()[0].alive).await);
        let dead = supervisor.dead_devices();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].role, DeviceRole::Tag);
        assert_eq!(dead[0].exit_code, Some(3));

        // Not restarted automatically, but a manual start is allowed.
        supervisor.start(DeviceRole::Tag, "/dev/ttyTEST1").await.unwrap();
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_responder_supervised_for_liveness() {
        let (mut supervisor, aggregator, _clock) = supervisor_with(RANGING_SCRIPT);
        supervisor
            .start(DeviceRole::Responder(AnchorId::One), "/dev/ttyTEST2")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let session = supervisor.session(DeviceRole::Responder(AnchorId::One)).unwrap();
        assert!(session.is_alive());
        assert_eq!(session.status().lines_seen, 0);
        assert_eq!(aggregator.sample_count(AnchorId::One), 0);

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop must not hang");
    }

    #[tokio::test]
    async fn test_duplicate_role_rejected() {
        let (mut supervisor, _aggregator, _clock) = supervisor_with("exec sleep 30");
        supervisor.start(DeviceRole::Tag, "/dev/ttyA").await.unwrap();
        assert!(matches!(
            supervisor.start(DeviceRole::Tag, "/dev/ttyB").await,
            Err(PositioningError::AlreadyRunning)
        ));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_all_launches_every_device() {
        let (mut supervisor, _aggregator, _clock) = supervisor_with("exec sleep 30");
        supervisor
            .start_all("/dev/tag", &[(AnchorId::One, "/dev/b1"), (AnchorId::Two, "/dev/b2")])
            .await
            .unwrap();
        let roles: Vec<DeviceRole> = supervisor.liveness().iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![
                DeviceRole::Responder(AnchorId::One),
                DeviceRole::Responder(AnchorId::Two),
                DeviceRole::Tag
            ]
        );
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_propagates() {
        let aggregator = Arc::new(DistanceAggregator::new(&PositioningConfig::default()).unwrap());
        let config = SupervisorConfig {
            collector_program: "/nonexistent/uwb-collector".to_string(),
            collector_args: Vec::new(),
            settle_delay_ms: 0,
            ..Default::default()
        };
        let mut supervisor = ProcessSupervisor::new(config, aggregator, SessionClock::new()).unwrap();
        let err = supervisor.start(DeviceRole::Tag, "/dev/ttyX").await.unwrap_err();
        assert!(matches!(err, PositioningError::SpawnFailed { .. }));
        assert!(supervisor.liveness().is_empty());
    }

    #[tokio::test]
    async fn test_stop_single_device() {
        let (mut supervisor, _aggregator, _clock) = supervisor_with("exec sleep 30");
        supervisor.start(DeviceRole::Tag, "/dev/ttyA").await.unwrap();
        supervisor
            .start(DeviceRole::Responder(AnchorId::Two), "/dev/ttyB")
            .await
            .unwrap();

        supervisor.stop_device(DeviceRole::Tag).await.unwrap();
        assert!(matches!(
            supervisor.stop_device(DeviceRole::Tag).await,
            Err(PositioningError::NotRunning)
        ));
        let remaining = supervisor.liveness();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].role, DeviceRole::Responder(AnchorId::Two));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_sessions() {
        let (mut supervisor, _aggregator, _clock) = supervisor_with("exit 0");
        supervisor.stop().await;
        assert!(supervisor.dead_devices().is_empty());
    }
}
