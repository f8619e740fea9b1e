//! Cadence-driven positioning.
//!
//! [`PositionEstimator`] performs one tick: read both anchor averages at a
//! single instant, solve, and hand the result to the report sink.
//! [`PositioningLoop`] owns the estimator and runs it on a fixed period in a
//! tokio task. A tick never waits for samples; it reports whatever the
//! aggregator holds right now.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AnchorAverage, DistanceAggregator};
use crate::config::PositioningConfig;
use crate::error::{PositioningError, Result};
use crate::report::ReportSink;
use crate::solver::{PositionSolver, SolveError};
use crate::types::{AnchorId, Point2, SessionClock};

/// A solved tag position with the inputs that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub sequence: u64,
    pub anchor1: Point2,
    pub anchor2: Point2,
    pub position: Point2,
    pub dist1: f64,
    pub dist2: f64,
    pub count1: usize,
    pub count2: usize,
}

/// Averaging outcome for one anchor within a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorStatus {
    pub anchor: AnchorId,
    pub average: AnchorAverage,
}

/// What a single tick produced
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    Position(PositionReport),
    /// At least one anchor lacks fresh data; statuses cover both anchors.
    Waiting {
        sequence: u64,
        statuses: Vec<AnchorStatus>,
    },
    /// Both anchors had data but the distances have no solution.
    Unsolvable {
        sequence: u64,
        reason: SolveError,
        dist1: f64,
        dist2: f64,
    },
}

impl TickReport {
    pub fn sequence(&self) -> u64 {
        match self {
            TickReport::Position(p) => p.sequence,
            TickReport::Waiting { sequence, .. } | TickReport::Unsolvable { sequence, .. } => *sequence,
        }
    }

    /// Anchors named as lacking fresh data.
    pub fn missing_anchors(&self) -> Vec<AnchorId> {
        match self {
            TickReport::Waiting { statuses, .. } => statuses
                .iter()
                .filter(|s| !s.average.is_fresh())
                .map(|s| s.anchor)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn position(&self) -> Option<&PositionReport> {
        match self {
            TickReport::Position(p) => Some(p),
            _ => None,
        }
    }
}

/// Evaluates ticks against the shared aggregator
pub struct PositionEstimator {
    aggregator: Arc<DistanceAggregator>,
    solver: PositionSolver,
    sink: Box<dyn ReportSink>,
    sequence: u64,
}

impl PositionEstimator {
    pub fn new(
        config: &PositioningConfig,
        aggregator: Arc<DistanceAggregator>,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self> {
        Ok(Self {
            aggregator,
            solver: PositionSolver::new(config)?,
            sink,
            sequence: 0,
        })
    }

    /// Run one tick at instant `now` and emit its report.
    pub fn tick(&mut self, now: f64) -> TickReport {
        let report = self.evaluate(now);
        self.sink.emit(&report);
        report
    }

    fn evaluate(&mut self, now: f64) -> TickReport {
        self.sequence += 1;
        let sequence = self.sequence;

        let avg1 = self.aggregator.average(AnchorId::One, now);
        let avg2 = self.aggregator.average(AnchorId::Two, now);

        let (dist1, count1, dist2, count2) = match (avg1, avg2) {
            (
                AnchorAverage::Fresh { mean: d1, count: n1 },
                AnchorAverage::Fresh { mean: d2, count: n2 },
            ) => (d1, n1, d2, n2),
            _ => {
                return TickReport::Waiting {
                    sequence,
                    statuses: vec![
                        AnchorStatus {
                            anchor: AnchorId::One,
                            average: avg1,
                        },
                        AnchorStatus {
                            anchor: AnchorId::Two,
                            average: avg2,
                        },
                    ],
                }
            }
        };

        match self.solver.solve(dist1, dist2) {
            Ok(position) => TickReport::Position(PositionReport {
                sequence,
                anchor1: self.solver.anchor(AnchorId::One),
                anchor2: self.solver.anchor(AnchorId::Two),
                position,
                dist1,
                dist2,
                count1,
                count2,
            }),
            Err(reason) => TickReport::Unsolvable {
                sequence,
                reason,
                dist1,
                dist2,
            },
        }
    }

    pub fn ticks(&self) -> u64 {
        self.sequence
    }

    fn open(&mut self) {
        self.sink.open();
    }

    fn close(&mut self) {
        self.sink.close();
    }
}

/// Lifecycle of the positioning loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    /// Terminal
    Stopped,
}

/// Fixed-period scheduler around a [`PositionEstimator`]
pub struct PositioningLoop {
    state: LoopState,
    period: Duration,
    clock: SessionClock,
    estimator: Option<PositionEstimator>,
    cancel_token: Option<CancellationToken>,
    handle: Option<JoinHandle<PositionEstimator>>,
    ticks_run: u64,
}

impl PositioningLoop {
    pub fn new(
        config: &PositioningConfig,
        aggregator: Arc<DistanceAggregator>,
        clock: SessionClock,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self> {
        let estimator = PositionEstimator::new(config, aggregator, sink)?;
        Ok(Self {
            state: LoopState::Idle,
            period: config.report_interval()?,
            clock,
            estimator: Some(estimator),
            cancel_token: None,
            handle: None,
            ticks_run: 0,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks completed by the time the loop stopped.
    pub fn ticks_run(&self) -> u64 {
        self.ticks_run
    }

    /// Idle -> Running. The first tick fires one period after this call.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LoopState::Idle => {}
            LoopState::Running => return Err(PositioningError::AlreadyRunning),
            LoopState::Stopped => {
                return Err(PositioningError::InvalidState(
                    "positioning loop already stopped".to_string(),
                ))
            }
        }

        let mut estimator = self.estimator.take().ok_or_else(|| {
            PositioningError::InvalidState("estimator missing from idle loop".to_string())
        })?;
        estimator.open();

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            estimator,
            self.clock,
            self.period,
            cancel_token.clone(),
        ));

        log::info!("Positioning loop started (interval {:.2}s)", self.period.as_secs_f64());
        self.cancel_token = Some(cancel_token);
        self.handle = Some(handle);
        self.state = LoopState::Running;
        Ok(())
    }

    /// Prevent further ticks, let an in-flight tick finish, and close the sink.
    /// Idempotent; stopping an idle loop moves it straight to Stopped.
    ///
    /// If the tick task panicked its estimator is gone with it: the loop
    /// still ends up Stopped, but the sink is never closed and an error is
    /// returned.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let mut estimator = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(estimator) => Some(estimator),
                Err(e) => {
                    log::error!("Positioning task failed; sink left unclosed: {}", e);
                    self.state = LoopState::Stopped;
                    return Err(PositioningError::InvalidState(format!(
                        "positioning task failed to join: {}",
                        e
                    )));
                }
            },
            None => self.estimator.take(),
        };

        if let Some(estimator) = estimator.as_mut() {
            self.ticks_run = estimator.ticks();
            estimator.close();
        }

        if self.state != LoopState::Stopped {
            log::info!("Positioning loop stopped after {} ticks", self.ticks_run);
        }
        self.state = LoopState::Stopped;
        Ok(())
    }
}

async fn tick_loop(
    mut estimator: PositionEstimator,
    clock: SessionClock,
    period: Duration,
    cancel_token: CancellationToken,
) -> PositionEstimator {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                estimator.tick(clock.now_secs());
            }
        }
    }

    estimator
}
