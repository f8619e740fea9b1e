//! Reporting sinks for tick results.

use std::sync::{Arc, Mutex};

use crate::aggregator::AnchorAverage;
use crate::positioning::TickReport;

/// Receives one report per tick, in tick order.
pub trait ReportSink: Send {
    /// Called once before the first tick.
    fn open(&mut self) {}

    fn emit(&mut self, report: &TickReport);

    /// Called once after the last tick.
    fn close(&mut self) {}
}

/// Round to millimetre precision for display and telemetry.
pub fn round_mm(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Writes reports to the `log` facade in the console format operators know.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        LogSink
    }
}

/// Human-readable description of one anchor's state, e.g. `d1=1.414m`.
pub fn describe_average(label: &str, index: u8, average: &AnchorAverage) -> String {
    match average {
        AnchorAverage::Fresh { mean, .. } => format!("d{}={:.3}m", index, mean),
        AnchorAverage::NoData => format!("no {} data", label),
        AnchorAverage::Stale { age_secs } => format!("{} stale ({:.1}s)", label, age_secs),
    }
}

impl ReportSink for LogSink {
    fn emit(&mut self, report: &TickReport) {
        match report {
            TickReport::Position(p) => log::info!(
                "Position: x={:.3}m, y={:.3}m (d1={:.3}m[n={}], d2={:.3}m[n={}])",
                p.position.x,
                p.position.y,
                p.dist1,
                p.count1,
                p.dist2,
                p.count2
            ),
            TickReport::Unsolvable {
                reason,
                dist1,
                dist2,
                ..
            } => log::debug!(
                "Position calculation failed (d1={:.3}m, d2={:.3}m): {}",
                dist1,
                dist2,
                reason
            ),
            TickReport::Waiting { statuses, .. } => {
                let parts: Vec<String> = statuses
                    .iter()
                    .map(|s| describe_average(&s.anchor.to_string(), s.anchor.number(), &s.average))
                    .collect();
                log::debug!("Waiting for measurements: {}", parts.join(", "));
            }
        }
    }
}

/// Sends every report to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ReportSink for FanoutSink {
    fn open(&mut self) {
        self.sinks.iter_mut().for_each(|s| s.open());
    }

    fn emit(&mut self, report: &TickReport) {
        self.sinks.iter_mut().for_each(|s| s.emit(report));
    }

    fn close(&mut self) {
        self.sinks.iter_mut().for_each(|s| s.close());
    }
}

/// Keeps every report in a shared buffer; handy for embedding and tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<TickReport>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<TickReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ReportSink for MemorySink {
    fn emit(&mut self, report: &TickReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}
