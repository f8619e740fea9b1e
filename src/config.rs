//! Operational parameters for the positioning engine.
//!
//! Values come from an optional JSON file, are overridden by CLI flags in the
//! binary, and are validated once before any component is constructed.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{PositioningError, Result};
use crate::ranging::AddressMap;
use crate::types::{AnchorId, Point2};

/// Shortest tick period the positioning loop accepts
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(1);

/// Geometry and timing parameters for windowing, solving and reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositioningConfig {
    /// Anchor 1 coordinate in meters
    pub anchor1: [f64; 2],
    /// Anchor 2 coordinate in meters
    pub anchor2: [f64; 2],
    /// Trailing duration over which samples are retained and averaged
    pub averaging_window_secs: f64,
    /// Maximum age of the latest sample before an anchor is reported stale
    pub staleness_timeout_secs: f64,
    /// Tick period of the positioning loop
    pub report_interval_secs: f64,
    /// Identifier stamped on telemetry payloads
    pub device_id: String,
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            anchor1: [0.0, 0.0],
            anchor2: [2.0, 0.0],
            averaging_window_secs: 2.0,
            staleness_timeout_secs: 5.0,
            report_interval_secs: 2.0,
            device_id: "dwm3001cdk-tag".to_string(),
        }
    }
}

impl PositioningConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: PositioningConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("averaging_window_secs", self.averaging_window_secs),
            ("staleness_timeout_secs", self.staleness_timeout_secs),
            ("report_interval_secs", self.report_interval_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PositioningError::InvalidConfig(format!(
                    "{} must be a positive number of seconds, got {}",
                    name, value
                )));
            }
        }

        if self.staleness_timeout_secs < self.averaging_window_secs {
            return Err(PositioningError::InvalidConfig(format!(
                "staleness_timeout_secs ({}) must not be shorter than averaging_window_secs ({})",
                self.staleness_timeout_secs, self.averaging_window_secs
            )));
        }

        self.report_interval()?;

        let a1 = self.anchor_position(AnchorId::One);
        let a2 = self.anchor_position(AnchorId::Two);
        if !(a1.x.is_finite() && a1.y.is_finite() && a2.x.is_finite() && a2.y.is_finite()) {
            return Err(PositioningError::InvalidConfig(
                "anchor coordinates must be finite".to_string(),
            ));
        }
        if a1 == a2 {
            return Err(PositioningError::InvalidConfig(format!(
                "anchors coincide at ({}, {})",
                a1.x, a1.y
            )));
        }

        Ok(())
    }

    pub fn anchor_position(&self, anchor: AnchorId) -> Point2 {
        let [x, y] = match anchor {
            AnchorId::One => self.anchor1,
            AnchorId::Two => self.anchor2,
        };
        Point2::new(x, y)
    }

    /// Tick period as a `Duration`, rejecting values that round below
    /// [`MIN_REPORT_INTERVAL`] or overflow.
    pub fn report_interval(&self) -> Result<Duration> {
        let period = Duration::try_from_secs_f64(self.report_interval_secs).map_err(|e| {
            PositioningError::InvalidConfig(format!(
                "report_interval_secs {} is not a usable period: {}",
                self.report_interval_secs, e
            ))
        })?;
        if period < MIN_REPORT_INTERVAL {
            return Err(PositioningError::InvalidConfig(format!(
                "report_interval_secs {} is below the {}ms minimum",
                self.report_interval_secs,
                MIN_REPORT_INTERVAL.as_millis()
            )));
        }
        Ok(period)
    }
}

/// How device collector subprocesses are launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable that speaks to one serial device
    pub collector_program: String,
    /// Arguments placed before the port/format/role arguments
    pub collector_args: Vec<String>,
    /// Output format requested from the collector
    pub output_format: String,
    /// Pause after launching a responder; the tag waits twice as long
    pub settle_delay_ms: u64,
    /// Responder address to anchor lookup
    pub addresses: AddressMap,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            collector_program: "python".to_string(),
            collector_args: vec!["serial_collector.py".to_string()],
            output_format: "raw".to_string(),
            settle_delay_ms: 1000,
            addresses: AddressMap::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.collector_program.trim().is_empty() {
            return Err(PositioningError::InvalidConfig(
                "collector_program must not be empty".to_string(),
            ));
        }
        if self.addresses.is_empty() {
            return Err(PositioningError::InvalidConfig(
                "address map must bind at least one anchor".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
