//! Two-anchor UWB positioning engine.
//!
//! Distance samples from a tag's ranging stream are windowed per anchor,
//! checked for staleness, and solved for a 2D position on a fixed cadence.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod positioning;
pub mod ranging;
pub mod report;
pub mod solver;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use aggregator::{AnchorAverage, AnchorWindow, DistanceAggregator};
pub use config::{PositioningConfig, SupervisorConfig};
pub use error::{PositioningError, Result};
pub use positioning::{LoopState, PositionEstimator, PositionReport, PositioningLoop, TickReport};
pub use ranging::{AddressMap, MeasurementParser, RangingResult};
pub use report::{FanoutSink, LogSink, MemorySink, ReportSink};
pub use solver::{PositionSolver, SolveError};
pub use supervisor::{DeviceStatus, ProcessSupervisor};
pub use telemetry::{TelemetryEncoder, TelemetrySink};
pub use types::{AnchorId, DeviceRole, Point2, Sample, SessionClock};
