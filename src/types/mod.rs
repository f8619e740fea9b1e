pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// One of the two fixed reference points the tag ranges against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AnchorId {
    One,
    Two,
}

impl AnchorId {
    pub const ALL: [AnchorId; 2] = [AnchorId::One, AnchorId::Two];

    /// Responder number used by the ranging firmware (1 or 2).
    pub fn number(self) -> u8 {
        match self {
            AnchorId::One => 1,
            AnchorId::Two => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(AnchorId::One),
            2 => Some(AnchorId::Two),
            _ => None,
        }
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "beacon{}", self.number())
    }
}

impl TryFrom<u8> for AnchorId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        AnchorId::from_number(value).ok_or_else(|| format!("unknown anchor number {}", value))
    }
}

impl From<AnchorId> for u8 {
    fn from(id: AnchorId) -> u8 {
        id.number()
    }
}

/// A single valid distance measurement to one anchor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub distance: f64,
    pub anchor: AnchorId,
}

impl Sample {
    pub fn new(anchor: AnchorId, timestamp: f64, distance: f64) -> Self {
        Self {
            timestamp,
            distance,
            anchor,
        }
    }
}

/// Role a supervised device plays in the ranging session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Initiator; the only role whose output carries ranging results.
    Tag,
    /// Responder bound to a fixed anchor; supervised for liveness only.
    Responder(AnchorId),
}

impl DeviceRole {
    /// Trailing collector arguments selecting this role.
    pub fn collector_args(&self) -> Vec<String> {
        match self {
            DeviceRole::Tag => vec!["tag".to_string()],
            DeviceRole::Responder(anchor) => vec!["beacon".to_string(), anchor.number().to_string()],
        }
    }

    pub fn emits_ranging(&self) -> bool {
        matches!(self, DeviceRole::Tag)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Tag => write!(f, "tag"),
            DeviceRole::Responder(anchor) => write!(f, "{}", anchor),
        }
    }
}

/// Monotonic time source shared by the readers and the positioning loop.
///
/// Samples are stamped and ticks are evaluated in seconds since the same
/// epoch, so staleness never depends on wall-clock adjustments.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
