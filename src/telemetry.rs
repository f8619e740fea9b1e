//! JSON telemetry payloads for the cloud sink.
//!
//! Transport is external; this module only shapes messages. Every message
//! carries the device id, a UTC timestamp and a `messageId` that increases by
//! one per message. Values are rounded to millimetres here and nowhere else.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;

use crate::aggregator::AnchorAverage;
use crate::positioning::{PositionReport, TickReport};
use crate::report::{round_mm, ReportSink};
use crate::types::AnchorId;

const UNIT_METERS: &str = "meters";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PositionPayload {
    pub x: f64,
    pub y: f64,
    pub unit: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BeaconDistance {
    pub distance: f64,
    pub measurement_count: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DistancesPayload {
    pub beacon1: BeaconDistance,
    pub beacon2: BeaconDistance,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionTelemetry {
    pub device_id: String,
    pub timestamp: String,
    pub position: PositionPayload,
    pub distances: DistancesPayload,
    pub message_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistanceTelemetry {
    pub device_id: String,
    pub timestamp: String,
    pub beacon_number: u8,
    pub distance: f64,
    pub measurement_count: usize,
    pub unit: String,
    pub message_id: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusTelemetry {
    pub device_id: String,
    pub timestamp: String,
    pub status: String,
    pub details: Value,
    pub message_id: u64,
}

pub fn utc_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Builds payloads and owns the message sequence
#[derive(Debug, Clone)]
pub struct TelemetryEncoder {
    device_id: String,
    message_count: u64,
}

impl TelemetryEncoder {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            message_count: 0,
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.message_count
    }

    fn next_id(&mut self) -> u64 {
        let id = self.message_count;
        self.message_count += 1;
        id
    }

    pub fn position(&mut self, report: &PositionReport, at: DateTime<Utc>) -> PositionTelemetry {
        PositionTelemetry {
            device_id: self.device_id.clone(),
            timestamp: utc_timestamp(at),
            position: PositionPayload {
                x: round_mm(report.position.x),
                y: round_mm(report.position.y),
                unit: UNIT_METERS.to_string(),
            },
            distances: DistancesPayload {
                beacon1: BeaconDistance {
                    distance: round_mm(report.dist1),
                    measurement_count: report.count1,
                },
                beacon2: BeaconDistance {
                    distance: round_mm(report.dist2),
                    measurement_count: report.count2,
                },
            },
            message_id: self.next_id(),
        }
    }

    pub fn distance(
        &mut self,
        anchor: AnchorId,
        distance: f64,
        measurement_count: usize,
        at: DateTime<Utc>,
    ) -> DistanceTelemetry {
        DistanceTelemetry {
            device_id: self.device_id.clone(),
            timestamp: utc_timestamp(at),
            beacon_number: anchor.number(),
            distance: round_mm(distance),
            measurement_count,
            unit: UNIT_METERS.to_string(),
            message_id: self.next_id(),
        }
    }

    pub fn status(&mut self, status: &str, details: Value, at: DateTime<Utc>) -> StatusTelemetry {
        StatusTelemetry {
            device_id: self.device_id.clone(),
            timestamp: utc_timestamp(at),
            status: status.to_string(),
            details,
            message_id: self.next_id(),
        }
    }
}

fn average_details(average: &AnchorAverage) -> Value {
    match average {
        AnchorAverage::Fresh { mean, count } => json!({
            "state": "fresh",
            "distance": round_mm(*mean),
            "measurementCount": count,
        }),
        AnchorAverage::NoData => json!({ "state": "no_data" }),
        AnchorAverage::Stale { age_secs } => json!({
            "state": "stale",
            "ageSeconds": round_mm(*age_secs),
        }),
    }
}

/// Writes one JSON telemetry message per line
pub struct TelemetrySink<W: Write + Send> {
    encoder: TelemetryEncoder,
    writer: W,
    distance_messages: bool,
}

impl<W: Write + Send> TelemetrySink<W> {
    pub fn new(device_id: &str, writer: W) -> Self {
        Self {
            encoder: TelemetryEncoder::new(device_id),
            writer,
            distance_messages: false,
        }
    }

    /// Also send one distance message per anchor after each position.
    pub fn with_distance_messages(mut self, enabled: bool) -> Self {
        self.distance_messages = enabled;
        self
    }

    pub fn messages_sent(&self) -> u64 {
        self.encoder.messages_sent()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write<T: Serialize>(&mut self, message: &T) {
        let result = serde_json::to_string(message)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                writeln!(self.writer, "{}", line)?;
                self.writer.flush()
            });
        if let Err(e) = result {
            log::error!("Failed to write telemetry: {}", e);
        }
    }

    fn send_status(&mut self, status: &str, details: Value) {
        let message = self.encoder.status(status, details, Utc::now());
        self.write(&message);
    }
}

impl<W: Write + Send> ReportSink for TelemetrySink<W> {
    fn open(&mut self) {
        self.send_status("online", json!({}));
    }

    fn emit(&mut self, report: &TickReport) {
        let now = Utc::now();
        match report {
            TickReport::Position(p) => {
                let message = self.encoder.position(p, now);
                self.write(&message);
                if self.distance_messages {
                    let first = self.encoder.distance(AnchorId::One, p.dist1, p.count1, now);
                    self.write(&first);
                    let second = self.encoder.distance(AnchorId::Two, p.dist2, p.count2, now);
                    self.write(&second);
                }
            }
            TickReport::Waiting { sequence, statuses } => {
                let mut details = serde_json::Map::new();
                details.insert("tick".to_string(), json!(sequence));
                let missing: Vec<String> = report
                    .missing_anchors()
                    .iter()
                    .map(|a| a.to_string())
                    .collect();
                details.insert("missing".to_string(), json!(missing));
                for status in statuses {
                    details.insert(status.anchor.to_string(), average_details(&status.average));
                }
                self.send_status("waiting", Value::Object(details));
            }
            TickReport::Unsolvable {
                sequence,
                reason,
                dist1,
                dist2,
            } => {
                let details = json!({
                    "tick": sequence,
                    "reason": reason.to_string(),
                    "geometricallyInconsistent": reason.is_geometric_inconsistency(),
                    "beacon1": round_mm(*dist1),
                    "beacon2": round_mm(*dist2),
                });
                self.send_status("unsolvable", details);
            }
        }
    }

    fn close(&mut self) {
        self.send_status("offline", json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioning::AnchorStatus;
    use crate::solver::SolveError;
    use crate::types::Point2;
    use chrono::TimeZone;

    fn sample_report() -> PositionReport {
        PositionReport {
            sequence: 7,
            anchor1: Point2::new(0.0, 0.0),
            anchor2: Point2::new(2.0, 0.0),
            position: Point2::new(1.00004, 0.99961),
            dist1: 1.4142135,
            dist2: 1.4142136,
            count1: 5,
            count2: 4,
        }
    }

    fn lines(buffer: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(buffer)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_position_payload_shape() {
        let mut encoder = TelemetryEncoder::new("tag-1");
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let message = encoder.position(&sample_report(), at);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["deviceId"], "tag-1");
        assert_eq!(value["timestamp"], "2024-05-01T12:30:00.000000Z");
        assert_eq!(value["position"]["x"], 1.0);
        assert_eq!(value["position"]["y"], 1.0);
        assert_eq!(value["position"]["unit"], "meters");
        assert_eq!(value["distances"]["beacon1"]["distance"], 1.414);
        assert_eq!(value["distances"]["beacon2"]["measurementCount"], 4);
        assert_eq!(value["messageId"], 0);
    }

    #[test]
    fn test_message_ids_increase() {
        let mut encoder = TelemetryEncoder::new("tag-1");
        let at = Utc::now();
        let a = encoder.status("online", json!({}), at);
        let b = encoder.position(&sample_report(), at);
        let c = encoder.distance(AnchorId::Two, 1.23456, 3, at);
        assert_eq!((a.message_id, b.message_id, c.message_id), (0, 1, 2));
        assert_eq!(c.beacon_number, 2);
        assert_eq!(c.distance, 1.235);
        assert_eq!(encoder.messages_sent(), 3);
    }

    #[test]
    fn test_sink_lifecycle() {
        let mut sink = TelemetrySink::new("tag-9", Vec::new()).with_distance_messages(true);
        sink.open();
        sink.emit(&TickReport::Position(sample_report()));
        sink.emit(&TickReport::Waiting {
            sequence: 8,
            statuses: vec![
                AnchorStatus {
                    anchor: AnchorId::One,
                    average: AnchorAverage::Fresh { mean: 1.2, count: 5 },
                },
                AnchorStatus {
                    anchor: AnchorId::Two,
                    average: AnchorAverage::NoData,
                },
            ],
        });
        sink.emit(&TickReport::Unsolvable {
            sequence: 9,
            reason: SolveError::NonIntersecting { h_squared: -0.2 },
            dist1: 0.4,
            dist2: 0.5,
        });
        sink.close();
        assert_eq!(sink.messages_sent(), 7);

        let messages = lines(&sink.into_inner());
        assert_eq!(messages.len(), 7);
        assert_eq!(messages[0]["status"], "online");
        assert!(messages[1].get("position").is_some());
        assert_eq!(messages[2]["beaconNumber"], 1);
        assert_eq!(messages[3]["beaconNumber"], 2);
        assert_eq!(messages[4]["status"], "waiting");
        assert_eq!(messages[4]["details"]["missing"], json!(["beacon2"]));
        assert_eq!(messages[4]["details"]["beacon1"]["distance"], 1.2);
        assert_eq!(messages[5]["status"], "unsolvable");
        assert_eq!(messages[5]["details"]["geometricallyInconsistent"], true);
        assert_eq!(messages[6]["status"], "offline");
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message["messageId"], i as u64);
            assert_eq!(message["deviceId"], "tag-9");
        }
    }
}
