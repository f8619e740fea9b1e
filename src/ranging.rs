//! Decoding of the collector's line-oriented ranging output.
//!
//! The collector interleaves diagnostic text with JSON ranging blocks such as
//! `{"Block":941, "results":[{"Addr":"0x0001","Status":"Ok","D_cm":39}]}`.
//! Anything that does not decode, reports a non-`Ok` status or names an
//! unknown responder address is dropped without error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::AnchorId;

const RAW_PREFIX: &str = "RAW: ";
const STATUS_OK: &str = "Ok";

/// Responder address to anchor lookup
///
/// Addresses are stored trimmed and lowercased, so lookups ignore case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, AnchorId>", into = "BTreeMap<String, AnchorId>")]
pub struct AddressMap {
    entries: BTreeMap<String, AnchorId>,
}

fn normalize(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl AddressMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, address: &str, anchor: AnchorId) -> Self {
        self.entries.insert(normalize(address), anchor);
        self
    }

    pub fn resolve(&self, address: &str) -> Option<AnchorId> {
        self.entries.get(&normalize(address)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, AnchorId>> for AddressMap {
    fn from(entries: BTreeMap<String, AnchorId>) -> Self {
        entries
            .into_iter()
            .fold(AddressMap::new(), |map, (address, anchor)| map.bind(&address, anchor))
    }
}

impl From<AddressMap> for BTreeMap<String, AnchorId> {
    fn from(map: AddressMap) -> Self {
        map.entries
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        AddressMap::new()
            .bind("0x0001", AnchorId::One)
            .bind("0x0002", AnchorId::Two)
    }
}

#[derive(Debug, Deserialize)]
struct RangingBlock {
    #[serde(rename = "Block", default)]
    block: Option<i64>,
    results: Vec<RawResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawResult {
    #[serde(rename = "Addr")]
    addr: Option<String>,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "D_cm")]
    d_cm: Option<f64>,
    #[serde(rename = "LPDoA_deg")]
    pdoa_deg: Option<f64>,
    #[serde(rename = "LAoA_deg")]
    laoa_deg: Option<f64>,
    #[serde(rename = "RAoA_deg")]
    raoa_deg: Option<f64>,
    #[serde(rename = "LFoM")]
    fom: Option<f64>,
    #[serde(rename = "CFO_100ppm")]
    cfo_100ppm: Option<f64>,
}

/// One usable distance measurement decoded from a ranging block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangingResult {
    pub block: Option<i64>,
    pub address: String,
    pub anchor: AnchorId,
    pub distance_m: f64,
    pub pdoa_deg: Option<f64>,
    pub laoa_deg: Option<f64>,
    pub raoa_deg: Option<f64>,
    pub fom: Option<f64>,
    pub cfo_100ppm: Option<f64>,
}

/// Turns collector output lines into ranging results
#[derive(Debug, Clone, Default)]
pub struct MeasurementParser {
    addresses: AddressMap,
}

impl MeasurementParser {
    pub fn new(addresses: AddressMap) -> Self {
        Self { addresses }
    }

    /// Decode one line. Returns an empty vector for anything that is not a
    /// well-formed ranging block with at least one usable result.
    pub fn parse_line(&self, line: &str) -> Vec<RangingResult> {
        let line = line.trim();
        let line = line.strip_prefix(RAW_PREFIX).unwrap_or(line);
        if !line.starts_with('{') {
            return Vec::new();
        }

        let block: RangingBlock = match serde_json::from_str(line) {
            Ok(block) => block,
            Err(e) => {
                log::trace!("dropping undecodable line ({}): {}", e, line);
                return Vec::new();
            }
        };

        block
            .results
            .into_iter()
            .filter_map(|raw| self.accept(block.block, raw))
            .collect()
    }

    fn accept(&self, block: Option<i64>, raw: RawResult) -> Option<RangingResult> {
        if raw.status.as_deref() != Some(STATUS_OK) {
            return None;
        }
        let address = raw.addr?;
        let d_cm = raw.d_cm.filter(|d| d.is_finite())?;
        let anchor = match self.addresses.resolve(&address) {
            Some(anchor) => anchor,
            None => {
                log::debug!("ignoring result from unknown responder {}", address);
                return None;
            }
        };

        Some(RangingResult {
            block,
            address,
            anchor,
            distance_m: d_cm / 100.0,
            pdoa_deg: raw.pdoa_deg,
            laoa_deg: raw.laoa_deg,
            raoa_deg: raw.raoa_deg,
            fom: raw.fom,
            cfo_100ppm: raw.cfo_100ppm,
        })
    }
}
