//! Telemetry parsing and snapshots.
//!
//! The device broadcasts its state roughly ten times a second as a single line
//! of `key:value;` pairs:
//!
//! ```text
//! pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:62;temph:65;tof:10;h:0;bat:87;baro:174.32;time:0;agx:-5.00;agy:1.00;agz:-999.00;
//! ```
//!
//! [`parse_telemetry`] turns a line into a field map. The listener wraps it in
//! a [`TelemetrySnapshot`] with a receive timestamp, and the first few
//! snapshots of a session are averaged into a [`TelemetryBaseline`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DroneError, Result};

/// Field names broadcast by the device.
pub mod fields {
    /// Attitude pitch, degrees
    pub const PITCH: &str = "pitch";
    /// Attitude roll, degrees
    pub const ROLL: &str = "roll";
    /// Attitude yaw, degrees
    pub const YAW: &str = "yaw";
    /// Speed along x
    pub const VGX: &str = "vgx";
    /// Speed along y
    pub const VGY: &str = "vgy";
    /// Speed along z
    pub const VGZ: &str = "vgz";
    /// Lowest temperature, degrees Celsius
    pub const TEMP_LOW: &str = "templ";
    /// Highest temperature, degrees Celsius
    pub const TEMP_HIGH: &str = "temph";
    /// Distance from the takeoff point, centimetres
    pub const TOF: &str = "tof";
    /// Height above ground, centimetres
    pub const HEIGHT: &str = "h";
    /// Battery level, percent
    pub const BATTERY: &str = "bat";
    /// Barometer reading, centimetres
    pub const BAROMETER: &str = "baro";
    /// Time the motors have been on, seconds
    pub const TIME: &str = "time";
    /// Acceleration along x, 0.001g
    pub const AGX: &str = "agx";
    /// Acceleration along y, 0.001g
    pub const AGY: &str = "agy";
    /// Acceleration along z, 0.001g
    pub const AGZ: &str = "agz";
}

/// Parse one telemetry line into its fields.
///
/// Empty entries (including the one after the trailing `;`) are skipped. Every
/// other entry must be `key:value` with a non-empty key and a numeric value.
/// A repeated key keeps its last value.
pub fn parse_telemetry(line: &str) -> Result<BTreeMap<String, f64>> {
    let mut fields = BTreeMap::new();

    for entry in line.trim().split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let Some((key, value)) = entry.split_once(':') else {
            return Err(DroneError::parse_error(
                "telemetry",
                format!("entry '{entry}' has no ':' separator"),
            ));
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(DroneError::parse_error(
                "telemetry",
                format!("entry '{entry}' has an empty key"),
            ));
        }

        let value: f64 = value.trim().parse().map_err(|_| {
            DroneError::parse_error("telemetry", format!("field '{key}' has non-numeric value"))
        })?;

        fields.insert(key.to_string(), value);
    }

    if fields.is_empty() {
        return Err(DroneError::parse_error("telemetry", "line contains no fields"));
    }

    Ok(fields)
}

/// Pitch, roll and yaw in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

/// A three-axis reading with its Euclidean magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub total: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, total: (x * x + y * y + z * z).sqrt() }
    }
}

/// Board temperature band in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    pub low: f64,
    pub high: f64,
    pub range: f64,
}

/// One parsed telemetry broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Position in the telemetry history
    pub sequence: u64,

    /// When the datagram was received
    pub received_at: DateTime<Utc>,

    fields: BTreeMap<String, f64>,
}

impl TelemetrySnapshot {
    pub fn new(sequence: u64, received_at: DateTime<Utc>, fields: BTreeMap<String, f64>) -> Self {
        Self { sequence, received_at, fields }
    }

    /// Value of a single field.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> &BTreeMap<String, f64> {
        &self.fields
    }

    /// Every field minus its baseline value. Fields without a baseline are
    /// returned unchanged.
    pub fn relative_to(&self, baseline: &TelemetryBaseline) -> BTreeMap<String, f64> {
        self.fields
            .iter()
            .map(|(name, value)| {
                let base = baseline.get(name).unwrap_or(0.0);
                (name.clone(), value - base)
            })
            .collect()
    }

    pub fn attitude(&self) -> Option<Attitude> {
        Some(Attitude {
            pitch: self.get(fields::PITCH)?,
            roll: self.get(fields::ROLL)?,
            yaw: self.get(fields::YAW)?,
        })
    }

    pub fn velocity(&self) -> Option<Vector3> {
        self.vector(fields::VGX, fields::VGY, fields::VGZ)
    }

    pub fn acceleration(&self) -> Option<Vector3> {
        self.vector(fields::AGX, fields::AGY, fields::AGZ)
    }

    pub fn temperature(&self) -> Option<TemperatureRange> {
        let low = self.get(fields::TEMP_LOW)?;
        let high = self.get(fields::TEMP_HIGH)?;
        Some(TemperatureRange { low, high, range: high - low })
    }

    pub fn battery(&self) -> Option<f64> {
        self.get(fields::BATTERY)
    }

    pub fn height(&self) -> Option<f64> {
        self.get(fields::HEIGHT)
    }

    pub fn barometer(&self) -> Option<f64> {
        self.get(fields::BAROMETER)
    }

    pub fn time_aloft(&self) -> Option<f64> {
        self.get(fields::TIME)
    }

    pub fn tof(&self) -> Option<f64> {
        self.get(fields::TOF)
    }

    fn vector(&self, x: &str, y: &str, z: &str) -> Option<Vector3> {
        Some(Vector3::new(self.get(x)?, self.get(y)?, self.get(z)?))
    }
}

/// Per-field mean of the first snapshots of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBaseline {
    /// Number of snapshots averaged
    pub samples: usize,

    fields: BTreeMap<String, f64>,
}

impl TelemetryBaseline {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> &BTreeMap<String, f64> {
        &self.fields
    }
}

/// Collects the first `target` snapshots and freezes their mean.
#[derive(Debug)]
pub struct BaselineAccumulator {
    target: usize,
    pushed: usize,
    sums: BTreeMap<String, (f64, usize)>,
}

impl BaselineAccumulator {
    pub fn new(target: usize) -> Self {
        Self { target, pushed: 0, sums: BTreeMap::new() }
    }

    /// Whether the baseline has already been produced.
    pub fn is_complete(&self) -> bool {
        self.pushed >= self.target
    }

    /// Baseline for a zero-sample configuration, available immediately.
    pub fn empty_baseline(&self) -> Option<TelemetryBaseline> {
        (self.target == 0).then(|| TelemetryBaseline { samples: 0, fields: BTreeMap::new() })
    }

    /// Add one snapshot's fields.
    ///
    /// Returns the baseline exactly once, when the target count is reached.
    /// Each field is averaged over the snapshots that contained it.
    pub fn push(&mut self, fields: &BTreeMap<String, f64>) -> Option<TelemetryBaseline> {
        if self.is_complete() {
            return None;
        }

        for (name, value) in fields {
            let entry = self.sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        self.pushed += 1;

        if !self.is_complete() {
            return None;
        }

        let fields = std::mem::take(&mut self.sums)
            .into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect();
        Some(TelemetryBaseline { samples: self.pushed, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "pitch:1;roll:-2;yaw:45;vgx:3;vgy:4;vgz:0;templ:62;temph:65;tof:10;h:0;bat:87;baro:174.32;time:0;agx:-5.00;agy:1.00;agz:-999.00;\r\n";

    #[test]
    fn parses_device_line() {
        let fields = parse_telemetry(SAMPLE).unwrap();
        assert_eq!(fields.len(), 16);
        assert_eq!(fields["bat"], 87.0);
        assert_eq!(fields["baro"], 174.32);
        assert_eq!(fields["agz"], -999.0);
    }

    #[test]
    fn missing_separator_is_rejected() {
        let err = parse_telemetry("pitch:0;roll0;yaw:1;").unwrap_err();
        assert!(matches!(err, DroneError::Parse { .. }));
        assert!(err.to_string().contains("roll0"));
    }

    #[test]
    fn non_numeric_value_and_empty_line_are_rejected() {
        assert!(parse_telemetry("bat:full;").is_err());
        assert!(parse_telemetry(":5;").is_err());
        assert!(parse_telemetry(";;\r\n").is_err());
    }

    #[test]
    fn derived_readings() {
        let snapshot = TelemetrySnapshot::new(0, Utc::now(), parse_telemetry(SAMPLE).unwrap());
        let velocity = snapshot.velocity().unwrap();
        assert_eq!(velocity.total, 5.0);
        let temp = snapshot.temperature().unwrap();
        assert_eq!(temp.range, 3.0);
        let attitude = snapshot.attitude().unwrap();
        assert_eq!(attitude.yaw, 45.0);
        assert_eq!(snapshot.battery(), Some(87.0));
        assert_eq!(snapshot.height(), Some(0.0));

        let partial = TelemetrySnapshot::new(1, Utc::now(), parse_telemetry("vgx:1;").unwrap());
        assert!(partial.velocity().is_none());
    }

    #[test]
    fn baseline_is_mean_of_first_samples() {
        let mut acc = BaselineAccumulator::new(3);
        assert!(acc.push(&parse_telemetry("h:10;bat:90;").unwrap()).is_none());
        assert!(acc.push(&parse_telemetry("h:20;bat:88;").unwrap()).is_none());
        let baseline = acc.push(&parse_telemetry("h:30;bat:86;").unwrap()).unwrap();
        assert_eq!(baseline.samples, 3);
        assert_eq!(baseline.get("h"), Some(20.0));
        assert_eq!(baseline.get("bat"), Some(88.0));
        assert!(acc.push(&parse_telemetry("h:99;").unwrap()).is_none());
    }

    #[test]
    fn baseline_averages_sparse_fields_over_their_own_count() {
        let mut acc = BaselineAccumulator::new(2);
        acc.push(&parse_telemetry("h:10;tof:4;").unwrap());
        let baseline = acc.push(&parse_telemetry("h:20;").unwrap()).unwrap();
        assert_eq!(baseline.get("tof"), Some(4.0));
        assert_eq!(baseline.get("h"), Some(15.0));
    }

    #[test]
    fn relative_reading_subtracts_baseline() {
        let mut acc = BaselineAccumulator::new(1);
        let baseline = acc.push(&parse_telemetry("h:10;baro:100;").unwrap()).unwrap();
        let snapshot =
            TelemetrySnapshot::new(0, Utc::now(), parse_telemetry("h:35;baro:99.5;bat:80;").unwrap());
        let relative = snapshot.relative_to(&baseline);
        assert_eq!(relative["h"], 25.0);
        assert_eq!(relative["baro"], -0.5);
        assert_eq!(relative["bat"], 80.0);
    }

    #[test]
    fn zero_sample_baseline_is_immediate() {
        let acc = BaselineAccumulator::new(0);
        assert!(acc.is_complete());
        assert_eq!(acc.empty_baseline().unwrap().samples, 0);
        assert!(BaselineAccumulator::new(2).empty_baseline().is_none());
    }

    proptest! {
        #[test]
        fn field_set_equals_input_keys(
            entries in prop::collection::btree_map("[a-z]{1,6}", -1000i32..1000, 1..16)
        ) {
            let line: String = entries.iter().map(|(k, v)| format!("{k}:{v};")).collect();
            let parsed = parse_telemetry(&line).unwrap();
            let parsed_keys: Vec<_> = parsed.keys().cloned().collect();
            let input_keys: Vec<_> = entries.keys().cloned().collect();
            prop_assert_eq!(parsed_keys, input_keys);
            for (key, value) in &entries {
                prop_assert_eq!(parsed[key], *value as f64);
            }
        }

        #[test]
        fn baseline_equals_arithmetic_mean(values in prop::collection::vec(-500i32..500, 1..20)) {
            let mut acc = BaselineAccumulator::new(values.len());
            let mut baseline = None;
            for v in &values {
                baseline = acc.push(&parse_telemetry(&format!("h:{v};")).unwrap());
            }
            let baseline = baseline.expect("baseline after final sample");
            let expected = values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64;
            prop_assert!((baseline.get("h").unwrap() - expected).abs() < 1e-9);
        }
    }
}
