//! YAML helpers shared by the config loader, history flushing and the archive.

use serde::Serialize;

use crate::{DroneError, Result};

/// Serialize a value as a YAML document.
pub fn to_yaml_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let text = serde_yaml_ng::to_string(value)?;
    if text.trim().is_empty() {
        return Err(DroneError::Serialization {
            details: "YAML document is empty after serialization".to_string(),
        });
    }
    Ok(text.into_bytes())
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde adapter storing a `Duration` as fractional milliseconds.
///
/// Used for measured durations where sub-millisecond precision matters.
pub mod duration_ms_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid duration: {millis}ms")));
        }
        Duration::try_from_secs_f64(millis / 1000.0).map_err(serde::de::Error::custom)
    }
}
