//! The canonical telemetry record.
//!
//! Every decoder normalizes its protocol into [`TelemetryRecord`]; the
//! validator and publisher consume nothing else. The record is immutable
//! after validation completes; only the pipeline's publish step appends the
//! reserved extended-data keys.
//!
//! JSON shape (bus wire format): camelCase keys, optional fields omitted when
//! unset, timestamps ISO-8601 UTC with millisecond precision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Extended-data keys reserved for the pipeline. Decoders must not write them.
pub mod keys {
    /// Protocol tag of the decoder that produced the record.
    pub const PROTOCOL: &str = "Protocol";
    /// Wall-clock UTC instant the pipeline processed the record.
    pub const PROCESSED_AT: &str = "ProcessedAt";
    /// Fresh opaque id minted per processed frame.
    pub const PROCESSING_ID: &str = "ProcessingId";
    /// Size in bytes of the raw frame the record was decoded from.
    pub const DATA_SIZE: &str = "DataSize";
    /// Quality score computed by the validator, 0-100.
    pub const QUALITY_SCORE: &str = "QualityScore";
    /// Bus partition the record landed on, set after publish.
    pub const KAFKA_PARTITION: &str = "KafkaPartition";
    /// Bus offset the record landed at, set after publish.
    pub const KAFKA_OFFSET: &str = "KafkaOffset";
}

/// Decoder-specific metadata attached to a record. Insertion order is
/// irrelevant; values are polymorphic scalars.
pub type ExtendedData = HashMap<String, serde_json::Value>;

/// A normalized GPS position record.
///
/// Required fields are populated before the record leaves a decoder, with one
/// exception: a decoder that only sees time-of-day (GGA alone) leaves
/// `timestamp` unset and the pipeline stamps it with wall-clock UTC on
/// ingress. The validator rejects any record still missing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Stable identifier for the emitting device. Never empty.
    pub device_id: String,
    /// WGS-84 latitude in degrees, [-90, 90].
    pub latitude: f64,
    /// WGS-84 longitude in degrees, [-180, 180].
    pub longitude: f64,
    /// UTC fix timestamp.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "iso8601_millis"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    /// Ground speed in km/h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Course over ground in degrees, [0, 360).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Altitude above mean sea level in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Number of satellites used in the fix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_count: Option<u32>,
    /// Horizontal dilution of precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    /// Decoder- and pipeline-attached metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extended_data: ExtendedData,
}

impl TelemetryRecord {
    /// Creates a record with the required position fields; everything else unset.
    pub fn new(device_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            device_id: device_id.into(),
            latitude,
            longitude,
            timestamp: None,
            speed: None,
            heading: None,
            altitude: None,
            satellite_count: None,
            hdop: None,
            extended_data: HashMap::new(),
        }
    }

    /// Inserts an extended-data entry, overwriting any previous value.
    pub fn set_extended(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.extended_data.insert(key.into(), value.into());
    }

    /// Returns an extended-data entry as a string slice, if present and textual.
    pub fn extended_str(&self, key: &str) -> Option<&str> {
        self.extended_data.get(key).and_then(|v| v.as_str())
    }

    /// Quality score previously stored by the validator, if any.
    pub fn quality_score(&self) -> Option<u64> {
        self.extended_data
            .get(keys::QUALITY_SCORE)
            .and_then(|v| v.as_u64())
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-01-15T10:30:00.000Z`.
mod iso8601_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        match opt {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
