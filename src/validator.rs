//! Central record validation and quality scoring.
//!
//! Runs on every record immediately after decoding. Hard invariants produce
//! a [`ValidationResult`]; the quality score is advisory only — a score of 0
//! never rejects a record.

use crate::record::TelemetryRecord;
use chrono::{Datelike, Duration, Utc};
use tracing::warn;

/// Outcome of validating one record.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether every hard invariant held.
    pub is_valid: bool,
    /// Human-readable descriptions of each violation.
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }
}

/// Stateless validator shared by all pipeline workers.
#[derive(Debug, Default)]
pub struct Validator;

impl Validator {
    /// Creates the validator.
    pub fn new() -> Self {
        Self
    }

    /// Checks every hard invariant from the record contract.
    pub fn validate(&self, record: &TelemetryRecord) -> ValidationResult {
        let mut result = ValidationResult::ok();

        if record.device_id.trim().is_empty() {
            result.errors.push("device id is empty".to_string());
        }

        if !(-90.0..=90.0).contains(&record.latitude) || !record.latitude.is_finite() {
            result
                .errors
                .push(format!("latitude {} outside [-90, 90]", record.latitude));
        }
        if !(-180.0..=180.0).contains(&record.longitude) || !record.longitude.is_finite() {
            result
                .errors
                .push(format!("longitude {} outside [-180, 180]", record.longitude));
        }
        if record.latitude == 0.0 && record.longitude == 0.0 {
            result
                .errors
                .push("position is null island (0, 0)".to_string());
        }

        match record.timestamp {
            None => result.errors.push("timestamp is missing".to_string()),
            Some(ts) => {
                let now = Utc::now();
                if ts < now - Duration::hours(24) {
                    result
                        .errors
                        .push(format!("timestamp {} older than 24h", ts));
                }
                if ts > now + Duration::hours(1) {
                    result
                        .errors
                        .push(format!("timestamp {} more than 1h in the future", ts));
                }
                if ts.year() < 2000 {
                    result.errors.push(format!("timestamp year {} < 2000", ts.year()));
                }
            }
        }

        if let Some(speed) = record.speed {
            if !(0.0..=1000.0).contains(&speed) {
                result
                    .errors
                    .push(format!("speed {} outside [0, 1000] km/h", speed));
            } else if speed > 300.0 {
                // Suspicious but valid
                warn!(
                    device_id = %record.device_id,
                    speed,
                    "Speed above 300 km/h"
                );
            }
        }

        if let Some(heading) = record.heading {
            if !(0.0..360.0).contains(&heading) {
                result
                    .errors
                    .push(format!("heading {} outside [0, 360)", heading));
            }
        }

        if let Some(satellites) = record.satellite_count {
            if satellites > 50 {
                result
                    .errors
                    .push(format!("satellite count {} outside [0, 50]", satellites));
            }
        }

        if let Some(hdop) = record.hdop {
            if !(0.0..=50.0).contains(&hdop) {
                result.errors.push(format!("hdop {} outside [0, 50]", hdop));
            }
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Computes the advisory quality score in [0, 100].
    ///
    /// Deductions: 5 per missing optional field; low satellite count
    /// (< 4: 30, < 6: 15, < 8: 5); high HDOP (> 10: 40, > 5: 20, > 2: 10);
    /// stale timestamps (> 60 min: 20, > 10 min: 10).
    pub fn quality_score(&self, record: &TelemetryRecord) -> u8 {
        let mut score: i32 = 100;

        if record.speed.is_none() {
            score -= 5;
        }
        if record.heading.is_none() {
            score -= 5;
        }
        if record.altitude.is_none() {
            score -= 5;
        }

        match record.satellite_count {
            None => score -= 5,
            Some(n) if n < 4 => score -= 30,
            Some(n) if n < 6 => score -= 15,
            Some(n) if n < 8 => score -= 5,
            Some(_) => {}
        }

        match record.hdop {
            None => score -= 5,
            Some(h) if h > 10.0 => score -= 40,
            Some(h) if h > 5.0 => score -= 20,
            Some(h) if h > 2.0 => score -= 10,
            Some(_) => {}
        }

        if let Some(ts) = record.timestamp {
            let age = Utc::now().signed_duration_since(ts);
            if age > Duration::minutes(60) {
                score -= 20;
            } else if age > Duration::minutes(10) {
                score -= 10;
            }
        }

        score.clamp(0, 100) as u8
    }
}
