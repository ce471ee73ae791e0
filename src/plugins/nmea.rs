//! NMEA 0183 reference decoder.
//!
//! Accepts a byte buffer holding one or more NMEA sentences, splits on
//! CR/LF, verifies each sentence's XOR checksum, and folds the surviving
//! sentences into one canonical record. Later sentences overwrite earlier
//! field values (last-write-wins by sentence order) while extended-data keys
//! accumulate; only sentences whose validity predicate passed contribute.
//!
//! Sentences with an invalid checksum are dropped with a warning and never
//! produce a record. A buffer in which no sentence yields a position decodes
//! to an error.

use crate::error::{GatewayError, Result};
use crate::plugin::{DecoderPlugin, ProtocolTag};
use crate::record::TelemetryRecord;
use chrono::{DateTime, NaiveDate, Utc};
use memchr::memchr_iter;
use tracing::{debug, warn};

const KNOTS_TO_KMH: f64 = 1.852;

/// Hand-rolled NMEA 0183 decoder; the in-tree reference plugin.
#[derive(Debug, Default)]
pub struct NmeaDecoder;

impl NmeaDecoder {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self
    }
}

impl DecoderPlugin for NmeaDecoder {
    fn name(&self) -> &str {
        "nmea-0183"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn protocol(&self) -> ProtocolTag {
        ProtocolTag::Nmea
    }

    fn can_decode(&self, payload: &[u8]) -> bool {
        // Leading bytes only: a sentence start and at least one field separator
        let trimmed = trim_ascii_start(payload);
        trimmed.first() == Some(&b'$') && memchr::memchr(b',', trimmed).is_some()
    }

    fn decode(&self, payload: &[u8], device_id: &str) -> Result<TelemetryRecord> {
        let text = String::from_utf8_lossy(payload);
        let mut fix = FixAccumulator::default();
        let mut sentences_seen = 0usize;

        for line in text.split(['\r', '\n']) {
            let line = line.trim();
            if line.is_empty() || !line.starts_with('$') {
                // Non-sentence noise is skipped silently
                continue;
            }
            sentences_seen += 1;

            let Some(body) = verified_body(line) else {
                warn!(device_id, sentence = line, "Invalid NMEA checksum");
                continue;
            };

            fix.apply(body);
        }

        if sentences_seen == 0 {
            return Err(GatewayError::decode("NMEA", "buffer contains no sentence"));
        }

        fix.into_record(device_id)
    }

    fn validate(&self, record: &TelemetryRecord) -> std::result::Result<(), String> {
        if !record.latitude.is_finite() || !record.longitude.is_finite() {
            return Err("non-finite coordinate".to_string());
        }
        if let Some(speed) = record.speed {
            if !speed.is_finite() {
                return Err("non-finite speed".to_string());
            }
        }
        Ok(())
    }
}

/// Verifies the sentence checksum and returns the body between `$` and `*`.
///
/// A sentence is valid iff it contains exactly one `*`, the two characters
/// after `*` form a hexadecimal byte, and the XOR of all bytes between `$`
/// and `*` (exclusive) equals that byte.
fn verified_body(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut stars = memchr_iter(b'*', bytes);
    let star = stars.next()?;
    if stars.next().is_some() {
        return None;
    }

    let hex = &line[star + 1..];
    if hex.len() != 2 {
        return None;
    }
    let expected = u8::from_str_radix(hex, 16).ok()?;
    let actual = bytes[1..star].iter().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return None;
    }
    Some(&line[1..star])
}

/// Mutable fix state folded over the sentences of one buffer.
#[derive(Debug, Default)]
struct FixAccumulator {
    latitude: Option<f64>,
    longitude: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
    speed: Option<f64>,
    heading: Option<f64>,
    altitude: Option<f64>,
    satellite_count: Option<u32>,
    hdop: Option<f64>,
    extended: Vec<(String, serde_json::Value)>,
}

impl FixAccumulator {
    fn apply(&mut self, body: &str) {
        let fields: Vec<&str> = body.split(',').collect();
        let sentence_type = fields[0];
        match stripped_type(sentence_type) {
            "RMC" => self.apply_rmc(sentence_type, &fields),
            "GGA" => self.apply_gga(sentence_type, &fields),
            "GSA" => self.apply_gsa(&fields),
            "GSV" => self.apply_gsv(&fields),
            other => {
                debug!(sentence_type, "Unhandled NMEA sentence type");
                self.put_extended(format!("Unknown_{}", other), body.to_string().into());
            }
        }
    }

    /// RMC: UTC time, status, lat, lat-dir, lon, lon-dir, speed-knots,
    /// course, date, magnetic-variation. Only status `A` is a valid fix.
    fn apply_rmc(&mut self, sentence_type: &str, fields: &[&str]) {
        if fields.get(2).copied() != Some("A") {
            debug!("Discarding RMC with void status");
            return;
        }

        if let Some(lat) = parse_coordinate(field(fields, 3), field(fields, 4)) {
            self.latitude = Some(lat);
        }
        if let Some(lon) = parse_coordinate(field(fields, 5), field(fields, 6)) {
            self.longitude = Some(lon);
        }
        if let Some(knots) = parse_f64(field(fields, 7)) {
            self.speed = Some(knots * KNOTS_TO_KMH);
        }
        if let Some(course) = parse_f64(field(fields, 8)) {
            self.heading = Some(course);
        }
        if let Some(ts) = parse_timestamp(field(fields, 9), field(fields, 1)) {
            self.timestamp = Some(ts);
        }

        self.put_extended("MessageType".to_string(), sentence_type.to_string().into());
        self.put_extended("Quality".to_string(), "A".into());
    }

    /// GGA: UTC time, lat, lat-dir, lon, lon-dir, fix-quality, satellites,
    /// hdop, altitude. Fix quality `0` means no fix. Carries no date, so the
    /// timestamp stays unset; the pipeline stamps it on ingress.
    fn apply_gga(&mut self, sentence_type: &str, fields: &[&str]) {
        let quality = field(fields, 6);
        if quality.is_empty() || quality == "0" {
            debug!("Discarding GGA without fix");
            return;
        }

        if let Some(lat) = parse_coordinate(field(fields, 2), field(fields, 3)) {
            self.latitude = Some(lat);
        }
        if let Some(lon) = parse_coordinate(field(fields, 4), field(fields, 5)) {
            self.longitude = Some(lon);
        }
        if let Some(satellites) = parse_u32(field(fields, 7)) {
            self.satellite_count = Some(satellites);
        }
        if let Some(hdop) = parse_f64(field(fields, 8)) {
            self.hdop = Some(hdop);
        }
        if let Some(altitude) = parse_f64(field(fields, 9)) {
            self.altitude = Some(altitude);
        }

        self.put_extended("MessageType".to_string(), sentence_type.to_string().into());
        self.put_extended("FixQuality".to_string(), quality.to_string().into());
    }

    /// GSA: selection mode, fix type, satellite ids, then PDOP/HDOP/VDOP.
    fn apply_gsa(&mut self, fields: &[&str]) {
        if let Some(hdop) = parse_f64(field(fields, 16)) {
            self.hdop = Some(hdop);
        }
        if !field(fields, 1).is_empty() {
            self.put_extended("Mode".to_string(), field(fields, 1).to_string().into());
        }
        if !field(fields, 2).is_empty() {
            self.put_extended("FixType".to_string(), field(fields, 2).to_string().into());
        }
    }

    /// GSV: satellites-in-view summary.
    fn apply_gsv(&mut self, fields: &[&str]) {
        if let Some(in_view) = parse_u32(field(fields, 3)) {
            self.put_extended("SatellitesInView".to_string(), in_view.into());
        }
    }

    /// Same-key writes overwrite (last write wins); distinct keys accumulate.
    fn put_extended(&mut self, key: String, value: serde_json::Value) {
        if let Some(slot) = self.extended.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.extended.push((key, value));
        }
    }

    fn into_record(self, device_id: &str) -> Result<TelemetryRecord> {
        let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) else {
            return Err(GatewayError::decode(
                "NMEA",
                "no valid sentence produced a position",
            ));
        };

        let mut record = TelemetryRecord::new(device_id, latitude, longitude);
        record.timestamp = self.timestamp;
        record.speed = self.speed;
        record.heading = self.heading;
        record.altitude = self.altitude;
        record.satellite_count = self.satellite_count;
        record.hdop = self.hdop;
        record.extended_data = self.extended.into_iter().collect();
        Ok(record)
    }
}

/// Strips the two-character talker prefix: `GPRMC` → `RMC`.
fn stripped_type(sentence_type: &str) -> &str {
    if sentence_type.len() >= 5 {
        &sentence_type[2..]
    } else {
        sentence_type
    }
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or("")
}

fn parse_f64(s: &str) -> Option<f64> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

/// Parses `DDMM.MMMM` (or `DDDMM.MMMM`) into signed decimal degrees,
/// negated when the direction is `S` or `W`.
pub fn parse_coordinate(value: &str, direction: &str) -> Option<f64> {
    let raw: f64 = parse_f64(value)?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match direction {
        "S" | "W" => Some(-decimal),
        "N" | "E" => Some(decimal),
        _ => None,
    }
}

/// Formats decimal degrees back into `(DDMM.MMMMM, direction)`; the inverse
/// of [`parse_coordinate`] to well under 1e-6 degrees.
pub fn format_coordinate(decimal: f64, is_latitude: bool) -> (String, &'static str) {
    let direction = match (is_latitude, decimal < 0.0) {
        (true, false) => "N",
        (true, true) => "S",
        (false, false) => "E",
        (false, true) => "W",
    };
    let abs = decimal.abs();
    let degrees = abs.trunc();
    let minutes = (abs - degrees) * 60.0;
    let text = if is_latitude {
        format!("{:02}{:08.5}", degrees as u32, minutes)
    } else {
        format!("{:03}{:08.5}", degrees as u32, minutes)
    };
    (text, direction)
}

/// Combines `DDMMYY` and `HHMMSS[.sss]` into a UTC timestamp, year offset
/// +2000.
pub fn parse_timestamp(date: &str, time: &str) -> Option<DateTime<Utc>> {
    if date.len() != 6 {
        return None;
    }
    let day: u32 = date[0..2].parse().ok()?;
    let month: u32 = date[2..4].parse().ok()?;
    let year: i32 = date[4..6].parse::<i32>().ok()? + 2000;

    let (hms, frac) = match time.split_once('.') {
        Some((hms, frac)) => (hms, frac),
        None => (time, ""),
    };
    if hms.len() != 6 {
        return None;
    }
    let hour: u32 = hms[0..2].parse().ok()?;
    let minute: u32 = hms[2..4].parse().ok()?;
    let second: u32 = hms[4..6].parse().ok()?;
    let millis: u32 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<3}", &frac[..frac.len().min(3)]);
        padded.parse().ok()?
    };

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_milli_opt(hour, minute, second, millis)
        .map(|dt| dt.and_utc())
}

fn trim_ascii_start(payload: &[u8]) -> &[u8] {
    let mut rest = payload;
    while let [first, tail @ ..] = rest {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }
    rest
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn decoder() -> NmeaDecoder {
        NmeaDecoder::new()
    }

    #[test]
    fn test_can_decode_requires_dollar_and_comma() {
        let d = decoder();
        assert!(d.can_decode(RMC.as_bytes()));
        assert!(d.can_decode(b"\r\n$GPGGA,1"));
        assert!(!d.can_decode(b"GPRMC,123519"));
        assert!(!d.can_decode(b"$GPRMC"));
        assert!(!d.can_decode(b"\xfd\x09\x00"));
    }

    #[test]
    fn test_checksum_verification() {
        assert!(verified_body(RMC).is_some());
        assert!(verified_body(GGA).is_some());
        // Wrong checksum byte
        assert!(verified_body(
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00"
        )
        .is_none());
        // Missing checksum entirely
        assert!(verified_body("$GPRMC,123519,A").is_none());
        // Two stars
        assert!(verified_body("$GPRMC,12*35*6A").is_none());
        // One hex digit only
        assert!(verified_body("$GPRMC,123519*6").is_none());
    }

    #[test]
    fn test_rmc_reference_sentence() {
        let record = decoder()
            .decode(RMC.as_bytes(), "truck-1")
            .expect("reference RMC decodes");

        assert_eq!(record.device_id, "truck-1");
        assert!((record.latitude - 48.1173).abs() < 1e-4);
        assert!((record.longitude - 11.5167).abs() < 1e-4);
        assert!((record.speed.expect("speed") - 41.4848).abs() < 1e-4);
        assert!((record.heading.expect("heading") - 84.4).abs() < 1e-9);
        let ts = record.timestamp.expect("timestamp");
        assert_eq!(ts.to_rfc3339(), "1994-03-23T12:35:19+00:00");
        assert_eq!(record.extended_str("MessageType"), Some("GPRMC"));
        assert_eq!(record.extended_str("Quality"), Some("A"));
    }

    #[test]
    fn test_rmc_void_status_discarded() {
        let sentence = with_checksum("GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,,");
        let result = decoder().decode(sentence.as_bytes(), "d");
        assert!(matches!(result, Err(GatewayError::Decode { .. })));
    }

    #[test]
    fn test_invalid_checksum_never_produces_record() {
        let bad = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00";
        let result = decoder().decode(bad.as_bytes(), "d");
        assert!(matches!(result, Err(GatewayError::Decode { .. })));
    }

    #[test]
    fn test_gga_reference_sentence() {
        let record = decoder().decode(GGA.as_bytes(), "d").expect("GGA decodes");

        assert!((record.latitude - 48.1173).abs() < 1e-4);
        assert!((record.altitude.expect("altitude") - 545.4).abs() < 1e-9);
        assert_eq!(record.satellite_count, Some(8));
        assert!((record.hdop.expect("hdop") - 0.9).abs() < 1e-9);
        // GGA carries no date: the decoder leaves the timestamp unset
        assert!(record.timestamp.is_none());
        assert_eq!(record.extended_str("FixQuality"), Some("1"));
    }

    #[test]
    fn test_gga_no_fix_discarded() {
        let sentence = with_checksum("GPGGA,123519,4807.038,N,01131.000,E,0,00,,,M,,M,,");
        let result = decoder().decode(sentence.as_bytes(), "d");
        assert!(matches!(result, Err(GatewayError::Decode { .. })));
    }

    #[test]
    fn test_gsa_populates_hdop_and_extended() {
        let gsa = with_checksum("GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1");
        let buffer = format!("{}\r\n{}", RMC, gsa);
        let record = decoder().decode(buffer.as_bytes(), "d").expect("decodes");

        assert!((record.hdop.expect("hdop") - 1.3).abs() < 1e-9);
        assert_eq!(record.extended_str("Mode"), Some("A"));
        assert_eq!(record.extended_str("FixType"), Some("3"));
    }

    #[test]
    fn test_gsv_satellites_in_view() {
        let gsv = with_checksum("GPGSV,2,1,08,01,40,083,46,02,17,308,41,12,07,344,39,14,22,228,45");
        let buffer = format!("{}\r\n{}", RMC, gsv);
        let record = decoder().decode(buffer.as_bytes(), "d").expect("decodes");
        assert_eq!(
            record.extended_data.get("SatellitesInView").and_then(|v| v.as_u64()),
            Some(8)
        );
    }

    #[test]
    fn test_unknown_sentence_stored_under_unknown_key() {
        let vtg = with_checksum("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K");
        let buffer = format!("{}\r\n{}", RMC, vtg);
        let record = decoder().decode(buffer.as_bytes(), "d").expect("decodes");
        assert!(record.extended_data.contains_key("Unknown_VTG"));
    }

    #[test]
    fn test_multi_sentence_last_write_wins() {
        // Second sentence disagrees on position; it arrives later, so it wins
        let second = with_checksum("GPRMC,123520,A,4807.100,N,01131.200,E,010.0,090.0,230394,,");
        let buffer = format!("{}\r\n{}", RMC, second);
        let record = decoder().decode(buffer.as_bytes(), "d").expect("decodes");

        let expected_lat = 48.0 + 7.100 / 60.0;
        assert!((record.latitude - expected_lat).abs() < 1e-9);
        assert!((record.speed.expect("speed") - 18.52).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_sentence_does_not_overwrite() {
        // A void RMC after a good one must not clobber the good fix
        let void = with_checksum("GPRMC,123520,V,0000.000,N,00000.000,E,000.0,000.0,230394,,");
        let buffer = format!("{}\r\n{}", RMC, void);
        let record = decoder().decode(buffer.as_bytes(), "d").expect("decodes");
        assert!((record.latitude - 48.1173).abs() < 1e-4);
    }

    #[test]
    fn test_non_sentence_lines_skipped_silently() {
        let buffer = format!("noise\r\n{}\r\n\r\ngarbage", RMC);
        assert!(decoder().decode(buffer.as_bytes(), "d").is_ok());
    }

    #[test]
    fn test_southern_western_hemispheres() {
        let sentence = with_checksum("GPRMC,123519,A,3352.128,S,15112.558,W,000.0,000.0,230394,,");
        let record = decoder().decode(sentence.as_bytes(), "d").expect("decodes");
        assert!(record.latitude < 0.0);
        assert!(record.longitude < 0.0);
        assert!((record.latitude + (33.0 + 52.128 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn test_coordinate_round_trip() {
        for &(lat, lon) in &[
            (48.117299, 11.516666),
            (-33.868800, 151.209300),
            (0.000100, -0.000100),
            (89.999900, 179.999900),
        ] {
            let (lat_text, lat_dir) = format_coordinate(lat, true);
            let (lon_text, lon_dir) = format_coordinate(lon, false);
            let lat_back = parse_coordinate(&lat_text, lat_dir).expect("lat parses");
            let lon_back = parse_coordinate(&lon_text, lon_dir).expect("lon parses");
            assert!((lat_back - lat).abs() < 1e-6, "lat {} -> {}", lat, lat_back);
            assert!((lon_back - lon).abs() < 1e-6, "lon {} -> {}", lon, lon_back);
        }
    }

    #[test]
    fn test_timestamp_with_fractional_seconds() {
        let ts = parse_timestamp("230394", "123519.25").expect("parses");
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_timestamp_invalid_inputs() {
        assert!(parse_timestamp("2303", "123519").is_none());
        assert!(parse_timestamp("230394", "1235").is_none());
        assert!(parse_timestamp("320394", "123519").is_none()); // day 32
        assert!(parse_timestamp("231394", "123519").is_none()); // month 13
    }

    /// Appends the XOR checksum, mirroring what a device emits.
    fn with_checksum(body: &str) -> String {
        let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}", body, checksum)
    }
}
