#![allow(clippy::unwrap_used)]

//! Contract tests for the NMEA 0183 reference decoder.

use gpsgate_rs::plugin::{DecoderPlugin, ProtocolTag};
use gpsgate_rs::plugins::nmea::{format_coordinate, parse_coordinate, parse_timestamp, NmeaDecoder};

const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

fn with_checksum(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${}*{:02X}", body, checksum)
}

#[test]
fn test_plugin_identity() {
    let decoder = NmeaDecoder::new();
    assert_eq!(decoder.name(), "nmea-0183");
    assert_eq!(decoder.protocol(), ProtocolTag::Nmea);
}

#[test]
fn test_reference_rmc_values() {
    // Scenario: the canonical GPRMC sentence
    let record = NmeaDecoder::new().decode(RMC.as_bytes(), "truck-1").unwrap();

    assert_eq!(record.device_id, "truck-1");
    assert!((record.latitude - 48.1173).abs() < 1e-4);
    assert!((record.longitude - 11.5167).abs() < 1e-4);
    assert!((record.speed.unwrap() - 41.4848).abs() < 1e-4);
    assert!((record.heading.unwrap() - 84.4).abs() < 1e-9);
    assert_eq!(
        record.timestamp.unwrap().to_rfc3339(),
        "1994-03-23T12:35:19+00:00"
    );
}

#[test]
fn test_bad_checksum_yields_no_record() {
    // Same sentence, checksum forced to *00
    let bad = RMC.replace("*6A", "*00");
    assert!(NmeaDecoder::new().decode(bad.as_bytes(), "truck-1").is_err());
}

#[test]
fn test_void_status_yields_no_record() {
    let void = with_checksum("GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
    assert!(NmeaDecoder::new().decode(void.as_bytes(), "truck-1").is_err());
}

#[test]
fn test_reference_gga_values() {
    // Scenario: the canonical GPGGA sentence
    let record = NmeaDecoder::new().decode(GGA.as_bytes(), "dev").unwrap();

    assert!((record.altitude.unwrap() - 545.4).abs() < 1e-9);
    assert_eq!(record.satellite_count, Some(8));
    assert!((record.hdop.unwrap() - 0.9).abs() < 1e-9);
    assert!(record.timestamp.is_none(), "GGA alone carries no date");
}

#[test]
fn test_rmc_then_gga_merge() {
    // GGA follows RMC for the same fix: position agrees, GGA adds
    // altitude/satellites/hdop, RMC's full timestamp survives
    let buffer = format!("{}\r\n{}\r\n", RMC, GGA);
    let record = NmeaDecoder::new().decode(buffer.as_bytes(), "dev").unwrap();

    assert!((record.latitude - 48.1173).abs() < 1e-4);
    assert!(record.timestamp.is_some());
    assert_eq!(record.satellite_count, Some(8));
    assert!((record.altitude.unwrap() - 545.4).abs() < 1e-9);
    assert!((record.speed.unwrap() - 41.4848).abs() < 1e-4);
}

#[test]
fn test_disagreeing_sentences_later_wins() {
    let second = with_checksum("GPGGA,123520,4808.000,N,01132.000,E,1,09,1.1,550.0,M,46.9,M,,");
    let buffer = format!("{}\r\n{}", RMC, second);
    let record = NmeaDecoder::new().decode(buffer.as_bytes(), "dev").unwrap();

    let expected_lat = 48.0 + 8.0 / 60.0;
    assert!((record.latitude - expected_lat).abs() < 1e-9);
    assert_eq!(record.satellite_count, Some(9));
}

#[test]
fn test_round_trip_law() {
    // decode(encode(lat, lon)) == (lat, lon) to 1e-6
    let cases = [
        (48.117300, 11.516667),
        (-33.868800, 151.209300),
        (89.999000, -179.999000),
        (0.000100, 0.000100),
    ];
    for (lat, lon) in cases {
        let (lat_text, lat_dir) = format_coordinate(lat, true);
        let (lon_text, lon_dir) = format_coordinate(lon, false);

        let body = format!(
            "GPRMC,120000,A,{},{},{},{},000.0,000.0,010124,,",
            lat_text, lat_dir, lon_text, lon_dir
        );
        let sentence = with_checksum(&body);
        let record = NmeaDecoder::new().decode(sentence.as_bytes(), "dev").unwrap();

        assert!((record.latitude - lat).abs() < 1e-6, "lat {}", lat);
        assert!((record.longitude - lon).abs() < 1e-6, "lon {}", lon);
    }
}

#[test]
fn test_coordinate_idempotence() {
    let (text, dir) = format_coordinate(48.117299, true);
    let decoded = parse_coordinate(&text, dir).unwrap();
    let (text2, dir2) = format_coordinate(decoded, true);
    assert_eq!(text, text2);
    assert_eq!(dir, dir2);
}

#[test]
fn test_timestamp_reconstruction_millisecond_tolerance() {
    let ts = parse_timestamp("230394", "123519.500").unwrap();
    let expected = chrono::DateTime::parse_from_rfc3339("1994-03-23T12:35:19.500Z").unwrap();
    let delta = (ts.timestamp_millis() - expected.timestamp_millis()).abs();
    assert!(delta <= 1, "within 1ms");
}

#[test]
fn test_capability_predicate() {
    let decoder = NmeaDecoder::new();
    assert!(decoder.can_decode(RMC.as_bytes()));
    assert!(!decoder.can_decode(b"\x02\x42binary"));
    assert!(!decoder.can_decode(b"plain text without dollar"));
}

#[test]
fn test_mixed_buffer_only_valid_sentences_contribute() {
    let bad = RMC.replace("*6A", "*FF");
    let buffer = format!("{}\r\n{}\r\n", bad, GGA);
    let record = NmeaDecoder::new().decode(buffer.as_bytes(), "dev").unwrap();

    // Only GGA survived: no timestamp, no speed, but altitude present
    assert!(record.timestamp.is_none());
    assert!(record.speed.is_none());
    assert!(record.altitude.is_some());
}
