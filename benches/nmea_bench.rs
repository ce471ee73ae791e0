use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gpsgate_rs::plugin::DecoderPlugin;
use gpsgate_rs::plugins::nmea::{parse_coordinate, NmeaDecoder};

const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

fn benchmark_decode(c: &mut Criterion) {
    let decoder = NmeaDecoder::new();

    c.bench_function("decode_single_rmc", |b| {
        b.iter(|| black_box(decoder.decode(black_box(RMC.as_bytes()), "bench-device")))
    });

    let multi = format!("{}\r\n{}\r\n", RMC, GGA);
    c.bench_function("decode_rmc_gga_pair", |b| {
        b.iter(|| black_box(decoder.decode(black_box(multi.as_bytes()), "bench-device")))
    });
}

fn benchmark_capability_predicate(c: &mut Criterion) {
    let decoder = NmeaDecoder::new();
    let binary = [0xFDu8, 0x09, 0x00, 0x01, 0x02, 0x03];

    c.bench_function("can_decode_hit", |b| {
        b.iter(|| black_box(decoder.can_decode(black_box(RMC.as_bytes()))))
    });

    c.bench_function("can_decode_miss", |b| {
        b.iter(|| black_box(decoder.can_decode(black_box(&binary))))
    });
}

fn benchmark_coordinate_parse(c: &mut Criterion) {
    c.bench_function("parse_coordinate", |b| {
        b.iter(|| black_box(parse_coordinate(black_box("4807.038"), black_box("N"))))
    });
}

criterion_group!(
    benches,
    benchmark_decode,
    benchmark_capability_predicate,
    benchmark_coordinate_parse
);
criterion_main!(benches);
