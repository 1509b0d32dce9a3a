//! Benchmarks for building sink payloads from an observation.
//!
//! Isolates record snapshotting and payload formatting from network I/O.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ruuvitag_fanout::sink::influxdb::data_point;
use ruuvitag_fanout::sink::mqtt::topic;
use ruuvitag_fanout::{MacAddress, Observation, WriteMeta, decode_ruuvi_data};
use std::time::SystemTime;

const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Example V5 payload (RuuviTag standard format)
fn v5_payload() -> Vec<u8> {
    vec![
        0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC, 0x36,
        0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
    ]
}

/// Example V6 payload (Ruuvi Air Quality Sensor)
fn v6_payload() -> Vec<u8> {
    vec![
        0x06, 0x17, 0x0C, 0x56, 0x68, 0xC7, 0x9E, 0x00, 0x70, 0x00, 0xC9, 0x05, 0x01, 0xD9, 0xFF,
        0xCD, 0x00, 0x4C, 0x88, 0x4F,
    ]
}

fn observation(payload: &[u8]) -> Observation {
    let measurement = decode_ruuvi_data(TEST_MAC, payload).expect("valid payload");
    Observation::new(&measurement)
}

fn bench_payloads(c: &mut Criterion) {
    let meta = WriteMeta {
        movement_detected: false,
        written_at: SystemTime::UNIX_EPOCH,
    };

    for (name, payload) in [("v5", v5_payload()), ("v6", v6_payload())] {
        let mut group = c.benchmark_group(format!("payloads_{name}"));
        group.throughput(Throughput::Elements(1));
        let observation = observation(&payload);
        let record = observation.as_record();

        group.bench_function("as_record", |b| {
            b.iter(|| black_box(observation.as_record()))
        });

        group.bench_function("line_protocol", |b| {
            b.iter(|| {
                let point = data_point(black_box("device"), black_box(&record), &meta);
                black_box(point.to_string())
            })
        });

        group.bench_function("json", |b| {
            b.iter(|| {
                let topic = topic("ruuvitag", &record.address);
                let payload = serde_json::to_vec(black_box(&record)).expect("serializable");
                black_box((topic, payload))
            })
        });

        group.finish();
    }
}

criterion_group!(benches, bench_payloads);
criterion_main!(benches);
