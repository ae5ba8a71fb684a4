//! Encode/decode throughput for the MQTT 5 wire codec.
//!
//! Run with: cargo run --release --bin codec_bench
//! (declared as a `[[bench]]` with `harness = false`, so it's a plain
//! binary rather than a `#[bench]`-based benchmark.)

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use mqtt5::packet::{Connect, Packet, Publish, QoS, Subscribe, SubscribeOptions};
use mqtt5::properties::Properties;
use mqtt5::varint;

const ITERATIONS: u32 = 100_000;

fn bench<F: FnMut()>(name: &str, mut f: F) {
    for _ in 0..1000 {
        f();
    }

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    let elapsed = start.elapsed();

    let per_op = elapsed / ITERATIONS;
    let ops_per_sec = if per_op.as_nanos() > 0 { 1_000_000_000 / per_op.as_nanos() } else { 0 };

    println!("{:40} {:>10.2?} per op, {:>12} ops/sec", name, per_op, format_number(ops_per_sec as u64));
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        format!("{n}")
    }
}

fn bench_variable_int() {
    println!("\n=== Variable Byte Integer ===");

    for value in [127u32, 16_383, 2_097_151, 268_435_455] {
        bench(&format!("encode {value}"), || {
            let mut buf = BytesMut::new();
            let _ = varint::write(&mut buf, value);
        });
    }

    for value in [127u32, 16_383, 2_097_151, 268_435_455] {
        let mut encoded = BytesMut::new();
        varint::write(&mut encoded, value).unwrap();
        let bytes = encoded.freeze();
        bench(&format!("decode {value}"), || {
            let mut cursor = &bytes[..];
            let _ = varint::read(&mut cursor);
        });
    }
}

fn bench_publish_packet() {
    println!("\n=== PUBLISH packet ===");

    for (label, size) in [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)] {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "bench/topic".to_string(),
            packet_id: None,
            properties: Properties::new(),
            payload: Bytes::from(vec![0u8; size]),
        });

        bench(&format!("encode {label} payload"), || {
            let mut out = BytesMut::new();
            let _ = packet.encode(&mut out);
        });

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let frozen = buf.freeze();

        bench(&format!("decode {label} payload"), || {
            let _ = Packet::decode(packet.packet_type(), 0, frozen.clone());
        });
    }
}

fn bench_connect_packet() {
    println!("\n=== CONNECT packet ===");

    let packet = Packet::Connect(Connect {
        clean_start: true,
        keep_alive: 60,
        client_id: "benchmark-client-12345".to_string(),
        will: None,
        user_name: Some("user".to_string()),
        password: Some(Bytes::from_static(b"password")),
        properties: Properties::new(),
    });

    bench("encode CONNECT", || {
        let mut out = BytesMut::new();
        let _ = packet.encode(&mut out);
    });

    let mut buf = BytesMut::new();
    packet.encode(&mut buf).unwrap();
    let frozen = buf.freeze();

    bench("decode CONNECT", || {
        let _ = Packet::decode(packet.packet_type(), 0, frozen.clone());
    });
}

fn bench_subscribe_packet() {
    println!("\n=== SUBSCRIBE packet (5 filters) ===");

    let filters = ["topic/1", "topic/2", "topic/3", "topic/+/wildcard", "topic/#"]
        .into_iter()
        .map(|f| (f.to_string(), SubscribeOptions::default()))
        .collect();
    let packet = Packet::Subscribe(Subscribe { packet_id: 1, properties: Properties::new(), filters });

    bench("encode SUBSCRIBE", || {
        let mut out = BytesMut::new();
        let _ = packet.encode(&mut out);
    });

    let mut buf = BytesMut::new();
    packet.encode(&mut buf).unwrap();
    let frozen = buf.freeze();

    bench("decode SUBSCRIBE", || {
        let _ = Packet::decode(packet.packet_type(), 0, frozen.clone());
    });
}

fn main() {
    println!("mqtt5 codec benchmark");
    println!("======================");
    println!("iterations per case: {ITERATIONS}");

    bench_variable_int();
    bench_publish_packet();
    bench_connect_packet();
    bench_subscribe_packet();

    println!("\ndone");
}
