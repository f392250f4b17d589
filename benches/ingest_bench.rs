//! End-to-end throughput harness: publish a batch of messages into a
//! stream and drain them through a push consumer.
//!
//! Run with `cargo bench --bench ingest_bench -- --messages 100000`.

use std::time::Instant;

use bytes::Bytes;
use clap::Parser;

use plexus::{AckPolicy, ConsumerConfig, StorageType, StreamConfig};
use plexus_broker::test_util::TestState;
use plexus_storage::HeaderMap;

#[derive(Parser, Debug)]
#[command(name = "ingest_bench")]
pub struct Args {
    #[arg(long, default_value = "100000")]
    pub messages: u64,

    #[arg(long, default_value = "128")]
    pub payload_bytes: usize,

    #[arg(long, value_enum, default_value = "memory")]
    pub storage: StorageArg,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum StorageArg {
    Memory,
    File,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // The libtest harness passes --bench through; ignore unknown flags.
    let args = Args::parse_from(std::env::args().filter(|a| a != "--bench"));

    let dir = tempfile::tempdir().expect("temp dir");
    let t = match args.storage {
        StorageArg::Memory => TestState::new(),
        StorageArg::File => TestState::with_root(dir.path()),
    };

    let mut cfg = StreamConfig::new("BENCH");
    cfg.subjects = vec!["bench".into()];
    cfg.storage = match args.storage {
        StorageArg::Memory => StorageType::Memory,
        StorageArg::File => StorageType::File,
    };
    let stream = t.add_stream(cfg).await.expect("stream");

    let payload = Bytes::from(vec![b'x'; args.payload_bytes]);

    let start = Instant::now();
    for _ in 0..args.messages {
        stream
            .ingest("bench", HeaderMap::new(), payload.clone())
            .await
            .expect("ingest");
    }
    let ingest = start.elapsed();
    println!(
        "ingest: {} msgs in {:.2?} ({:.0} msg/s)",
        args.messages,
        ingest,
        args.messages as f64 / ingest.as_secs_f64()
    );

    let mut rx = t.transport.subscribe("bench.deliver");
    let start = Instant::now();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("BENCHER".into()),
            deliver_subject: Some("bench.deliver".into()),
            ack_policy: AckPolicy::None,
            ..ConsumerConfig::default()
        })
        .await
        .expect("consumer");

    let mut received = 0u64;
    while received < args.messages {
        if TestState::recv(&mut rx, 5_000).await.is_none() {
            eprintln!("stalled after {received} deliveries");
            std::process::exit(1);
        }
        received += 1;
    }
    let consume = start.elapsed();
    println!(
        "consume: {} msgs in {:.2?} ({:.0} msg/s)",
        received,
        consume,
        received as f64 / consume.as_secs_f64()
    );
}
