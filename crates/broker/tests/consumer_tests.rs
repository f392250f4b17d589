//! Consumer delivery, ack protocol and lifecycle behavior.

use std::time::Duration;

use bytes::Bytes;

use plexus_broker::config::{
    AckPolicy, ConsumerConfig, DeliverPolicy, ReplayPolicy, StorageType, StreamConfig,
};
use plexus_broker::consumer::AckReply;
use plexus_broker::test_util::{TestState, TEST_ACCOUNT};
use plexus_storage::HeaderMap;

fn memory_stream(name: &str, subjects: &[&str]) -> StreamConfig {
    let mut cfg = StreamConfig::new(name);
    cfg.subjects = subjects.iter().map(|s| s.to_string()).collect();
    cfg.storage = StorageType::Memory;
    cfg
}

async fn ingest_n(t: &TestState, stream: &str, subject: &str, n: usize) {
    let s = t.lookup_stream(stream).unwrap();
    for i in 0..n {
        s.ingest(subject, HeaderMap::new(), Bytes::from(format!("m{i}")))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn push_delivers_in_order_with_tokens() {
    let t = TestState::new();
    t.add_stream(memory_stream("P", &["p"])).await.unwrap();
    ingest_n(&t, "P", "p", 5).await;

    let mut rx = t.transport.subscribe("deliver.p");
    let stream = t.lookup_stream("P").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.p".into()),
            ack_policy: AckPolicy::Explicit,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    for want in 1..=5u64 {
        let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
        assert_eq!(msg.subject, "p");
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.stream_seq, want);
        assert_eq!(token.consumer_seq, want);
        assert_eq!(token.delivery_count, 1);
        assert_eq!(token.pending, 5 - want);
        t.respond(&msg, b"+ACK").await;
    }

    // Late publishes flow straight through.
    ingest_n(&t, "P", "p", 1).await;
    let msg = TestState::recv(&mut rx, 1000).await.expect("live delivery");
    let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 6);
}

#[tokio::test]
async fn explicit_ack_advances_floor_over_contiguous_prefix() {
    let t = TestState::new();
    t.add_stream(memory_stream("F", &["f"])).await.unwrap();
    ingest_n(&t, "F", "f", 4).await;

    let mut rx = t.transport.subscribe("deliver.f");
    let stream = t.lookup_stream("F").unwrap();
    let consumer = stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.f".into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 60_000,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let mut deliveries = Vec::new();
    for _ in 0..4 {
        deliveries.push(TestState::recv(&mut rx, 1000).await.expect("delivery"));
    }

    // Ack 2 first: floor stays below the unacked 1.
    t.respond(&deliveries[1], b"+ACK").await;
    let info = consumer.info().await;
    assert_eq!(info.ack_floor.stream_seq, 0);
    assert_eq!(info.num_ack_pending, 3);

    // Acking 1 lifts the floor over both.
    t.respond(&deliveries[0], b"+ACK").await;
    let info = consumer.info().await;
    assert_eq!(info.ack_floor.stream_seq, 2);
    assert_eq!(info.num_ack_pending, 2);
}

#[tokio::test]
async fn ack_all_acks_everything_below() {
    let t = TestState::new();
    t.add_stream(memory_stream("AA", &["aa"])).await.unwrap();
    ingest_n(&t, "AA", "aa", 6).await;

    let mut rx = t.transport.subscribe("deliver.aa");
    let stream = t.lookup_stream("AA").unwrap();
    let consumer = stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.aa".into()),
            ack_policy: AckPolicy::All,
            ack_wait_ms: 60_000,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let mut fifth = None;
    for i in 0..6 {
        let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
        if i == 4 {
            fifth = Some(msg);
        }
    }

    t.respond(fifth.as_ref().unwrap(), b"+ACK").await;
    let info = consumer.info().await;
    assert_eq!(info.ack_floor.stream_seq, 5);
    assert_eq!(info.ack_floor.consumer_seq, 5);
    assert_eq!(info.num_ack_pending, 1);
}

#[tokio::test]
async fn wpi_postpones_redelivery() {
    let t = TestState::new();
    t.add_stream(memory_stream("W", &["w"])).await.unwrap();
    ingest_n(&t, "W", "w", 1).await;

    let mut rx = t.transport.subscribe("deliver.w");
    let stream = t.lookup_stream("W").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.w".into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 200,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");

    // Keep sending progress; no redelivery while we do.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(120)).await;
        t.respond(&msg, b"+WPI").await;
    }
    TestState::expect_no_message(&mut rx, 120).await;

    // Stop working on it: the ack wait runs out and it comes back.
    let redelivered = TestState::recv(&mut rx, 1000).await.expect("redelivery");
    let token = AckReply::parse(redelivered.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 1);
    assert!(token.delivery_count >= 2);
}

#[tokio::test]
async fn term_removes_message_and_emits_advisory() {
    let t = TestState::new();
    t.add_stream(memory_stream("T", &["t"])).await.unwrap();
    ingest_n(&t, "T", "t", 2).await;

    let mut advisories = t.transport.subscribe("$PLX.EVENT.TERMINATED.>");
    let mut rx = t.transport.subscribe("deliver.t");
    let stream = t.lookup_stream("T").unwrap();
    let consumer = stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.t".into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 150,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let first = TestState::recv(&mut rx, 1000).await.expect("delivery 1");
    let _second = TestState::recv(&mut rx, 1000).await.expect("delivery 2");
    t.respond(&first, b"+TERM").await;

    let adv = TestState::recv(&mut advisories, 1000).await.expect("advisory");
    let body: serde_json::Value = serde_json::from_slice(&adv.payload).unwrap();
    assert_eq!(body["stream"], "T");
    assert_eq!(body["consumer"], "D");
    assert_eq!(body["stream_seq"], 1);
    assert_eq!(body["deliveries"], 1);

    // Terminated messages never come back; the unacked one does.
    let redelivered = TestState::recv(&mut rx, 1000).await.expect("redelivery");
    let token = AckReply::parse(redelivered.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 2);
    t.respond(&redelivered, b"+ACK").await;
    TestState::expect_no_message(&mut rx, 300).await;

    let info = consumer.info().await;
    assert_eq!(info.num_ack_pending, 0);
}

#[tokio::test]
async fn max_deliver_caps_attempts() {
    let t = TestState::new();
    t.add_stream(memory_stream("MD", &["md"])).await.unwrap();
    ingest_n(&t, "MD", "md", 1).await;

    let mut rx = t.transport.subscribe("deliver.md");
    let stream = t.lookup_stream("MD").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.md".into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 100,
            max_deliver: 2,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let mut seen = 0;
    while TestState::recv(&mut rx, 400).await.is_some() {
        seen += 1;
    }
    assert_eq!(seen, 2, "no more than max_deliver attempts");
}

#[tokio::test]
async fn nak_redelivers_immediately() {
    let t = TestState::new();
    t.add_stream(memory_stream("NK", &["nk"])).await.unwrap();
    ingest_n(&t, "NK", "nk", 1).await;

    let mut rx = t.transport.subscribe("deliver.nk");
    let stream = t.lookup_stream("NK").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.nk".into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 60_000,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
    t.respond(&msg, b"-NAK").await;

    // Redelivery does not wait for the ack timer.
    let again = TestState::recv(&mut rx, 500).await.expect("nak redelivery");
    let token = AckReply::parse(again.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 1);
    assert_eq!(token.delivery_count, 2);
}

#[tokio::test]
async fn pull_batch_serves_waiter() {
    let t = TestState::new();
    t.add_stream(memory_stream("PB", &["pb"])).await.unwrap();
    ingest_n(&t, "PB", "pb", 5).await;

    let stream = t.lookup_stream("PB").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            ack_policy: AckPolicy::Explicit,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let inbox = "_PULL.batch";
    let mut rx = t.transport.subscribe(inbox);
    t.server
        .process_publish(
            TEST_ACCOUNT,
            "mgmt.CONSUMER.MSG.NEXT.PB.D",
            HeaderMap::new(),
            Bytes::from_static(b"3"),
            Some(inbox),
        )
        .await;

    for want in 1..=3u64 {
        let msg = TestState::recv(&mut rx, 1000).await.expect("batch delivery");
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.stream_seq, want);
        t.respond(&msg, b"+ACK").await;
    }
    // Batch exhausted: nothing more until the next pull.
    TestState::expect_no_message(&mut rx, 200).await;
}

#[tokio::test]
async fn nxt_acks_and_pulls_in_one_round_trip() {
    let t = TestState::new();
    t.add_stream(memory_stream("NX", &["nx"])).await.unwrap();
    ingest_n(&t, "NX", "nx", 3).await;

    let stream = t.lookup_stream("NX").unwrap();
    let consumer = stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            ack_policy: AckPolicy::Explicit,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let inbox = "_PULL.nxt";
    let mut rx = t.transport.subscribe(inbox);
    t.pull_next("NX", "D", inbox).await;

    for want in 1..=3u64 {
        let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.stream_seq, want);
        // Ack-and-request-next keeps the loop going on one inbox.
        let reply = msg.reply.clone().unwrap();
        t.server
            .process_publish(
                TEST_ACCOUNT,
                &reply,
                HeaderMap::new(),
                Bytes::from_static(b"+NXT"),
                Some(inbox),
            )
            .await;
    }

    let info = consumer.info().await;
    assert_eq!(info.ack_floor.stream_seq, 3);
    assert_eq!(info.num_pending, 0);
}

#[tokio::test]
async fn ack_probe_gets_confirmation() {
    let t = TestState::new();
    t.add_stream(memory_stream("PRB", &["prb"])).await.unwrap();
    ingest_n(&t, "PRB", "prb", 1).await;

    let mut rx = t.transport.subscribe("deliver.prb");
    let stream = t.lookup_stream("PRB").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.prb".into()),
            ack_policy: AckPolicy::Explicit,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
    let probe_inbox = "_INBOX.ackprobe";
    let mut probe_rx = t.transport.subscribe(probe_inbox);
    let reply = msg.reply.clone().unwrap();
    t.server
        .process_publish(
            TEST_ACCOUNT,
            &reply,
            HeaderMap::new(),
            Bytes::from_static(b"+ACK"),
            Some(probe_inbox),
        )
        .await;
    let ok = TestState::recv(&mut probe_rx, 1000).await.expect("probe reply");
    assert_eq!(ok.payload.as_ref(), b"+OK");
}

#[tokio::test]
async fn replay_original_respects_stored_gaps() {
    let t = TestState::new();
    t.add_stream(memory_stream("RP", &["rp"])).await.unwrap();

    let stream = t.lookup_stream("RP").unwrap();
    stream
        .ingest("rp", HeaderMap::new(), Bytes::from_static(b"a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    stream
        .ingest("rp", HeaderMap::new(), Bytes::from_static(b"b"))
        .await
        .unwrap();

    let mut rx = t.transport.subscribe("deliver.rp");
    let started = std::time::Instant::now();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.rp".into()),
            ack_policy: AckPolicy::None,
            replay_policy: ReplayPolicy::Original,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let _a = TestState::recv(&mut rx, 1000).await.expect("first");
    let _b = TestState::recv(&mut rx, 1000).await.expect("second");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(200),
        "second delivery must honor the stored gap, got {elapsed:?}"
    );
}

#[tokio::test]
async fn deliver_by_start_sequence() {
    let t = TestState::new();
    t.add_stream(memory_stream("BS", &["bs"])).await.unwrap();
    ingest_n(&t, "BS", "bs", 10).await;

    let mut rx = t.transport.subscribe("deliver.bs");
    let stream = t.lookup_stream("BS").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.bs".into()),
            deliver_policy: DeliverPolicy::ByStartSequence,
            opt_start_seq: Some(7),
            ack_policy: AckPolicy::None,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
    let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 7);
}

#[tokio::test]
async fn ephemeral_is_removed_after_interest_loss() {
    let t = TestState::new();
    t.add_stream(memory_stream("EP", &["ep"])).await.unwrap();
    ingest_n(&t, "EP", "ep", 1).await;

    let mut rx = t.transport.subscribe("deliver.ep");
    let stream = t.lookup_stream("EP").unwrap();
    let consumer = stream
        .add_consumer(ConsumerConfig {
            deliver_subject: Some("deliver.ep".into()),
            ack_policy: AckPolicy::None,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();
    let name = consumer.name().to_string();
    assert_eq!(name.len(), 6, "ephemeral names are random tokens");

    let _ = TestState::recv(&mut rx, 1000).await.expect("delivery");

    t.transport.unsubscribe("deliver.ep");
    t.server.interest_lost(TEST_ACCOUNT, "deliver.ep").await;

    // Past the inactivity threshold the consumer cleans itself up.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(stream.get_consumer(&name).is_none());
    assert_eq!(stream.state().await.consumer_count, 0);
}
