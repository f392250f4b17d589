//! End-to-end scenarios driven through the management surface and the
//! publish/ack protocol, with an in-memory transport.

use std::time::Duration;

use plexus::{
    AckPolicy, AckReply, ConsumerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy,
    StorageType, StreamConfig,
};
use plexus_broker::test_util::TestState;

fn memory_stream(name: &str, subjects: &[&str]) -> StreamConfig {
    let mut cfg = StreamConfig::new(name);
    cfg.subjects = subjects.iter().map(|s| s.to_string()).collect();
    cfg.storage = StorageType::Memory;
    cfg
}

#[tokio::test]
async fn basic_ack_publish() {
    let t = TestState::new();
    t.add_stream(memory_stream("foo", &["foo"])).await.unwrap();

    for i in 1..=1000u64 {
        let ack = t.publish_expect_ack("foo", "HELLO").await.unwrap();
        assert_eq!(ack.stream, "foo");
        assert_eq!(ack.seq, i);
        assert!(!ack.duplicate);
    }

    let stream = t.lookup_stream("foo").unwrap();
    let state = stream.state().await;
    assert_eq!(state.msgs, 1000);
    assert_eq!(state.first_seq, 1);
    assert_eq!(state.last_seq, 1000);
}

#[tokio::test]
async fn discard_new_limits() {
    let t = TestState::new();
    let mut cfg = memory_stream("LIMITS", &["limits"]);
    cfg.max_msgs = 10;
    cfg.max_bytes = 4096;
    cfg.discard = DiscardPolicy::New;
    t.add_stream(cfg).await.unwrap();

    for _ in 0..10 {
        t.publish_expect_ack("limits", "x").await.unwrap();
    }
    let err = t.publish_expect_ack("limits", "x").await.unwrap_err();
    assert_eq!(err, "-ERR 'maximum messages exceeded'");

    let resp = t.api("mgmt.STREAM.PURGE.LIMITS", "").await;
    assert_eq!(resp["result"]["purged"], 10);

    let big = vec![b'Z'; 8192];
    let err = t.publish_expect_ack("limits", big).await.unwrap_err();
    assert_eq!(err, "-ERR 'maximum bytes exceeded'");
}

#[tokio::test]
async fn workqueue_nak_redelivery() {
    let t = TestState::new();
    let mut cfg = memory_stream("MY_WQ", &["wq"]);
    cfg.retention = RetentionPolicy::WorkQueue;
    t.add_stream(cfg).await.unwrap();

    for _ in 0..10 {
        t.publish_expect_ack("wq", "work").await.unwrap();
    }

    let stream = t.lookup_stream("MY_WQ").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("PBO".into()),
            ack_policy: AckPolicy::Explicit,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    let pull = |n: &'static str| {
        let t = &t;
        async move {
            let inbox = format!("_PULL.{n}");
            let mut rx = t.transport.subscribe(&inbox);
            t.pull_next("MY_WQ", "PBO", &inbox).await;
            let msg = TestState::recv(&mut rx, 1000)
                .await
                .unwrap_or_else(|| panic!("no pull delivery for {n}"));
            t.transport.unsubscribe(&inbox);
            msg
        }
    };

    // Deliveries 1-5: positive acks.
    for i in 1..=5u64 {
        let msg = pull("a").await;
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.stream_seq, i);
        assert_eq!(token.consumer_seq, i);
        t.respond(&msg, b"+ACK").await;
    }

    // Delivery 6: NAK, so the next pull sees stream seq 6 again with a
    // fresh consumer sequence.
    let msg = pull("b").await;
    let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 6);
    assert_eq!(token.consumer_seq, 6);
    t.respond(&msg, b"-NAK").await;

    let msg = pull("c").await;
    let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 6);
    assert_eq!(token.consumer_seq, 7);
    assert_eq!(token.delivery_count, 2);
    t.respond(&msg, b"+ACK").await;

    for (sseq, cseq) in [(7u64, 8u64), (8, 9)] {
        let msg = pull("d").await;
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.stream_seq, sseq);
        assert_eq!(token.consumer_seq, cseq);
        t.respond(&msg, b"+ACK").await;
    }

    // WorkQueue retention removed everything that was acked.
    let state = stream.state().await;
    assert_eq!(state.msgs, 2);
}

#[tokio::test]
async fn dedup_window_decays() {
    let t = TestState::new();
    let mut cfg = memory_stream("DEDUP", &["dd"]);
    cfg.duplicate_window_ms = 100;
    t.add_stream(cfg).await.unwrap();

    for (id, want) in [("AA", 1u64), ("BB", 2), ("CC", 3), ("ZZ", 4)] {
        let ack = t.publish_with_id("dd", id, "m").await.unwrap();
        assert_eq!(ack.seq, want);
        assert!(!ack.duplicate);
    }

    for (id, want) in [("AA", 1u64), ("BB", 2), ("ZZ", 4)] {
        let ack = t.publish_with_id("dd", id, "m").await.unwrap();
        assert_eq!(ack.seq, want, "duplicate must resolve to original seq");
        assert!(ack.duplicate);
    }

    let stream = t.lookup_stream("DEDUP").unwrap();
    assert_eq!(stream.state().await.msgs, 4);

    // Past the window the old ids are forgotten.
    tokio::time::sleep(Duration::from_millis(250)).await;
    for id in ["AAA", "BBB", "CCC", "DDD", "ZZZ"] {
        let ack = t.publish_with_id("dd", id, "m").await.unwrap();
        assert!(!ack.duplicate);
    }
    assert_eq!(stream.dedup_len().await, 5);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(stream.dedup_len().await, 0);
    assert_eq!(stream.state().await.msgs, 9);
}

#[tokio::test]
async fn filtered_push_with_redelivery() {
    let t = TestState::new();
    t.add_stream(memory_stream("FILTERED", &["foo.*"]))
        .await
        .unwrap();

    for _ in 0..50 {
        t.publish_expect_ack("foo.AA", "aa").await.unwrap();
        t.publish_expect_ack("foo.ZZ", "zz").await.unwrap();
    }

    let mut rx = t.transport.subscribe("deliver.AA");
    let stream = t.lookup_stream("FILTERED").unwrap();
    stream
        .add_consumer(ConsumerConfig {
            durable: Some("D".into()),
            deliver_subject: Some("deliver.AA".into()),
            filter_subject: Some("foo.AA".into()),
            deliver_policy: DeliverPolicy::Last,
            ack_policy: AckPolicy::Explicit,
            ack_wait_ms: 100,
            ..ConsumerConfig::default()
        })
        .await
        .unwrap();

    // Deliver-last with the filter starts at the last foo.AA (seq 99).
    let first = TestState::recv(&mut rx, 1000).await.expect("first delivery");
    assert_eq!(first.subject, "foo.AA");
    let token = AckReply::parse(first.reply.as_deref().unwrap()).unwrap();
    assert_eq!(token.stream_seq, 99);
    assert_eq!(token.consumer_seq, 1);
    t.respond(&first, b"+ACK").await;

    // Ten more matching messages; ack only the even stream sequences.
    for _ in 0..10 {
        t.publish_expect_ack("foo.AA", "aa").await.unwrap();
    }
    let mut odd_unacked = 0;
    for _ in 0..10 {
        let msg = TestState::recv(&mut rx, 1000).await.expect("delivery");
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert_eq!(token.delivery_count, 1);
        if token.stream_seq % 2 == 0 {
            t.respond(&msg, b"+ACK").await;
        } else {
            odd_unacked += 1;
        }
    }
    assert!(odd_unacked > 0);

    // Unacked messages come around again with a higher delivery count and
    // strictly increasing consumer sequences.
    let mut redelivered = 0;
    let mut last_cseq = 11;
    while redelivered < odd_unacked {
        let msg = TestState::recv(&mut rx, 2000).await.expect("redelivery");
        let token = AckReply::parse(msg.reply.as_deref().unwrap()).unwrap();
        assert!(token.delivery_count >= 2);
        assert_eq!(token.stream_seq % 2, 1);
        assert!(token.consumer_seq > last_cseq);
        last_cseq = token.consumer_seq;
        t.respond(&msg, b"+ACK").await;
        redelivered += 1;
    }
}

#[tokio::test]
async fn templates_create_and_cap_streams() {
    let t = TestState::new();

    let mut inner = StreamConfig::new("kv");
    inner.subjects = vec!["kv.*".into()];
    inner.storage = StorageType::Memory;
    let body = serde_json::json!({
        "name": "kv",
        "config": inner,
        "max_streams": 4,
    });

    // Name in subject must match the request body.
    let resp = t.api("mgmt.TEMPLATE.CREATE.BOB", body.to_string()).await;
    assert_eq!(resp["error"]["code"], 400);

    let resp = t.api("mgmt.TEMPLATE.CREATE.kv", body.to_string()).await;
    assert!(resp["error"].is_null(), "unexpected: {resp}");

    for n in ["kv.22", "kv.33", "kv.44", "kv.55"] {
        t.publish_expect_ack(n, "v").await.unwrap();
    }
    // Cap reached: the publish fails with no response.
    assert!(t.request("kv.99", "v").await.is_none());

    let resp = t.api("mgmt.TEMPLATE.INFO.kv", "").await;
    let streams = resp["result"]["streams"].as_array().unwrap();
    assert_eq!(streams.len(), 4);
    assert!(streams.iter().any(|s| s == "kv_22"));

    // Template deletion cascades to the derived streams.
    let resp = t.api("mgmt.TEMPLATE.DELETE.kv", "").await;
    assert_eq!(resp["result"]["success"], true);
    let resp = t.api("mgmt.STREAM.INFO.kv_22", "").await;
    assert_eq!(resp["error"]["code"], 404);
}

#[tokio::test]
async fn account_info_reports_usage() {
    let t = TestState::new();
    t.add_stream(memory_stream("A1", &["a1"])).await.unwrap();
    t.publish_expect_ack("a1", "hello").await.unwrap();

    let resp = t.api("mgmt.INFO", "").await;
    let result = &resp["result"];
    assert_eq!(result["streams"], 1);
    assert_eq!(result["memory"], 5);
    assert_eq!(result["limits"]["max_memory"], -1);
}

#[tokio::test]
async fn stream_names_are_paged() {
    let t = TestState::new();
    for i in 0..30 {
        t.add_stream(memory_stream(&format!("S{i:02}"), &[&format!("s.{i}")]))
            .await
            .unwrap();
    }
    let resp = t.api("mgmt.STREAM.NAMES", "").await;
    assert_eq!(resp["result"]["total"], 30);
    assert_eq!(resp["result"]["offset"], 0);
    assert_eq!(resp["result"]["items"].as_array().unwrap().len(), 30);

    let resp = t.api("mgmt.STREAM.NAMES", r#"{"offset": 28}"#).await;
    let items = resp["result"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], "S28");
}
