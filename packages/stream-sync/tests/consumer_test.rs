//! Consumer loop against the in-memory broker and store: dispatch, produced
//! messages and the acknowledgment discipline.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use stream_sync::config::{CLIENT_IN_STREAM, CLIENT_OUT_STREAM, CONSUMER_GROUP, UPDATER_IN_STREAM, UPDATER_OUT_STREAM};
use stream_sync::{decode, BrokerError, DocumentStore, MessageType, SyncError};

#[tokio::test]
async fn group_creation_is_idempotent() {
    let h = harness();
    let consumer = h.consumer();

    consumer.ensure_groups().await;
    consumer.ensure_groups().await;

    assert_eq!(h.broker.group_count(), 2);
    assert!(h.broker.has_group(CLIENT_OUT_STREAM, CONSUMER_GROUP));
    assert!(h.broker.has_group(UPDATER_OUT_STREAM, CONSUMER_GROUP));
    assert!(h.broker.has_stream(CLIENT_OUT_STREAM));
}

#[tokio::test]
async fn fetched_data_is_stored_and_acknowledged() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[
            ("type", "DATA_FETCHED"),
            ("request_id", "req-1"),
            ("symbol", "AAPL"),
            ("price", "150"),
        ]),
    );

    let batch = consumer.poll().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let stored = h.store.documents(&h.ns);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["symbol"], json!("AAPL"));
    assert_eq!(stored[0]["price"], json!(150));

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 1);
    let response = decode(&responses[0]).unwrap();
    assert_eq!(response.message_type, MessageType::DataStored);
    assert_eq!(response.request_id, "req-1");
    assert!(response.payload.is_empty());

    assert!(h.broker.pending(UPDATER_OUT_STREAM, CONSUMER_GROUP).is_empty());
}

#[tokio::test]
async fn failed_write_still_reports_and_acknowledges() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;
    h.store.set_failing(true);

    h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[("type", "DATA_FETCHED"), ("request_id", "req-2"), ("symbol", "MSFT")]),
    );

    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 1);
    let response = decode(&responses[0]).unwrap();
    assert_eq!(response.message_type, MessageType::DataStored);
    assert_eq!(response.request_id, "req-2");
    assert!(response.payload.contains_key("error"));
}

#[tokio::test]
async fn stored_data_answers_read_and_acknowledges() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    h.store
        .insert(&h.ns, doc(json!({"params": {"symbol": "AAPL"}, "price": 200, "day": "2024-01-03"})))
        .await
        .unwrap();
    h.store
        .insert(&h.ns, doc(json!({"params": {"symbol": "AAPL"}, "price": 150, "day": "2024-01-02"})))
        .await
        .unwrap();

    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-3"),
            ("symbol", "AAPL"),
            ("sortkey", "day"),
        ]),
    );

    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 1);
    let response = decode(&responses[0]).unwrap();
    assert_eq!(response.message_type, MessageType::DataRead);
    assert_eq!(response.request_id, "req-3");
    assert_eq!(response.payload["day"], json!("2024-01-02"));
    assert_eq!(response.payload["price"], json!(150));
    assert!(!response.payload.contains_key("id"));

    assert!(h.broker.entries(UPDATER_IN_STREAM).is_empty());
    assert!(h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP).is_empty());
}

#[tokio::test]
async fn fetched_data_answers_the_matching_read() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[
            ("type", "DATA_FETCHED"),
            ("request_id", "req-20"),
            ("params", r#"{"symbol": "AAPL", "interval": "1d"}"#),
            ("data", r#"[[1, "a"]]"#),
            ("ts", "1"),
        ]),
    );
    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-21"),
            ("symbol", "AAPL"),
            ("interval", "1d"),
            ("sortkey", "ts"),
        ]),
    );
    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 2);
    let response = decode(&responses[1]).unwrap();
    assert_eq!(response.message_type, MessageType::DataRead);
    assert_eq!(response.request_id, "req-21");
    assert_eq!(response.payload["data"], json!([[1, "a"]]));
    assert_eq!(response.payload["params"], json!({"symbol": "AAPL", "interval": "1d"}));

    assert!(h.broker.entries(UPDATER_IN_STREAM).is_empty());
    assert!(h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP).is_empty());
}

#[tokio::test]
async fn business_id_field_is_stored_and_read_back() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    for (request_id, day) in [("req-22", "2024-01-02"), ("req-23", "2024-01-03")] {
        h.broker.publish(
            UPDATER_OUT_STREAM,
            message(&[
                ("type", "DATA_FETCHED"),
                ("request_id", request_id),
                ("id", "bar-42"),
                ("params", r#"{"symbol": "AAPL"}"#),
                ("day", day),
            ]),
        );
    }
    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 2);

    let stored = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(stored.len(), 2);
    for response in &stored {
        assert!(!decode(response).unwrap().payload.contains_key("error"));
    }
    assert_eq!(h.store.record_count(&h.ns), 2);

    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-24"),
            ("symbol", "AAPL"),
            ("sortkey", "day"),
        ]),
    );
    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let response = decode(&h.broker.entries(CLIENT_IN_STREAM)[2]).unwrap();
    assert_eq!(response.message_type, MessageType::DataRead);
    assert_eq!(response.payload["id"], json!("bar-42"));
    assert_eq!(response.payload["day"], json!("2024-01-02"));
}

#[tokio::test]
async fn read_miss_forwards_fetch_request_without_ack() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    let id = h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-4"),
            ("symbol", "TSLA"),
            ("sortkey", "day"),
        ]),
    );

    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 0);

    assert!(h.broker.entries(CLIENT_IN_STREAM).is_empty());
    let forwarded = h.broker.entries(UPDATER_IN_STREAM);
    assert_eq!(forwarded.len(), 1);
    let request = decode(&forwarded[0]).unwrap();
    assert_eq!(request.message_type, MessageType::FetchRequest);
    assert_eq!(request.request_id, "req-4");
    assert_eq!(request.payload["symbol"], json!("TSLA"));
    assert_eq!(request.payload["sortkey"], json!("day"));

    assert_eq!(h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP), vec![id]);
}

#[tokio::test]
async fn forwarded_fetch_request_keeps_field_names_and_order() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-25"),
            ("symbol", "AMD"),
            ("sortKey", "day"),
        ]),
    );
    let batch = consumer.poll().await.unwrap();
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 0);

    let forwarded = h.broker.entries(UPDATER_IN_STREAM);
    assert_eq!(forwarded.len(), 1);
    let names: Vec<&str> = forwarded[0].fields().iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["symbol", "sortKey", "type", "request_id"]);
    assert_eq!(text(&forwarded[0], "sortKey").as_deref(), Some("day"));
}

#[tokio::test]
async fn unacknowledged_request_is_replayed_after_restart() {
    let h = harness();
    let mut first = h.consumer();
    first.ensure_groups().await;

    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[
            ("type", "DATA_REQUESTED"),
            ("request_id", "req-5"),
            ("symbol", "NVDA"),
            ("sortkey", "day"),
        ]),
    );
    let batch = first.poll().await.unwrap();
    first.process_batch(&batch).await.unwrap();
    assert_eq!(h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP).len(), 1);

    // The updater has since filled the store.
    h.store
        .insert(&h.ns, doc(json!({"params": {"symbol": "NVDA"}, "day": "2024-01-02", "close": 48.1})))
        .await
        .unwrap();

    let mut restarted = h.consumer();
    restarted.ensure_groups().await;
    let replay = restarted.poll().await.unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(restarted.process_batch(&replay).await.unwrap(), 1);

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 1);
    assert_eq!(decode(&responses[0]).unwrap().message_type, MessageType::DataRead);
    assert!(h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP).is_empty());

    // Backlog drained; the next poll only waits for new entries.
    assert!(restarted.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_entries_are_dropped_without_stopping_the_batch() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    let no_type = h
        .broker
        .publish(CLIENT_OUT_STREAM, message(&[("request_id", "req-6"), ("symbol", "AAPL")]));
    let unknown = h
        .broker
        .publish(CLIENT_OUT_STREAM, message(&[("type", "PING"), ("request_id", "req-7")]));
    let no_sort_key = h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[("type", "DATA_REQUESTED"), ("request_id", "req-8"), ("symbol", "AAPL")]),
    );
    h.broker.publish(
        CLIENT_OUT_STREAM,
        message(&[("type", "DATA_FETCHED"), ("request_id", "req-9"), ("symbol", "AAPL")]),
    );

    let batch = consumer.poll().await.unwrap();
    assert_eq!(batch.len(), 4);
    assert_eq!(consumer.process_batch(&batch).await.unwrap(), 1);

    let responses = h.broker.entries(CLIENT_IN_STREAM);
    assert_eq!(responses.len(), 1);
    assert_eq!(decode(&responses[0]).unwrap().request_id, "req-9");
    assert!(h.broker.entries(UPDATER_IN_STREAM).is_empty());
    assert_eq!(
        h.broker.pending(CLIENT_OUT_STREAM, CONSUMER_GROUP),
        vec![no_type, unknown, no_sort_key]
    );
}

#[tokio::test]
async fn batch_is_handled_in_poll_order() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    let ids: Vec<String> = (0..5)
        .map(|i| {
            h.broker.publish(
                UPDATER_OUT_STREAM,
                message(&[
                    ("type", "DATA_FETCHED"),
                    ("request_id", &format!("req-{}", i)),
                    ("seq", &i.to_string()),
                ]),
            )
        })
        .collect();

    let batch = consumer.poll().await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), ids);
    consumer.process_batch(&batch).await.unwrap();

    let order: Vec<String> = h
        .broker
        .entries(CLIENT_IN_STREAM)
        .iter()
        .filter_map(|m| text(m, "request_id"))
        .collect();
    assert_eq!(order, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);

    let stored: Vec<_> = h.store.documents(&h.ns).iter().map(|d| d["seq"].clone()).collect();
    assert_eq!(stored, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn batch_size_caps_each_poll() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    for i in 0..15 {
        h.broker.publish(
            UPDATER_OUT_STREAM,
            message(&[("type", "DATA_FETCHED"), ("request_id", &format!("req-{}", i))]),
        );
    }

    assert_eq!(consumer.poll().await.unwrap().len(), 10);
    assert_eq!(consumer.poll().await.unwrap().len(), 5);
}

#[tokio::test]
async fn append_failure_stops_processing_and_leaves_entry_pending() {
    let h = harness();
    let mut consumer = h.consumer();
    consumer.ensure_groups().await;

    let id = h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[("type", "DATA_FETCHED"), ("request_id", "req-10")]),
    );
    h.broker.fail_appends(true);

    let batch = consumer.poll().await.unwrap();
    let err = consumer.process_batch(&batch).await.unwrap_err();
    assert!(matches!(err, BrokerError::Command(_)));
    assert_eq!(h.broker.pending(UPDATER_OUT_STREAM, CONSUMER_GROUP), vec![id]);
}

#[tokio::test]
async fn run_finishes_work_then_stops_on_shutdown() {
    let h = harness();
    let consumer = h.consumer();

    h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[("type", "DATA_FETCHED"), ("request_id", "req-11")]),
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(consumer.run(async {
        let _ = stop_rx.await;
    }));

    let mut waited = Duration::ZERO;
    while h.broker.entries(CLIENT_IN_STREAM).is_empty() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(h.broker.entries(CLIENT_IN_STREAM).len(), 1);

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("consumer did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(h.broker.pending(UPDATER_OUT_STREAM, CONSUMER_GROUP).is_empty());
}

#[tokio::test]
async fn run_surfaces_broker_errors() {
    let h = harness();
    let consumer = h.consumer();
    h.broker.fail_appends(true);

    h.broker.publish(
        UPDATER_OUT_STREAM,
        message(&[("type", "DATA_FETCHED"), ("request_id", "req-12")]),
    );

    let result = tokio::time::timeout(Duration::from_secs(2), consumer.run(std::future::pending()))
        .await
        .expect("consumer should fail fast");
    assert!(matches!(result, Err(SyncError::Broker(BrokerError::Command(_)))));
}
