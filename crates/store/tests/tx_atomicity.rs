#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Transaction protocol tests: commit visibility, abort restoration, and
//! crash recovery around the marker write — each participant must come
//! back with either all new values or all old values, never a mixture.

use std::{sync::Arc, time::Duration};

use datakeep_storage::{DataService, MemoryCoordinationMap, MemoryDataService, RequestKind};
use datakeep_store::{RetryPolicy, Store, StoreConfig, StoreError};
use serde_json::json;

fn build_store(data: &MemoryDataService, map: &MemoryCoordinationMap, name: &str) -> Store {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = StoreConfig::builder(name)
        .template(json!({"coins": 0, "inventory": []}))
        .lock_ttl(Duration::from_secs(2))
        .lock_refresh_interval(Duration::from_millis(200))
        .lock_acquire_timeout(Duration::from_secs(2))
        .autosave_interval(Duration::from_secs(300))
        .data_retry(RetryPolicy::new(2, Duration::from_millis(10)).unwrap())
        .map_retry(RetryPolicy::new(2, Duration::from_millis(10)).unwrap())
        .build()
        .unwrap();
    Store::new(config, Arc::new(data.clone()), Arc::new(map.clone()))
}

async fn seed_coins(store: &Store, key: &str, coins: i64) {
    store.load(key, None).await.unwrap();
    store
        .update(key, move |data| {
            data["coins"] = json!(coins);
            true
        })
        .await
        .unwrap();
    store.save(key).await.unwrap();
}

#[tokio::test]
async fn committed_transfer_is_atomic_and_durable() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx1");

    seed_coins(&store, "p1", 200).await;
    seed_coins(&store, "p2", 0).await;

    let committed = store
        .tx(&["p1", "p2"], |state| {
            let amount = 100;
            state.get_mut("p1").unwrap()["coins"] = json!(200 - amount);
            state.get_mut("p2").unwrap()["coins"] = json!(amount);
            true
        })
        .await
        .unwrap();
    assert!(committed);

    // In-memory state adopted on both sessions, nothing left dirty.
    assert_eq!(store.get("p1").unwrap()["coins"], json!(100));
    assert_eq!(store.get("p2").unwrap()["coins"], json!(100));

    // Both records are durable and carry no pending marker; the marker
    // itself has been collected.
    for key in ["p1", "p2"] {
        let record = data.get(&format!("records/tx1/{key}")).await.unwrap().unwrap();
        assert_eq!(record["data"]["coins"], json!(100));
        assert!(record.get("pendingTx").is_none());
    }
    assert!(data.keys_containing("tx/tx1/").is_empty());

    // Crash and reload: the committed values survive.
    store.close().await.unwrap();
    let reopened = build_store(&data, &map, "tx1");
    for key in ["p1", "p2"] {
        reopened.load(key, None).await.unwrap();
        assert_eq!(reopened.get(key).unwrap()["coins"], json!(100));
    }
}

#[tokio::test]
async fn declined_transaction_writes_nothing() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-decline");

    seed_coins(&store, "p1", 5).await;
    seed_coins(&store, "p2", 6).await;

    let committed = store
        .tx(&["p1", "p2"], |state| {
            state.get_mut("p1").unwrap()["coins"] = json!(999);
            false
        })
        .await
        .unwrap();
    assert!(!committed);

    assert_eq!(store.get("p1").unwrap()["coins"], json!(5));
    assert_eq!(store.get("p2").unwrap()["coins"], json!(6));
    assert!(data.keys_containing("tx/tx-decline/").is_empty());
}

#[tokio::test]
async fn modified_key_set_is_rejected() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-keys");

    seed_coins(&store, "p1", 1).await;
    seed_coins(&store, "p2", 2).await;

    let err = store
        .tx(&["p1", "p2"], |state| {
            state.remove("p2");
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TxKeysModified));

    let err = store
        .tx(&["p1", "p2"], |state| {
            state.insert("p3".to_string(), json!({"coins": 0}));
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TxKeysModified));

    assert_eq!(store.get("p1").unwrap()["coins"], json!(1));
    assert_eq!(store.get("p2").unwrap()["coins"], json!(2));
}

#[tokio::test]
async fn single_key_transaction_degrades_to_a_plain_update() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-single");

    seed_coins(&store, "p1", 10).await;
    let committed = store
        .tx(&["p1"], |state| {
            state.get_mut("p1").unwrap()["coins"] = json!(20);
            true
        })
        .await
        .unwrap();
    assert!(committed);

    assert_eq!(store.get("p1").unwrap()["coins"], json!(20));
    // No marker protocol for one participant.
    assert!(data.keys_containing("tx/tx-single/").is_empty());
    // Durable immediately.
    let record = data.get("records/tx-single/p1").await.unwrap().unwrap();
    assert_eq!(record["data"]["coins"], json!(20));
}

#[tokio::test]
async fn failed_participant_write_aborts_and_restores() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-abort");

    seed_coins(&store, "p1", 50).await;
    seed_coins(&store, "p2", 60).await;

    // Participants commit in sorted order; p2's record write fails
    // fatally after p1's pending write has landed.
    data.inject_fault(RequestKind::Set, "records/tx-abort/p2", 403, 1);

    let err = store
        .tx(&["p1", "p2"], |state| {
            state.get_mut("p1").unwrap()["coins"] = json!(0);
            state.get_mut("p2").unwrap()["coins"] = json!(110);
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BackendFatal { .. }));

    // No marker, both records back to their pre-transaction values with
    // no pending tags.
    assert!(data.keys_containing("tx/tx-abort/").is_empty());
    for (key, coins) in [("p1", 50), ("p2", 60)] {
        let record = data.get(&format!("records/tx-abort/{key}")).await.unwrap().unwrap();
        assert_eq!(record["data"]["coins"], json!(coins));
        assert!(record.get("pendingTx").is_none());
        assert_eq!(store.get(key).unwrap()["coins"], json!(coins));
    }

    // The sessions remain usable.
    store
        .update("p1", |d| {
            d["coins"] = json!(51);
            true
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn transform_panic_aborts_with_bad_transform() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-panic");

    seed_coins(&store, "p1", 1).await;
    seed_coins(&store, "p2", 2).await;

    let err = store
        .tx(&["p1", "p2"], |_state| -> bool { panic!("boom") })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::BadTransform { .. }));
    assert_eq!(store.get("p1").unwrap()["coins"], json!(1));
    assert_eq!(store.get("p2").unwrap()["coins"], json!(2));
}

// ---------------------------------------------------------------------------
// Crash recovery around the marker
// ---------------------------------------------------------------------------

/// Writes a record value directly, simulating a crashed writer's leftovers.
async fn plant_record(data: &MemoryDataService, key: &str, value: serde_json::Value) {
    data.set(key, value, None).await.unwrap();
}

#[tokio::test]
async fn crash_after_marker_write_adopts_the_new_values() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();

    // A transaction crashed after its marker write: both records carry the
    // new values plus the pending tag, and the marker is durable.
    let tx_id = "crashed-tx-1";
    for (key, coins) in [("p1", 100), ("p2", 100)] {
        plant_record(
            &data,
            &format!("records/txrec/{key}"),
            json!({"data": {"coins": coins, "inventory": []}, "pendingTx": tx_id}),
        )
        .await;
    }
    data.set(&format!("tx/txrec/{tx_id}"), json!("committed"), None).await.unwrap();

    let store = build_store(&data, &map, "txrec");
    for key in ["p1", "p2"] {
        store.load(key, None).await.unwrap();
        assert_eq!(store.get(key).unwrap()["coins"], json!(100));
    }

    // Recovery cleared the pending tags in storage.
    for key in ["p1", "p2"] {
        let record = data.get(&format!("records/txrec/{key}")).await.unwrap().unwrap();
        assert!(record.get("pendingTx").is_none(), "pending tag must be cleared on {key}");
        assert_eq!(record["data"]["coins"], json!(100));
    }
}

#[tokio::test]
async fn crash_before_marker_write_rolls_back_to_prior_versions() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();

    // A transaction crashed before its marker write: records carry the new
    // values and the pending tag, prior versions hold the old values, and
    // no marker exists.
    let tx_id = "crashed-tx-2";
    for (key, old_coins) in [("p1", 200), ("p2", 0)] {
        let record_key = format!("records/txroll/{key}");
        plant_record(
            &data,
            &record_key,
            json!({"data": {"coins": old_coins, "inventory": []}}),
        )
        .await;
        plant_record(
            &data,
            &record_key,
            json!({"data": {"coins": 100, "inventory": []}, "pendingTx": tx_id}),
        )
        .await;
    }

    let store = build_store(&data, &map, "txroll");
    for (key, old_coins) in [("p1", 200), ("p2", 0)] {
        store.load(key, None).await.unwrap();
        assert_eq!(store.get(key).unwrap()["coins"], json!(old_coins), "rollback on {key}");
    }

    // The restored records are durable and untagged.
    for (key, old_coins) in [("p1", 200), ("p2", 0)] {
        let record = data.get(&format!("records/txroll/{key}")).await.unwrap().unwrap();
        assert!(record.get("pendingTx").is_none());
        assert_eq!(record["data"]["coins"], json!(old_coins));
    }
}

#[tokio::test]
async fn rollback_without_a_prior_version_fails_the_load() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();

    // The pending write is the only version that exists.
    plant_record(
        &data,
        "records/txfail/p1",
        json!({"data": {"coins": 1}, "pendingTx": "lost-tx"}),
    )
    .await;

    let store = build_store(&data, &map, "txfail");
    let err = store.load("p1", None).await.unwrap_err();
    assert!(matches!(err, StoreError::TxRecoveryFailed { .. }));

    // The lease is not leaked by the failed load.
    assert!(!store.probe_lock_active("p1").await.unwrap());
}

#[tokio::test]
async fn peek_passes_through_a_pending_record() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();

    plant_record(
        &data,
        "records/txpeek/p1",
        json!({"data": {"coins": 42}, "pendingTx": "unresolved"}),
    )
    .await;

    let store = build_store(&data, &map, "txpeek");
    // No recovery, no marker consultation: the record is returned as
    // written.
    let peeked = store.peek("p1").await.unwrap().unwrap();
    assert_eq!(peeked["coins"], json!(42));
}

#[tokio::test]
async fn overlapping_transactions_serialize() {
    let data = MemoryDataService::new();
    let map = MemoryCoordinationMap::new();
    let store = build_store(&data, &map, "tx-contend");

    seed_coins(&store, "p1", 0).await;
    seed_coins(&store, "p2", 0).await;
    seed_coins(&store, "p3", 0).await;

    // Concurrent transfers over overlapping participant sets; every one
    // must apply atomically.
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..6 {
        let store = store.clone();
        let keys: Vec<&'static str> =
            if i % 2 == 0 { vec!["p1", "p2"] } else { vec!["p2", "p3"] };
        tasks.spawn(async move {
            store
                .tx(&keys, |state| {
                    for value in state.values_mut() {
                        let coins = value["coins"].as_i64().unwrap();
                        value["coins"] = json!(coins + 1);
                    }
                    true
                })
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().unwrap());
    }

    // p2 took part in all six, p1 and p3 in three each.
    assert_eq!(store.get("p1").unwrap()["coins"], json!(3));
    assert_eq!(store.get("p2").unwrap()["coins"], json!(6));
    assert_eq!(store.get("p3").unwrap()["coins"], json!(3));
}
