use crate::{
    service::auto_bid::OwnerRecord,
    storage::{self, InMemorySettingsStore, Keys, SettingsStore, Tier},
};
use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn decode_treats_garbage_as_absent() {
    assert_eq!(storage::decode::<OwnerRecord>("SETTINGS", json!(null)), None);
    assert_eq!(storage::decode::<OwnerRecord>("SETTINGS", json!(42)), None);
    assert_eq!(storage::decode::<OwnerRecord>("SETTINGS", json!("{oops")), None);
}

#[test]
fn decode_accepts_json_text() {
    let record = storage::decode::<OwnerRecord>(
        "SETTINGS",
        json!(r#"{"ownerId": "ext:1", "autoBidEnabled": true, "timestampMs": 5}"#),
    );
    assert_eq!(
        record,
        Some(OwnerRecord {
            owner_id: Some("ext:1".to_owned()),
            auto_bid_enabled: true,
            timestamp_ms: Some(5),
        })
    );
}

#[test]
fn owner_record_fields_decode_one_by_one() {
    let record = storage::decode::<OwnerRecord>(
        "SETTINGS",
        json!({ "ownerId": 17, "autoBidEnabled": true, "timestampMs": "soon" }),
    );
    assert_eq!(
        record,
        Some(OwnerRecord {
            owner_id: None,
            auto_bid_enabled: true,
            timestamp_ms: None,
        })
    );
}

#[test]
fn stores_know_their_tier() {
    let synced = InMemorySettingsStore::new(Tier::Synced);
    let local = InMemorySettingsStore::new(Tier::Local);

    assert_eq!(synced.tier(), Tier::Synced);
    assert_eq!(local.tier().to_string(), "local");
    assert_eq!(synced.tier().to_string(), "sync");
}

#[tokio::test]
async fn every_mutation_is_announced() -> Result<()> {
    let store = InMemorySettingsStore::new(Tier::Synced);
    let mut changes = store.subscribe();

    storage::save(&store, "a", &1).await?;
    let change = changes.recv().await?;
    assert_eq!(change.tier, Tier::Synced);
    assert_eq!(change.changes["a"].old_value, None);
    assert_eq!(change.changes["a"].new_value, Some(json!(1)));

    storage::save(&store, "a", &2).await?;
    assert_eq!(changes.recv().await?.changes["a"].old_value, Some(json!(1)));

    store.remove(&["a", "missing"]).await?;
    let change = changes.recv().await?;
    assert_eq!(change.changes.len(), 1);
    assert_eq!(change.changes["a"].new_value, None);

    store
        .set(BTreeMap::from([("b".to_owned(), json!(true)), ("c".to_owned(), json!(false))]))
        .await?;
    assert_eq!(changes.recv().await?.changes.len(), 2);

    store.clear().await?;
    assert_eq!(changes.recv().await?.changes.len(), 2);
    assert!(store.snapshot().is_empty());
    Ok(())
}

#[tokio::test]
async fn get_selects_keys() -> Result<()> {
    let store = InMemorySettingsStore::new(Tier::Local);
    store
        .set(BTreeMap::from([
            ("a".to_owned(), json!(1)),
            ("b".to_owned(), json!(2)),
            ("c".to_owned(), json!(3)),
        ]))
        .await?;

    assert_eq!(store.get(Keys::One("a")).await?.len(), 1);
    assert!(store.get(Keys::One("x")).await?.is_empty());
    assert_eq!(
        store.get(Keys::Many(&["a", "c", "x"])).await?.keys().collect::<Vec<_>>(),
        vec!["a", "c"]
    );
    assert_eq!(store.get(Keys::All).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn failing_writes_leave_data_alone() -> Result<()> {
    let store = InMemorySettingsStore::new(Tier::Synced);
    storage::save(&store, "a", &1).await?;

    store.set_fail_writes(true);
    assert!(storage::save(&store, "a", &2).await.is_err());
    assert!(store.remove(&["a"]).await.is_err());

    assert_eq!(storage::load::<i64>(&store, "a").await?, Some(1));
    Ok(())
}
