use super::fixture::*;
use crate::{
    service::{
        auto_bid::{
            AutoBidStatus, AutoBidWatcher, LivenessOutcome, LivenessSweep, LocalSettings, OwnerRecord,
            LOCAL_SETTINGS_KEY, OWNER_RECORD_KEY,
        },
        ChangeFollowerService, LoopService,
    },
    storage::{self, SettingsStore, StorageChange, StorageChanges},
};
use anyhow::Result;
use serde_json::json;
use std::time::Duration;

async fn owner_record(browser: &Browser) -> Result<Option<OwnerRecord>> {
    storage::load(&*browser.synced, OWNER_RECORD_KEY).await
}

#[tokio::test]
async fn enabling_claims_the_owner_record() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    let info = w1.engine.set_state(Some(true), Some(false)).await?;

    assert!(info.auto_bid_enabled);
    assert_eq!(info.status, AutoBidStatus::Owner);
    assert_eq!(
        owner_record(&browser).await?,
        Some(OwnerRecord {
            owner_id: Some("ext:1".to_owned()),
            auto_bid_enabled: true,
            timestamp_ms: Some(T0),
        })
    );
    Ok(())
}

#[tokio::test]
async fn simulation_stays_local() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    let info = w1.engine.set_state(Some(true), Some(true)).await?;

    assert!(info.auto_bid_enabled);
    assert_eq!(info.status, AutoBidStatus::LocalOnly { simulation: true });
    assert!(!browser.synced.snapshot().contains_key(OWNER_RECORD_KEY));
    Ok(())
}

#[tokio::test]
async fn fresh_owner_elsewhere_disables_local_auto_bid() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    w1.engine.set_state(Some(true), None).await?;
    storage::save(
        &*w2.local,
        LOCAL_SETTINGS_KEY,
        &LocalSettings {
            auto_bid_enabled: true,
            ..Default::default()
        },
    )
    .await?;

    let info = w2.engine.get_state().await?;
    assert!(!info.auto_bid_enabled);
    assert_eq!(
        info.status,
        AutoBidStatus::Preempted {
            owner_id: "ext:1".to_owned()
        }
    );
    assert!(info.message.unwrap_or_default().contains("ext:1"));
    assert!(!w2.engine.local_settings().await?.auto_bid_enabled);

    // disabling must not clear somebody else's claim
    w2.engine.set_state(Some(false), None).await?;
    assert_eq!(
        owner_record(&browser).await?.and_then(|r| r.owner_id),
        Some("ext:1".to_owned())
    );
    Ok(())
}

#[tokio::test]
async fn simulating_window_keeps_running_when_preempted() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    w2.engine.set_state(Some(true), Some(true)).await?;
    w1.engine.set_state(Some(true), None).await?;

    let info = w2.engine.get_state().await?;
    assert!(info.auto_bid_enabled);
    assert!(info.simulation);
    assert!(info.message.is_some());
    Ok(())
}

#[tokio::test]
async fn concurrent_enables_settle_on_one_owner() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    let (r1, r2) = futures::join!(
        w1.engine.set_state(Some(true), None),
        w2.engine.set_state(Some(true), None)
    );
    r1?;
    r2?;

    let s1 = w1.engine.get_state().await?;
    let s2 = w2.engine.get_state().await?;
    assert!(s1.auto_bid_enabled ^ s2.auto_bid_enabled);

    // and it stays that way
    let s1 = w1.engine.get_state().await?;
    let s2 = w2.engine.get_state().await?;
    assert!(s1.auto_bid_enabled ^ s2.auto_bid_enabled);
    Ok(())
}

#[tokio::test]
async fn disabling_releases_own_record() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    w1.engine.set_state(Some(true), None).await?;
    let info = w1.engine.set_state(Some(false), None).await?;

    assert_eq!(info.status, AutoBidStatus::Disabled);
    assert_eq!(owner_record(&browser).await?, None);
    Ok(())
}

#[tokio::test]
async fn switching_to_simulation_releases_own_record() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    w1.engine.set_state(Some(true), None).await?;
    let info = w1.engine.set_state(None, Some(true)).await?;

    assert_eq!(info.status, AutoBidStatus::LocalOnly { simulation: true });
    assert_eq!(owner_record(&browser).await?, None);
    Ok(())
}

#[tokio::test]
async fn failed_synced_write_keeps_local_state() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    browser.synced.set_fail_writes(true);
    let info = w1.engine.set_state(Some(true), None).await?;

    assert!(info.auto_bid_enabled);
    assert_eq!(info.status, AutoBidStatus::LocalOnly { simulation: false });

    browser.synced.set_fail_writes(false);
    assert_eq!(w1.engine.check_liveness().await?, LivenessOutcome::Refreshed);
    assert_eq!(w1.engine.get_state().await?.status, AutoBidStatus::Owner);
    Ok(())
}

#[tokio::test]
async fn owner_refreshes_its_lease() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    w1.engine.set_state(Some(true), None).await?;
    browser.clock.advance(Duration::from_secs(60));

    assert_eq!(w1.engine.check_liveness().await?, LivenessOutcome::Refreshed);
    assert_eq!(
        owner_record(&browser).await?.and_then(|r| r.timestamp_ms),
        Some(T0 + 60_000)
    );
    Ok(())
}

#[tokio::test]
async fn stale_lease_is_expired_by_any_window() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    w1.engine.set_state(Some(true), None).await?;

    browser.clock.advance(Duration::from_secs(299));
    assert_eq!(w2.engine.check_liveness().await?, LivenessOutcome::Unchanged);

    // w1 went away and stopped refreshing
    browser.clock.advance(Duration::from_secs(2));
    assert_eq!(
        w2.engine.check_liveness().await?,
        LivenessOutcome::Expired {
            previous_owner: Some("ext:1".to_owned())
        }
    );
    assert_eq!(owner_record(&browser).await?, None);

    let info = w2.engine.set_state(Some(true), None).await?;
    assert_eq!(info.status, AutoBidStatus::Owner);
    Ok(())
}

#[tokio::test]
async fn record_without_timestamp_counts_as_stale() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    storage::save(&*browser.synced, OWNER_RECORD_KEY, &json!({ "ownerId": "ext:9" })).await?;

    assert!(matches!(
        w1.engine.check_liveness().await?,
        LivenessOutcome::Expired { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn timestamp_far_in_the_past_is_stale() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    storage::save(
        &*browser.synced,
        OWNER_RECORD_KEY,
        &json!({ "ownerId": "ext:9", "autoBidEnabled": true, "timestampMs": i64::MIN }),
    )
    .await?;

    assert_eq!(
        w1.engine.check_liveness().await?,
        LivenessOutcome::Expired {
            previous_owner: Some("ext:9".to_owned())
        }
    );
    assert_eq!(owner_record(&browser).await?, None);
    Ok(())
}

#[tokio::test]
async fn sweep_expires_record_with_unreadable_fields() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    storage::save(
        &*browser.synced,
        OWNER_RECORD_KEY,
        &json!({ "ownerId": "ext:9", "autoBidEnabled": "yes", "timestampMs": "yesterday" }),
    )
    .await?;

    let record = owner_record(&browser).await?.expect("record still readable");
    assert_eq!(record.owner_id.as_deref(), Some("ext:9"));
    assert!(!record.auto_bid_enabled);
    assert_eq!(record.timestamp_ms, None);

    let mut sweep = LivenessSweep::new(w1.engine.clone());
    sweep.run_iteration().await?;
    assert_eq!(owner_record(&browser).await?, None);
    Ok(())
}

#[tokio::test]
async fn preempted_window_does_not_reclaim_on_liveness_check() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    w1.engine.set_state(Some(true), None).await?;
    // w2 still believes it is enabled, it has not reconciled yet
    storage::save(
        &*w2.local,
        LOCAL_SETTINGS_KEY,
        &LocalSettings {
            auto_bid_enabled: true,
            ..Default::default()
        },
    )
    .await?;

    assert_eq!(w2.engine.check_liveness().await?, LivenessOutcome::Unchanged);
    assert_eq!(
        owner_record(&browser).await?.and_then(|r| r.owner_id),
        Some("ext:1".to_owned())
    );

    browser.clock.advance(Duration::from_secs(60));
    assert_eq!(w2.engine.check_liveness().await?, LivenessOutcome::Unchanged);
    assert_eq!(
        owner_record(&browser).await?.and_then(|r| r.timestamp_ms),
        Some(T0)
    );
    Ok(())
}

#[tokio::test]
async fn claim_keeps_unrelated_fields_of_the_record() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    storage::save(&*browser.synced, OWNER_RECORD_KEY, &json!({ "compactView": true })).await?;
    w1.engine.set_state(Some(true), None).await?;

    let stored = browser.synced.snapshot();
    assert_eq!(stored[OWNER_RECORD_KEY]["compactView"], json!(true));
    assert_eq!(stored[OWNER_RECORD_KEY]["ownerId"], json!("ext:1"));
    Ok(())
}

#[tokio::test]
async fn page_length_survives_auto_bid_changes() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    w1.engine.set_page_length(50).await?;
    w1.engine.set_state(Some(true), Some(true)).await?;

    assert_eq!(w1.engine.local_settings().await?.page_length, Some(50));
    Ok(())
}

#[tokio::test]
async fn own_echo_is_not_relevant() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);

    let change = |value| {
        StorageChanges::from([(
            OWNER_RECORD_KEY.to_owned(),
            StorageChange {
                old_value: None,
                new_value: value,
            },
        )])
    };

    assert!(!w1.engine.is_relevant_change(&change(Some(json!({ "ownerId": "ext:1" })))));
    assert!(w1.engine.is_relevant_change(&change(Some(json!({ "ownerId": "ext:2" })))));
    assert!(w1.engine.is_relevant_change(&change(None)));
    assert!(w1.engine.is_relevant_change(&StorageChanges::from([(
        "autoBidGroups".to_owned(),
        StorageChange {
            old_value: None,
            new_value: Some(json!({})),
        },
    )])));
    Ok(())
}

#[tokio::test]
async fn watcher_rerenders_on_foreign_claim() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);

    w1.engine.set_state(Some(true), None).await?;
    let rendered = w1.engine.subscribe();
    let mut changes = browser.synced.subscribe();

    w2.engine.set_state(Some(true), None).await?;
    let change = changes.recv().await?;

    AutoBidWatcher::new(w1.engine.clone()).handle_change(change).await?;

    let info = rendered.borrow().clone().expect("rendered");
    assert!(!info.auto_bid_enabled);
    assert_eq!(
        info.status,
        AutoBidStatus::Preempted {
            owner_id: "ext:2".to_owned()
        }
    );
    Ok(())
}
