use super::fixture::*;
use crate::{
    service::{auto_bid::LivenessSweep, LoopService, ServiceControl},
    storage::{self, SettingsStore},
};
use anyhow::{bail, Result};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

struct Counter {
    runs: Arc<AtomicU32>,
    fail: bool,
}

#[async_trait::async_trait]
impl LoopService for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    async fn run_iteration(&mut self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("boom");
        }
        Ok(())
    }
}

async fn run_until(runs: &AtomicU32, at_least: u32) {
    while runs.load(Ordering::SeqCst) < at_least {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn loop_runs_until_stopped() -> Result<()> {
    let svc_ctl = ServiceControl::new();
    let runs = Arc::new(AtomicU32::new(0));

    let handle = svc_ctl.spawn_loop(Counter {
        runs: runs.clone(),
        fail: false,
    });
    run_until(&runs, 3).await;

    svc_ctl.stop_all();
    assert!(svc_ctl.is_stopped());
    handle.join().await?;

    let after_stop = runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    Ok(())
}

#[tokio::test]
async fn failing_iterations_keep_the_loop_going() -> Result<()> {
    let svc_ctl = ServiceControl::new();
    let runs = Arc::new(AtomicU32::new(0));

    let handle = svc_ctl.spawn_loop(Counter {
        runs: runs.clone(),
        fail: true,
    });
    run_until(&runs, 3).await;

    svc_ctl.stop_all();
    handle.join().await?;
    Ok(())
}

#[tokio::test]
async fn liveness_sweep_refreshes_on_first_iteration() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    w1.engine.set_state(Some(true), None).await?;
    browser.clock.advance(Duration::from_secs(60));

    let mut sweep = LivenessSweep::new(w1.engine.clone());
    assert_eq!(sweep.interval(), Duration::from_secs(60));
    sweep.run_iteration().await?;

    let record: Option<serde_json::Value> = storage::load(&*browser.synced, "SETTINGS").await?;
    assert_eq!(record.map(|r| r["timestampMs"].clone()), Some(serde_json::json!(T0 + 60_000)));
    Ok(())
}

#[tokio::test]
async fn change_follower_sees_foreign_writes() -> Result<()> {
    let browser = Browser::new();
    let w1 = browser.window(1);
    let w2 = browser.window(2);
    w1.engine.set_state(Some(true), None).await?;

    let svc_ctl = ServiceControl::new();
    let mut rendered = w1.engine.subscribe();
    let handle = svc_ctl.spawn_change_follower(
        crate::service::auto_bid::AutoBidWatcher::new(w1.engine.clone()),
        browser.synced.subscribe(),
    );

    w2.engine.set_state(Some(true), None).await?;

    loop {
        rendered.changed().await?;
        if rendered.borrow().as_ref().is_some_and(|info| !info.auto_bid_enabled) {
            break;
        }
    }

    svc_ctl.stop_all();
    handle.join().await?;
    Ok(())
}
