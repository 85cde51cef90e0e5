use crate::{
    config::Config,
    context::{Context, ManualClock, SharedContext, TimestampMs, WindowIdentity},
    service::{
        articles::ArticleTracker,
        auto_bid::AutoBidEngine,
        groups::GroupRegistry,
        messaging::{RetryPolicy, TabCommand, TabId, TabMessenger},
        popup::Popup,
    },
    storage::{InMemorySettingsStore, Tier},
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

pub const T0: TimestampMs = 1_700_000_000_000;

/// Storage shared by every window of the same browser profile
pub struct Browser {
    pub synced: Arc<InMemorySettingsStore>,
    pub clock: Arc<ManualClock>,
}

impl Browser {
    pub fn new() -> Self {
        Self {
            synced: InMemorySettingsStore::new_shared(Tier::Synced),
            clock: ManualClock::new_shared(T0),
        }
    }

    pub fn window(&self, handle: u32) -> Window {
        let ctx = Context::new_shared(
            WindowIdentity::new("ext", handle),
            Config::default(),
            self.clock.clone(),
        );
        let local = InMemorySettingsStore::new_shared(Tier::Local);

        Window {
            engine: Arc::new(AutoBidEngine::new(ctx.clone(), self.synced.clone(), local.clone())),
            groups: Arc::new(GroupRegistry::new(self.synced.clone())),
            tracker: Arc::new(ArticleTracker::new(ctx.clone(), self.synced.clone(), local.clone())),
            synced: self.synced.clone(),
            ctx,
            local,
        }
    }
}

/// One popup window
pub struct Window {
    pub ctx: SharedContext,
    pub synced: Arc<InMemorySettingsStore>,
    pub local: Arc<InMemorySettingsStore>,
    pub engine: Arc<AutoBidEngine>,
    pub groups: Arc<GroupRegistry>,
    pub tracker: Arc<ArticleTracker>,
}

impl Window {
    pub fn popup(&self, messenger: Arc<RecordingMessenger>) -> Popup {
        Popup::new(
            self.ctx.clone(),
            self.synced.clone(),
            self.engine.clone(),
            self.groups.clone(),
            self.tracker.clone(),
            messenger,
        )
    }
}

/// Records every command and fails the first `fail_first` sends
#[derive(Default)]
pub struct RecordingMessenger {
    pub fail_first: u32,
    pub sent: Mutex<Vec<(TabId, TabCommand)>>,
    calls: AtomicU32,
}

impl RecordingMessenger {
    pub fn failing(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabMessenger for RecordingMessenger {
    async fn send_message(&self, tab_id: TabId, command: &TabCommand) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            bail!("Could not establish connection. Receiving end does not exist.");
        }
        self.sent.lock().push((tab_id, command.clone()));
        Ok(Value::Null)
    }
}

/// Fast retries, no jitter
pub fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_retries,
        max_jitter: Duration::ZERO,
    }
}
