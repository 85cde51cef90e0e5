//! Auto-bid arbitration
//!
//! Any number of popup windows may be open, but only one of them should
//! actually place bids. They coordinate through a single owner record in
//! the synced tier, which works as a lease: the owner refreshes its
//! timestamp every liveness interval, and anybody who sees a record older
//! than `owner_stale_after` deletes it.
//!
//! The synced tier has no compare-and-swap, so this is cooperative and
//! last-writer-wins. Two windows enabling auto-bid at the same moment can
//! both believe to be the owner until their next reconciliation, at which
//! point the one that got overwritten disables itself. Enabling always
//! overwrites the record (even a fresh one of another window); disabling
//! only ever deletes our own.
use super::{ChangeFollowerService, LoopService};
use crate::{
    context::{SharedContext, TimestampMs},
    storage::{self, ChangeNotification, SharedSettingsStore, StorageChange, StorageChanges, Tier},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Owner record key in the synced tier
pub const OWNER_RECORD_KEY: &str = "SETTINGS";
/// Per-window settings key in the local tier
pub const LOCAL_SETTINGS_KEY: &str = "SETTINGS";

/// What this window wants, regardless of other windows
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSettings {
    #[serde(default)]
    pub auto_bid_enabled: bool,
    #[serde(default)]
    pub simulation: bool,
    /// Table page length the user picked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_length: Option<u32>,
}

/// The owner lease shared by all windows
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRecord {
    #[serde(default, deserialize_with = "storage::lenient")]
    pub owner_id: Option<String>,
    #[serde(default, deserialize_with = "storage::lenient_or_default")]
    pub auto_bid_enabled: bool,
    /// A timestamp we can't read is as good as none
    #[serde(default, deserialize_with = "storage::lenient")]
    pub timestamp_ms: Option<TimestampMs>,
}

impl OwnerRecord {
    pub fn claim(owner_id: &str, now_ms: TimestampMs) -> Self {
        Self {
            owner_id: Some(owner_id.to_owned()),
            auto_bid_enabled: true,
            timestamp_ms: Some(now_ms),
        }
    }

    pub fn is_owned_by(&self, id: &str) -> bool {
        self.owner_id.as_deref() == Some(id)
    }

    /// A record without a timestamp can't prove it's alive and counts as stale
    pub fn is_stale(&self, now_ms: TimestampMs, stale_after: Duration) -> bool {
        match self.timestamp_ms {
            Some(ts) => now_ms.saturating_sub(ts) > stale_after.as_millis() as TimestampMs,
            None => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AutoBidStatus {
    Disabled,
    /// Enabled, but not (yet) holding the lease; always the case when simulating
    LocalOnly { simulation: bool },
    Owner,
    /// Another window holds the lease
    Preempted { owner_id: String },
}

/// Read model rendered by the popup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoBidInfo {
    pub id: String,
    pub auto_bid_enabled: bool,
    pub simulation: bool,
    pub status: AutoBidStatus,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessOutcome {
    Refreshed,
    Expired { previous_owner: Option<String> },
    Unchanged,
}

pub struct AutoBidEngine {
    ctx: SharedContext,
    synced: SharedSettingsStore,
    local: SharedSettingsStore,
    info_tx: watch::Sender<Option<AutoBidInfo>>,
}

pub type SharedAutoBidEngine = Arc<AutoBidEngine>;

impl AutoBidEngine {
    pub fn new(ctx: SharedContext, synced: SharedSettingsStore, local: SharedSettingsStore) -> Self {
        Self {
            ctx,
            synced,
            local,
            info_tx: watch::channel(None).0,
        }
    }

    pub fn new_shared(
        ctx: SharedContext,
        synced: SharedSettingsStore,
        local: SharedSettingsStore,
    ) -> SharedAutoBidEngine {
        Arc::new(Self::new(ctx, synced, local))
    }

    fn id(&self) -> &str {
        self.ctx.identity.as_str()
    }

    /// Latest reconciled state, updated by every `get_state`
    pub fn subscribe(&self) -> watch::Receiver<Option<AutoBidInfo>> {
        self.info_tx.subscribe()
    }

    pub async fn local_settings(&self) -> Result<LocalSettings> {
        Ok(storage::load(&*self.local, LOCAL_SETTINGS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_local_settings(&self, settings: &LocalSettings) -> Result<()> {
        storage::save(&*self.local, LOCAL_SETTINGS_KEY, settings).await
    }

    pub async fn owner_record(&self) -> Result<Option<OwnerRecord>> {
        storage::load(&*self.synced, OWNER_RECORD_KEY).await
    }

    /// Overwrite the lease fields, keeping whatever else lives in the record
    async fn write_owner_record(&self, record: &OwnerRecord) -> Result<()> {
        let mut raw = self.synced.get(storage::Keys::One(OWNER_RECORD_KEY)).await?;
        let mut merged = match raw.remove(OWNER_RECORD_KEY) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Value::Object(fields) = serde_json::to_value(record)? {
            merged.extend(fields);
        }

        self.synced
            .set(BTreeMap::from([(OWNER_RECORD_KEY.to_owned(), Value::Object(merged))]))
            .await
    }

    pub async fn set_page_length(&self, page_length: u32) -> Result<()> {
        let mut settings = self.local_settings().await?;
        settings.page_length = Some(page_length);
        self.save_local_settings(&settings).await
    }

    /// Reconcile local intent with the owner record
    pub async fn get_state(&self) -> Result<AutoBidInfo> {
        let mut local = self.local_settings().await?;

        // local state stays authoritative if the synced tier is unreachable
        let owner = self.owner_record().await.unwrap_or_else(|e| {
            warn!(window = %self.id(), error = %e, "failed to read owner record");
            None
        });

        let other_owner = owner
            .as_ref()
            .and_then(|o| o.owner_id.clone())
            .filter(|owner_id| owner_id != self.id());

        let mut message = None;
        if let Some(other_owner) = &other_owner {
            message = Some(format!("Auto-bid is active in another window ({})", other_owner));

            if local.auto_bid_enabled && !local.simulation {
                info!(window = %self.id(), owner = %other_owner, "auto-bid owned elsewhere, disabling");
                local.auto_bid_enabled = false;
                if let Err(e) = self.save_local_settings(&local).await {
                    warn!(window = %self.id(), error = %e, "failed to store local settings");
                }
            }
        }

        let status = match (&other_owner, local.auto_bid_enabled) {
            (Some(owner_id), _) => AutoBidStatus::Preempted {
                owner_id: owner_id.clone(),
            },
            (None, false) => AutoBidStatus::Disabled,
            (None, true) if !local.simulation && owner.as_ref().is_some_and(|o| o.is_owned_by(self.id())) => {
                AutoBidStatus::Owner
            }
            (None, true) => AutoBidStatus::LocalOnly {
                simulation: local.simulation,
            },
        };

        let info = AutoBidInfo {
            id: self.id().to_owned(),
            auto_bid_enabled: local.auto_bid_enabled,
            simulation: local.simulation,
            status,
            message,
        };
        self.info_tx.send_replace(Some(info.clone()));
        Ok(info)
    }

    /// Change local intent; `None` leaves the respective flag alone
    pub async fn set_state(
        &self,
        auto_bid_enabled: Option<bool>,
        simulation: Option<bool>,
    ) -> Result<AutoBidInfo> {
        let mut local = self.local_settings().await?;
        if let Some(simulation) = simulation {
            local.simulation = simulation;
        }
        if let Some(enabled) = auto_bid_enabled {
            local.auto_bid_enabled = enabled;
        }
        self.save_local_settings(&local).await?;
        debug!(window = %self.id(), ?auto_bid_enabled, ?simulation, "auto-bid state set");

        let wants_lease = local.auto_bid_enabled && !local.simulation;
        if wants_lease && (auto_bid_enabled == Some(true) || simulation == Some(false)) {
            let record = OwnerRecord::claim(self.id(), self.ctx.now_ms());
            if let Err(e) = self.write_owner_record(&record).await {
                warn!(window = %self.id(), error = %e, "failed to claim auto-bid ownership");
            }
        } else if auto_bid_enabled == Some(false) || simulation == Some(true) {
            if let Err(e) = self.release_if_owned().await {
                warn!(window = %self.id(), error = %e, "failed to release auto-bid ownership");
            }
        }

        self.get_state().await
    }

    /// Delete the owner record, but only if it's ours
    async fn release_if_owned(&self) -> Result<()> {
        match self.owner_record().await? {
            Some(record) if record.is_owned_by(self.id()) => {
                info!(window = %self.id(), "releasing auto-bid ownership");
                self.synced.remove(&[OWNER_RECORD_KEY]).await
            }
            _ => Ok(()),
        }
    }

    /// Dead man switch: renew our lease, expire anybody's stale one
    pub async fn check_liveness(&self) -> Result<LivenessOutcome> {
        let now = self.ctx.now_ms();
        let local = self.local_settings().await?;
        let owner = self.owner_record().await?;

        let vacant = owner.as_ref().map_or(true, |o| o.owner_id.is_none());
        let ours = owner.as_ref().is_some_and(|o| o.is_owned_by(self.id()));

        if local.auto_bid_enabled && !local.simulation && (ours || vacant) {
            self.write_owner_record(&OwnerRecord::claim(self.id(), now))
                .await?;
            debug!(window = %self.id(), "auto-bid lease refreshed");
            return Ok(LivenessOutcome::Refreshed);
        }

        match owner {
            Some(record) if record.is_stale(now, self.ctx.config.owner_stale_after()) => {
                info!(
                    window = %self.id(),
                    owner = ?record.owner_id,
                    timestamp_ms = ?record.timestamp_ms,
                    "owner record expired, removing"
                );
                self.synced.remove(&[OWNER_RECORD_KEY]).await?;
                Ok(LivenessOutcome::Expired {
                    previous_owner: record.owner_id,
                })
            }
            _ => Ok(LivenessOutcome::Unchanged),
        }
    }

    /// Whether a synced tier change warrants a re-render.
    ///
    /// Our own writes to the owner record echo back; those don't.
    pub fn is_relevant_change(&self, changes: &StorageChanges) -> bool {
        changes
            .iter()
            .any(|(key, change)| key != OWNER_RECORD_KEY || !self.is_own_echo(key, change))
    }

    fn is_own_echo(&self, key: &str, change: &StorageChange) -> bool {
        change
            .new_value
            .clone()
            .and_then(|value| storage::decode::<OwnerRecord>(key, value))
            .is_some_and(|record| record.is_owned_by(self.id()))
    }
}

/// Runs the dead man switch every liveness interval
pub struct LivenessSweep {
    engine: SharedAutoBidEngine,
    interval: Duration,
}

impl LivenessSweep {
    pub fn new(engine: SharedAutoBidEngine) -> Self {
        let interval = engine.ctx.config.liveness_interval();
        Self { engine, interval }
    }
}

#[async_trait::async_trait]
impl LoopService for LivenessSweep {
    fn name(&self) -> &'static str {
        "liveness-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_iteration(&mut self) -> Result<()> {
        self.engine.check_liveness().await.map(|_| ())
    }
}

/// Re-reconciles whenever another window touched the synced tier
pub struct AutoBidWatcher {
    engine: SharedAutoBidEngine,
}

impl AutoBidWatcher {
    pub fn new(engine: SharedAutoBidEngine) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ChangeFollowerService for AutoBidWatcher {
    fn name(&self) -> &'static str {
        "auto-bid-watcher"
    }

    async fn handle_change(&mut self, change: ChangeNotification) -> Result<()> {
        if change.tier != Tier::Synced || !self.engine.is_relevant_change(&change.changes) {
            return Ok(());
        }
        self.engine.get_state().await.map(|_| ())
    }
}
