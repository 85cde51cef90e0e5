//! The set of tracked articles
//!
//! Holds one `ArticleRecord` per article id and keeps the durable part of
//! it (`StoredArticle`) in the synced tier, keyed by the article id. Each
//! article's log lives in the local tier under `log:<articleId>`.
//!
//! A tab shows at most one article. When a tab goes away (or moves on to
//! another article) the article it showed is released, and articles the
//! user never expressed any interest in are dropped entirely.
use super::LoopService;
use crate::{
    article::{
        migrate_legacy_keys, ArticleId, ArticleIdRef, ArticleRecord, ArticleUpdate, LogEntry, LogLevel, MergeOutcome,
        StoredArticle, LEGACY_KEYS,
    },
    context::{SharedContext, TimestampMs},
    error::TrackerError,
    service::{auto_bid::OWNER_RECORD_KEY, groups::GROUPS_KEY, messaging::TabId},
    storage::{self, Keys, SharedSettingsStore},
};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

pub const LOG_KEY_PREFIX: &str = "log:";

/// Synced tier keys that are not articles
const RESERVED_KEYS: [&str; 2] = [OWNER_RECORD_KEY, GROUPS_KEY];

pub fn log_key(article_id: ArticleIdRef) -> String {
    format!("{}{}", LOG_KEY_PREFIX, article_id)
}

#[derive(Clone, Debug)]
struct TrackedArticle {
    record: ArticleRecord,
    /// Whether the synced tier has a record for it
    stored: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    NotBound,
    Retained(ArticleId),
    Evicted(ArticleId),
}

/// What the synced tier holds for an article id
enum StoredLookup {
    Missing,
    /// Present, but not something we can read; must be left alone
    Unreadable,
    Found { update: ArticleUpdate, legacy: bool },
}

/// Parse a stored article, returning whether it was in the legacy format
fn parse_stored(key: &str, value: Value) -> Option<(ArticleUpdate, bool)> {
    let map: Map<String, Value> = storage::decode(key, value)?;
    let legacy = LEGACY_KEYS.iter().any(|(short, _)| map.contains_key(*short));

    match ArticleUpdate::from_value(Value::Object(map)) {
        Ok(update) => Some((update, legacy)),
        Err(e) => {
            warn!(%key, error = %e, "ignoring malformed stored article");
            None
        }
    }
}

pub struct ArticleTracker {
    ctx: SharedContext,
    synced: SharedSettingsStore,
    local: SharedSettingsStore,
    articles: Mutex<BTreeMap<ArticleId, TrackedArticle>>,
    heartbeats: Mutex<BTreeMap<TabId, TimestampMs>>,
}

pub type SharedArticleTracker = Arc<ArticleTracker>;

impl ArticleTracker {
    pub fn new(ctx: SharedContext, synced: SharedSettingsStore, local: SharedSettingsStore) -> Self {
        Self {
            ctx,
            synced,
            local,
            articles: Mutex::new(BTreeMap::new()),
            heartbeats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn new_shared(
        ctx: SharedContext,
        synced: SharedSettingsStore,
        local: SharedSettingsStore,
    ) -> SharedArticleTracker {
        Arc::new(Self::new(ctx, synced, local))
    }

    pub fn get(&self, article_id: ArticleIdRef) -> Option<ArticleRecord> {
        self.articles
            .lock()
            .get(article_id)
            .map(|tracked| tracked.record.clone())
    }

    pub fn articles(&self) -> Vec<ArticleRecord> {
        self.articles
            .lock()
            .values()
            .map(|tracked| tracked.record.clone())
            .collect()
    }

    pub fn article_for_tab(&self, tab_id: TabId) -> Option<ArticleId> {
        self.articles
            .lock()
            .values()
            .find(|tracked| tracked.record.tab_id == Some(tab_id))
            .map(|tracked| tracked.record.article_id.clone())
    }

    async fn read_stored(&self, article_id: ArticleIdRef<'_>) -> Result<StoredLookup> {
        let mut raw = self.synced.get(Keys::One(article_id)).await?;
        Ok(match raw.remove(article_id) {
            None => StoredLookup::Missing,
            Some(value) => match parse_stored(article_id, value) {
                Some((update, legacy)) => StoredLookup::Found { update, legacy },
                None => StoredLookup::Unreadable,
            },
        })
    }

    async fn read_log(&self, article_id: ArticleIdRef<'_>) -> Vec<LogEntry> {
        storage::load(&*self.local, &log_key(article_id))
            .await
            .unwrap_or_else(|e| {
                warn!(%article_id, error = %e, "failed to read article log");
                None
            })
            .unwrap_or_default()
    }

    /// Write the durable projection over whatever is stored for the
    /// article, keeping fields we don't know about.
    ///
    /// Returns whether the write went through.
    async fn persist(&self, stored: &StoredArticle) -> bool {
        let key = stored.article_id.as_str();
        let tier = self.synced.tier();

        let mut record = match self.synced.get(Keys::One(key)).await {
            Ok(mut raw) => raw
                .remove(key)
                .and_then(|value| storage::decode::<Map<String, Value>>(key, value))
                .map(migrate_legacy_keys)
                .unwrap_or_default(),
            Err(e) => {
                warn!(article_id = %key, %tier, error = %e, "failed to read article before storing");
                return false;
            }
        };
        match serde_json::to_value(stored) {
            Ok(Value::Object(fields)) => record.extend(fields),
            Ok(_) => {}
            Err(e) => {
                warn!(article_id = %key, error = %e, "failed to encode article");
                return false;
            }
        }

        match self
            .synced
            .set(BTreeMap::from([(key.to_owned(), Value::Object(record))]))
            .await
        {
            Ok(()) => {
                if let Some(tracked) = self.articles.lock().get_mut(key) {
                    tracked.stored = true;
                }
                true
            }
            Err(e) => {
                warn!(article_id = %key, %tier, error = %e, "failed to store article");
                false
            }
        }
    }

    /// Load every article stored in the synced tier, upgrading legacy records
    pub async fn load_stored(&self) -> Result<usize> {
        let all = self.synced.get(Keys::All).await?;

        let mut loaded = vec![];
        let mut upgrade = vec![];
        for (key, value) in all {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            let Some((update, legacy)) = parse_stored(&key, value) else {
                continue;
            };

            let mut record = ArticleRecord::new(key.clone());
            record.merge(&update);
            record.log = self.read_log(&key).await;
            if legacy {
                upgrade.push(record.to_stored());
            }
            loaded.push(record);
        }

        let count = loaded.len();
        {
            let mut articles = self.articles.lock();
            for record in loaded {
                articles
                    .entry(record.article_id.clone())
                    .or_insert(TrackedArticle {
                        record,
                        stored: true,
                    });
            }
        }

        for stored in upgrade {
            debug!(article_id = %stored.article_id, "upgrading legacy article record");
            self.persist(&stored).await;
        }

        info!(count, "stored articles loaded");
        Ok(count)
    }

    /// Start tracking `article_id`, seeded from its stored preferences
    async fn ensure_tracked(&self, article_id: ArticleIdRef<'_>) -> Result<()> {
        if self.articles.lock().contains_key(article_id) {
            return Ok(());
        }

        let stored = self.read_stored(article_id).await.unwrap_or_else(|e| {
            warn!(%article_id, error = %e, "failed to read stored article");
            StoredLookup::Missing
        });

        let mut record = ArticleRecord::new(article_id);
        let mut upgrade = None;
        // an unreadable record only gets overwritten by a durable preference
        let is_stored = matches!(stored, StoredLookup::Found { .. });
        if let StoredLookup::Found { update, legacy } = stored {
            record.merge(&update);
            if legacy {
                upgrade = Some(record.to_stored());
            }
        }
        record.log = self.read_log(article_id).await;

        self.articles
            .lock()
            .entry(article_id.to_owned())
            .or_insert(TrackedArticle {
                record,
                stored: is_stored,
            });

        if let Some(stored) = upgrade {
            self.persist(&stored).await;
        }
        Ok(())
    }

    /// Bind `tab_id` to `article_id`.
    ///
    /// Whatever article the tab showed before is released first. An article
    /// already bound to a different tab is a conflict the caller must
    /// resolve.
    pub async fn bind_tab(
        &self,
        article_id: ArticleIdRef<'_>,
        tab_id: TabId,
        for_bidding: bool,
    ) -> Result<()> {
        self.ensure_tracked(article_id).await?;

        let previous = {
            let articles = self.articles.lock();
            let tracked = articles
                .get(article_id)
                .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;

            if let Some(bound_tab) = tracked.record.tab_id.filter(|bound| *bound != tab_id) {
                return Err(TrackerError::TabConflict {
                    article_id: article_id.to_owned(),
                    bound_tab,
                    requested_tab: tab_id,
                }
                .into());
            }

            articles
                .values()
                .find(|other| other.record.tab_id == Some(tab_id) && other.record.article_id != article_id)
                .map(|other| other.record.article_id.clone())
        };

        if let Some(previous) = previous {
            debug!(tab_id, %previous, %article_id, "tab moved to another article");
            self.release(&previous).await?;
        }

        {
            let mut articles = self.articles.lock();
            let tracked = articles
                .get_mut(article_id)
                .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;
            tracked.record.tab_id = Some(tab_id);
            if for_bidding {
                tracked.record.tab_opened_for_bidding = true;
            }
        }
        self.heartbeat(tab_id);
        Ok(())
    }

    /// Merge an update from a tab (`tab_id` set) or from the user
    pub async fn update_article(
        &self,
        article_id: ArticleIdRef<'_>,
        tab_id: Option<TabId>,
        update: &ArticleUpdate,
    ) -> Result<MergeOutcome> {
        match tab_id {
            Some(tab_id) => self.bind_tab(article_id, tab_id, false).await?,
            None => self.ensure_tracked(article_id).await?,
        }

        let (outcome, to_persist) = {
            let mut articles = self.articles.lock();
            let tracked = articles
                .get_mut(article_id)
                .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;

            let before = tracked.record.to_stored();
            let outcome = tracked.record.merge(update);
            let after = tracked.record.to_stored();

            let worth_storing = if tracked.stored {
                after != before
            } else {
                tracked.record.has_durable_preference()
            };
            let to_persist = (outcome.changed && worth_storing).then_some(after);
            (outcome, to_persist)
        };

        if !outcome.changes.is_empty() {
            debug!(%article_id, changes = %outcome.describe(), "article updated");
            self.append_log(
                article_id,
                "popup",
                LogLevel::Info,
                format!("Article updated: {}", outcome.describe()),
            )
            .await?;
        }

        if let Some(stored) = to_persist {
            self.persist(&stored).await;
        }
        Ok(outcome)
    }

    /// The synced tier was wiped underneath us
    pub fn forget_stored(&self) {
        for tracked in self.articles.lock().values_mut() {
            tracked.stored = false;
        }
    }

    pub fn heartbeat(&self, tab_id: TabId) {
        self.heartbeats.lock().insert(tab_id, self.ctx.now_ms());
    }

    /// The tab closed or navigated away
    pub async fn release_tab(&self, tab_id: TabId) -> Result<ReleaseOutcome> {
        self.heartbeats.lock().remove(&tab_id);
        match self.article_for_tab(tab_id) {
            Some(article_id) => self.release(&article_id).await,
            None => Ok(ReleaseOutcome::NotBound),
        }
    }

    async fn release(&self, article_id: ArticleIdRef<'_>) -> Result<ReleaseOutcome> {
        let (tab_id, remembered) = {
            let mut articles = self.articles.lock();
            let Some(tracked) = articles.get_mut(article_id) else {
                return Ok(ReleaseOutcome::NotBound);
            };
            tracked.record.tab_opened_for_bidding = false;
            (
                tracked.record.tab_id.take(),
                tracked.record.has_durable_preference(),
            )
        };
        if let Some(tab_id) = tab_id {
            self.heartbeats.lock().remove(&tab_id);
        }

        let stored_preference = match self.read_stored(article_id).await {
            Ok(StoredLookup::Found { update, .. }) => update.has_durable_preference(),
            Ok(StoredLookup::Missing) => false,
            Ok(StoredLookup::Unreadable) => {
                warn!(%article_id, "stored article unreadable, keeping it");
                true
            }
            Err(e) => {
                warn!(%article_id, error = %e, "failed to read stored article, keeping it");
                true
            }
        };

        if stored_preference || remembered {
            debug!(%article_id, ?tab_id, "article released, retained");
            return Ok(ReleaseOutcome::Retained(article_id.to_owned()));
        }

        self.articles.lock().remove(article_id);
        self.remove_stored(article_id).await;
        info!(%article_id, ?tab_id, "article without preferences evicted");
        Ok(ReleaseOutcome::Evicted(article_id.to_owned()))
    }

    async fn remove_stored(&self, article_id: ArticleIdRef<'_>) {
        if let Err(e) = self.synced.remove(&[article_id]).await {
            warn!(%article_id, tier = %self.synced.tier(), error = %e, "failed to remove stored article");
        }
        if let Err(e) = self.local.remove(&[log_key(article_id).as_str()]).await {
            warn!(%article_id, tier = %self.local.tier(), error = %e, "failed to remove article log");
        }
    }

    /// The user explicitly dropped an article
    pub async fn discard(&self, article_id: ArticleIdRef<'_>) -> Result<()> {
        let tracked = self
            .articles
            .lock()
            .remove(article_id)
            .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;
        if let Some(tab_id) = tracked.record.tab_id {
            self.heartbeats.lock().remove(&tab_id);
        }

        self.synced.remove(&[article_id]).await?;
        self.local.remove(&[log_key(article_id).as_str()]).await?;
        info!(%article_id, "article discarded");
        Ok(())
    }

    pub async fn append_log(
        &self,
        article_id: ArticleIdRef<'_>,
        component: &str,
        level: LogLevel,
        message: String,
    ) -> Result<()> {
        let entry = LogEntry {
            timestamp: self.ctx.now_ms(),
            component: component.to_owned(),
            level,
            message,
        };

        let log = {
            let mut articles = self.articles.lock();
            let tracked = articles
                .get_mut(article_id)
                .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;
            tracked.record.log.push(entry);
            tracked.record.log.clone()
        };

        if let Err(e) = storage::save(&*self.local, &log_key(article_id), &log).await {
            warn!(%article_id, error = %e, "failed to store article log");
        }
        Ok(())
    }

    /// Release every bound tab that missed its heartbeats
    pub async fn release_stale_tabs(&self) -> Vec<ReleaseOutcome> {
        let now = self.ctx.now_ms();
        let stale_after_ms = self.ctx.config.tab_stale_after().as_millis() as TimestampMs;

        let stale: Vec<TabId> = {
            let articles = self.articles.lock();
            let heartbeats = self.heartbeats.lock();
            articles
                .values()
                .filter_map(|tracked| tracked.record.tab_id)
                .filter(|tab_id| {
                    heartbeats
                        .get(tab_id)
                        .map_or(true, |last_seen| now - last_seen > stale_after_ms)
                })
                .collect()
        };

        let mut outcomes = vec![];
        for tab_id in stale {
            debug!(tab_id, "tab missed its heartbeats");
            match self.release_tab(tab_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(tab_id, error = %e, "failed to release stale tab"),
            }
        }
        outcomes
    }
}

/// Periodically releases tabs that stopped sending heartbeats
pub struct TabScanner {
    tracker: SharedArticleTracker,
    interval: Duration,
}

impl TabScanner {
    pub fn new(tracker: SharedArticleTracker) -> Self {
        let interval = tracker.ctx.config.tab_scan_interval();
        Self { tracker, interval }
    }
}

#[async_trait::async_trait]
impl LoopService for TabScanner {
    fn name(&self) -> &'static str {
        "tab-scanner"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_iteration(&mut self) -> Result<()> {
        self.tracker.release_stale_tabs().await;
        Ok(())
    }
}
