//! The popup window: user intents and requests from tabs
use crate::{
    article::{adjusted_bid_time, parse_amount, ArticleId, ArticleIdRef, ArticleUpdate, DeconflictPolicy, MergeOutcome},
    context::{SharedContext, TimestampMs},
    error::TrackerError,
    event::{PopupIntent, PopupResponse, TabRequest, TabResponse},
    service::{
        articles::SharedArticleTracker,
        auto_bid::{AutoBidInfo, SharedAutoBidEngine},
        groups::SharedGroupRegistry,
        messaging::{send_with_retry, RetryPolicy, SharedTabMessenger, TabCommand, TabId},
    },
    storage::{Keys, SharedSettingsStore},
};
use anyhow::{format_err, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

mod bridge;
pub use self::bridge::*;

/// Whether (and when) a tab should bid on its article
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveAutoBid {
    pub article_id: ArticleId,
    /// Window-level auto-bid (after arbitration)
    pub window: bool,
    pub group: bool,
    pub article: bool,
    pub simulation: bool,
    /// All of the above
    pub auto_bid_enabled: bool,
    /// Deconflicted bid time, `None` for articles without an end time
    pub bid_time_ms: Option<TimestampMs>,
}

pub struct Popup {
    ctx: SharedContext,
    synced: SharedSettingsStore,
    engine: SharedAutoBidEngine,
    groups: SharedGroupRegistry,
    tracker: SharedArticleTracker,
    messenger: SharedTabMessenger,
}

pub type SharedPopup = Arc<Popup>;

impl Popup {
    pub fn new(
        ctx: SharedContext,
        synced: SharedSettingsStore,
        engine: SharedAutoBidEngine,
        groups: SharedGroupRegistry,
        tracker: SharedArticleTracker,
        messenger: SharedTabMessenger,
    ) -> Self {
        Self {
            ctx,
            synced,
            engine,
            groups,
            tracker,
            messenger,
        }
    }

    pub fn new_shared(
        ctx: SharedContext,
        synced: SharedSettingsStore,
        engine: SharedAutoBidEngine,
        groups: SharedGroupRegistry,
        tracker: SharedArticleTracker,
        messenger: SharedTabMessenger,
    ) -> SharedPopup {
        Arc::new(Self::new(ctx, synced, engine, groups, tracker, messenger))
    }

    pub async fn handle_request(&self, tab_id: TabId, request: TabRequest) -> Result<TabResponse> {
        match request {
            TabRequest::UpdateArticleStatus { article_id, detail }
            | TabRequest::UpdateArticleMaxBid { article_id, detail } => {
                let update = ArticleUpdate::from_value(detail)?;
                self.tracker
                    .update_article(&article_id, Some(tab_id), &update)
                    .await?;
                Ok(TabResponse::Ack)
            }
            TabRequest::Refresh => {
                self.tracker.heartbeat(tab_id);
                if self.ctx.rate_limiter.check(
                    "render",
                    self.ctx.now_ms(),
                    self.ctx.config.render_min_interval(),
                ) {
                    self.engine.get_state().await?;
                }
                Ok(TabResponse::Ack)
            }
            TabRequest::AddArticleLog { article_id, detail } => {
                self.tracker
                    .append_log(&article_id, &detail.component, detail.level, detail.message)
                    .await?;
                Ok(TabResponse::Ack)
            }
            TabRequest::GetWindowSettings => {
                Ok(TabResponse::WindowSettings(self.engine.local_settings().await?))
            }
            TabRequest::GetArticleAutoBid { article_id } => {
                Ok(TabResponse::AutoBid(self.effective_auto_bid(&article_id).await?))
            }
        }
    }

    pub async fn handle_intent(&self, intent: PopupIntent) -> Result<PopupResponse> {
        Ok(match intent {
            PopupIntent::SetAutoBid {
                auto_bid_enabled,
                simulation,
            } => PopupResponse::State(self.set_auto_bid(auto_bid_enabled, simulation).await?),
            PopupIntent::SetMaxBid { article_id, max_bid } => {
                PopupResponse::from(self.set_max_bid(&article_id, &max_bid).await?)
            }
            PopupIntent::SetArticleAutoBid { article_id, auto_bid } => {
                PopupResponse::from(self.set_article_auto_bid(&article_id, auto_bid).await?)
            }
            PopupIntent::SetArticleGroup { article_id, group } => {
                PopupResponse::from(self.set_article_group(&article_id, group).await?)
            }
            PopupIntent::ToggleGroupAutoBid { group } => PopupResponse::GroupAutoBid {
                auto_bid: self.toggle_group_auto_bid(group.as_deref()).await?,
            },
            PopupIntent::SetPageLength { page_length } => {
                self.engine.set_page_length(page_length).await?;
                PopupResponse::Ack
            }
            PopupIntent::DiscardArticle { article_id } => {
                self.tracker.discard(&article_id).await?;
                PopupResponse::Ack
            }
            PopupIntent::GetState => PopupResponse::State(self.engine.get_state().await?),
            PopupIntent::ExportAll => PopupResponse::Exported(self.export_all().await?),
            PopupIntent::ImportAll { items, confirmed } => PopupResponse::Imported {
                count: self.import_all(items, confirmed).await?,
            },
            PopupIntent::ClearAll { confirmed } => {
                self.clear_all(confirmed).await?;
                PopupResponse::Ack
            }
        })
    }

    /// Window ⨯ group ⨯ article auto-bid, plus when to bid
    pub async fn effective_auto_bid(&self, article_id: ArticleIdRef<'_>) -> Result<EffectiveAutoBid> {
        let article = self
            .tracker
            .get(article_id)
            .ok_or_else(|| TrackerError::UnknownArticle(article_id.to_owned()))?;

        let window = self.engine.get_state().await?;
        let group = self.groups.get_state(article.group.as_deref()).await?;

        let tracked = self.tracker.articles();
        let bid_time_ms = adjusted_bid_time(&article, &tracked, DeconflictPolicy::from(&self.ctx.config));

        Ok(EffectiveAutoBid {
            article_id: article.article_id,
            window: window.auto_bid_enabled,
            group,
            article: article.auto_bid,
            simulation: window.simulation,
            auto_bid_enabled: window.auto_bid_enabled && group && article.auto_bid,
            bid_time_ms,
        })
    }

    /// Max bid as typed by the user, e.g. `"10,50"`
    pub async fn set_max_bid(&self, article_id: ArticleIdRef<'_>, input: &Value) -> Result<MergeOutcome> {
        let max_bid = parse_amount(input).map_err(|raw| format_err!("invalid max bid: {}", raw))?;
        self.apply_user_update(
            article_id,
            ArticleUpdate {
                max_bid: Some(max_bid),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_article_auto_bid(&self, article_id: ArticleIdRef<'_>, auto_bid: bool) -> Result<MergeOutcome> {
        self.apply_user_update(
            article_id,
            ArticleUpdate {
                auto_bid: Some(auto_bid),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_article_group(
        &self,
        article_id: ArticleIdRef<'_>,
        group: Option<String>,
    ) -> Result<MergeOutcome> {
        self.apply_user_update(
            article_id,
            ArticleUpdate {
                group: Some(group),
                ..Default::default()
            },
        )
        .await
    }

    async fn apply_user_update(&self, article_id: ArticleIdRef<'_>, update: ArticleUpdate) -> Result<MergeOutcome> {
        let outcome = self.tracker.update_article(article_id, None, &update).await?;
        if outcome.changed {
            self.push_to_tab(article_id).await;
        }
        Ok(outcome)
    }

    /// Let the article's tab know about new preferences, if it has one
    async fn push_to_tab(&self, article_id: ArticleIdRef<'_>) {
        let Some(article) = self.tracker.get(article_id) else {
            return;
        };
        let Some(tab_id) = article.tab_id else {
            return;
        };

        let command = TabCommand::UpdateArticleMaxBid {
            article_id: article.article_id.clone(),
            detail: article.to_stored(),
        };
        if let Err(e) = send_with_retry(
            &*self.messenger,
            tab_id,
            &command,
            RetryPolicy::from(&self.ctx.config.messaging),
        )
        .await
        {
            warn!(%article_id, tab_id, error = %e, "failed to update tab");
        }
    }

    pub async fn set_auto_bid(&self, enabled: Option<bool>, simulation: Option<bool>) -> Result<AutoBidInfo> {
        self.engine.set_state(enabled, simulation).await
    }

    pub async fn toggle_group_auto_bid(&self, group: Option<&str>) -> Result<bool> {
        self.groups.toggle_state(group).await
    }

    /// Everything in the synced tier, for backup
    pub async fn export_all(&self) -> Result<BTreeMap<String, Value>> {
        self.synced.get(Keys::All).await
    }

    /// Restore a backup on top of the synced tier
    pub async fn import_all(&self, items: BTreeMap<String, Value>, confirmed: bool) -> Result<usize> {
        if !confirmed {
            return Err(TrackerError::NotConfirmed.into());
        }
        let count = items.len();
        self.synced.set(items).await?;
        self.tracker.load_stored().await?;
        info!(count, "settings imported");
        Ok(count)
    }

    pub async fn clear_all(&self, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(TrackerError::NotConfirmed.into());
        }
        self.synced.clear().await?;
        self.tracker.forget_stored();
        debug!("synced settings cleared");
        Ok(())
    }
}

impl From<MergeOutcome> for PopupResponse {
    fn from(outcome: MergeOutcome) -> Self {
        PopupResponse::Changed {
            changed: outcome.changed,
            changes: outcome.changes.iter().map(ToString::to_string).collect(),
        }
    }
}
