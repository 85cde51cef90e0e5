use crate::{
    article::{ArticleId, LogLevel},
    service::{
        auto_bid::{AutoBidInfo, LocalSettings},
        messaging::TabId,
        popup::EffectiveAutoBid,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Messages content scripts send to the popup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum TabRequest {
    /// Article state scraped from the page, complete or partial
    UpdateArticleStatus {
        #[serde(rename = "articleId")]
        article_id: ArticleId,
        detail: Value,
    },
    /// The user changed max bid / auto bid on the page itself
    UpdateArticleMaxBid {
        #[serde(rename = "articleId")]
        article_id: ArticleId,
        detail: Value,
    },
    /// Heartbeat, the tab is still there
    Refresh,
    AddArticleLog {
        #[serde(rename = "articleId")]
        article_id: ArticleId,
        detail: LogRequest,
    },
    GetWindowSettings,
    GetArticleAutoBid {
        #[serde(rename = "articleId")]
        article_id: ArticleId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    pub component: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TabResponse {
    Ack,
    WindowSettings(LocalSettings),
    AutoBid(EffectiveAutoBid),
}

/// A request together with the tab it came from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEnvelope {
    pub tab_id: TabId,
    pub request: TabRequest,
}

/// What the user does in the popup window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PopupIntent {
    #[serde(rename_all = "camelCase")]
    SetAutoBid {
        #[serde(default)]
        auto_bid_enabled: Option<bool>,
        #[serde(default)]
        simulation: Option<bool>,
    },
    /// Max bid as typed, e.g. `"10,50"`
    #[serde(rename_all = "camelCase")]
    SetMaxBid { article_id: ArticleId, max_bid: Value },
    #[serde(rename_all = "camelCase")]
    SetArticleAutoBid { article_id: ArticleId, auto_bid: bool },
    /// `None` moves the article out of any group
    #[serde(rename_all = "camelCase")]
    SetArticleGroup {
        article_id: ArticleId,
        #[serde(default)]
        group: Option<String>,
    },
    ToggleGroupAutoBid {
        #[serde(default)]
        group: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetPageLength { page_length: u32 },
    #[serde(rename_all = "camelCase")]
    DiscardArticle { article_id: ArticleId },
    GetState,
    ExportAll,
    ImportAll {
        items: BTreeMap<String, Value>,
        #[serde(default)]
        confirmed: bool,
    },
    ClearAll {
        #[serde(default)]
        confirmed: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PopupResponse {
    Ack,
    State(AutoBidInfo),
    /// Result of an article edit, changes rendered as `field: old -> new`
    Changed { changed: bool, changes: Vec<String> },
    #[serde(rename_all = "camelCase")]
    GroupAutoBid { auto_bid: bool },
    Exported(BTreeMap<String, Value>),
    Imported { count: usize },
}

/// One line from the host: either a tab request or a popup intent
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
    Tab(TabEnvelope),
    Popup { intent: PopupIntent },
}
