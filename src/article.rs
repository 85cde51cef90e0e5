//! Tracked auction articles
//!
//! An article is observed from a tab (the content script pushes whatever
//! it could scrape), or read back from storage (the durable preferences
//! the user set on it). Both sources speak the same record format, which
//! over time gained long `article*` field names; older records still use
//! the short ones. Everything entering this module goes through
//! [`migrate_legacy_keys`] first.
pub mod deconflict;
pub mod merge;

pub use self::{deconflict::*, merge::*};

use crate::{context::TimestampMs, service::messaging::TabId, storage};
use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub type ArticleId = String;
pub type ArticleIdRef<'s> = &'s str;
pub type Amount = f64;

/// Group name used for articles without a group
pub const NO_GROUP: &str = "Keine Gruppe";

/// Short (legacy) field name -> canonical field name
pub const LEGACY_KEYS: [(&str, &str); 7] = [
    ("maxBid", "articleMaxBid"),
    ("minBid", "articleMinimumBid"),
    ("endTime", "articleEndTime"),
    ("bidPrice", "articleBidPrice"),
    ("group", "articleGroup"),
    ("description", "articleDescription"),
    ("autoBid", "articleAutoBid"),
];

/// Rename short legacy keys to their canonical names.
///
/// A canonical key that is already present wins over its legacy alias.
/// Running this on an already migrated record changes nothing.
pub fn migrate_legacy_keys(mut record: Map<String, Value>) -> Map<String, Value> {
    for (short, long) in LEGACY_KEYS {
        if let Some(value) = record.remove(short) {
            record.entry(long).or_insert(value);
        }
    }
    record
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: TimestampMs,
    pub component: String,
    pub level: LogLevel,
    pub message: String,
}

/// One tracked auction item, as the popup sees it
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    #[serde(rename = "articleId")]
    pub article_id: ArticleId,
    /// `None` for listings without an end time (buy-now only)
    #[serde(rename = "articleEndTime", default)]
    pub end_time_ms: Option<TimestampMs>,
    #[serde(rename = "articleBidPrice", default)]
    pub bid_price: Option<Amount>,
    #[serde(rename = "articleBuyPrice", default)]
    pub buy_price: Option<Amount>,
    #[serde(rename = "articleBidCount", default)]
    pub bid_count: Option<u32>,
    #[serde(rename = "articleMinimumBid", default)]
    pub minimum_bid: Option<Amount>,
    #[serde(rename = "articleShippingCost", default)]
    pub shipping_cost: Option<String>,
    #[serde(rename = "articleCurrency", default)]
    pub currency: Option<String>,
    #[serde(rename = "articleDescription", default)]
    pub description: Option<String>,
    #[serde(rename = "articleAuctionState", default)]
    pub auction_state: Option<Value>,
    #[serde(rename = "articleGroup", default)]
    pub group: Option<String>,
    #[serde(rename = "articleMaxBid", default)]
    pub max_bid: Option<Amount>,
    #[serde(rename = "articleAutoBid", default)]
    pub auto_bid: bool,
    #[serde(rename = "tabId", default)]
    pub tab_id: Option<TabId>,
    #[serde(rename = "tabOpenedForBidding", default)]
    pub tab_opened_for_bidding: bool,
    #[serde(skip)]
    pub log: Vec<LogEntry>,
}

impl ArticleRecord {
    pub fn new(article_id: impl Into<ArticleId>) -> Self {
        Self {
            article_id: article_id.into(),
            ..Default::default()
        }
    }

    /// Keep `max_bid` within `[minimum_bid, buy_price - 0.01]`
    pub fn clamp_max_bid(&mut self) {
        let Some(mut max_bid) = self.max_bid else {
            return;
        };

        if let Some(buy_price) = self.buy_price {
            let ceiling = round_cents(buy_price - 0.01);
            if max_bid > ceiling {
                max_bid = ceiling;
            }
        }
        if let Some(minimum_bid) = self.minimum_bid {
            if max_bid < minimum_bid {
                max_bid = minimum_bid;
            }
        }

        self.max_bid = Some(max_bid);
    }

    pub fn has_durable_preference(&self) -> bool {
        self.max_bid.is_some() || is_group_set(self.group.as_deref())
    }

    pub fn to_stored(&self) -> StoredArticle {
        StoredArticle {
            article_id: self.article_id.clone(),
            description: self.description.clone(),
            end_time_ms: self.end_time_ms,
            max_bid: self.max_bid,
            auto_bid: self.auto_bid,
            group: self.group.clone(),
            minimum_bid: self.minimum_bid,
            buy_price: self.buy_price,
            currency: self.currency.clone(),
        }
    }
}

fn is_group_set(group: Option<&str>) -> bool {
    matches!(group, Some(g) if !g.is_empty() && g != NO_GROUP)
}

fn round_cents(amount: Amount) -> Amount {
    (amount * 100.0).round() / 100.0
}

/// What we keep of an article in the synced tier
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredArticle {
    #[serde(rename = "articleId")]
    pub article_id: ArticleId,
    #[serde(rename = "articleDescription", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "articleEndTime", skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<TimestampMs>,
    #[serde(rename = "articleMaxBid")]
    pub max_bid: Option<Amount>,
    #[serde(rename = "articleAutoBid")]
    pub auto_bid: bool,
    #[serde(rename = "articleGroup")]
    pub group: Option<String>,
    #[serde(rename = "articleMinimumBid", skip_serializing_if = "Option::is_none")]
    pub minimum_bid: Option<Amount>,
    #[serde(rename = "articleBuyPrice", skip_serializing_if = "Option::is_none")]
    pub buy_price: Option<Amount>,
    #[serde(rename = "articleCurrency", skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// A partial article: only fields that are present get applied.
///
/// `max_bid` and `group` can be explicitly cleared, hence the double
/// `Option` (outer: present, inner: value or `null`). Other versions of
/// the extension share the synced tier, so a field of unexpected type is
/// dropped on its own rather than taking the rest of the record with it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ArticleUpdate {
    #[serde(rename = "articleId", default, deserialize_with = "storage::lenient")]
    pub article_id: Option<ArticleId>,
    #[serde(rename = "articleEndTime", default, deserialize_with = "storage::lenient")]
    pub end_time_ms: Option<TimestampMs>,
    #[serde(rename = "articleBidPrice", default, deserialize_with = "storage::lenient")]
    pub bid_price: Option<Amount>,
    #[serde(rename = "articleBuyPrice", default, deserialize_with = "storage::lenient")]
    pub buy_price: Option<Amount>,
    #[serde(rename = "articleBidCount", default, deserialize_with = "storage::lenient")]
    pub bid_count: Option<u32>,
    #[serde(rename = "articleMinimumBid", default, deserialize_with = "storage::lenient")]
    pub minimum_bid: Option<Amount>,
    #[serde(rename = "articleShippingCost", default, deserialize_with = "lenient_text")]
    pub shipping_cost: Option<String>,
    #[serde(rename = "articleCurrency", default, deserialize_with = "storage::lenient")]
    pub currency: Option<String>,
    #[serde(rename = "articleDescription", default, deserialize_with = "storage::lenient")]
    pub description: Option<String>,
    #[serde(rename = "articleAuctionState", default)]
    pub auction_state: Option<Value>,
    #[serde(rename = "articleGroup", default, deserialize_with = "storage::lenient_present")]
    pub group: Option<Option<String>>,
    #[serde(rename = "articleMaxBid", default, deserialize_with = "lenient_amount")]
    pub max_bid: Option<Option<Amount>>,
    #[serde(rename = "articleAutoBid", default, deserialize_with = "storage::lenient")]
    pub auto_bid: Option<bool>,
}

impl ArticleUpdate {
    /// Parse a raw record (tab push or storage read), migrating legacy keys
    pub fn from_value(value: Value) -> Result<Self> {
        let value = match value {
            Value::Object(map) => Value::Object(migrate_legacy_keys(map)),
            other => other,
        };
        Ok(serde_json::from_value(value)?)
    }

    pub fn has_durable_preference(&self) -> bool {
        self.max_bid.flatten().is_some() || is_group_set(self.group.as_ref().and_then(|g| g.as_deref()))
    }
}

/// Shipping cost is free text ("4,90 EUR", "Abholung"); bare numbers are
/// kept as their text.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        other => {
            warn!(%other, "ignoring malformed shipping cost");
            None
        }
    })
}

/// Accepts numbers, `null` and locale formatted strings like `"10,50"`.
///
/// A string that still doesn't parse is dropped (field treated as absent).
fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<Option<Amount>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match parse_amount(&value) {
        Ok(amount) => Some(amount),
        Err(raw) => {
            warn!(%raw, "ignoring unparseable max bid");
            None
        }
    })
}

/// Parse a user supplied amount; `Err` carries the raw input
pub fn parse_amount(value: &Value) -> Result<Option<Amount>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| n.to_string()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .replace(',', ".")
            .parse::<Amount>()
            .ok()
            .filter(|a| a.is_finite())
            .map(Some)
            .ok_or_else(|| s.clone()),
        other => Err(other.to_string()),
    }
}
