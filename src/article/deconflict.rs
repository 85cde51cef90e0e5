//! Bid time deconfliction
//!
//! When several tracked auctions end (almost) at the same time, bidding on
//! all of them in the last second could win more than one. Instead each of
//! them gets its own bid time, a fixed stagger apart. Every window computes
//! this on its own, so the result must only depend on the article set.
use super::*;
use crate::config::Config;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeconflictPolicy {
    /// Auctions ending closer than this are in conflict
    pub window_ms: i64,
    pub stagger_ms: i64,
}

impl Default for DeconflictPolicy {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            stagger_ms: 2_000,
        }
    }
}

impl From<&Config> for DeconflictPolicy {
    fn from(config: &Config) -> Self {
        Self {
            window_ms: config.deconflict_window_ms,
            stagger_ms: config.deconflict_stagger_ms,
        }
    }
}

/// Numeric ids sort numerically (and before any non-numeric id), the rest
/// lexicographically.
pub fn cmp_article_ids(a: ArticleIdRef, b: ArticleIdRef) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// The time at which to bid on `article`, given everything tracked.
///
/// `None` for articles without an end time.
pub fn adjusted_bid_time<'a>(
    article: &ArticleRecord,
    tracked: impl IntoIterator<Item = &'a ArticleRecord>,
    policy: DeconflictPolicy,
) -> Option<TimestampMs> {
    let end_time = article.end_time_ms?;
    let window_ms = u64::try_from(policy.window_ms).unwrap_or(0);

    let mut conflicting: Vec<ArticleIdRef> = tracked
        .into_iter()
        .filter(|other| other.article_id != article.article_id)
        .filter(|other| {
            other
                .end_time_ms
                .map(|other_end| other_end.abs_diff(end_time) <= window_ms)
                .unwrap_or(false)
        })
        .map(|other| other.article_id.as_str())
        .collect();

    if conflicting.is_empty() {
        return Some(end_time);
    }

    conflicting.push(&article.article_id);
    conflicting.sort_by(|a, b| cmp_article_ids(a, b));
    conflicting.dedup();

    let rank = conflicting
        .iter()
        .position(|id| *id == article.article_id)
        .unwrap_or(0) as i64;

    // end times come from tabs and storage, anything goes
    Some(end_time.saturating_sub(rank.saturating_mul(policy.stagger_ms)))
}
