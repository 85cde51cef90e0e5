//! Talking to content scripts in auction tabs
//!
//! A tab may not be ready to answer yet (still loading, no listener
//! registered), so everything we send goes through `send_with_retry`.
use crate::{
    article::{ArticleId, StoredArticle},
    config::MessagingConfig,
    error::MessagingError,
};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;

mod stdio;
pub use self::stdio::*;

pub type TabId = i32;

/// Messages the popup sends to content scripts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum TabCommand {
    /// Ask the tab to push its article state
    GetArticleInfo,
    /// Max bid / auto bid changed in the popup
    UpdateArticleMaxBid {
        #[serde(rename = "articleId")]
        article_id: ArticleId,
        detail: StoredArticle,
    },
}

#[async_trait]
pub trait TabMessenger: Send + Sync {
    async fn send_message(&self, tab_id: TabId, command: &TabCommand) -> Result<Value>;
}

pub type SharedTabMessenger = Arc<dyn TabMessenger + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub max_jitter: Duration,
}

impl From<&MessagingConfig> for RetryPolicy {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_retries: config.max_retries,
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(self.max_retries)))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

pub async fn send_with_retry(
    messenger: &dyn TabMessenger,
    tab_id: TabId,
    command: &TabCommand,
    policy: RetryPolicy,
) -> Result<Value> {
    let mut retry = 0;
    loop {
        match messenger.send_message(tab_id, command).await {
            Ok(response) => return Ok(response),
            Err(e) if retry < policy.max_retries => {
                let delay = policy.backoff(retry) + policy.jitter();
                debug!(tab_id, retry, ?delay, error = %e, "tab not answering, retrying");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => {
                return Err(MessagingError::RetriesExhausted {
                    tab_id,
                    attempts: retry + 1,
                    last_error: e.to_string(),
                }
                .into())
            }
        }
    }
}
