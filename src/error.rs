use crate::{article::ArticleId, service::messaging::TabId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("article {article_id} is already bound to tab {bound_tab}, refusing to bind tab {requested_tab}")]
    TabConflict {
        article_id: ArticleId,
        bound_tab: TabId,
        requested_tab: TabId,
    },
    #[error("unknown article: {0}")]
    UnknownArticle(ArticleId),
    #[error("destructive operation requires confirmation")]
    NotConfirmed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("tab {tab_id} did not answer after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        tab_id: TabId,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
