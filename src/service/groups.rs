//! Per-group auto-bid flags
//!
//! Toggles are read-then-write and not atomic. They come from clicks, so
//! two of them racing each other is not something we guard against.
use crate::{
    article::NO_GROUP,
    storage::{self, SharedSettingsStore},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Group map key in the synced tier
pub const GROUPS_KEY: &str = "autoBidGroups";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    #[serde(default)]
    pub auto_bid: bool,
}

pub type GroupAutoBidMap = BTreeMap<String, GroupState>;

/// Missing and empty group names mean "no group"
pub fn normalize_group(group: Option<&str>) -> &str {
    match group {
        None | Some("") => NO_GROUP,
        Some(group) => group,
    }
}

pub struct GroupRegistry {
    synced: SharedSettingsStore,
}

pub type SharedGroupRegistry = Arc<GroupRegistry>;

impl GroupRegistry {
    pub fn new(synced: SharedSettingsStore) -> Self {
        Self { synced }
    }

    pub fn new_shared(synced: SharedSettingsStore) -> SharedGroupRegistry {
        Arc::new(Self::new(synced))
    }

    pub async fn groups(&self) -> Result<GroupAutoBidMap> {
        Ok(storage::load(&*self.synced, GROUPS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_state(&self, group: Option<&str>) -> Result<bool> {
        Ok(self
            .groups()
            .await?
            .get(normalize_group(group))
            .map(|state| state.auto_bid)
            .unwrap_or(false))
    }

    /// Returns whether anything was written
    pub async fn set_state(&self, group: Option<&str>, auto_bid: bool) -> Result<bool> {
        let group = normalize_group(group);
        let mut groups = self.groups().await?;

        let state = groups.entry(group.to_owned()).or_default();
        if state.auto_bid == auto_bid {
            return Ok(false);
        }
        state.auto_bid = auto_bid;

        storage::save(&*self.synced, GROUPS_KEY, &groups).await?;
        debug!(%group, auto_bid, "group auto-bid set");
        Ok(true)
    }

    /// Flip the flag, returning the new value
    pub async fn toggle_state(&self, group: Option<&str>) -> Result<bool> {
        let auto_bid = !self.get_state(group).await?;
        self.set_state(group, auto_bid).await?;
        Ok(auto_bid)
    }
}
