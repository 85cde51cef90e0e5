//! Settings storage traits
//!
//! The browser gives us two key-value tiers: a small one synchronized
//! across all windows (and devices) of the user, and a larger local one
//! that never leaves this browser. Both look the same from here, so every
//! tier is just one `SettingsStore` instance.
//!
//! Nothing in here is transactional: there is no compare-and-swap and no
//! multi-key atomicity. Whoever writes last wins.
mod in_memory;

pub use self::in_memory::*;

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Synced,
    Local,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Synced => "sync",
            Tier::Local => "local",
        })
    }
}

/// Which keys to `get`
#[derive(Clone, Copy, Debug)]
pub enum Keys<'a> {
    One(&'a str),
    Many(&'a [&'a str]),
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageChange {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

pub type StorageChanges = BTreeMap<String, StorageChange>;

/// Fired for every mutation, including the ones we made ourselves
#[derive(Clone, Debug)]
pub struct ChangeNotification {
    pub tier: Tier,
    pub changes: StorageChanges,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get(&self, keys: Keys<'_>) -> Result<BTreeMap<String, Value>>;
    async fn set(&self, items: BTreeMap<String, Value>) -> Result<()>;
    async fn remove(&self, keys: &[&str]) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}

pub type SharedSettingsStore = Arc<dyn SettingsStore + Send + Sync + 'static>;

/// Decode a stored value, treating anything malformed as absent.
///
/// Other versions of the extension write to the same synced tier, so a
/// record we can't parse is not our problem to fail on. Values stored as
/// JSON text are accepted too.
pub fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    if value.is_null() {
        return None;
    }

    let text = value.as_str().map(ToOwned::to_owned);
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => match text.map(|t| serde_json::from_str(&t)) {
            Some(Ok(v)) => Some(v),
            _ => {
                warn!(%key, error = %e, "ignoring malformed stored value");
                None
            }
        },
    }
}

/// `deserialize_with` helper: a field of unexpected type is dropped
/// (treated as absent) instead of failing the whole record.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(decode_field(&value))
}

/// [`lenient`] for fields with a natural default
pub fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

/// Like [`lenient`], but keeps an explicit `null` apart from absence:
/// `Some(None)` is a cleared field, `None` a missing or malformed one.
pub fn lenient_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(Some(None));
    }
    Ok(decode_field(&value).map(Some))
}

fn decode_field<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(%value, error = %e, "ignoring malformed field");
            None
        }
    }
}

/// Load and decode a single key
pub async fn load<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str) -> Result<Option<T>> {
    let mut items = store.get(Keys::One(key)).await?;
    Ok(items.remove(key).and_then(|value| decode(key, value)))
}

/// Encode and store a single key
pub async fn save<T: Serialize>(store: &dyn SettingsStore, key: &str, value: &T) -> Result<()> {
    store
        .set(BTreeMap::from([(key.to_owned(), serde_json::to_value(value)?)]))
        .await
}
