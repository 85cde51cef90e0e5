use super::*;
use anyhow::bail;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Fake in-memory settings tier.
///
/// Useful for unit-tests, and shared between several "windows" (contexts)
/// to stand in for the synced tier.
pub struct InMemorySettingsStore {
    tier: Tier,
    items: Mutex<BTreeMap<String, Value>>,
    changes: broadcast::Sender<ChangeNotification>,
    fail_writes: AtomicBool,
}

impl InMemorySettingsStore {
    pub fn new(tier: Tier) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tier,
            items: Mutex::new(BTreeMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn new_shared(tier: Tier) -> Arc<Self> {
        Arc::new(Self::new(tier))
    }

    /// Make every following mutation fail, like a flaky network would
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.items.lock().clone()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("{} storage unavailable", self.tier);
        }
        Ok(())
    }

    fn notify(&self, changes: StorageChanges) {
        if changes.is_empty() {
            return;
        }
        // nobody listening is fine
        let _ = self.changes.send(ChangeNotification {
            tier: self.tier,
            changes,
        });
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn get(&self, keys: Keys<'_>) -> Result<BTreeMap<String, Value>> {
        let items = self.items.lock();
        Ok(match keys {
            Keys::All => items.clone(),
            Keys::One(key) => items
                .get(key)
                .map(|v| BTreeMap::from([(key.to_owned(), v.clone())]))
                .unwrap_or_default(),
            Keys::Many(keys) => keys
                .iter()
                .filter_map(|key| items.get(*key).map(|v| ((*key).to_owned(), v.clone())))
                .collect(),
        })
    }

    async fn set(&self, new_items: BTreeMap<String, Value>) -> Result<()> {
        self.ensure_writable()?;

        let changes = {
            let mut items = self.items.lock();
            new_items
                .into_iter()
                .map(|(key, value)| {
                    let old_value = items.insert(key.clone(), value.clone());
                    (
                        key,
                        StorageChange {
                            old_value,
                            new_value: Some(value),
                        },
                    )
                })
                .collect()
        };
        self.notify(changes);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        self.ensure_writable()?;

        let changes = {
            let mut items = self.items.lock();
            keys.iter()
                .filter_map(|key| {
                    items.remove(*key).map(|old| {
                        (
                            (*key).to_owned(),
                            StorageChange {
                                old_value: Some(old),
                                new_value: None,
                            },
                        )
                    })
                })
                .collect()
        };
        self.notify(changes);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_writable()?;

        let changes = std::mem::take(&mut *self.items.lock())
            .into_iter()
            .map(|(key, old)| {
                (
                    key,
                    StorageChange {
                        old_value: Some(old),
                        new_value: None,
                    },
                )
            })
            .collect();
        self.notify(changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }
}
