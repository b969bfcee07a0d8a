use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ChaosConfig, PartialChaosConfig, STORAGE_KEY};
use crate::storage::KeyValueStore;

type Listener = Arc<dyn Fn(&ChaosConfig) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// The shared source of truth for [`ChaosConfig`].
///
/// Construct one per process and hand it to every consumer by `Arc`.
/// Listeners are invoked synchronously, after persistence, with the full
/// new config.
pub struct ConfigStore {
    storage: Arc<dyn KeyValueStore>,
    config: RwLock<ChaosConfig>,
    listeners: Arc<Mutex<Listeners>>,
}

/// Handle returned by [`ConfigStore::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            config: RwLock::new(ChaosConfig::default()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Read the persisted config and merge it over the defaults.
    ///
    /// Missing or corrupt data yields the defaults, which are then stored.
    /// A failing read yields the defaults without touching storage.
    pub async fn load(&self) -> ChaosConfig {
        let loaded = match self.storage.get(STORAGE_KEY).await {
            Ok(Some(raw)) => match ChaosConfig::from_stored(&raw) {
                Some(config) => config,
                None => {
                    warn!("stored chaos config is not an object; resetting to defaults");
                    self.store_defaults().await
                }
            },
            Ok(None) => {
                debug!("no stored chaos config; writing defaults");
                self.store_defaults().await
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to read chaos config; using defaults");
                ChaosConfig::default()
            }
        };

        *self.config.write() = loaded.clone();
        loaded
    }

    async fn store_defaults(&self) -> ChaosConfig {
        let config = ChaosConfig::default();
        self.persist(&config).await;
        config
    }

    /// Merge `partial` into the current config, persist, then notify.
    ///
    /// A persistence failure is logged; the in-memory update still applies.
    pub async fn update(&self, partial: PartialChaosConfig) {
        let merged = {
            let mut current = self.config.write();
            *current = current.merged(&partial);
            current.clone()
        };

        self.persist(&merged).await;
        self.notify(&merged);
    }

    /// Apply a raw value written to storage by another context.
    pub fn on_external_change(&self, raw: &Value) {
        let Some(config) = ChaosConfig::from_stored(raw) else {
            warn!("ignoring external chaos config change that is not an object");
            return;
        };

        *self.config.write() = config.clone();
        self.notify(&config);
    }

    pub fn current(&self) -> ChaosConfig {
        self.config.read().clone()
    }

    pub fn subscribe(&self, listener: impl Fn(&ChaosConfig) + Send + Sync + 'static) -> Subscription {
        let listener: Listener = Arc::new(listener);
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, listener));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    async fn persist(&self, config: &ChaosConfig) {
        let value = match serde_json::to_value(config) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to serialize chaos config");
                return;
            }
        };

        if let Err(err) = self.storage.set(STORAGE_KEY, value).await {
            warn!(error = %format!("{err:#}"), "failed to persist chaos config");
        }
    }

    fn notify(&self, config: &ChaosConfig) {
        // Listeners may call back into the store, so the lock is released first.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(config);
        }
    }
}
