use crate::infrastructure::error::InfraError;
use crate::infrastructure::key_value_store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

pub const SETTINGS_KEY: &str = "settings";
pub const CLOUD_SETTINGS_KEY: &str = "cloud_settings";

const BUS_CAPACITY: usize = 64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// Cell that performed the write.
    pub origin: u64,
}

/// Change notifications between cells backed by the same storage.
#[derive(Debug, Clone)]
pub struct StorageBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl Default for StorageBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl StorageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: StorageEvent) {
        // No receivers is fine: nobody else is watching.
        let _ = self.sender.send(event);
    }
}

type Subscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Observable value persisted as JSON under one storage key.
///
/// Every `set` writes through to storage and notifies subscribers. Cells that
/// share a [`StorageBus`] pick up each other's writes through
/// [`apply_pending_events`](Self::apply_pending_events) or a listener task;
/// an incoming value equal to the current one is ignored, so notifications
/// never echo back and forth. Subscribers must not write to the cell that is
/// notifying them.
pub struct PersistentCell<T> {
    key: String,
    storage: Arc<dyn KeyValueStore>,
    value: RwLock<T>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    origin: u64,
    bus: Option<StorageBus>,
    pending: Option<Mutex<broadcast::Receiver<StorageEvent>>>,
}

impl<T> PersistentCell<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(
        key: impl Into<String>,
        storage: Arc<dyn KeyValueStore>,
        default: T,
    ) -> Result<Self, InfraError> {
        Self::build(key.into(), storage, default, None)
    }

    pub fn with_bus(
        key: impl Into<String>,
        storage: Arc<dyn KeyValueStore>,
        default: T,
        bus: &StorageBus,
    ) -> Result<Self, InfraError> {
        Self::build(key.into(), storage, default, Some(bus.clone()))
    }

    fn build(
        key: String,
        storage: Arc<dyn KeyValueStore>,
        default: T,
        bus: Option<StorageBus>,
    ) -> Result<Self, InfraError> {
        // An unreadable stored value is left in place until the next `set`.
        let (initial, readable) = match storage.get_item(&key)? {
            Some(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => (value, true),
                Err(error) => {
                    tracing::warn!(%key, %error, "stored value unreadable, using default");
                    (default, false)
                }
            },
            None => (default, true),
        };

        let pending = bus.as_ref().map(|bus| Mutex::new(bus.subscribe()));
        let cell = Self {
            key,
            storage,
            value: RwLock::new(initial.clone()),
            subscribers: Mutex::new(Vec::new()),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
            bus,
            pending,
        };
        if readable {
            cell.persist(&initial)?;
        }
        Ok(cell)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> T {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: T) -> Result<(), InfraError> {
        self.persist(&value)?;
        self.replace(value);
        if let Some(bus) = &self.bus {
            bus.publish(StorageEvent {
                key: self.key.clone(),
                origin: self.origin,
            });
        }
        Ok(())
    }

    pub fn update(&self, change: impl FnOnce(&mut T)) -> Result<T, InfraError> {
        let mut value = self.get();
        change(&mut value);
        self.set(value.clone())?;
        Ok(value)
    }

    /// Registers `subscriber` and immediately calls it with the current value.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) {
        subscriber(&self.get());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(subscriber));
    }

    /// Re-reads storage and applies the stored value if it differs.
    /// A missing key leaves the cell untouched.
    pub fn rehydrate(&self) -> Result<bool, InfraError> {
        let Some(raw) = self.storage.get_item(&self.key)? else {
            return Ok(false);
        };
        let incoming: T = serde_json::from_str(&raw)?;
        if incoming == self.get() {
            return Ok(false);
        }
        tracing::debug!(key = %self.key, "applying value written by another context");
        self.replace(incoming);
        Ok(true)
    }

    pub fn handle_storage_event(&self, event: &StorageEvent) -> Result<bool, InfraError> {
        if event.key != self.key || event.origin == self.origin {
            return Ok(false);
        }
        self.rehydrate()
    }

    /// Drains queued bus notifications. Returns how many changed the value.
    pub fn apply_pending_events(&self) -> Result<usize, InfraError> {
        let Some(pending) = &self.pending else {
            return Ok(0);
        };
        let mut receiver = pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut applied = 0;
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    if self.handle_storage_event(&event)? {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(key = %self.key, skipped, "storage notifications dropped");
                    if self.rehydrate()? {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        Ok(applied)
    }

    /// Background task applying bus notifications as they arrive. Ends once
    /// the cell is dropped or the bus closes.
    pub fn spawn_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self.bus.as_ref()?.subscribe();
        let cell = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => Some(event),
                    Err(RecvError::Lagged(_)) => None,
                    Err(RecvError::Closed) => break,
                };
                let Some(cell) = cell.upgrade() else {
                    break;
                };
                let result = match event {
                    Some(event) => cell.handle_storage_event(&event),
                    None => cell.rehydrate(),
                };
                if let Err(error) = result {
                    tracing::warn!(key = %cell.key, %error, "failed to apply storage notification");
                }
            }
        }))
    }

    fn persist(&self, value: &T) -> Result<(), InfraError> {
        let json = serde_json::to_value(value)?;
        if json.is_null() {
            self.storage.remove_item(&self.key)
        } else {
            self.storage.set_item(&self.key, &json.to_string())
        }
    }

    fn replace(&self, value: T) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value.clone();
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter() {
            subscriber(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CloudSettings, Settings};
    use crate::infrastructure::key_value_store::{InMemoryKeyValueStore, SqliteKeyValueStore};
    use crate::infrastructure::storage::initialize_database;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn shared_storage() -> Arc<dyn KeyValueStore> {
        Arc::new(InMemoryKeyValueStore::default())
    }

    #[test]
    fn hydrates_from_storage_or_default() {
        let storage = shared_storage();
        storage
            .set_item(SETTINGS_KEY, r#"{"name": "Stored"}"#)
            .expect("seed storage");

        let stored = PersistentCell::new(SETTINGS_KEY, Arc::clone(&storage), Settings::default())
            .expect("cell from storage");
        assert_eq!(stored.get().name, "Stored");

        let fresh = PersistentCell::new(CLOUD_SETTINGS_KEY, Arc::clone(&storage), CloudSettings::default())
            .expect("cell from default");
        assert_eq!(fresh.get(), CloudSettings::default());
        assert!(storage.get_item(CLOUD_SETTINGS_KEY).expect("get").is_some());
    }

    #[test]
    fn unreadable_stored_value_falls_back_to_default() {
        let storage = shared_storage();
        storage.set_item(SETTINGS_KEY, "{broken").expect("seed storage");

        let cell = PersistentCell::new(SETTINGS_KEY, Arc::clone(&storage), Settings::default())
            .expect("cell");
        assert_eq!(cell.get(), Settings::default());
        assert_eq!(
            storage.get_item(SETTINGS_KEY).expect("get").as_deref(),
            Some("{broken")
        );

        cell.update(|settings| settings.name = "Replaced".to_string())
            .expect("explicit write");
        assert!(storage
            .get_item(SETTINGS_KEY)
            .expect("get")
            .is_some_and(|raw| raw.contains("Replaced")));
    }

    #[test]
    fn null_fields_in_stored_settings_keep_the_rest() {
        let storage = shared_storage();
        storage
            .set_item(
                SETTINGS_KEY,
                r#"{"name":"Ada","company":"Initech","projects":["P1"],"tags":[],"ics_url":null,"gitlab_access_token":null}"#,
            )
            .expect("seed storage");

        let cell = PersistentCell::new(SETTINGS_KEY, Arc::clone(&storage), Settings::default())
            .expect("cell");
        let settings = cell.get();

        assert_eq!(settings.name, "Ada");
        assert_eq!(settings.company, "Initech");
        assert_eq!(settings.projects, vec!["P1".to_string()]);
        assert_eq!(settings.ics_url, "");
        assert!(storage
            .get_item(SETTINGS_KEY)
            .expect("get")
            .is_some_and(|raw| raw.contains("Ada")));
    }

    #[test]
    fn null_value_removes_key() {
        let storage = shared_storage();
        let cell = PersistentCell::new("maybe", Arc::clone(&storage), Some(3_u32)).expect("cell");
        assert_eq!(storage.get_item("maybe").expect("get").as_deref(), Some("3"));

        cell.set(None).expect("set none");
        assert!(storage.get_item("maybe").expect("get").is_none());
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn subscribers_see_current_value_then_every_change() {
        let cell = PersistentCell::new("counter", shared_storage(), 1_u32).expect("cell");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cell.subscribe(move |value| sink.lock().expect("lock").push(*value));

        cell.set(2).expect("set");
        cell.update(|value| *value += 5).expect("update");

        assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 7]);
    }

    #[test]
    fn cells_sharing_storage_converge_after_notification() {
        let storage = shared_storage();
        let bus = StorageBus::new();
        let first = PersistentCell::with_bus(SETTINGS_KEY, Arc::clone(&storage), Settings::default(), &bus)
            .expect("first");
        let second = PersistentCell::with_bus(SETTINGS_KEY, Arc::clone(&storage), Settings::default(), &bus)
            .expect("second");
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        second.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        first
            .update(|settings| settings.company = "Initech".to_string())
            .expect("update first");

        assert_eq!(second.get().company, "");
        assert_eq!(second.apply_pending_events().expect("apply"), 1);
        assert_eq!(second.get().company, "Initech");
        assert_eq!(first.apply_pending_events().expect("own event"), 0);
        // one call on subscribe, one for the applied change
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn identical_incoming_value_is_not_reapplied() {
        let storage = shared_storage();
        let bus = StorageBus::new();
        let first = PersistentCell::with_bus("n", Arc::clone(&storage), 1_u32, &bus).expect("first");
        let second = PersistentCell::with_bus("n", Arc::clone(&storage), 1_u32, &bus).expect("second");

        first.set(4).expect("set");
        second.set(4).expect("set same value");

        assert_eq!(second.apply_pending_events().expect("apply"), 0);
        assert_eq!(first.apply_pending_events().expect("apply"), 0);
        assert_eq!(first.get(), 4);
    }

    #[test]
    fn other_keys_are_ignored() {
        let storage = shared_storage();
        let bus = StorageBus::new();
        let settings = PersistentCell::with_bus(SETTINGS_KEY, Arc::clone(&storage), Settings::default(), &bus)
            .expect("settings");
        let cloud = PersistentCell::with_bus(
            CLOUD_SETTINGS_KEY,
            Arc::clone(&storage),
            CloudSettings::default(),
            &bus,
        )
        .expect("cloud");

        cloud
            .set(CloudSettings {
                cloud_url: "https://sheets.example.com".to_string(),
                cloud_api_key: "k".to_string(),
            })
            .expect("set cloud");

        assert_eq!(settings.apply_pending_events().expect("apply"), 0);
    }

    #[test]
    fn sqlite_backed_cells_converge() {
        let path = std::env::temp_dir().join(format!(
            "timesheet-cell-test-{}.sqlite",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        initialize_database(&path).expect("initialize database");
        let bus = StorageBus::new();
        let first = PersistentCell::with_bus(
            CLOUD_SETTINGS_KEY,
            Arc::new(SqliteKeyValueStore::new(&path)),
            CloudSettings::default(),
            &bus,
        )
        .expect("first");
        let second = PersistentCell::with_bus(
            CLOUD_SETTINGS_KEY,
            Arc::new(SqliteKeyValueStore::new(&path)),
            CloudSettings::default(),
            &bus,
        )
        .expect("second");

        let updated = first
            .update(|cloud| cloud.cloud_api_key = "fresh".to_string())
            .expect("update");
        second.apply_pending_events().expect("apply");

        assert_eq!(second.get(), updated);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn listener_task_applies_remote_writes() {
        let storage = shared_storage();
        let bus = StorageBus::new();
        let writer = PersistentCell::with_bus("n", Arc::clone(&storage), 0_u32, &bus).expect("writer");
        let reader =
            Arc::new(PersistentCell::with_bus("n", Arc::clone(&storage), 0_u32, &bus).expect("reader"));
        let handle = reader.spawn_listener().expect("listener");

        writer.set(9).expect("set");

        let observed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if reader.get() == 9 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        handle.abort();
        assert!(observed.is_ok());
    }
}
