use crate::error::Result;
use accounting::{Accountant, ChangeHook, MigrationReport, SNAPSHOT_VERSION, StateChange, StoreSnapshot};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

/// Durable home of the accounting state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<(StoreSnapshot, MigrationReport)>>;

    async fn save(&self, snapshot: &StoreSnapshot) -> Result<()>;
}

/// Whole-state JSON file, replaced atomically on every save.
///
/// Records loaded without a last reset instant are placed in the billing
/// cycle, under `offset`, that contains the load time.
pub struct JsonFileStore {
    path: PathBuf,
    offset: FixedOffset,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<(StoreSnapshot, MigrationReport)>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (snapshot, report) = StoreSnapshot::from_json_str(&content, Utc::now(), &self.offset)?;
        Ok(Some((snapshot, report)))
    }

    async fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let content = snapshot.to_json_pretty()?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// Load the stored state, starting empty when there is none or it cannot
/// be read. The flag is set when the state should be written back in the
/// current format.
pub async fn load_or_empty(store: &dyn SnapshotStore) -> (StoreSnapshot, bool) {
    match store.load().await {
        Ok(Some((snapshot, report))) => {
            info!("Loaded {} tracked entities", report.loaded);
            if report.from_version != SNAPSHOT_VERSION {
                info!(
                    "Migrated stored state from version {} to {}",
                    report.from_version, SNAPSHOT_VERSION
                );
            }
            if !report.skipped.is_empty() {
                warn!("Skipped unreadable records: {:?}", report.skipped);
            }
            if !report.repaired.is_empty() {
                warn!("Repaired records: {:?}", report.repaired);
            }
            let rewrite = !report.is_clean();
            (snapshot, rewrite)
        }
        Ok(None) => {
            info!("No stored state found, starting with an empty store");
            (StoreSnapshot::default(), false)
        }
        Err(e) => {
            error!("Failed to load stored state, starting with an empty store: {}", e);
            (StoreSnapshot::default(), false)
        }
    }
}

/// Change hook that wakes the [`Persister`].
///
/// Bursts of changes collapse into a single pending wake-up.
pub struct FlushSignal {
    notify: Arc<Notify>,
}

impl FlushSignal {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

impl ChangeHook for FlushSignal {
    fn state_changed(&self, change: &StateChange) {
        debug!("State changed ({:?}), scheduling save", change);
        self.notify.notify_one();
    }
}

/// Writes the accountant's state to the store whenever it is signalled.
pub struct Persister {
    accountant: Arc<Accountant>,
    store: Arc<dyn SnapshotStore>,
    notify: Arc<Notify>,
}

impl Persister {
    pub fn new(
        accountant: Arc<Accountant>,
        store: Arc<dyn SnapshotStore>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            accountant,
            store,
            notify,
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            self.flush().await;
        }
    }

    /// Save the current state. Failures are logged and the in-memory state
    /// is kept as is.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> bool {
        let snapshot = self.accountant.snapshot();
        match self.store.save(&snapshot).await {
            Ok(()) => {
                debug!("Saved {} tracked entities", snapshot.entities.len());
                true
            }
            Err(e) => {
                error!("Failed to save state: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use accounting::{NetCounters, NoopHook, TrafficReport};
    use chrono::{Offset, TimeZone, Utc};
    use std::time::Duration;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 20, 12, 0, 0).unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn load(&self) -> Result<Option<(StoreSnapshot, MigrationReport)>> {
            Err(ServerError::Io(std::io::Error::other("disk on fire")))
        }

        async fn save(&self, _snapshot: &StoreSnapshot) -> Result<()> {
            Err(ServerError::Io(std::io::Error::other("disk on fire")))
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"), Utc.fix());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(
            dir.path().join("nested").join("state.json"),
            Utc.fix(),
        );

        let accountant = Accountant::new(Utc.fix(), Arc::new(NoopHook));
        accountant
            .ingest(TrafficReport::new("srv1", 0, 0), now())
            .unwrap();
        accountant
            .ingest(TrafficReport::new("srv1", 300, 400), now())
            .unwrap();
        let snapshot = accountant.snapshot();

        store.save(&snapshot).await.unwrap();
        assert!(!store.temp_path().exists());

        let (loaded, report) = store.load().await.unwrap().unwrap();
        assert!(report.is_clean());
        assert_eq!(loaded, snapshot);
        assert_eq!(
            loaded.entities["srv1"].accumulated,
            NetCounters::new(300, 400)
        );
    }

    #[tokio::test]
    async fn legacy_file_is_migrated_and_flagged_for_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_data.json");
        tokio::fs::write(
            &path,
            r#"{"srv1": {"id": "srv1", "rawTotalNet": {"up": 1, "down": 2}, "totalNet": {"up": 3, "down": 4}}}"#,
        )
        .await
        .unwrap();

        let store = JsonFileStore::new(&path, Utc.fix());
        let (snapshot, rewrite) = load_or_empty(&store).await;

        assert!(rewrite);
        assert_eq!(
            snapshot.entities["srv1"].accumulated,
            NetCounters::new(3, 4)
        );
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_data.json");
        tokio::fs::write(&path, "{ definitely not json").await.unwrap();

        let (snapshot, rewrite) = load_or_empty(&JsonFileStore::new(&path, Utc.fix())).await;
        assert!(snapshot.entities.is_empty());
        assert!(!rewrite);

        let (snapshot, _) = load_or_empty(&FailingStore).await;
        assert!(snapshot.entities.is_empty());
    }

    #[tokio::test]
    async fn failed_save_keeps_in_memory_state() {
        let notify = Arc::new(Notify::new());
        let accountant = Arc::new(Accountant::new(
            Utc.fix(),
            Arc::new(FlushSignal::new(notify.clone())),
        ));
        let persister = Persister::new(accountant.clone(), Arc::new(FailingStore), notify);

        accountant
            .ingest(TrafficReport::new("srv1", 0, 0), now())
            .unwrap();
        assert!(!persister.flush().await);
        assert!(accountant.get("srv1").is_some());
    }

    #[tokio::test]
    async fn changes_trigger_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let notify = Arc::new(Notify::new());
        let accountant = Arc::new(Accountant::new(
            Utc.fix(),
            Arc::new(FlushSignal::new(notify.clone())),
        ));
        let persister = Arc::new(Persister::new(
            accountant.clone(),
            Arc::new(JsonFileStore::new(&path, Utc.fix())),
            notify,
        ));
        let handle = tokio::spawn(persister.clone().run());

        accountant
            .ingest(TrafficReport::new("srv1", 10, 20), now())
            .unwrap();

        let store = JsonFileStore::new(&path, Utc.fix());
        let mut saved = None;
        for _ in 0..100 {
            if let Ok(Some((snapshot, _))) = store.load().await
                && snapshot.entities.contains_key("srv1")
            {
                saved = Some(snapshot);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        let saved = saved.expect("state was never saved");
        assert_eq!(
            saved.entities["srv1"].raw_counters,
            NetCounters::new(10, 20)
        );
    }
}
