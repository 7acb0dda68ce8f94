use crate::api::ApiServer;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::persistence::{self, FlushSignal, JsonFileStore, Persister, SnapshotStore};
use crate::scheduler::ResetScheduler;
use accounting::Accountant;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

pub struct TrafficServer {
    config: Arc<ServerConfig>,
    accountant: Arc<Accountant>,
    persister: Arc<Persister>,
}

impl TrafficServer {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let config = Arc::new(config);
        let offset = config
            .billing_offset()
            .map_err(|e| ServerError::Configuration(format!("{:#}", e)))?;

        // Restore state, migrating older layouts
        let store: Arc<dyn SnapshotStore> =
            Arc::new(JsonFileStore::new(&config.data_file, offset));
        let (snapshot, rewrite) = persistence::load_or_empty(store.as_ref()).await;

        let notify = Arc::new(Notify::new());
        let accountant = Arc::new(Accountant::from_snapshot(
            snapshot,
            offset,
            Arc::new(FlushSignal::new(notify.clone())),
        ));
        let persister = Arc::new(Persister::new(accountant.clone(), store, notify.clone()));

        if rewrite {
            notify.notify_one();
        }

        info!(
            "Tracking {} entities, billing offset {}",
            accountant.len(),
            offset
        );

        Ok(Self {
            config,
            accountant,
            persister,
        })
    }

    pub async fn run(self) -> Result<()> {
        let scheduler = ResetScheduler::new(
            self.accountant.clone(),
            Duration::from_secs(self.config.reset_check_interval_secs),
        );
        let scheduler_handle = tokio::spawn(scheduler.run());
        let persister_handle = tokio::spawn(self.persister.clone().run());

        let api_server = ApiServer::new(self.config.clone(), self.accountant.clone());

        let result = tokio::select! {
            result = api_server.run() => {
                if let Err(e) = &result {
                    error!("API server error: {}", e);
                }
                result
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        };

        scheduler_handle.abort();
        persister_handle.abort();

        // Last write so nothing accepted before shutdown is lost
        self.persister.flush().await;
        info!("Traffic server stopped");

        result
    }
}
