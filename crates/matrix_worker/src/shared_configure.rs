//! Read-through store of Gateway-owned shared configurations.

use dashmap::DashMap;
use matrix_protocol::defaults::SPLIT;
use matrix_protocol::{EventType, PayloadType, SharedConfigure};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::client::IntranetClient;

/// Invoked when the Gateway pushes a configure change; the application
/// refreshes whatever subsystems depend on the record.
pub type ConfigureChangeHandler = Arc<dyn Fn(&SharedConfigure) + Send + Sync>;

pub struct SharedConfigureStore {
    client: Arc<IntranetClient>,
    gateway: String,
    configures: DashMap<String, Arc<SharedConfigure>>,
    change_handler: RwLock<Option<ConfigureChangeHandler>>,
}

impl SharedConfigureStore {
    pub fn new(client: Arc<IntranetClient>, gateway: impl Into<String>) -> Self {
        Self {
            client,
            gateway: gateway.into(),
            configures: DashMap::new(),
            change_handler: RwLock::new(None),
        }
    }

    /// Fetch a configure, loading it from the Gateway on first use.
    pub async fn shared_configure(&self, key: &str) -> Option<Arc<SharedConfigure>> {
        if let Some(existing) = self.configures.get(key) {
            return Some(Arc::clone(existing.value()));
        }

        let response = self
            .client
            .post(
                &self.gateway,
                EventType::WtgGetSharedConfigure.as_u16(),
                PayloadType::Text,
                key.as_bytes(),
            )
            .await
            .ok()?;
        if response.status_code != 200 {
            warn!("Shared configure {} unavailable: {}", key, response.status_code);
            return None;
        }

        let configure: SharedConfigure = serde_json::from_slice(&response.payload).ok()?;
        // Load-or-store: a concurrent loader may have won; last write wins
        // and both values came from the same authority.
        let configure = Arc::new(configure);
        self.configures
            .insert(key.to_string(), Arc::clone(&configure));
        Some(configure)
    }

    /// Tell the Gateway this worker depends on a configure key.
    /// Fire-and-forget: a miss costs nothing but bookkeeping.
    pub fn report_config_used_by(&self, key: &str, worker_id: &str) {
        let client = Arc::clone(&self.client);
        let gateway = self.gateway.clone();
        let param = format!("{key}{SPLIT}{worker_id}");
        tokio::spawn(async move {
            let result = client
                .post(
                    &gateway,
                    EventType::WtgReportConfUsedBy.as_u16(),
                    PayloadType::Text,
                    param.as_bytes(),
                )
                .await;
            if let Err(e) = result {
                warn!("Failed to report configure usage {}: {}", param, e);
            }
        });
    }

    pub fn set_change_handler(&self, handler: ConfigureChangeHandler) {
        *self
            .change_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Apply a Gateway-pushed configure change.
    pub fn handle_change(&self, configure: SharedConfigure) {
        info!("Shared configure changed: {}", configure.key);
        let configure = Arc::new(configure);
        self.configures
            .insert(configure.key.clone(), Arc::clone(&configure));

        let handler = self
            .change_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(&configure);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self, key: &str) -> Option<Arc<SharedConfigure>> {
        self.configures.get(key).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use matrix_protocol::{Envelope, SecretAlgorithm};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offline_store() -> SharedConfigureStore {
        let client = Arc::new(IntranetClient::new(
            ClientConfig::default(),
            Envelope::new(SecretAlgorithm::None, ""),
        ));
        SharedConfigureStore::new(client, "127.0.0.1:1")
    }

    #[tokio::test]
    async fn test_change_updates_cache_and_fires_handler() {
        let store = offline_store();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            store.set_change_handler(Arc::new(move |configure| {
                assert_eq!(configure.key, "db-main");
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        store.handle_change(SharedConfigure {
            key: "db-main".into(),
            kind: "DB".into(),
            value: r#"{"dsn":"sqlite:demo.db"}"#.into(),
            used_workers: vec![],
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let cached = store.cached("db-main").unwrap();
        assert_eq!(cached.kind, "DB");

        // A cached record answers without the Gateway.
        let loaded = store.shared_configure("db-main").await.unwrap();
        assert_eq!(loaded.key, "db-main");
    }

    #[tokio::test]
    async fn test_gateway_miss_degrades_to_none() {
        let store = offline_store();
        assert!(store.shared_configure("missing").await.is_none());
    }
}
