use std::sync::Arc;

use authentication::Authenticator;
use common::StorageConfig;
use errors::ErrorMetadata;
use http::HeaderMap;
use metrics::StorageMetrics;
use rules::RuleManager;
use storage::{
    FilteringStorage,
    QueryEngine,
    SelectorQueryEngine,
    TimeSeriesStore,
};

#[derive(Clone)]
pub struct LocalAppState {
    pub storage: Arc<FilteringStorage>,
    pub query_engine: Arc<dyn QueryEngine>,
    // Absent authenticator means no authentication: all requests pass.
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl LocalAppState {
    pub fn new(
        config: StorageConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> anyhow::Result<Self> {
        let metrics = StorageMetrics::new()?;
        let store = TimeSeriesStore::new(config, metrics)?;
        let storage = FilteringStorage::new(store.clone(), Arc::new(RuleManager::new()));
        let query_engine: Arc<dyn QueryEngine> = SelectorQueryEngine::new(store);
        Ok(Self {
            storage,
            query_engine,
            authenticator,
        })
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        self.storage.store().metrics()
    }

    /// Run the configured authenticator against the request headers,
    /// returning the tenant id on success.
    pub async fn check_auth(&self, headers: &HeaderMap) -> anyhow::Result<Option<String>> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(None);
        };
        let result = authenticator.authenticate(headers).await;
        if !result.authenticated {
            anyhow::bail!(ErrorMetadata::unauthenticated(
                "AuthenticationFailed",
                result
                    .error
                    .unwrap_or_else(|| "authentication failed".to_string()),
            ));
        }
        Ok(result.tenant_id)
    }
}
