use crate::config::{MarketplaceKind, MarketplaceSettings, StorageKind, StorageSettings};
use gpufleet_common::{FleetError, FleetResult};
use gpufleet_providers::{Marketplace, ObjectStorage};
use std::sync::Arc;
use tracing::info;

/// Builds the marketplace and storage clients selected by configuration.
/// Implementations are compiled in through crate features.
pub struct ProviderManager;

impl ProviderManager {
    pub fn marketplace(settings: &MarketplaceSettings) -> FleetResult<Arc<dyn Marketplace>> {
        match settings.kind {
            MarketplaceKind::Http => Self::http_marketplace(settings),
            MarketplaceKind::Mock => Self::mock_marketplace(),
        }
    }

    #[cfg(feature = "provider-http")]
    fn http_marketplace(settings: &MarketplaceSettings) -> FleetResult<Arc<dyn Marketplace>> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| FleetError::config("MARKETPLACE_API_KEY is not set"))?;
        let client = gpufleet_providers::http::HttpMarketplace::new(
            settings.bases.clone(),
            api_key,
            settings.request_timeout,
        )
        .map_err(|e| FleetError::config(format!("{:#}", e)))?;
        info!("[providers] marketplace: http ({})", client.active_base());
        Ok(Arc::new(client))
    }

    #[cfg(not(feature = "provider-http"))]
    fn http_marketplace(_settings: &MarketplaceSettings) -> FleetResult<Arc<dyn Marketplace>> {
        Err(FleetError::config("built without the provider-http feature"))
    }

    #[cfg(feature = "provider-mock")]
    fn mock_marketplace() -> FleetResult<Arc<dyn Marketplace>> {
        info!("[providers] marketplace: mock");
        Ok(Arc::new(gpufleet_providers::mock::MockMarketplace::new()))
    }

    #[cfg(not(feature = "provider-mock"))]
    fn mock_marketplace() -> FleetResult<Arc<dyn Marketplace>> {
        Err(FleetError::config("built without the provider-mock feature"))
    }

    pub async fn storage(settings: &StorageSettings) -> FleetResult<Arc<dyn ObjectStorage>> {
        match settings.kind {
            StorageKind::S3 => Self::s3_storage(settings).await,
            StorageKind::Memory => Self::memory_storage(settings),
        }
    }

    #[cfg(feature = "storage-s3")]
    async fn s3_storage(settings: &StorageSettings) -> FleetResult<Arc<dyn ObjectStorage>> {
        use gpufleet_providers::s3::{S3Settings, S3Storage};
        let s3 = S3Settings {
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            endpoint: settings.endpoint.clone(),
            access_key_id: settings.access_key_id.clone(),
            secret_access_key: settings.secret_access_key.clone(),
            operation_timeout: settings.operation_timeout,
            multipart: settings.multipart.clone(),
        };
        let storage = S3Storage::connect(&s3)
            .await
            .map_err(|e| FleetError::storage(format!("{:#}", e)))?;
        info!(
            "[providers] storage: s3 bucket={} endpoint={}",
            settings.bucket,
            settings.endpoint.as_deref().unwrap_or("aws")
        );
        Ok(Arc::new(storage))
    }

    #[cfg(not(feature = "storage-s3"))]
    async fn s3_storage(_settings: &StorageSettings) -> FleetResult<Arc<dyn ObjectStorage>> {
        Err(FleetError::config("built without the storage-s3 feature"))
    }

    #[cfg(feature = "provider-mock")]
    fn memory_storage(settings: &StorageSettings) -> FleetResult<Arc<dyn ObjectStorage>> {
        let bucket = if settings.bucket.is_empty() { "local" } else { &settings.bucket };
        info!("[providers] storage: in-memory bucket={}", bucket);
        Ok(Arc::new(gpufleet_providers::mock::MemoryStorage::new(bucket)))
    }

    #[cfg(not(feature = "provider-mock"))]
    fn memory_storage(_settings: &StorageSettings) -> FleetResult<Arc<dyn ObjectStorage>> {
        Err(FleetError::config("built without the provider-mock feature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn http_marketplace_requires_a_key() {
        let settings = MarketplaceSettings {
            kind: MarketplaceKind::Http,
            bases: vec!["https://a.example/api".into()],
            api_key: None,
            request_timeout: Duration::from_secs(5),
        };
        let err = ProviderManager::marketplace(&settings).err().map(|e| e.code());
        assert_eq!(err, Some("config"));
    }
}
