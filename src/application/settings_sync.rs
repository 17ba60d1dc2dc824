use crate::application::persistent_store::PersistentCell;
use crate::domain::models::{CloudSettings, Settings};
use crate::infrastructure::cloud_client::TimesheetCloud;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Whole-object push/pull of the settings cell against `{endpoint}/api/settings`.
pub struct SettingsSync<C>
where
    C: TimesheetCloud,
{
    cloud_client: Arc<C>,
    settings: Arc<PersistentCell<Settings>>,
    cloud_settings: Arc<PersistentCell<CloudSettings>>,
    default_cloud_url: Option<String>,
    now_provider: NowProvider,
}

impl<C> SettingsSync<C>
where
    C: TimesheetCloud,
{
    pub fn new(
        cloud_client: Arc<C>,
        settings: Arc<PersistentCell<Settings>>,
        cloud_settings: Arc<PersistentCell<CloudSettings>>,
    ) -> Self {
        Self {
            cloud_client,
            settings,
            cloud_settings,
            default_cloud_url: None,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_default_cloud_url(mut self, default_cloud_url: Option<String>) -> Self {
        self.default_cloud_url = default_cloud_url;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn endpoint(&self, cloud: &CloudSettings) -> Result<String, InfraError> {
        cloud
            .configured_endpoint(self.default_cloud_url.as_deref())
            .ok_or(InfraError::CloudNotConfigured)
    }

    /// Uploads the whole object stamped with `last_updated` (Unix seconds),
    /// keeps the stamp locally once the upload succeeded, then hands the cloud
    /// settings to `on_complete`.
    pub async fn push<F, Fut>(&self, on_complete: F) -> Result<Settings, InfraError>
    where
        F: FnOnce(CloudSettings) -> Fut,
        Fut: Future<Output = ()>,
    {
        let cloud = self.cloud_settings.get();
        let endpoint = self.endpoint(&cloud)?;
        let stamp = u64::try_from((self.now_provider)().timestamp()).unwrap_or_default();
        let mut settings = self.settings.get();
        settings.last_updated = Some(stamp);

        self.cloud_client.upload_settings(&endpoint, &settings).await?;
        self.settings.set(settings.clone())?;
        tracing::info!(last_updated = stamp, "pushed settings to cloud");

        on_complete(cloud).await;
        Ok(settings)
    }

    /// Replaces the local settings with the remote object, no merge.
    pub async fn pull<F, Fut>(&self, on_complete: F) -> Result<Settings, InfraError>
    where
        F: FnOnce(CloudSettings) -> Fut,
        Fut: Future<Output = ()>,
    {
        let cloud = self.cloud_settings.get();
        let endpoint = self.endpoint(&cloud)?;

        let remote = self.cloud_client.fetch_settings(&endpoint).await?;
        self.settings.set(remote.clone())?;
        tracing::info!(last_updated = ?remote.last_updated, "pulled settings from cloud");

        on_complete(cloud).await;
        Ok(remote)
    }
}
