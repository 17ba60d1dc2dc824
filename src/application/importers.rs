use crate::application::persistent_store::PersistentCell;
use crate::domain::models::{ActivityEntry, CloudSettings, IcsEntry, Settings};
use crate::infrastructure::activity_client::ActivityClient;
use crate::infrastructure::cloud_client::TimesheetCloud;
use chrono::{Days, NaiveDate};
use std::sync::Arc;

/// Calendar and activity suggestions for a day. Every failure, including
/// missing configuration, yields an empty list.
pub struct Importers<C, A>
where
    C: TimesheetCloud,
    A: ActivityClient,
{
    cloud_client: Arc<C>,
    activity_client: Arc<A>,
    settings: Arc<PersistentCell<Settings>>,
    cloud_settings: Arc<PersistentCell<CloudSettings>>,
    default_cloud_url: Option<String>,
}

impl<C, A> Importers<C, A>
where
    C: TimesheetCloud,
    A: ActivityClient,
{
    pub fn new(
        cloud_client: Arc<C>,
        activity_client: Arc<A>,
        settings: Arc<PersistentCell<Settings>>,
        cloud_settings: Arc<PersistentCell<CloudSettings>>,
    ) -> Self {
        Self {
            cloud_client,
            activity_client,
            settings,
            cloud_settings,
            default_cloud_url: None,
        }
    }

    pub fn with_default_cloud_url(mut self, default_cloud_url: Option<String>) -> Self {
        self.default_cloud_url = default_cloud_url;
        self
    }

    /// `month` is 1-based.
    pub async fn fetch_ics(&self, month: u32, day: u32) -> Vec<IcsEntry> {
        if !self.settings.get().has_ics_source() {
            return Vec::new();
        }
        let Some(endpoint) = self
            .cloud_settings
            .get()
            .configured_endpoint(self.default_cloud_url.as_deref())
        else {
            return Vec::new();
        };

        match self.cloud_client.fetch_ics(&endpoint, month, day).await {
            Ok(entries) => {
                tracing::debug!(month, day, count = entries.len(), "fetched calendar entries");
                entries
            }
            Err(error) => {
                tracing::warn!(month, day, %error, "failed to fetch ICS");
                Vec::new()
            }
        }
    }

    /// Events from the day before through the day after `date`.
    pub async fn fetch_activity(&self, date: NaiveDate) -> Vec<ActivityEntry> {
        let settings = self.settings.get();
        let Some((base_url, access_token)) = settings.gitlab_credentials() else {
            return Vec::new();
        };
        let (Some(after), Some(before)) = (
            date.checked_sub_days(Days::new(1)),
            date.checked_add_days(Days::new(1)),
        ) else {
            return Vec::new();
        };

        match self
            .activity_client
            .list_events(base_url, access_token, after, before)
            .await
        {
            Ok(events) => {
                tracing::debug!(%date, count = events.len(), "fetched activity events");
                events
            }
            Err(error) => {
                tracing::warn!(%date, %error, "failed to fetch gitlab activity");
                Vec::new()
            }
        }
    }
}
