use crate::domain::models::{IcsEntry, Month, MonthKey, Settings};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_client::{HttpClient, RequestOptions};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Remote timesheet backend. `endpoint` is the resolved cloud base URL.
#[async_trait]
pub trait TimesheetCloud: Send + Sync {
    async fn fetch_month(&self, endpoint: &str, key: MonthKey) -> Result<Month, InfraError>;

    async fn upload_month(&self, endpoint: &str, month: &Month) -> Result<(), InfraError>;

    async fn delete_month(&self, endpoint: &str, key: MonthKey) -> Result<(), InfraError>;

    async fn fetch_settings(&self, endpoint: &str) -> Result<Settings, InfraError>;

    async fn upload_settings(&self, endpoint: &str, settings: &Settings) -> Result<(), InfraError>;

    async fn fetch_ics(&self, endpoint: &str, month: u32, day: u32) -> Result<Vec<IcsEntry>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTimesheetCloud {
    http: HttpClient,
    request_timeout: Duration,
    ics_timeout: Duration,
}

impl ReqwestTimesheetCloud {
    pub fn new(http: HttpClient, request_timeout: Duration, ics_timeout: Duration) -> Self {
        Self {
            http,
            request_timeout,
            ics_timeout,
        }
    }

    fn options(&self) -> RequestOptions {
        RequestOptions::default().with_timeout(self.request_timeout)
    }

    fn month_url(endpoint: &str, key: MonthKey) -> Result<Url, InfraError> {
        endpoint_url(endpoint, &["api", "timesheets", &key.path_segment()])
    }
}

pub fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, InfraError> {
    let mut url =
        Url::parse(base).map_err(|error| InfraError::InvalidUrl(format!("{base}: {error}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| InfraError::InvalidUrl(format!("{base} cannot be a base")))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

#[async_trait]
impl TimesheetCloud for ReqwestTimesheetCloud {
    async fn fetch_month(&self, endpoint: &str, key: MonthKey) -> Result<Month, InfraError> {
        let url = Self::month_url(endpoint, key)?;
        self.http.get_json(url.as_str(), self.options()).await
    }

    async fn upload_month(&self, endpoint: &str, month: &Month) -> Result<(), InfraError> {
        let key = month.key().map_err(InfraError::InvalidInput)?;
        let url = Self::month_url(endpoint, key)?;
        self.http.post_json(url.as_str(), month, self.options()).await?;
        Ok(())
    }

    async fn delete_month(&self, endpoint: &str, key: MonthKey) -> Result<(), InfraError> {
        let url = Self::month_url(endpoint, key)?;
        self.http.delete(url.as_str(), self.options()).await?;
        Ok(())
    }

    async fn fetch_settings(&self, endpoint: &str) -> Result<Settings, InfraError> {
        let url = endpoint_url(endpoint, &["api", "settings"])?;
        self.http.get_json(url.as_str(), self.options()).await
    }

    async fn upload_settings(&self, endpoint: &str, settings: &Settings) -> Result<(), InfraError> {
        let url = endpoint_url(endpoint, &["api", "settings"])?;
        self.http.post_json(url.as_str(), settings, self.options()).await?;
        Ok(())
    }

    async fn fetch_ics(&self, endpoint: &str, month: u32, day: u32) -> Result<Vec<IcsEntry>, InfraError> {
        let url = endpoint_url(
            endpoint,
            &["api", "fetch_ics", &month.to_string(), &day.to_string()],
        )?;
        self.http
            .get_json(url.as_str(), RequestOptions::default().with_timeout(self.ics_timeout))
            .await
    }
}
