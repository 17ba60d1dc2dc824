use crate::domain::models::ActivityEntry;
use crate::infrastructure::cloud_client::endpoint_url;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_client::{HttpClient, RequestOptions};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;

const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Read-only developer activity feed (GitLab events API).
#[async_trait]
pub trait ActivityClient: Send + Sync {
    /// Events strictly between `after` and `before`.
    async fn list_events(
        &self,
        base_url: &str,
        access_token: &str,
        after: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<ActivityEntry>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestGitlabClient {
    http: HttpClient,
    timeout: Duration,
}

impl ReqwestGitlabClient {
    pub fn new(http: HttpClient, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl ActivityClient for ReqwestGitlabClient {
    async fn list_events(
        &self,
        base_url: &str,
        access_token: &str,
        after: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<ActivityEntry>, InfraError> {
        if access_token.trim().is_empty() {
            return Err(InfraError::InvalidInput("gitlab access token must not be empty".to_string()));
        }

        let mut url = endpoint_url(base_url, &["api", "v4", "events"])?;
        url.query_pairs_mut()
            .append_pair("before", &before.format("%Y-%m-%d").to_string())
            .append_pair("after", &after.format("%Y-%m-%d").to_string());

        // The app's own bearer token must not leak to the third party.
        let options = RequestOptions::default()
            .with_timeout(self.timeout)
            .without_auth()
            .with_header(PRIVATE_TOKEN_HEADER, access_token.trim());

        self.http.get_json(url.as_str(), options).await
    }
}
