use crate::infrastructure::error::InfraError;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const JSON_MIME: &str = "application/json";

/// Bearer token attached to outgoing requests. Shared between the client and
/// whoever owns the cloud settings; a 401 response clears it.
#[derive(Debug, Default)]
pub struct Credentials {
    token: RwLock<Option<String>>,
}

impl Credentials {
    pub fn new(token: Option<&str>) -> Self {
        let credentials = Self::default();
        credentials.set_token(token);
        credentials
    }

    pub fn set_token(&self, token: Option<&str>) {
        let normalized = token
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = normalized;
    }

    pub fn clear(&self) {
        self.set_token(None);
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Skip the bearer header even when a token is present.
    pub no_auth: bool,
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            no_auth: false,
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.no_auth = true;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RequestBody {
    pub content_type: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, InfraError> {
        serde_json::from_str(&self.body).map_err(InfraError::from)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    credentials: Arc<Credentials>,
}

impl HttpClient {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            client: Client::new(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Single exchange bounded by `options.timeout`. Non-2xx statuses become
    /// `InfraError::Http`; a 401 additionally clears the stored token.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<RequestBody>,
        options: RequestOptions,
    ) -> Result<HttpResponse, InfraError> {
        let url = Url::parse(url).map_err(|error| InfraError::InvalidUrl(format!("{url}: {error}")))?;
        let mut request = self.client.request(method.clone(), url.clone());

        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.no_auth {
            if let Some(token) = self.credentials.token() {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
        }
        if let Some(body) = body {
            if let Some(content_type) = body.content_type {
                request = request.header(CONTENT_TYPE, content_type);
            }
            request = request.body(body.content);
        }

        tracing::debug!(%method, %url, no_auth = options.no_auth, "sending request");

        let exchange = async move {
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        let timeout_ms = options.timeout.as_millis() as u64;
        // Dropping the exchange future on expiry aborts the connection.
        let (status, text) = match tokio::time::timeout(options.timeout, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                return Err(InfraError::Network(format!("{method} {url} failed: {error}")));
            }
            Err(_) => {
                tracing::error!(%method, %url, timeout_ms, "fetch timeout");
                return Err(InfraError::Timeout {
                    url: url.to_string(),
                    timeout_ms,
                });
            }
        };

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(%url, "unauthorized response, clearing stored token");
            self.credentials.clear();
        }
        if !status.is_success() {
            return Err(InfraError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            body: text,
        })
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<HttpResponse, InfraError> {
        self.fetch(Method::GET, url, None, options).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T, InfraError> {
        self.get(url, options).await?.json()
    }

    pub async fn post(
        &self,
        url: &str,
        mime: Option<&str>,
        body: impl Into<String>,
        options: RequestOptions,
    ) -> Result<String, InfraError> {
        let body = RequestBody {
            content_type: mime.map(ToOwned::to_owned),
            content: body.into(),
        };
        Ok(self.fetch(Method::POST, url, Some(body), options).await?.body)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        value: &T,
        options: RequestOptions,
    ) -> Result<String, InfraError> {
        let payload = serde_json::to_string(value)?;
        self.post(url, Some(JSON_MIME), payload, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<String, InfraError> {
        Ok(self.fetch(Method::DELETE, url, None, options).await?.body)
    }
}
