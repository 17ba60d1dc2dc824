use crate::infrastructure::error::InfraError;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const SUPPORTED_SCHEMA: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ICS_TIMEOUT_MS: u64 = 12_000;
const DEFAULT_ACTIVITY_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppConfig {
    pub request_timeout: Duration,
    pub ics_timeout: Duration,
    pub activity_timeout: Duration,
    /// Used when the cloud settings carry an API key but no URL.
    pub default_cloud_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            ics_timeout: Duration::from_millis(DEFAULT_ICS_TIMEOUT_MS),
            activity_timeout: Duration::from_millis(DEFAULT_ACTIVITY_TIMEOUT_MS),
            default_cloud_url: None,
        }
    }
}

fn default_app_json() -> serde_json::Value {
    serde_json::json!({
        "schema": SUPPORTED_SCHEMA,
        "requestTimeoutMs": DEFAULT_REQUEST_TIMEOUT_MS,
        "icsTimeoutMs": DEFAULT_ICS_TIMEOUT_MS,
        "activityTimeoutMs": DEFAULT_ACTIVITY_TIMEOUT_MS,
        "defaultCloudUrl": null
    })
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_app_json())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn read_timeout(
    config: &serde_json::Value,
    field: &str,
    default_ms: u64,
) -> Result<Duration, InfraError> {
    let Some(value) = config.get(field).filter(|value| !value.is_null()) else {
        return Ok(Duration::from_millis(default_ms));
    };
    let millis = value
        .as_u64()
        .filter(|millis| *millis > 0)
        .ok_or_else(|| InfraError::InvalidConfig(format!("{field} must be a positive integer")))?;
    Ok(Duration::from_millis(millis))
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(AppConfig {
        request_timeout: read_timeout(&app, "requestTimeoutMs", DEFAULT_REQUEST_TIMEOUT_MS)?,
        ics_timeout: read_timeout(&app, "icsTimeoutMs", DEFAULT_ICS_TIMEOUT_MS)?,
        activity_timeout: read_timeout(&app, "activityTimeoutMs", DEFAULT_ACTIVITY_TIMEOUT_MS)?,
        default_cloud_url: app
            .get("defaultCloudUrl")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
    })
}

pub fn save_default_cloud_url(config_dir: &Path, url: Option<&str>) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    let mut app = read_config(&path)?;
    let object = app.as_object_mut().ok_or_else(|| {
        InfraError::InvalidConfig(format!("invalid object structure in {}", path.display()))
    })?;
    let value = url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| serde_json::Value::String(value.to_string()))
        .unwrap_or(serde_json::Value::Null);
    object.insert("defaultCloudUrl".to_string(), value);

    let formatted = serde_json::to_string_pretty(&app)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}
