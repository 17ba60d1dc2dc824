use crate::application::bootstrap::bootstrap_workspace;
use crate::application::importers::Importers;
use crate::application::persistent_store::{
    PersistentCell, StorageBus, CLOUD_SETTINGS_KEY, SETTINGS_KEY,
};
use crate::application::settings_sync::SettingsSync;
use crate::application::timesheet_sync::TimesheetService;
use crate::domain::models::{
    ActivityEntry, CloudSettings, Day, Entry, IcsEntry, LoadSheetResult, LoadSource, Month,
    MonthKey, Settings,
};
use crate::infrastructure::activity_client::ReqwestGitlabClient;
use crate::infrastructure::cloud_client::ReqwestTimesheetCloud;
use crate::infrastructure::config::{save_default_cloud_url, AppConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_client::{Credentials, HttpClient};
use crate::infrastructure::key_value_store::{KeyValueStore, SqliteKeyValueStore};
use crate::infrastructure::month_repository::SqliteMonthRepository;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

const NO_PROJECT: &str = "(none)";

pub struct AppState {
    workspace_root: PathBuf,
    config_dir: PathBuf,
    database_path: PathBuf,
    config: AppConfig,
    credentials: Arc<Credentials>,
    settings: Arc<PersistentCell<Settings>>,
    cloud_settings: Arc<PersistentCell<CloudSettings>>,
    timesheets: TimesheetService<ReqwestTimesheetCloud, SqliteMonthRepository>,
    settings_sync: SettingsSync<ReqwestTimesheetCloud>,
    importers: Importers<ReqwestTimesheetCloud, ReqwestGitlabClient>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let config = bootstrap.config.clone();

        let storage: Arc<dyn KeyValueStore> =
            Arc::new(SqliteKeyValueStore::new(&bootstrap.database_path));
        let bus = StorageBus::new();
        let settings = Arc::new(PersistentCell::with_bus(
            SETTINGS_KEY,
            Arc::clone(&storage),
            Settings::default(),
            &bus,
        )?);
        let cloud_settings = Arc::new(PersistentCell::with_bus(
            CLOUD_SETTINGS_KEY,
            storage,
            CloudSettings::default(),
            &bus,
        )?);

        let credentials = Arc::new(Credentials::new(None));
        {
            let credentials = Arc::clone(&credentials);
            cloud_settings.subscribe(move |cloud: &CloudSettings| credentials.set_token(cloud.api_key()));
        }

        let http = HttpClient::new(Arc::clone(&credentials));
        let cloud_client = Arc::new(ReqwestTimesheetCloud::new(
            http.clone(),
            config.request_timeout,
            config.ics_timeout,
        ));
        let activity_client = Arc::new(ReqwestGitlabClient::new(http, config.activity_timeout));
        let months = Arc::new(SqliteMonthRepository::new(&bootstrap.database_path));

        let timesheets = TimesheetService::new(
            Arc::clone(&cloud_client),
            months,
            Arc::clone(&cloud_settings),
        )
        .with_default_cloud_url(config.default_cloud_url.clone());
        let settings_sync = SettingsSync::new(
            Arc::clone(&cloud_client),
            Arc::clone(&settings),
            Arc::clone(&cloud_settings),
        )
        .with_default_cloud_url(config.default_cloud_url.clone());
        let importers = Importers::new(
            cloud_client,
            activity_client,
            Arc::clone(&settings),
            Arc::clone(&cloud_settings),
        )
        .with_default_cloud_url(config.default_cloud_url.clone());

        Ok(Self {
            workspace_root: bootstrap.workspace_root,
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            config,
            credentials,
            settings,
            cloud_settings,
            timesheets,
            settings_sync,
            importers,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Keeps both settings cells in step with writes from other cells on the
    /// same bus. Must be called inside a tokio runtime.
    pub fn watch_storage(&self) -> Vec<JoinHandle<()>> {
        [
            self.settings.spawn_listener(),
            self.cloud_settings.spawn_listener(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        tracing::info!(command, "{message}");
    }

    pub fn log_error(&self, command: &str, message: &str) {
        tracing::error!(command, "{message}");
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub minutes: u32,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub company: Option<String>,
    pub client: Option<String>,
    pub ics_url: Option<String>,
    pub gitlab_url: Option<String>,
    pub gitlab_access_token: Option<String>,
    pub projects: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DayUpdateResponse {
    pub month: String,
    pub day: u32,
    pub change_id: Option<u64>,
    pub total_minutes: u64,
    pub expected_minutes: u64,
    pub sick: bool,
    pub holiday: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonthSummaryResponse {
    pub month: String,
    pub source: LoadSource,
    pub change_id: Option<u64>,
    pub total_minutes: u64,
    pub expected_minutes: u64,
    pub balance_minutes: i64,
    pub worked_days: usize,
    pub sick_days: usize,
    pub holidays: usize,
    pub minutes_per_project: BTreeMap<String, u64>,
    pub minutes_per_tag: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CloudStatusResponse {
    pub cloud_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub api_key_set: bool,
    pub configured: bool,
}

fn cloud_status(state: &AppState) -> CloudStatusResponse {
    let cloud = state.cloud_settings.get();
    let fallback = state.config.default_cloud_url.as_deref();
    CloudStatusResponse {
        endpoint: cloud.endpoint(fallback),
        api_key_set: cloud.api_key().is_some(),
        configured: cloud.configured_endpoint(fallback).is_some(),
        cloud_url: cloud.cloud_url,
    }
}

fn day_response(month: &Month, day_number: u32) -> Result<DayUpdateResponse, InfraError> {
    let key = month.key().map_err(InfraError::InvalidInput)?;
    let day = month
        .day(day_number)
        .ok_or_else(|| InfraError::InvalidInput(format!("day {day_number} is outside {key}")))?;
    Ok(DayUpdateResponse {
        month: key.to_string(),
        day: day_number,
        change_id: month.change_id,
        total_minutes: day.total_minutes(),
        expected_minutes: day.expected_minutes(),
        sick: day.sick,
        holiday: day.holiday,
    })
}

fn non_blank(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

pub async fn show_month_impl(
    state: &AppState,
    year: i32,
    month: u32,
) -> Result<LoadSheetResult, InfraError> {
    state.timesheets.load(year, month).await
}

pub async fn add_entry_impl(
    state: &AppState,
    year: i32,
    month: u32,
    day: u32,
    entry: NewEntry,
) -> Result<DayUpdateResponse, InfraError> {
    let entry = Entry {
        description: entry.description.unwrap_or_default().trim().to_string(),
        duration: entry.minutes,
        tags: non_blank(entry.tags),
        project: non_blank(entry.projects),
        import_tags: Vec::new(),
    };
    entry.validate().map_err(InfraError::InvalidInput)?;

    let mut sheet = state.timesheets.load(year, month).await?.month;
    let key = sheet.key().map_err(InfraError::InvalidInput)?;
    sheet
        .day_mut(day)
        .ok_or_else(|| InfraError::InvalidInput(format!("day {day} is outside {key}")))?
        .entries
        .push(entry);

    let stored = state.timesheets.store(sheet).await?;
    state.log_info("add", &format!("added entry to {key}-{day:02}"));
    day_response(&stored, day)
}

pub async fn mark_day_impl(
    state: &AppState,
    year: i32,
    month: u32,
    day: u32,
    sick: bool,
    holiday: bool,
) -> Result<DayUpdateResponse, InfraError> {
    let mut sheet = state.timesheets.load(year, month).await?.month;
    let key = sheet.key().map_err(InfraError::InvalidInput)?;
    let target: &mut Day = sheet
        .day_mut(day)
        .ok_or_else(|| InfraError::InvalidInput(format!("day {day} is outside {key}")))?;
    target.sick = sick;
    target.holiday = holiday;

    let stored = state.timesheets.store(sheet).await?;
    state.log_info("mark", &format!("marked {key}-{day:02} sick={sick} holiday={holiday}"));
    day_response(&stored, day)
}

pub async fn delete_month_impl(state: &AppState, year: i32, month: u32) -> Result<bool, InfraError> {
    let removed = state.timesheets.delete(year, month).await?;
    state.log_info("delete", &format!("delete {year}-{month:02} removed={removed}"));
    Ok(removed)
}

pub fn list_months_impl(state: &AppState) -> Result<Vec<String>, InfraError> {
    Ok(state
        .timesheets
        .list_local()?
        .into_iter()
        .map(|key: MonthKey| key.to_string())
        .collect())
}

pub async fn month_summary_impl(
    state: &AppState,
    year: i32,
    month: u32,
) -> Result<MonthSummaryResponse, InfraError> {
    let loaded = state.timesheets.load(year, month).await?;
    let sheet = &loaded.month;
    let key = sheet.key().map_err(InfraError::InvalidInput)?;

    let mut minutes_per_project = BTreeMap::new();
    let mut minutes_per_tag = BTreeMap::new();
    for entry in sheet.days.iter().flat_map(|day| day.entries.iter()) {
        let minutes = u64::from(entry.duration);
        if entry.project.is_empty() {
            *minutes_per_project.entry(NO_PROJECT.to_string()).or_insert(0) += minutes;
        }
        for project in &entry.project {
            *minutes_per_project.entry(project.clone()).or_insert(0) += minutes;
        }
        for tag in &entry.tags {
            *minutes_per_tag.entry(tag.clone()).or_insert(0) += minutes;
        }
    }

    let total_minutes = sheet.total_minutes();
    let expected_minutes = sheet.expected_minutes();
    Ok(MonthSummaryResponse {
        month: key.to_string(),
        source: loaded.source,
        change_id: sheet.change_id,
        total_minutes,
        expected_minutes,
        balance_minutes: i64::try_from(total_minutes).unwrap_or(i64::MAX)
            - i64::try_from(expected_minutes).unwrap_or(i64::MAX),
        worked_days: sheet.days.iter().filter(|day| !day.entries.is_empty()).count(),
        sick_days: sheet.days.iter().filter(|day| day.sick).count(),
        holidays: sheet.days.iter().filter(|day| day.holiday).count(),
        minutes_per_project,
        minutes_per_tag,
    })
}

pub fn set_cloud_impl(
    state: &AppState,
    cloud_url: String,
    cloud_api_key: String,
) -> Result<CloudStatusResponse, InfraError> {
    let cloud_url = cloud_url.trim().to_string();
    if !cloud_url.is_empty() {
        url::Url::parse(&cloud_url)
            .map_err(|error| InfraError::InvalidUrl(format!("{cloud_url}: {error}")))?;
    }
    state.cloud_settings.set(CloudSettings {
        cloud_url,
        cloud_api_key: cloud_api_key.trim().to_string(),
    })?;
    state.log_info("cloud_set", "updated cloud settings");
    Ok(cloud_status(state))
}

pub fn clear_cloud_impl(state: &AppState) -> Result<CloudStatusResponse, InfraError> {
    state.cloud_settings.set(CloudSettings::default())?;
    state.log_info("cloud_clear", "cleared cloud settings");
    Ok(cloud_status(state))
}

pub fn show_cloud_impl(state: &AppState) -> Result<CloudStatusResponse, InfraError> {
    Ok(cloud_status(state))
}

/// Stores the fallback endpoint used when cloud settings carry only a key.
/// Takes effect for the next `AppState`.
pub fn set_default_cloud_url_impl(state: &AppState, url: Option<String>) -> Result<(), InfraError> {
    if let Some(raw) = url.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        url::Url::parse(raw).map_err(|error| InfraError::InvalidUrl(format!("{raw}: {error}")))?;
    }
    save_default_cloud_url(&state.config_dir, url.as_deref())
}

pub fn show_settings_impl(state: &AppState) -> Result<Settings, InfraError> {
    Ok(state.settings.get())
}

pub fn set_profile_impl(state: &AppState, update: ProfileUpdate) -> Result<Settings, InfraError> {
    let updated = state.settings.update(|settings| {
        let assign = |target: &mut String, value: Option<String>| {
            if let Some(value) = value {
                *target = value.trim().to_string();
            }
        };
        assign(&mut settings.name, update.name);
        assign(&mut settings.company, update.company);
        assign(&mut settings.client, update.client);
        assign(&mut settings.ics_url, update.ics_url);
        assign(&mut settings.gitlab_url, update.gitlab_url);
        assign(&mut settings.gitlab_access_token, update.gitlab_access_token);
        if let Some(projects) = update.projects {
            settings.projects = non_blank(projects);
        }
        if let Some(tags) = update.tags {
            settings.tags = non_blank(tags);
        }
    })?;
    state.log_info("settings_set_profile", "updated local settings");
    Ok(updated)
}

pub async fn push_settings_impl(state: &AppState) -> Result<Settings, InfraError> {
    state
        .settings_sync
        .push(|cloud| async move {
            state.log_info("settings_push", &format!("pushed settings to {}", cloud.cloud_url));
        })
        .await
}

pub async fn pull_settings_impl(state: &AppState) -> Result<Settings, InfraError> {
    state
        .settings_sync
        .pull(|cloud| async move {
            state.log_info("settings_pull", &format!("pulled settings from {}", cloud.cloud_url));
        })
        .await
}

pub async fn fetch_ics_impl(state: &AppState, month: u32, day: u32) -> Result<Vec<IcsEntry>, InfraError> {
    if !(1..=12).contains(&month) {
        return Err(InfraError::InvalidInput(format!("month must be 1-12, got {month}")));
    }
    if !(1..=31).contains(&day) {
        return Err(InfraError::InvalidInput(format!("day must be 1-31, got {day}")));
    }
    Ok(state.importers.fetch_ics(month, day).await)
}

pub async fn fetch_activity_impl(state: &AppState, date: String) -> Result<Vec<ActivityEntry>, InfraError> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|error| InfraError::InvalidInput(format!("date must be YYYY-MM-DD: {error}")))?;
    Ok(state.importers.fetch_activity(date).await)
}
