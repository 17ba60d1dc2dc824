use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

pub const WORKDAY_EXPECTED_HOURS: f64 = 8.0;
pub const WEEKEND_EXPECTED_HOURS: f64 = 0.0;

/// A validated (year, 1-based month) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    first_day: NaiveDate,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Result<Self, String> {
        if !(1..=12).contains(&month) {
            return Err(format!("month must be between 1 and 12, got {month}"));
        }
        let first_day = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| format!("year {year} is out of range"))?;
        Ok(Self { first_day })
    }

    pub fn year(&self) -> i32 {
        self.first_day.year()
    }

    pub fn month(&self) -> u32 {
        self.first_day.month()
    }

    pub fn days_in_month(&self) -> u32 {
        self.first_day
            .checked_add_months(Months::new(1))
            .map(|next| (next - self.first_day).num_days() as u32)
            .unwrap_or(31)
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        self.first_day.iter_days().take(self.days_in_month() as usize)
    }

    /// Remote path segment, e.g. `2024_2`.
    pub fn path_segment(&self) -> String {
        format!("{}_{}", self.year(), self.month())
    }
}

impl std::fmt::Display for MonthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    /// Minutes.
    #[serde(default, deserialize_with = "lenient_minutes")]
    pub duration: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "project_list")]
    pub project: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub import_tags: Vec<String>,
}

impl Entry {
    pub fn validate(&self) -> Result<(), String> {
        if self.duration == 0 {
            return Err("entry.duration must be > 0".to_string());
        }
        for tag in &self.tags {
            validate_non_empty(tag, "entry.tags[]")?;
        }
        for project in &self.project {
            validate_non_empty(project, "entry.project[]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Day {
    #[serde(default, deserialize_with = "null_as_default")]
    pub entries: Vec<Entry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub expected_min_hours: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sick: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub holiday: bool,
}

impl Day {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            entries: Vec::new(),
            expected_min_hours: expected_hours_for(date),
            sick: false,
            holiday: false,
        }
    }

    pub fn total_minutes(&self) -> u64 {
        self.entries.iter().map(|entry| u64::from(entry.duration)).sum()
    }

    pub fn is_off(&self) -> bool {
        self.sick || self.holiday
    }

    pub fn expected_minutes(&self) -> u64 {
        if self.is_off() {
            return 0;
        }
        (self.expected_min_hours.max(0.0) * 60.0).round() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Month {
    #[serde(default, deserialize_with = "null_as_default")]
    pub days: Vec<Day>,
    pub year: i32,
    /// 1-based.
    pub month: u32,
    /// Unix milliseconds of first creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<u64>,
}

impl Month {
    /// Fresh sheet with one `Day` per calendar day; Monday to Friday expect
    /// a full workday, weekends expect nothing.
    pub fn blank(key: MonthKey, created: i64) -> Self {
        Self {
            days: key.dates().map(Day::for_date).collect(),
            year: key.year(),
            month: key.month(),
            created: Some(created),
            change_id: Some(1),
        }
    }

    pub fn key(&self) -> Result<MonthKey, String> {
        MonthKey::new(self.year, self.month)
    }

    /// True when both bookkeeping fields are present.
    pub fn is_versioned(&self) -> bool {
        self.created.is_some() && self.change_id.is_some()
    }

    pub fn backfill(&mut self, now: i64) {
        self.created.get_or_insert(now);
        self.change_id.get_or_insert(1);
    }

    /// Bookkeeping applied right before a write.
    pub fn mark_saved(&mut self, now: i64) {
        self.created.get_or_insert(now);
        self.change_id = Some(self.change_id.map_or(1, |id| id.saturating_add(1)));
    }

    /// 1-based day lookup.
    pub fn day(&self, day: u32) -> Option<&Day> {
        day.checked_sub(1).and_then(|index| self.days.get(index as usize))
    }

    pub fn day_mut(&mut self, day: u32) -> Option<&mut Day> {
        day.checked_sub(1)
            .and_then(move |index| self.days.get_mut(index as usize))
    }

    pub fn total_minutes(&self) -> u64 {
        self.days.iter().map(Day::total_minutes).sum()
    }

    pub fn expected_minutes(&self) -> u64 {
        self.days.iter().map(Day::expected_minutes).sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        self.key()?;
        if self.days.len() > 31 {
            return Err(format!("month.days has {} entries, at most 31 allowed", self.days.len()));
        }
        if self.change_id == Some(0) {
            return Err("month.change_id must be >= 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Cloud,
    Local,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadSheetResult {
    pub source: LoadSource,
    pub month: Month,
}

impl LoadSheetResult {
    pub fn is_cloud(&self) -> bool {
        self.source == LoadSource::Cloud
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    #[serde(deserialize_with = "null_as_default")]
    pub ics_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ics_filter: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub projects: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub company: String,
    #[serde(deserialize_with = "null_as_default")]
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
    #[serde(deserialize_with = "null_as_default")]
    pub gitlab_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub gitlab_access_token: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ics_url: String::new(),
            ics_filter: Vec::new(),
            projects: vec!["Agami".to_string(), "Falco".to_string(), "Rowi".to_string()],
            tags: vec!["meeting".to_string()],
            name: String::new(),
            company: String::new(),
            client: String::new(),
            last_updated: Some(0),
            gitlab_url: String::new(),
            gitlab_access_token: String::new(),
        }
    }
}

impl Settings {
    pub fn has_ics_source(&self) -> bool {
        !self.ics_url.trim().is_empty()
    }

    pub fn gitlab_credentials(&self) -> Option<(&str, &str)> {
        let url = self.gitlab_url.trim();
        let token = self.gitlab_access_token.trim();
        if url.is_empty() || token.is_empty() {
            return None;
        }
        Some((url, token))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CloudSettings {
    #[serde(deserialize_with = "null_as_default")]
    pub cloud_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub cloud_api_key: String,
}

impl CloudSettings {
    /// Explicit `cloud_url` wins; otherwise the configured fallback is used.
    pub fn endpoint(&self, fallback: Option<&str>) -> Option<String> {
        let explicit = self.cloud_url.trim();
        let chosen = if explicit.is_empty() {
            fallback.map(str::trim).filter(|value| !value.is_empty())?
        } else {
            explicit
        };
        Some(chosen.trim_end_matches('/').to_string())
    }

    pub fn api_key(&self) -> Option<&str> {
        let key = self.cloud_api_key.trim();
        (!key.is_empty()).then_some(key)
    }

    /// Endpoint to use when both an endpoint and an API key are present.
    pub fn configured_endpoint(&self, fallback: Option<&str>) -> Option<String> {
        self.api_key()?;
        self.endpoint(fallback)
    }
}

/// Calendar entry produced by the backend's ICS feed conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IcsEntry {
    pub desc: String,
    pub uid: String,
    pub title: String,
    /// Unix seconds.
    pub start: i64,
    /// Seconds.
    pub duration: i64,
    pub confirmed: bool,
    /// Out of office.
    pub oof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityPushData {
    pub commit_title: Option<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub ref_type: String,
    #[serde(rename = "ref", default)]
    pub ref_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEntry {
    pub id: u64,
    #[serde(default)]
    pub action_name: String,
    pub target_type: Option<String>,
    pub target_title: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_data: Option<ActivityPushData>,
}

impl ActivityEntry {
    pub fn headline(&self) -> String {
        if let Some(title) = self.target_title.as_deref().filter(|value| !value.is_empty()) {
            return format!("{} {}", self.action_name, title);
        }
        if let Some(push) = &self.push_data {
            let commit = push.commit_title.as_deref().unwrap_or_default();
            return format!("{} {} {}: {}", self.action_name, push.ref_type, push.ref_name, commit);
        }
        self.action_name.clone()
    }
}

pub fn expected_hours_for(date: NaiveDate) -> f64 {
    if date.weekday().num_days_from_monday() < 5 {
        WORKDAY_EXPECTED_HOURS
    } else {
        WEEKEND_EXPECTED_HOURS
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Sheets written by the web client may hold fractional or negative minutes,
// and NaN arrives as null.
fn lenient_minutes<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let minutes = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    if !minutes.is_finite() || minutes <= 0.0 {
        return Ok(0);
    }
    Ok(minutes.round().min(f64::from(u32::MAX)) as u32)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProjectField {
    Single(String),
    Many(Vec<String>),
}

// Older sheets stored a single project name instead of a list.
fn project_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<ProjectField>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(ProjectField::Single(project)) => {
            let project = project.trim();
            if project.is_empty() {
                Vec::new()
            } else {
                vec![project.to_string()]
            }
        }
        Some(ProjectField::Many(projects)) => projects,
    })
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
