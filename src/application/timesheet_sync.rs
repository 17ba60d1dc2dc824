use crate::application::persistent_store::PersistentCell;
use crate::domain::models::{CloudSettings, LoadSheetResult, LoadSource, Month, MonthKey};
use crate::infrastructure::cloud_client::TimesheetCloud;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::month_repository::MonthRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Cloud-first month loading and write-through storing.
///
/// There is no merge: a remote copy wins on load when it carries both
/// counters, and a store overwrites the remote copy without comparing
/// `change_id` values.
pub struct TimesheetService<C, R>
where
    C: TimesheetCloud,
    R: MonthRepository,
{
    cloud_client: Arc<C>,
    month_repository: Arc<R>,
    cloud_settings: Arc<PersistentCell<CloudSettings>>,
    default_cloud_url: Option<String>,
    now_provider: NowProvider,
}

impl<C, R> TimesheetService<C, R>
where
    C: TimesheetCloud,
    R: MonthRepository,
{
    pub fn new(
        cloud_client: Arc<C>,
        month_repository: Arc<R>,
        cloud_settings: Arc<PersistentCell<CloudSettings>>,
    ) -> Self {
        Self {
            cloud_client,
            month_repository,
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

    /// Resolved endpoint, present only when an API key is configured too.
    pub fn cloud_endpoint(&self) -> Option<String> {
        self.cloud_settings
            .get()
            .configured_endpoint(self.default_cloud_url.as_deref())
    }

    fn now_millis(&self) -> i64 {
        (self.now_provider)().timestamp_millis()
    }

    pub async fn load(&self, year: i32, month: u32) -> Result<LoadSheetResult, InfraError> {
        let key = MonthKey::new(year, month).map_err(InfraError::InvalidInput)?;

        if let Some(endpoint) = self.cloud_endpoint() {
            match self.cloud_client.fetch_month(&endpoint, key).await {
                Ok(remote) if remote.is_versioned() && remote.key().is_ok_and(|found| found == key) => {
                    tracing::info!(month = %key, change_id = ?remote.change_id, "loaded month from cloud");
                    return Ok(LoadSheetResult {
                        source: LoadSource::Cloud,
                        month: remote,
                    });
                }
                Ok(_) => {
                    tracing::warn!(month = %key, "cloud copy is missing counters or mismatched, ignoring");
                }
                Err(error) => {
                    tracing::warn!(month = %key, %error, "failed to fetch month from cloud");
                }
            }
        }

        match self.month_repository.get(key) {
            Ok(Some(mut local)) => {
                local.backfill(self.now_millis());
                tracing::debug!(month = %key, change_id = ?local.change_id, "loaded month from local store");
                return Ok(LoadSheetResult {
                    source: LoadSource::Local,
                    month: local,
                });
            }
            Ok(None) => {
                tracing::debug!(month = %key, "no stored copy, starting a blank month");
            }
            Err(InfraError::UnreadableDocument { reason, .. }) => {
                tracing::warn!(month = %key, %reason, "local copy is unreadable, showing a blank month");
            }
            Err(error) => return Err(error),
        }

        Ok(LoadSheetResult {
            source: LoadSource::Local,
            month: Month::blank(key, self.now_millis()),
        })
    }

    /// Bumps `change_id`, writes locally, then best-effort uploads. Only the
    /// local write can fail the call. An unreadable local record is never
    /// overwritten; it has to be deleted first.
    pub async fn store(&self, mut month: Month) -> Result<Month, InfraError> {
        month.validate().map_err(InfraError::InvalidInput)?;
        let key = month.key().map_err(InfraError::InvalidInput)?;
        self.month_repository.get(key)?;
        month.mark_saved(self.now_millis());
        self.month_repository.put(&month)?;
        tracing::info!(month = %key, change_id = ?month.change_id, "stored month locally");

        if let Some(endpoint) = self.cloud_endpoint() {
            match self.cloud_client.upload_month(&endpoint, &month).await {
                Ok(()) => tracing::info!(month = %key, "stored month to cloud"),
                Err(error) => tracing::warn!(month = %key, %error, "failed to store month to cloud"),
            }
        }

        Ok(month)
    }

    /// Removes the local copy and best-effort deletes the remote one.
    pub async fn delete(&self, year: i32, month: u32) -> Result<bool, InfraError> {
        let key = MonthKey::new(year, month).map_err(InfraError::InvalidInput)?;
        let removed = self.month_repository.delete(key)?;

        if let Some(endpoint) = self.cloud_endpoint() {
            if let Err(error) = self.cloud_client.delete_month(&endpoint, key).await {
                tracing::warn!(month = %key, %error, "failed to delete month from cloud");
            }
        }
        Ok(removed)
    }

    pub fn list_local(&self) -> Result<Vec<MonthKey>, InfraError> {
        self.month_repository.list_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Entry, IcsEntry, Settings};
    use crate::infrastructure::key_value_store::InMemoryKeyValueStore;
    use crate::infrastructure::month_repository::InMemoryMonthRepository;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum FakeFetch {
        Found(Month),
        Timeout,
        NotFound,
    }

    #[derive(Debug, Default)]
    struct FakeTimesheetCloud {
        fetch_responses: Mutex<VecDeque<FakeFetch>>,
        fetch_calls: AtomicUsize,
        uploads: Mutex<Vec<(String, Month)>>,
        deletes: Mutex<Vec<MonthKey>>,
        fail_uploads: bool,
    }

    impl FakeTimesheetCloud {
        fn with_fetch_responses(responses: Vec<FakeFetch>) -> Self {
            Self {
                fetch_responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        fn failing_uploads() -> Self {
            Self {
                fail_uploads: true,
                ..Self::default()
            }
        }

        fn uploads(&self) -> Vec<(String, Month)> {
            self.uploads.lock().expect("uploads lock").clone()
        }
    }

    #[async_trait]
    impl TimesheetCloud for FakeTimesheetCloud {
        async fn fetch_month(&self, _endpoint: &str, _key: MonthKey) -> Result<Month, InfraError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .fetch_responses
                .lock()
                .expect("fetch lock")
                .pop_front()
                .unwrap_or(FakeFetch::NotFound);
            match response {
                FakeFetch::Found(month) => Ok(month),
                FakeFetch::Timeout => Err(InfraError::Timeout {
                    url: "http://cloud/api/timesheets".to_string(),
                    timeout_ms: 2_000,
                }),
                FakeFetch::NotFound => Err(InfraError::Http {
                    status: 404,
                    body: "File not found".to_string(),
                }),
            }
        }

        async fn upload_month(&self, endpoint: &str, month: &Month) -> Result<(), InfraError> {
            if self.fail_uploads {
                return Err(InfraError::Network("connection reset".to_string()));
            }
            self.uploads
                .lock()
                .expect("uploads lock")
                .push((endpoint.to_string(), month.clone()));
            Ok(())
        }

        async fn delete_month(&self, _endpoint: &str, key: MonthKey) -> Result<(), InfraError> {
            self.deletes.lock().expect("deletes lock").push(key);
            Ok(())
        }

        async fn fetch_settings(&self, _endpoint: &str) -> Result<Settings, InfraError> {
            Err(InfraError::Network("not used".to_string()))
        }

        async fn upload_settings(&self, _endpoint: &str, _settings: &Settings) -> Result<(), InfraError> {
            Err(InfraError::Network("not used".to_string()))
        }

        async fn fetch_ics(&self, _endpoint: &str, _month: u32, _day: u32) -> Result<Vec<IcsEntry>, InfraError> {
            Ok(Vec::new())
        }
    }

    const FIXED_NOW_MS: i64 = 1_771_200_000_000;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(FIXED_NOW_MS).expect("valid timestamp")
    }

    fn key(year: i32, month: u32) -> MonthKey {
        MonthKey::new(year, month).expect("valid key")
    }

    fn cloud_cell(configured: bool) -> Arc<PersistentCell<CloudSettings>> {
        let settings = if configured {
            CloudSettings {
                cloud_url: "https://sheets.example.com".to_string(),
                cloud_api_key: "api-key".to_string(),
            }
        } else {
            CloudSettings::default()
        };
        Arc::new(
            PersistentCell::new(
                "cloud_settings",
                Arc::new(InMemoryKeyValueStore::default()),
                settings,
            )
            .expect("cloud cell"),
        )
    }

    fn service(
        client: Arc<FakeTimesheetCloud>,
        repository: Arc<InMemoryMonthRepository>,
        configured: bool,
    ) -> TimesheetService<FakeTimesheetCloud, InMemoryMonthRepository> {
        TimesheetService::new(client, repository, cloud_cell(configured))
            .with_now_provider(Arc::new(fixed_time))
    }

    fn month_with_entry(key: MonthKey, change_id: Option<u64>) -> Month {
        let mut month = Month::blank(key, 1_000);
        month.change_id = change_id;
        month.days[0].entries.push(Entry {
            description: "Code review".to_string(),
            duration: 90,
            ..Entry::default()
        });
        month
    }

    #[tokio::test]
    async fn blank_leap_february_when_nothing_is_stored() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(Arc::clone(&client), Arc::clone(&repository), false);

        let result = service.load(2024, 2).await.expect("load");

        assert_eq!(result.source, LoadSource::Local);
        assert_eq!(result.month.days.len(), 29);
        assert_eq!(result.month.days[0].expected_min_hours, 8.0);
        assert_eq!(result.month.created, Some(FIXED_NOW_MS));
        assert_eq!(result.month.change_id, Some(1));
        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(repository.list_keys().expect("list").is_empty());
    }

    #[tokio::test]
    async fn local_month_without_counters_is_backfilled() {
        let repository = Arc::new(InMemoryMonthRepository::default());
        let mut legacy = month_with_entry(key(2023, 7), None);
        legacy.created = None;
        repository.put(&legacy).expect("seed legacy month");
        let service = service(Arc::new(FakeTimesheetCloud::default()), repository, false);

        let result = service.load(2023, 7).await.expect("load");

        assert_eq!(result.source, LoadSource::Local);
        assert_eq!(result.month.change_id, Some(1));
        assert_eq!(result.month.created, Some(FIXED_NOW_MS));
        assert_eq!(result.month.days[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn versioned_cloud_copy_wins_over_local() {
        let remote = month_with_entry(key(2024, 3), Some(12));
        let client = Arc::new(FakeTimesheetCloud::with_fetch_responses(vec![FakeFetch::Found(
            remote.clone(),
        )]));
        let repository = Arc::new(InMemoryMonthRepository::default());
        repository
            .put(&Month::blank(key(2024, 3), 5))
            .expect("seed local");
        let service = service(client, repository, true);

        let result = service.load(2024, 3).await.expect("load");

        assert!(result.is_cloud());
        assert_eq!(result.month, remote);
    }

    #[tokio::test]
    async fn cloud_copy_without_change_id_falls_back_to_local() {
        let remote = month_with_entry(key(2024, 3), None);
        let client = Arc::new(FakeTimesheetCloud::with_fetch_responses(vec![FakeFetch::Found(remote)]));
        let repository = Arc::new(InMemoryMonthRepository::default());
        let mut local = Month::blank(key(2024, 3), 5);
        local.change_id = Some(3);
        repository.put(&local).expect("seed local");
        let service = service(client, repository, true);

        let result = service.load(2024, 3).await.expect("load");

        assert_eq!(result.source, LoadSource::Local);
        assert_eq!(result.month.change_id, Some(3));
    }

    #[tokio::test]
    async fn cloud_copy_for_another_month_is_ignored() {
        let client = Arc::new(FakeTimesheetCloud::with_fetch_responses(vec![FakeFetch::Found(
            month_with_entry(key(2024, 4), Some(2)),
        )]));
        let service = service(client, Arc::new(InMemoryMonthRepository::default()), true);

        let result = service.load(2024, 3).await.expect("load");

        assert_eq!(result.source, LoadSource::Local);
        assert_eq!(result.month.month, 3);
    }

    #[tokio::test]
    async fn cloud_timeout_falls_back_silently() {
        let client = Arc::new(FakeTimesheetCloud::with_fetch_responses(vec![FakeFetch::Timeout]));
        let service = service(Arc::clone(&client), Arc::new(InMemoryMonthRepository::default()), true);

        let result = service.load(2025, 1).await.expect("load never fails on network errors");

        assert_eq!(result.source, LoadSource::Local);
        assert_eq!(result.month.days.len(), 31);
        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_month_is_rejected() {
        let service = service(
            Arc::new(FakeTimesheetCloud::default()),
            Arc::new(InMemoryMonthRepository::default()),
            true,
        );
        assert!(matches!(service.load(2024, 0).await, Err(InfraError::InvalidInput(_))));
        assert!(matches!(service.load(2024, 13).await, Err(InfraError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn store_rejects_impossible_month_without_writing() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(Arc::clone(&client), Arc::clone(&repository), true);

        let mut month = Month::blank(key(2024, 1), 1_000);
        month.days.push(month.days[0].clone());

        assert!(matches!(service.store(month).await, Err(InfraError::InvalidInput(_))));
        assert!(repository.list_keys().expect("list").is_empty());
        assert!(client.uploads().is_empty());
    }

    #[derive(Debug, Default)]
    struct UnreadableMonthRepository {
        puts: AtomicUsize,
    }

    impl MonthRepository for UnreadableMonthRepository {
        fn get(&self, key: MonthKey) -> Result<Option<Month>, InfraError> {
            Err(InfraError::UnreadableDocument {
                key: key.to_string(),
                reason: "expected value at line 1 column 2".to_string(),
            })
        }

        fn put(&self, _month: &Month) -> Result<(), InfraError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete(&self, _key: MonthKey) -> Result<bool, InfraError> {
            Ok(true)
        }

        fn list_keys(&self) -> Result<Vec<MonthKey>, InfraError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unreadable_local_copy_is_shown_blank_but_never_overwritten() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let repository = Arc::new(UnreadableMonthRepository::default());
        let service = TimesheetService::new(Arc::clone(&client), Arc::clone(&repository), cloud_cell(false))
            .with_now_provider(Arc::new(fixed_time));

        let loaded = service.load(2024, 2).await.expect("load");
        assert_eq!(loaded.source, LoadSource::Local);
        assert_eq!(loaded.month.total_minutes(), 0);

        let error = service.store(loaded.month).await.expect_err("store must refuse");
        assert!(matches!(error, InfraError::UnreadableDocument { .. }));
        assert_eq!(repository.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_increments_change_id_and_writes_both_copies() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(Arc::clone(&client), Arc::clone(&repository), true);

        let loaded = service.load(2024, 2).await.expect("load").month;
        let stored = service.store(loaded).await.expect("store");

        assert_eq!(stored.change_id, Some(2));
        assert_eq!(repository.get(key(2024, 2)).expect("get"), Some(stored.clone()));
        let uploads = client.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "https://sheets.example.com");
        assert_eq!(uploads[0].1, stored);
    }

    #[tokio::test]
    async fn first_store_of_unversioned_month_sets_counter_to_one() {
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(Arc::new(FakeTimesheetCloud::default()), Arc::clone(&repository), false);
        let mut month = month_with_entry(key(2022, 9), None);
        month.created = None;

        let stored = service.store(month).await.expect("store");

        assert_eq!(stored.change_id, Some(1));
        assert_eq!(stored.created, Some(FIXED_NOW_MS));
    }

    #[tokio::test]
    async fn failed_upload_still_keeps_local_copy() {
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(
            Arc::new(FakeTimesheetCloud::failing_uploads()),
            Arc::clone(&repository),
            true,
        );

        let stored = service
            .store(month_with_entry(key(2024, 6), Some(4)))
            .await
            .expect("remote failure is not surfaced");

        assert_eq!(stored.change_id, Some(5));
        assert_eq!(
            repository.get(key(2024, 6)).expect("get").and_then(|month| month.change_id),
            Some(5)
        );
    }

    #[tokio::test]
    async fn unconfigured_cloud_is_never_contacted() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let service = service(Arc::clone(&client), Arc::new(InMemoryMonthRepository::default()), false);

        service
            .store(Month::blank(key(2024, 1), 0))
            .await
            .expect("store");
        service.delete(2024, 1).await.expect("delete");

        assert!(client.uploads().is_empty());
        assert!(client.deletes.lock().expect("deletes lock").is_empty());
    }

    #[tokio::test]
    async fn default_cloud_url_is_used_when_settings_have_only_a_key() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let cloud = Arc::new(
            PersistentCell::new(
                "cloud_settings",
                Arc::new(InMemoryKeyValueStore::default()),
                CloudSettings {
                    cloud_url: String::new(),
                    cloud_api_key: "api-key".to_string(),
                },
            )
            .expect("cloud cell"),
        );
        let service = TimesheetService::new(
            Arc::clone(&client),
            Arc::new(InMemoryMonthRepository::default()),
            cloud,
        )
        .with_default_cloud_url(Some("http://localhost:8080".to_string()));

        service.store(Month::blank(key(2024, 1), 0)).await.expect("store");

        assert_eq!(client.uploads()[0].0, "http://localhost:8080");
    }

    #[tokio::test]
    async fn delete_removes_local_and_remote_copies() {
        let client = Arc::new(FakeTimesheetCloud::default());
        let repository = Arc::new(InMemoryMonthRepository::default());
        let service = service(Arc::clone(&client), Arc::clone(&repository), true);
        service.store(Month::blank(key(2024, 8), 0)).await.expect("store");

        assert!(service.delete(2024, 8).await.expect("delete"));
        assert!(!service.delete(2024, 8).await.expect("delete again"));
        assert!(service.list_local().expect("list").is_empty());
        assert_eq!(client.deletes.lock().expect("deletes lock").len(), 2);
    }

    proptest! {
        #[test]
        fn store_adds_exactly_one_to_previous_counter(previous in 1u64..10_000, month in 1u32..=12) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let repository = Arc::new(InMemoryMonthRepository::default());
                let service = service(Arc::new(FakeTimesheetCloud::default()), Arc::clone(&repository), false);
                let mut sheet = Month::blank(key(2024, month), 0);
                sheet.change_id = Some(previous);

                let stored = service.store(sheet).await.expect("store");
                let reloaded = service.load(2024, month).await.expect("load");

                assert_eq!(stored.change_id, Some(previous + 1));
                assert_eq!(reloaded.month.change_id, Some(previous + 1));
            });
        }
    }
}
