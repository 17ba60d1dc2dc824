use crate::domain::models::{Month, MonthKey};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Local document store for month sheets, keyed by (year, month).
pub trait MonthRepository: Send + Sync {
    /// `Ok(None)` only when no record exists. A record that cannot be parsed
    /// is `InfraError::UnreadableDocument`.
    fn get(&self, key: MonthKey) -> Result<Option<Month>, InfraError>;
    fn put(&self, month: &Month) -> Result<(), InfraError>;
    fn delete(&self, key: MonthKey) -> Result<bool, InfraError>;
    fn list_keys(&self) -> Result<Vec<MonthKey>, InfraError>;
}

fn month_key_of(month: &Month) -> Result<MonthKey, InfraError> {
    month.key().map_err(InfraError::InvalidInput)
}

#[derive(Debug, Clone)]
pub struct SqliteMonthRepository {
    db_path: PathBuf,
}

impl SqliteMonthRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl MonthRepository for SqliteMonthRepository {
    fn get(&self, key: MonthKey) -> Result<Option<Month>, InfraError> {
        let connection = self.connect()?;
        let document: Option<String> = connection
            .query_row(
                "SELECT document FROM months WHERE year = ?1 AND month = ?2",
                params![key.year(), key.month()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(document) = document else {
            return Ok(None);
        };

        serde_json::from_str::<Month>(&document)
            .map(Some)
            .map_err(|error| InfraError::UnreadableDocument {
                key: key.to_string(),
                reason: error.to_string(),
            })
    }

    fn put(&self, month: &Month) -> Result<(), InfraError> {
        let key = month_key_of(month)?;
        let document = serde_json::to_string(month)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO months (year, month, document, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(year, month) DO UPDATE SET
               document = excluded.document,
               updated_at = excluded.updated_at",
            params![key.year(), key.month(), document, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, key: MonthKey) -> Result<bool, InfraError> {
        let connection = self.connect()?;
        let removed = connection.execute(
            "DELETE FROM months WHERE year = ?1 AND month = ?2",
            params![key.year(), key.month()],
        )?;
        Ok(removed > 0)
    }

    fn list_keys(&self) -> Result<Vec<MonthKey>, InfraError> {
        let connection = self.connect()?;
        let mut statement =
            connection.prepare("SELECT year, month FROM months ORDER BY year, month")?;
        let rows = statement.query_map([], |row| Ok((row.get::<_, i32>(0)?, row.get::<_, u32>(1)?)))?;

        let mut keys = Vec::new();
        for row in rows {
            let (year, month) = row?;
            match MonthKey::new(year, month) {
                Ok(key) => keys.push(key),
                Err(error) => tracing::warn!(year, month, %error, "skipping invalid month row"),
            }
        }
        Ok(keys)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMonthRepository {
    months: Mutex<BTreeMap<MonthKey, Month>>,
}

impl InMemoryMonthRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<MonthKey, Month>>, InfraError> {
        self.months
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("month store lock poisoned: {error}")))
    }
}

impl MonthRepository for InMemoryMonthRepository {
    fn get(&self, key: MonthKey) -> Result<Option<Month>, InfraError> {
        Ok(self.lock()?.get(&key).cloned())
    }

    fn put(&self, month: &Month) -> Result<(), InfraError> {
        let key = month_key_of(month)?;
        self.lock()?.insert(key, month.clone());
        Ok(())
    }

    fn delete(&self, key: MonthKey) -> Result<bool, InfraError> {
        Ok(self.lock()?.remove(&key).is_some())
    }

    fn list_keys(&self) -> Result<Vec<MonthKey>, InfraError> {
        Ok(self.lock()?.keys().copied().collect())
    }
}
