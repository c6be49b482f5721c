//! Repositories over the extension tables
//!
//! `ExtensionRepository` persists the installed-extension list per profile;
//! `SqliteKvStore` backs the namespaced extension storage.

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::ExtensionRecord;
use crate::plugin::storage::KvStore;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;

const EXTENSION_COLUMNS: &str = "profile, id, manifest, source, enabled, installed_at";

fn extension_from_row(row: &Row<'_>) -> rusqlite::Result<ExtensionRecord> {
    Ok(ExtensionRecord {
        profile: row.get(0)?,
        id: row.get(1)?,
        manifest: row.get(2)?,
        source: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        installed_at: row.get(5)?,
    })
}

/// Installed extensions
#[derive(Clone)]
pub struct ExtensionRepository {
    db: Arc<DatabaseManager>,
}

impl ExtensionRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    /// Every entry of a profile, oldest install first
    pub async fn find_all(&self, profile: &str) -> Result<Vec<ExtensionRecord>> {
        let profile = profile.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM extensions WHERE profile = ? ORDER BY installed_at, id",
                    EXTENSION_COLUMNS
                ))?;
                let records = stmt
                    .query_map([&profile], extension_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await
    }

    pub async fn find_by_id(&self, profile: &str, id: &str) -> Result<Option<ExtensionRecord>> {
        let (profile, id) = (profile.to_string(), id.to_string());
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM extensions WHERE profile = ? AND id = ?", EXTENSION_COLUMNS),
                        [&profile, &id],
                        extension_from_row,
                    )
                    .optional()?)
            })
            .await
    }

    /// Insert or replace an entry; a replaced entry keeps its install time
    pub async fn upsert(&self, record: &ExtensionRecord) -> Result<()> {
        let record = record.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO extensions (profile, id, manifest, source, enabled, installed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(profile, id) DO UPDATE SET \
                     manifest = excluded.manifest, source = excluded.source, enabled = excluded.enabled",
                    params![
                        record.profile,
                        record.id,
                        record.manifest,
                        record.source,
                        record.enabled as i64,
                        record.installed_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Returns whether a row was updated
    pub async fn set_enabled(&self, profile: &str, id: &str, enabled: bool) -> Result<bool> {
        let (profile, id) = (profile.to_string(), id.to_string());
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE extensions SET enabled = ? WHERE profile = ? AND id = ?",
                    params![enabled as i64, profile, id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Returns whether a row was deleted
    pub async fn delete(&self, profile: &str, id: &str) -> Result<bool> {
        let (profile, id) = (profile.to_string(), id.to_string());
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM extensions WHERE profile = ? AND id = ?",
                    [&profile, &id],
                )?;
                Ok(changed > 0)
            })
            .await
    }
}

/// [`KvStore`] over the `extension_storage` table.
///
/// Flat keys have the form `<namespace>::<key>`; the namespace part goes to
/// its own column so one extension's rows share an index prefix.
#[derive(Clone)]
pub struct SqliteKvStore {
    db: Arc<DatabaseManager>,
}

impl SqliteKvStore {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }
}

const NAMESPACE_SEPARATOR: &str = "::";

fn split_key(key: &str) -> (String, String) {
    match key.split_once(NAMESPACE_SEPARATOR) {
        Some((namespace, rest)) => (namespace.to_string(), rest.to_string()),
        None => (String::new(), key.to_string()),
    }
}

fn join_key(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, key)
    }
}

fn parse_value(raw: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let (namespace, key) = split_key(key);
        self.db
            .execute(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM extension_storage WHERE namespace = ? AND key = ?",
                        [&namespace, &key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw.map(parse_value).transpose()?)
            })
            .await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let (namespace, key) = split_key(key);
        let value = serde_json::to_string(&value)?;
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO extension_storage (namespace, key, value, updated_at) \
                     VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP) \
                     ON CONFLICT(namespace, key) DO UPDATE SET \
                     value = excluded.value, updated_at = excluded.updated_at",
                    params![namespace, key, value],
                )?;
                Ok(())
            })
            .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let (namespace, key) = split_key(key);
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM extension_storage WHERE namespace = ? AND key = ?",
                    [&namespace, &key],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let (namespace, key_prefix) = split_key(prefix);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT namespace, key, value FROM extension_storage \
                     WHERE namespace = ?1 AND substr(key, 1, ?2) = ?3 ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(
                        params![namespace, key_prefix.chars().count() as i64, key_prefix],
                        |row| {
                            let namespace: String = row.get(0)?;
                            let key: String = row.get(1)?;
                            Ok((join_key(&namespace, &key), parse_value(row.get(2)?)?))
                        },
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let (namespace, key_prefix) = split_key(prefix);
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM extension_storage WHERE namespace = ?1 AND substr(key, 1, ?2) = ?3",
                    params![namespace, key_prefix.chars().count() as i64, key_prefix],
                )?;
                Ok(changed as u64)
            })
            .await
    }
}
