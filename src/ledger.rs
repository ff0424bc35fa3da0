//! Per-role version ledger persisted in SQLite.
//!
//! Each role scope owns its own database file, so no query can ever join
//! one role's manifest with another's.
//!
//! # Schema
//!
//! ```text
//! mirror_entries(key PK, role, version, size, local_path, fetched_at)
//! scope_state(name PK, value)      -- "fingerprint", "last_sync"
//! ```
//!
//! A sync's delta is applied in a single transaction together with the new
//! fingerprint, so the persisted manifest is always one that a completed
//! sync produced.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use policy_retrieval_core::models::{DocumentRef, MirrorEntry, RoleScope, SyncManifest};

use crate::error::{Result, RetrievalError};

pub struct Ledger {
    pool: SqlitePool,
    role: RoleScope,
}

impl Ledger {
    pub async fn open(path: &Path, role: RoleScope) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let ledger = Self { pool, role };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirror_entries (
                key TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                version TEXT NOT NULL,
                size INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scope_state (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the persisted manifest.
    ///
    /// The stored fingerprint is checked against one recomputed from the rows;
    /// a mismatch, or a row owned by another role, means the ledger is corrupt.
    pub async fn load(&self) -> Result<SyncManifest> {
        let rows = sqlx::query(
            "SELECT key, role, version, size, local_path, fetched_at FROM mirror_entries ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("key").map_err(corrupt)?;
            let role: String = row.try_get("role").map_err(corrupt)?;
            if role != self.role.as_str() {
                return Err(RetrievalError::corrupt(
                    "ledger",
                    format!("entry '{}' belongs to role '{}', not {}", key, role, self.role),
                ));
            }
            let size: i64 = row.try_get("size").map_err(corrupt)?;
            let local_path: String = row.try_get("local_path").map_err(corrupt)?;
            entries.push(MirrorEntry {
                doc: DocumentRef::new(
                    key,
                    self.role,
                    row.try_get::<String, _>("version").map_err(corrupt)?,
                    size.max(0) as u64,
                ),
                local_path: PathBuf::from(local_path),
                fetched_at: row.try_get("fetched_at").map_err(corrupt)?,
            });
        }

        let stored_fp = self.state("fingerprint").await?;
        let last_sync = self
            .state("last_sync")
            .await?
            .and_then(|v| v.parse::<i64>().ok());

        let manifest = SyncManifest::from_entries(entries, last_sync);
        if let Some(stored) = stored_fp {
            if stored != manifest.fingerprint {
                return Err(RetrievalError::corrupt(
                    "ledger",
                    format!(
                        "stored fingerprint {} does not match entries ({})",
                        stored, manifest.fingerprint
                    ),
                ));
            }
        }
        Ok(manifest)
    }

    async fn state(&self, name: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM scope_state WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Apply a sync delta and record the resulting manifest state atomically.
    pub async fn commit(
        &self,
        upserts: &[MirrorEntry],
        removed: &[String],
        fingerprint: &str,
        synced_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for key in removed {
            sqlx::query("DELETE FROM mirror_entries WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        for entry in upserts {
            sqlx::query(
                r#"
                INSERT INTO mirror_entries (key, role, version, size, local_path, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    role = excluded.role,
                    version = excluded.version,
                    size = excluded.size,
                    local_path = excluded.local_path,
                    fetched_at = excluded.fetched_at
                "#,
            )
            .bind(&entry.doc.key)
            .bind(self.role.as_str())
            .bind(&entry.doc.version)
            .bind(entry.doc.size as i64)
            .bind(entry.local_path.to_string_lossy().into_owned())
            .bind(entry.fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        for (name, value) in [("fingerprint", fingerprint.to_string()), ("last_sync", synced_at.to_string())] {
            sqlx::query(
                "INSERT INTO scope_state (name, value) VALUES (?, ?) \
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            )
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Forget every entry, e.g. before a full resync after corruption.
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mirror_entries")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM scope_state")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn corrupt(e: sqlx::Error) -> RetrievalError {
    RetrievalError::corrupt("ledger", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(key: &str, version: &str) -> MirrorEntry {
        MirrorEntry {
            doc: DocumentRef::new(key, RoleScope::Employee, version, 42),
            local_path: PathBuf::from(format!("/mirror/{}", key)),
            fetched_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_empty_ledger_loads_empty_manifest() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger.sqlite"), RoleScope::Employee)
            .await
            .unwrap();
        let m = ledger.load().await.unwrap();
        assert!(m.is_empty());
        assert_eq!(m.last_sync, None);
    }

    #[tokio::test]
    async fn test_commit_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.sqlite");
        let entries = vec![entry("employee/a.md", "1"), entry("employee/b.md", "1")];
        let expected = SyncManifest::from_entries(entries.clone(), Some(10));

        {
            let ledger = Ledger::open(&path, RoleScope::Employee).await.unwrap();
            ledger
                .commit(&entries, &[], &expected.fingerprint, 10)
                .await
                .unwrap();
            ledger.close().await;
        }

        let ledger = Ledger::open(&path, RoleScope::Employee).await.unwrap();
        let m = ledger.load().await.unwrap();
        assert_eq!(m, expected);
    }

    #[tokio::test]
    async fn test_commit_applies_removals_and_replacements() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("l.sqlite"), RoleScope::Employee)
            .await
            .unwrap();
        let first = vec![entry("employee/a.md", "1"), entry("employee/b.md", "1")];
        let fp1 = SyncManifest::from_entries(first.clone(), None).fingerprint;
        ledger.commit(&first, &[], &fp1, 1).await.unwrap();

        let replaced = vec![entry("employee/a.md", "2")];
        let after = SyncManifest::from_entries(replaced.clone(), None);
        ledger
            .commit(&replaced, &["employee/b.md".to_string()], &after.fingerprint, 2)
            .await
            .unwrap();

        let m = ledger.load().await.unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.entries["employee/a.md"].doc.version, "2");
        assert_eq!(m.last_sync, Some(2));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("l.sqlite"), RoleScope::Employee)
            .await
            .unwrap();
        ledger
            .commit(&[entry("employee/a.md", "1")], &[], "not-the-fingerprint", 1)
            .await
            .unwrap();
        let err = ledger.load().await.unwrap_err();
        assert!(err.requires_full_rebuild());

        ledger.reset().await.unwrap();
        assert!(ledger.load().await.unwrap().is_empty());
    }
}
