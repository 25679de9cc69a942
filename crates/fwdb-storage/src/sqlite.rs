use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fwdb_core::{ContactRecord, EmailKey, TABLE_NAME};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, info_span, Instrument};

use crate::{ensure_key_free, single_match, ContactStore, StoreError, ValidationError};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://fw_data_base.db";

/// SQLite-backed contact table. Column names match the spreadsheet headers and
/// carry no uniqueness constraint; identity lives in the email key.
#[derive(Debug, Clone)]
pub struct SqliteContactStore {
    pool: SqlitePool,
    exists: Arc<AtomicBool>,
}

fn create_table_sql() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            "Company" TEXT NOT NULL DEFAULT '',
            "Name" TEXT NOT NULL DEFAULT '',
            "Surname" TEXT NOT NULL DEFAULT '',
            "Email" TEXT NOT NULL DEFAULT '',
            "Position" TEXT NOT NULL DEFAULT '',
            "Phone" TEXT NOT NULL DEFAULT ''
        )"#
    )
}

fn insert_sql() -> String {
    format!(
        r#"INSERT INTO {TABLE_NAME} ("Company", "Name", "Surname", "Email", "Position", "Phone")
           VALUES (?, ?, ?, ?, ?, ?)"#
    )
}

impl SqliteContactStore {
    /// Open (creating if missing) the database at `url` and inspect the table once.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let connect_err = |source| StoreError::Connect {
            url: url.to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(url)
            .map_err(connect_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(connect_err)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let found: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(TABLE_NAME)
                .fetch_one(&pool)
                .await?;
        info!(table = TABLE_NAME, exists = found > 0, "contact store ready");
        Ok(Self {
            pool,
            exists: Arc::new(AtomicBool::new(found > 0)),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_with_rowid(&self) -> Result<Vec<(i64, ContactRecord)>, StoreError> {
        if !self.table_exists() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"SELECT rowid, "Company", "Name", "Surname", "Email", "Position", "Phone"
                 FROM {TABLE_NAME}
                ORDER BY rowid"#
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text = |idx: usize| -> Result<String, sqlx::Error> {
                Ok(row.try_get::<Option<String>, _>(idx)?.unwrap_or_default())
            };
            let record = ContactRecord::from_values([
                text(1)?,
                text(2)?,
                text(3)?,
                text(4)?,
                text(5)?,
                text(6)?,
            ]);
            out.push((row.try_get::<i64, _>(0)?, record));
        }
        Ok(out)
    }

    async fn insert_rows(tx: &mut Transaction<'_, Sqlite>, rows: &[ContactRecord]) -> Result<(), sqlx::Error> {
        let sql = insert_sql();
        for row in rows {
            sqlx::query(&sql)
                .bind(&row.company)
                .bind(&row.name)
                .bind(&row.surname)
                .bind(&row.email)
                .bind(&row.position)
                .bind(&row.phone)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn delete_rowids(tx: &mut Transaction<'_, Sqlite>, rowids: &[i64]) -> Result<(), sqlx::Error> {
        let sql = format!("DELETE FROM {TABLE_NAME} WHERE rowid = ?");
        for rowid in rowids {
            sqlx::query(&sql).bind(rowid).execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn overwrite_rowid(
        tx: &mut Transaction<'_, Sqlite>,
        rowid: i64,
        after: &ContactRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"UPDATE {TABLE_NAME}
                  SET "Company" = ?, "Name" = ?, "Surname" = ?, "Email" = ?, "Position" = ?, "Phone" = ?
                WHERE rowid = ?"#
        ))
        .bind(&after.company)
        .bind(&after.name)
        .bind(&after.surname)
        .bind(&after.email)
        .bind(&after.position)
        .bind(&after.phone)
        .bind(rowid)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContactStore for SqliteContactStore {
    fn table_exists(&self) -> bool {
        self.exists.load(Ordering::SeqCst)
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        if !self.table_exists() {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {TABLE_NAME}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn load_all(&self) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self
            .load_with_rowid()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn replace_all(&self, rows: &[ContactRecord]) -> Result<(), StoreError> {
        async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&create_table_sql()).execute(&mut *tx).await?;
            sqlx::query(&format!("DELETE FROM {TABLE_NAME}"))
                .execute(&mut *tx)
                .await?;
            Self::insert_rows(&mut tx, rows).await?;
            tx.commit().await?;
            self.exists.store(true, Ordering::SeqCst);
            info!("table replaced");
            Ok::<(), StoreError>(())
        }
        .instrument(info_span!("store_replace_all", rows = rows.len()))
        .await
    }

    async fn append(&self, rows: &[ContactRecord]) -> Result<(), StoreError> {
        async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&create_table_sql()).execute(&mut *tx).await?;
            Self::insert_rows(&mut tx, rows).await?;
            tx.commit().await?;
            self.exists.store(true, Ordering::SeqCst);
            info!("rows appended");
            Ok::<(), StoreError>(())
        }
        .instrument(info_span!("store_append", rows = rows.len()))
        .await
    }

    async fn drop_table(&self) -> Result<bool, StoreError> {
        let existed = self.table_exists();
        sqlx::query(&format!("DROP TABLE IF EXISTS {TABLE_NAME}"))
            .execute(&self.pool)
            .await?;
        self.exists.store(false, Ordering::SeqCst);
        info!(table = TABLE_NAME, existed, "table dropped");
        Ok(existed)
    }

    async fn update_row(&self, before: &ContactRecord, after: &ContactRecord) -> Result<(), StoreError> {
        let rows = self.load_with_rowid().await?;
        let rowid = single_match(&rows, before)?;
        ensure_key_free(&rows, &[rowid], &before.key(), after)?;
        let mut tx = self.pool.begin().await?;
        Self::overwrite_rowid(&mut tx, rowid, after).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_row(&self, row: &ContactRecord) -> Result<(), StoreError> {
        let rows = self.load_with_rowid().await?;
        let rowid = single_match(&rows, row)?;
        let mut tx = self.pool.begin().await?;
        Self::delete_rowids(&mut tx, &[rowid]).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_by_key(&self, key: &EmailKey, after: &ContactRecord) -> Result<usize, StoreError> {
        let rows = self.load_with_rowid().await?;
        let moving = rows
            .iter()
            .filter(|(_, row)| &row.key() == key)
            .map(|(rowid, _)| *rowid)
            .collect::<Vec<_>>();
        let Some((&first, rest)) = moving.split_first() else {
            return Err(ValidationError::NoMatch.into());
        };
        ensure_key_free(&rows, &moving, key, after)?;
        let mut tx = self.pool.begin().await?;
        Self::overwrite_rowid(&mut tx, first, after).await?;
        Self::delete_rowids(&mut tx, rest).await?;
        tx.commit().await?;
        Ok(moving.len())
    }

    async fn delete_by_key(&self, key: &EmailKey) -> Result<usize, StoreError> {
        let doomed = self
            .load_with_rowid()
            .await?
            .into_iter()
            .filter(|(_, row)| &row.key() == key)
            .map(|(rowid, _)| rowid)
            .collect::<Vec<_>>();
        if doomed.is_empty() {
            return Err(ValidationError::NoMatch.into());
        }
        let mut tx = self.pool.begin().await?;
        Self::delete_rowids(&mut tx, &doomed).await?;
        tx.commit().await?;
        Ok(doomed.len())
    }
}
