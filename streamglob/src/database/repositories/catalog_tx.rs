//! Transactional catalog operations.
//!
//! These operate within an existing transaction and do NOT commit. The
//! caller is responsible for committing or rolling back.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{ListingDbModel, NewSourceRow, SourceDbModel};

/// Which completion timestamp to stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampColumn {
    Viewed,
    Downloaded,
}

impl StampColumn {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Viewed => "viewed",
            Self::Downloaded => "downloaded",
        }
    }
}

pub struct CatalogTxOps;

impl CatalogTxOps {
    pub async fn insert_listing(
        tx: &mut SqliteConnection,
        provider_id: &str,
        title: &str,
        downloaded: Option<i64>,
        viewed: Option<i64>,
    ) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO listings (provider_id, title, downloaded, viewed) VALUES (?, ?, ?, ?)",
        )
        .bind(provider_id)
        .bind(title)
        .bind(downloaded)
        .bind(viewed)
        .execute(tx)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn insert_source(tx: &mut SqliteConnection, row: &NewSourceRow) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO sources (listing_id, provider_id, locator, media_type, rank, ext, downloaded, viewed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.listing_id)
        .bind(&row.provider_id)
        .bind(&row.locator)
        .bind(&row.media_type)
        .bind(row.rank)
        .bind(&row.ext)
        .bind(row.downloaded)
        .bind(row.viewed)
        .execute(tx)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_listing(
        tx: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<ListingDbModel>> {
        let listing = sqlx::query_as::<_, ListingDbModel>("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(tx)
            .await?;
        Ok(listing)
    }

    pub async fn sources_for_listing(
        tx: &mut SqliteConnection,
        listing_id: i64,
    ) -> Result<Vec<SourceDbModel>> {
        let sources = sqlx::query_as::<_, SourceDbModel>(
            "SELECT * FROM sources WHERE listing_id = ? ORDER BY rank, id",
        )
        .bind(listing_id)
        .fetch_all(tx)
        .await?;
        Ok(sources)
    }

    /// Record which task is acting on a source.
    pub async fn set_task(
        tx: &mut SqliteConnection,
        source_id: i64,
        task_id: Option<&str>,
    ) -> Result<u64> {
        let affected = sqlx::query("UPDATE sources SET task_id = ? WHERE id = ?")
            .bind(task_id)
            .bind(source_id)
            .execute(tx)
            .await?
            .rows_affected();
        Ok(affected)
    }

    /// Clear the task reference of a source if it still points at `task_id`.
    pub async fn release_task(
        tx: &mut SqliteConnection,
        source_id: i64,
        task_id: &str,
    ) -> Result<u64> {
        let affected = sqlx::query("UPDATE sources SET task_id = NULL WHERE id = ? AND task_id = ?")
            .bind(source_id)
            .bind(task_id)
            .execute(tx)
            .await?
            .rows_affected();
        Ok(affected)
    }

    /// Stamp a source and release its task reference.
    pub async fn stamp_source(
        tx: &mut SqliteConnection,
        source_id: i64,
        column: StampColumn,
        at_ms: i64,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE sources SET {} = ?, task_id = NULL WHERE id = ?",
            column.as_str()
        );
        let affected = sqlx::query(&sql)
            .bind(at_ms)
            .bind(source_id)
            .execute(tx)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn stamp_listing(
        tx: &mut SqliteConnection,
        listing_id: i64,
        column: StampColumn,
        at_ms: i64,
    ) -> Result<u64> {
        let sql = format!("UPDATE listings SET {} = ? WHERE id = ?", column.as_str());
        let affected = sqlx::query(&sql)
            .bind(at_ms)
            .bind(listing_id)
            .execute(tx)
            .await?
            .rows_affected();
        Ok(affected)
    }
}
