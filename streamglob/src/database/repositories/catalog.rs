//! Catalog repository: listings and sources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::catalog_tx::{CatalogTxOps, StampColumn};
use crate::database::models::{NewSourceRow, SourceDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::to_ms;
use crate::database::{DbPool, begin_immediate};
use crate::domain::{Listing, Source};
use crate::{Error, Result};

/// Catalog repository trait.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Insert a listing and its sources, returning it with ids assigned.
    async fn create_listing(&self, listing: &Listing) -> Result<Listing>;
    /// Insert a source, standalone or under an existing listing.
    async fn add_source(&self, listing_id: Option<i64>, source: &Source) -> Result<Source>;
    async fn get_listing(&self, id: i64) -> Result<Listing>;
    async fn get_source(&self, id: i64) -> Result<Source>;
    async fn sources_for_listing(&self, listing_id: i64) -> Result<Vec<Source>>;
    async fn find_source(&self, provider_id: &str, locator: &str) -> Result<Option<Source>>;

    /// Point the given sources at the task acting on them.
    async fn attach_task(&self, source_ids: &[i64], task_id: &str) -> Result<()>;
    /// Drop the task reference from sources still pointing at `task_id`.
    async fn release_task(&self, source_ids: &[i64], task_id: &str) -> Result<()>;
    /// Stamp `viewed` on the sources and listing in one transaction.
    async fn mark_viewed(
        &self,
        listing_id: Option<i64>,
        source_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<()>;
    /// Stamp `downloaded` on the sources and listing in one transaction.
    async fn mark_downloaded(
        &self,
        listing_id: Option<i64>,
        source_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// SQLx implementation of CatalogRepository.
pub struct SqlxCatalogRepository {
    pool: DbPool,
}

impl SqlxCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn stamp(
        &self,
        column: StampColumn,
        listing_id: Option<i64>,
        source_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<()> {
        if source_ids.is_empty() && listing_id.is_none() {
            return Ok(());
        }
        let at_ms = at.timestamp_millis();

        retry_on_sqlite_busy("catalog_stamp", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            for &source_id in source_ids {
                let affected =
                    CatalogTxOps::stamp_source(&mut tx, source_id, column, at_ms).await?;
                if affected == 0 {
                    tx.rollback().await?;
                    return Err(Error::not_found("Source", source_id.to_string()));
                }
            }
            if let Some(listing_id) = listing_id {
                CatalogTxOps::stamp_listing(&mut tx, listing_id, column, at_ms).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;

        debug!(
            ?column,
            listing_id = ?listing_id,
            sources = source_ids.len(),
            "Stamped catalog entries"
        );
        Ok(())
    }
}

#[async_trait]
impl CatalogRepository for SqlxCatalogRepository {
    async fn create_listing(&self, listing: &Listing) -> Result<Listing> {
        let mut tx = begin_immediate(&self.pool).await?;
        let listing_id = CatalogTxOps::insert_listing(
            &mut tx,
            &listing.provider_id,
            &listing.title,
            to_ms(listing.downloaded),
            to_ms(listing.viewed),
        )
        .await?;

        let mut sources = Vec::with_capacity(listing.sources.len());
        for source in &listing.sources {
            let row = NewSourceRow::from_domain(Some(listing_id), source);
            let id = CatalogTxOps::insert_source(&mut tx, &row).await?;
            let mut stored = source.clone();
            stored.id = Some(id);
            sources.push(stored);
        }
        tx.commit().await?;

        Ok(Listing {
            id: Some(listing_id),
            sources,
            ..listing.clone()
        })
    }

    async fn add_source(&self, listing_id: Option<i64>, source: &Source) -> Result<Source> {
        let row = NewSourceRow::from_domain(listing_id, source);
        let mut conn = self.pool.acquire().await?;
        let id = CatalogTxOps::insert_source(&mut conn, &row).await?;
        let mut stored = source.clone();
        stored.id = Some(id);
        Ok(stored)
    }

    async fn get_listing(&self, id: i64) -> Result<Listing> {
        let mut conn = self.pool.acquire().await?;
        let listing = CatalogTxOps::get_listing(&mut conn, id)
            .await?
            .ok_or_else(|| Error::not_found("Listing", id.to_string()))?;
        let sources = CatalogTxOps::sources_for_listing(&mut conn, id).await?;
        Ok(listing.into_domain(sources))
    }

    async fn get_source(&self, id: i64) -> Result<Source> {
        sqlx::query_as::<_, SourceDbModel>("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(SourceDbModel::into_domain)
            .ok_or_else(|| Error::not_found("Source", id.to_string()))
    }

    async fn sources_for_listing(&self, listing_id: i64) -> Result<Vec<Source>> {
        let mut conn = self.pool.acquire().await?;
        let rows = CatalogTxOps::sources_for_listing(&mut conn, listing_id).await?;
        Ok(rows.into_iter().map(SourceDbModel::into_domain).collect())
    }

    async fn find_source(&self, provider_id: &str, locator: &str) -> Result<Option<Source>> {
        let row = sqlx::query_as::<_, SourceDbModel>(
            "SELECT * FROM sources WHERE provider_id = ? AND locator = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(provider_id)
        .bind(locator)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SourceDbModel::into_domain))
    }

    async fn attach_task(&self, source_ids: &[i64], task_id: &str) -> Result<()> {
        if source_ids.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("attach_task", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            for &source_id in source_ids {
                CatalogTxOps::set_task(&mut tx, source_id, Some(task_id)).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn release_task(&self, source_ids: &[i64], task_id: &str) -> Result<()> {
        if source_ids.is_empty() {
            return Ok(());
        }
        retry_on_sqlite_busy("release_task", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            for &source_id in source_ids {
                CatalogTxOps::release_task(&mut tx, source_id, task_id).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn mark_viewed(
        &self,
        listing_id: Option<i64>,
        source_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.stamp(StampColumn::Viewed, listing_id, source_ids, at)
            .await
    }

    async fn mark_downloaded(
        &self,
        listing_id: Option<i64>,
        source_ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.stamp(StampColumn::Downloaded, listing_id, source_ids, at)
            .await
    }
}
