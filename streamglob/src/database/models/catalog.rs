//! Catalog rows: listings and their sources.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{from_ms, to_ms};
use crate::domain::{Listing, MediaType, Source};

/// Listing row. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ListingDbModel {
    pub id: i64,
    pub provider_id: String,
    pub title: String,
    pub downloaded: Option<i64>,
    pub viewed: Option<i64>,
}

impl ListingDbModel {
    /// Build the domain listing from this row and its ordered source rows.
    pub fn into_domain(self, sources: Vec<SourceDbModel>) -> Listing {
        Listing {
            id: Some(self.id),
            provider_id: self.provider_id,
            title: self.title,
            downloaded: from_ms(self.downloaded),
            viewed: from_ms(self.viewed),
            sources: sources.into_iter().map(SourceDbModel::into_domain).collect(),
        }
    }
}

/// Source row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SourceDbModel {
    pub id: i64,
    pub listing_id: Option<i64>,
    pub provider_id: String,
    pub locator: String,
    pub media_type: String,
    pub rank: i64,
    pub ext: Option<String>,
    pub downloaded: Option<i64>,
    pub viewed: Option<i64>,
    pub task_id: Option<String>,
}

impl SourceDbModel {
    pub fn into_domain(self) -> Source {
        Source {
            id: Some(self.id),
            provider_id: self.provider_id,
            locator: self.locator,
            media_type: MediaType::parse(&self.media_type),
            rank: u32::try_from(self.rank).unwrap_or(0),
            ext: self.ext,
            downloaded: from_ms(self.downloaded),
            viewed: from_ms(self.viewed),
            task_id: self.task_id,
        }
    }
}

/// Column values for inserting a source.
#[derive(Debug, Clone)]
pub struct NewSourceRow {
    pub listing_id: Option<i64>,
    pub provider_id: String,
    pub locator: String,
    pub media_type: String,
    pub rank: i64,
    pub ext: Option<String>,
    pub downloaded: Option<i64>,
    pub viewed: Option<i64>,
}

impl NewSourceRow {
    pub fn from_domain(listing_id: Option<i64>, source: &Source) -> Self {
        Self {
            listing_id,
            provider_id: source.provider_id.clone(),
            locator: source.locator.clone(),
            media_type: source.media_type.as_str().to_string(),
            rank: i64::from(source.rank),
            ext: source.ext.clone(),
            downloaded: to_ms(source.downloaded),
            viewed: to_ms(source.viewed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_row_into_domain() {
        let row = SourceDbModel {
            id: 7,
            listing_id: Some(1),
            provider_id: "bam".into(),
            locator: "https://example.com/a.mp4".into(),
            media_type: "video".into(),
            rank: 2,
            ext: None,
            downloaded: Some(1_700_000_000_000),
            viewed: None,
            task_id: None,
        };
        let source = row.into_domain();
        assert_eq!(source.id, Some(7));
        assert_eq!(source.rank, 2);
        assert_eq!(source.media_type, MediaType::Video);
        assert!(source.is_downloaded());
        assert!(!source.is_viewed());
    }

    #[test]
    fn test_negative_rank_clamps() {
        let row = SourceDbModel {
            id: 1,
            listing_id: None,
            provider_id: "p".into(),
            locator: "x".into(),
            media_type: "unknown".into(),
            rank: -1,
            ext: None,
            downloaded: None,
            viewed: None,
            task_id: None,
        };
        assert_eq!(row.into_domain().rank, 0);
    }
}
