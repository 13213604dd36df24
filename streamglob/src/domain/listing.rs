//! A logical content unit aggregating one or more sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Source;
use crate::utils::filename::sanitize_filename;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Option<i64>,
    pub provider_id: String,
    pub title: String,
    pub downloaded: Option<DateTime<Utc>>,
    pub viewed: Option<DateTime<Utc>>,
    pub sources: Vec<Source>,
}

impl Listing {
    pub fn new(provider_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: None,
            provider_id: provider_id.into(),
            title: title.into(),
            downloaded: None,
            viewed: None,
            sources: Vec::new(),
        }
    }

    /// Append a source, assigning it the next rank.
    pub fn with_source(mut self, source: Source) -> Self {
        let rank = self.sources.len() as u32;
        self.sources.push(source.with_rank(rank));
        self
    }

    /// Title made safe for use as a path component.
    pub fn safe_title(&self) -> String {
        sanitize_filename(&self.title)
    }

    /// Value of a `{listing.<field>}` template placeholder. `title` renders
    /// the filesystem-safe variant.
    pub fn template_field(&self, field: &str) -> Option<String> {
        Some(match field {
            "title" | "safe_title" => self.safe_title(),
            "raw_title" => self.title.clone(),
            "provider" | "provider_id" => self.provider_id.clone(),
            "id" => self.id.map(|id| id.to_string()).unwrap_or_default(),
            _ => return None,
        })
    }

    /// Every source has been viewed. Derived; sources are authoritative.
    pub fn is_viewed(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(Source::is_viewed)
    }

    /// Every source has been downloaded. Derived; sources are authoritative.
    pub fn is_downloaded(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(Source::is_downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_source_assigns_ranks() {
        let listing = Listing::new("bam", "Game")
            .with_source(Source::new("bam", "https://example.com/home.m3u8"))
            .with_source(Source::new("bam", "https://example.com/away.m3u8"));
        let ranks: Vec<u32> = listing.sources.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![0, 1]);
    }

    #[test]
    fn test_title_field_is_sanitized() {
        let listing = Listing::new("rss", "Q&A: what/why?");
        assert_eq!(listing.template_field("title").as_deref(), Some("Q&A_ what_why_"));
        assert_eq!(
            listing.template_field("raw_title").as_deref(),
            Some("Q&A: what/why?")
        );
        assert_eq!(listing.template_field("missing"), None);
    }

    #[test]
    fn test_aggregate_state_is_derived_from_sources() {
        let mut listing = Listing::new("bam", "Game")
            .with_source(Source::new("bam", "a.mp4"))
            .with_source(Source::new("bam", "b.mp4"));
        assert!(!listing.is_viewed());

        listing.sources[0].viewed = Some(Utc::now());
        assert!(!listing.is_viewed());

        listing.sources[1].viewed = Some(Utc::now());
        assert!(listing.is_viewed());
        assert!(!listing.is_downloaded());
        assert!(!Listing::new("bam", "Empty").is_viewed());
    }
}
