//! A single playable or downloadable locator.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use super::MediaType;
use super::media_type::locator_extension;

/// One playable/downloadable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Catalog row id; `None` for sources that were never persisted.
    pub id: Option<i64>,
    pub provider_id: String,
    /// URI or provider-specific identifier.
    pub locator: String,
    pub media_type: MediaType,
    /// Ordinal rank among siblings (0-based).
    pub rank: u32,
    /// Explicit output extension, if the provider knows it.
    pub ext: Option<String>,
    pub downloaded: Option<DateTime<Utc>>,
    pub viewed: Option<DateTime<Utc>>,
    /// Task currently acting on this source.
    pub task_id: Option<String>,
}

impl Source {
    pub fn new(provider_id: impl Into<String>, locator: impl Into<String>) -> Self {
        let locator = locator.into();
        Self {
            id: None,
            provider_id: provider_id.into(),
            media_type: MediaType::guess_from_locator(&locator),
            locator,
            rank: 0,
            ext: None,
            downloaded: None,
            viewed: None,
            task_id: None,
        }
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    /// Name derived from the last non-empty path segment of the locator,
    /// keeping only alphanumerics, spaces and dashes.
    pub fn default_name(&self) -> String {
        let path = self.locator.split(['?', '#']).next().unwrap_or(&self.locator);
        path.rsplit('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-')
                    .collect::<String>()
                    .trim_end()
                    .to_string()
            })
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| "untitled".to_string())
    }

    /// Output file extension: explicit, else taken from the locator, else a
    /// provider-specific placeholder.
    pub fn extension(&self) -> String {
        self.ext
            .clone()
            .or_else(|| locator_extension(&self.locator).map(str::to_ascii_lowercase))
            .unwrap_or_else(|| format!("{}_dl", self.provider_id))
    }

    /// Local timestamp used by the default filename template.
    pub fn timestamp(&self) -> String {
        Local::now().format("%Y%m%d_%H%M%S").to_string()
    }

    /// Value of a `{self.<field>}` template placeholder.
    pub fn template_field(&self, field: &str) -> Option<String> {
        Some(match field {
            "provider" | "provider_id" => self.provider_id.clone(),
            "locator" | "url" => self.locator.clone(),
            "media_type" => self.media_type.as_str().to_string(),
            "rank" => self.rank.to_string(),
            "ext" => self.extension(),
            "default_name" => self.default_name(),
            "timestamp" => self.timestamp(),
            "id" => self.id.map(|id| id.to_string()).unwrap_or_default(),
            _ => return None,
        })
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.is_some()
    }

    pub fn is_viewed(&self) -> bool {
        self.viewed.is_some()
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.locator)
    }
}
