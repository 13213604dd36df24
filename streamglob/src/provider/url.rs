//! Built-in provider for plain URLs and local files.

use super::{ListingFactory, SourceFactory};
use crate::domain::{Listing, Source};
use crate::{Error, Result};

pub const URL_PROVIDER_ID: &str = "url";

#[derive(Debug, Clone)]
pub struct UrlSourceFactory {
    provider_id: String,
}

impl UrlSourceFactory {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
        }
    }
}

impl SourceFactory for UrlSourceFactory {
    /// `file://` URLs become plain local paths; everything else is kept
    /// as given. The media type is guessed from the extension either way.
    fn create_source(&self, locator: &str) -> Result<Source> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(Error::unsupported("empty locator"));
        }
        let locator = match locator.strip_prefix("file://") {
            Some("") => return Err(Error::unsupported("file URL without a path")),
            Some(path) => path,
            None => locator,
        };
        Ok(Source::new(&self.provider_id, locator))
    }
}

#[derive(Debug, Clone)]
pub struct UrlListingFactory {
    provider_id: String,
    sources: UrlSourceFactory,
}

impl UrlListingFactory {
    pub fn new(provider_id: impl Into<String>) -> Self {
        let provider_id = provider_id.into();
        Self {
            sources: UrlSourceFactory::new(provider_id.clone()),
            provider_id,
        }
    }
}

impl ListingFactory for UrlListingFactory {
    /// A blank title falls back to the first source's default name.
    fn create_listing(&self, title: &str, locators: &[String]) -> Result<Listing> {
        if locators.is_empty() {
            return Err(Error::EmptyTask);
        }
        let sources = locators
            .iter()
            .map(|locator| self.sources.create_source(locator))
            .collect::<Result<Vec<_>>>()?;

        let title = match title.trim() {
            "" => sources[0].default_name(),
            title => title.to_string(),
        };
        Ok(sources
            .into_iter()
            .fold(Listing::new(&self.provider_id, title), Listing::with_source))
    }
}
