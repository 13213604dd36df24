//! Provider registry and the task factory contract.
//!
//! A provider is registered under its id with a small bundle of factories
//! and a program resolver. The registry replaces any kind of runtime
//! discovery: what is registered is all there is.

mod url;

pub use url::{URL_PROVIDER_ID, UrlListingFactory, UrlSourceFactory};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::{AppConfig, OutputConfig};
use crate::database::CatalogRepository;
use crate::domain::{Listing, Source};
use crate::program::{ConfigProgramResolver, ProgramResolver, SessionHints};
use crate::task::template::find_downloaded;
use crate::task::{DownloadPayload, FilenameTemplate, Task, TaskOptions, TemplateContext};
use crate::{Error, Result};

/// Builds listings from user input.
pub trait ListingFactory: Send + Sync {
    fn create_listing(&self, title: &str, locators: &[String]) -> Result<Listing>;
}

/// Builds one source from a locator.
pub trait SourceFactory: Send + Sync {
    fn create_source(&self, locator: &str) -> Result<Source>;
}

/// Settings a provider applies to the tasks it creates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderSettings {
    pub output: OutputConfig,
    pub player: Option<String>,
    pub downloader: Option<String>,
    pub postprocessors: Vec<String>,
    pub session: SessionHints,
}

impl ProviderSettings {
    /// Global settings with the provider's overrides applied.
    pub fn from_app(config: &AppConfig, provider_id: &str) -> Self {
        let overrides = config.provider(provider_id);
        Self {
            output: config.output_for(provider_id).clone(),
            player: overrides.and_then(|p| p.player.clone()),
            downloader: overrides.and_then(|p| p.downloader.clone()),
            postprocessors: overrides
                .and_then(|p| p.postprocessors.clone())
                .unwrap_or_default(),
            session: config.session_for(provider_id),
        }
    }
}

/// Everything registered for one provider.
#[derive(Clone)]
pub struct ProviderBundle {
    pub listing_factory: Arc<dyn ListingFactory>,
    pub source_factory: Arc<dyn SourceFactory>,
    pub program_resolver: Arc<dyn ProgramResolver>,
    pub config: ProviderSettings,
}

/// A registered provider.
#[derive(Clone)]
pub struct Provider {
    id: String,
    bundle: ProviderBundle,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("config", &self.bundle.config)
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn new(id: impl Into<String>, bundle: ProviderBundle) -> Self {
        Self {
            id: id.into(),
            bundle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.bundle.config
    }

    pub fn resolver(&self) -> &Arc<dyn ProgramResolver> {
        &self.bundle.program_resolver
    }

    pub fn listing(&self, title: &str, locators: &[String]) -> Result<Listing> {
        self.bundle.listing_factory.create_listing(title, locators)
    }

    pub fn source(&self, locator: &str) -> Result<Source> {
        self.bundle.source_factory.create_source(locator)
    }

    /// Play task over every source of `listing`.
    ///
    /// The player is resolved here and pinned by name, so an unsupported
    /// listing fails before anything is submitted.
    pub fn create_play_task(&self, listing: &Listing, options: TaskOptions) -> Result<Task> {
        let mut options = self.with_defaults(options);
        let player = self
            .bundle
            .program_resolver
            .resolve_player(&listing.sources, options.player.as_deref())?;
        options.player = Some(player.name().to_string());

        Ok(Task::play(&listing.title, &self.id, listing.sources.clone(), options)
            .with_listing_id(listing.id))
    }

    /// One download task per selected source: the source at `index`, or
    /// every source when `index` is `None`.
    ///
    /// Destinations are rendered here, so template errors surface before
    /// any task exists.
    pub fn create_download_tasks(
        &self,
        listing: &Listing,
        index: Option<usize>,
        options: TaskOptions,
    ) -> Result<Vec<Task>> {
        let selected = select_sources(listing, index)?;
        let mut options = self.with_defaults(options);
        let template = self.template(&options)?;
        self.bundle
            .program_resolver
            .resolve_postprocessors(&options.postprocessors)?;
        if options.template.is_none() {
            options.template = Some(template.as_str().to_string());
        }

        let mut tasks = Vec::with_capacity(selected.len());
        for source in selected {
            let sources = std::slice::from_ref(source);
            let downloader = self
                .bundle
                .program_resolver
                .resolve_downloader(sources, options.downloader.as_deref())?;
            let mut task_options = options.clone();
            task_options.downloader = Some(downloader.name().to_string());

            let ctx = TemplateContext::new(source, Some(listing));
            let destination = template.destination(&self.bundle.config.output.path, &ctx)?;
            debug!(
                provider = %self.id,
                locator = %source.locator,
                destination = %destination.display(),
                "Download destination"
            );
            let payload = DownloadPayload::new(destination)
                .with_normalization(self.bundle.config.output.unicode_normalization);
            tasks.push(
                Task::download(&listing.title, &self.id, vec![source.clone()], task_options, payload)
                    .with_listing_id(listing.id),
            );
        }
        Ok(tasks)
    }

    /// Previously downloaded files for the selected sources, in source
    /// order. `None` marks a source with no match.
    pub async fn find_downloaded(
        &self,
        listing: &Listing,
        index: Option<usize>,
        options: &TaskOptions,
    ) -> Result<Vec<Option<PathBuf>>> {
        let template = self.template(&self.with_defaults(options.clone()))?;
        let dir: &Path = &self.bundle.config.output.path;
        let mut found = Vec::new();
        for source in select_sources(listing, index)? {
            let ctx = TemplateContext::new(source, Some(listing));
            found.push(find_downloaded(&template, dir, &ctx).await?);
        }
        Ok(found)
    }

    fn template(&self, options: &TaskOptions) -> Result<FilenameTemplate> {
        let template = options
            .template
            .as_deref()
            .or(self.bundle.config.output.template.as_deref());
        FilenameTemplate::parse_or_default(template)
    }

    /// Fill options the caller left unset from the provider settings.
    fn with_defaults(&self, mut options: TaskOptions) -> TaskOptions {
        let settings = &self.bundle.config;
        if options.postprocessors.is_empty() {
            options.postprocessors = settings.postprocessors.clone();
        }
        options.session = settings.session.merged(&options.session);
        options
    }
}

fn select_sources(listing: &Listing, index: Option<usize>) -> Result<Vec<&Source>> {
    if listing.sources.is_empty() {
        return Err(Error::EmptyTask);
    }
    match index {
        None => Ok(listing.sources.iter().collect()),
        Some(i) => listing.sources.get(i).map(|s| vec![s]).ok_or_else(|| {
            Error::validation(format!(
                "source index {} out of range, listing has {} sources",
                i,
                listing.sources.len()
            ))
        }),
    }
}

/// Providers by id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in providers, configured from `config`.
    pub fn with_builtin(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        let settings = ProviderSettings::from_app(config, URL_PROVIDER_ID);
        let resolver: Arc<dyn ProgramResolver> = Arc::new(
            ConfigProgramResolver::new(&config.programs)
                .with_pinned(settings.player.clone(), settings.downloader.clone()),
        );
        registry.register(
            URL_PROVIDER_ID,
            ProviderBundle {
                listing_factory: Arc::new(UrlListingFactory::new(URL_PROVIDER_ID)),
                source_factory: Arc::new(UrlSourceFactory::new(URL_PROVIDER_ID)),
                program_resolver: resolver,
                config: settings,
            },
        );
        registry
    }

    /// Register `bundle` under `id`, replacing any previous registration.
    pub fn register(&mut self, id: impl Into<String>, bundle: ProviderBundle) {
        let id = id.into();
        debug!(provider = %id, "Registering provider");
        self.providers.insert(id.clone(), Provider::new(id, bundle));
    }

    pub fn get(&self, id: &str) -> Result<&Provider> {
        self.providers
            .get(id)
            .ok_or_else(|| Error::not_found("Provider", id))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Bring `listing` into the catalog so its tasks can be stamped.
///
/// Sources already known by provider and locator keep their catalog ids
/// and nothing new is written; otherwise the listing is stored with all
/// of its sources.
pub async fn persist_listing(catalog: &dyn CatalogRepository, mut listing: Listing) -> Result<Listing> {
    let mut known = Vec::with_capacity(listing.sources.len());
    for source in &listing.sources {
        match catalog.find_source(&source.provider_id, &source.locator).await? {
            Some(stored) => known.push(stored),
            None => return catalog.create_listing(&listing).await,
        }
    }
    for (source, stored) in listing.sources.iter_mut().zip(known) {
        source.id = stored.id;
        source.downloaded = stored.downloaded;
        source.viewed = stored.viewed;
    }
    Ok(listing)
}
