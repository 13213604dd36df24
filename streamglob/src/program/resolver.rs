//! Program selection.

use super::{Program, ProgramRole, ProgramSpec};
use crate::config::ProgramsConfig;
use crate::domain::Source;
use crate::{Error, Result};

/// Picks the concrete program for a task.
///
/// All methods are synchronous so that resolution errors surface to the
/// submitter before anything is admitted.
pub trait ProgramResolver: Send + Sync {
    fn resolve_player(&self, sources: &[Source], preferred: Option<&str>) -> Result<Program>;

    fn resolve_downloader(&self, sources: &[Source], preferred: Option<&str>) -> Result<Program>;

    fn resolve_postprocessor(&self, name: &str) -> Result<Program>;

    /// Resolve a whole postprocessor chain, failing on the first unknown name.
    fn resolve_postprocessors(&self, names: &[String]) -> Result<Vec<Program>> {
        names
            .iter()
            .map(|name| self.resolve_postprocessor(name))
            .collect()
    }
}

/// Resolver backed by the configured program lists.
///
/// Without an explicit choice, the first program whose media types cover
/// every source wins.
#[derive(Debug, Clone, Default)]
pub struct ConfigProgramResolver {
    players: Vec<ProgramSpec>,
    downloaders: Vec<ProgramSpec>,
    postprocessors: Vec<ProgramSpec>,
    pinned_player: Option<String>,
    pinned_downloader: Option<String>,
}

impl ConfigProgramResolver {
    pub fn new(config: &ProgramsConfig) -> Self {
        Self {
            players: config.players.clone(),
            downloaders: config.downloaders.clone(),
            postprocessors: config.postprocessors.clone(),
            pinned_player: None,
            pinned_downloader: None,
        }
    }

    /// Pin the player and downloader used when a task does not choose one.
    pub fn with_pinned(mut self, player: Option<String>, downloader: Option<String>) -> Self {
        self.pinned_player = player;
        self.pinned_downloader = downloader;
        self
    }

    fn pick(
        role: ProgramRole,
        specs: &[ProgramSpec],
        sources: &[Source],
        preferred: Option<&str>,
    ) -> Result<Program> {
        if sources.is_empty() {
            return Err(Error::EmptyTask);
        }

        if let Some(name) = preferred {
            let spec = specs
                .iter()
                .find(|spec| spec.name == name)
                .ok_or_else(|| Error::UnknownProgram {
                    kind: role.to_string(),
                    name: name.to_string(),
                })?;
            if !spec.supports(sources) {
                return Err(Error::unsupported(format!(
                    "{} {} does not handle {}",
                    role,
                    name,
                    describe_media(sources)
                )));
            }
            return Ok(Program::new(spec.clone(), role));
        }

        specs
            .iter()
            .find(|spec| spec.supports(sources))
            .map(|spec| Program::new(spec.clone(), role))
            .ok_or_else(|| {
                Error::unsupported(format!("no {} handles {}", role, describe_media(sources)))
            })
    }
}

fn describe_media(sources: &[Source]) -> String {
    let mut kinds: Vec<&str> = sources.iter().map(|s| s.media_type.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    kinds.join("+")
}

impl ProgramResolver for ConfigProgramResolver {
    fn resolve_player(&self, sources: &[Source], preferred: Option<&str>) -> Result<Program> {
        let preferred = preferred.or(self.pinned_player.as_deref());
        Self::pick(ProgramRole::Player, &self.players, sources, preferred)
    }

    fn resolve_downloader(&self, sources: &[Source], preferred: Option<&str>) -> Result<Program> {
        let preferred = preferred.or(self.pinned_downloader.as_deref());
        Self::pick(ProgramRole::Downloader, &self.downloaders, sources, preferred)
    }

    fn resolve_postprocessor(&self, name: &str) -> Result<Program> {
        self.postprocessors
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| Program::new(spec.clone(), ProgramRole::Postprocessor))
            .ok_or_else(|| Error::UnknownProgram {
                kind: ProgramRole::Postprocessor.to_string(),
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaType;

    fn resolver() -> ConfigProgramResolver {
        ConfigProgramResolver::new(&ProgramsConfig {
            players: vec![
                ProgramSpec::new("feh", "feh").with_media_types([MediaType::Image]),
                ProgramSpec::new("mpv", "mpv").with_media_types([MediaType::Video, MediaType::Audio]),
            ],
            downloaders: ProgramSpec::default_downloaders(),
            postprocessors: vec![ProgramSpec::new("remux", "ffmpeg")],
        })
    }

    #[test]
    fn test_first_covering_program_wins() {
        let video = [Source::new("p", "https://example.com/a.m3u8")];
        assert_eq!(resolver().resolve_player(&video, None).unwrap().name(), "mpv");

        let image = [Source::new("p", "https://example.com/a.png")];
        assert_eq!(resolver().resolve_player(&image, None).unwrap().name(), "feh");
        assert_eq!(resolver().resolve_downloader(&image, None).unwrap().name(), "copy");
    }

    #[test]
    fn test_mixed_media_unsupported() {
        let mixed = [
            Source::new("p", "https://example.com/a.m3u8"),
            Source::new("p", "https://example.com/a.png"),
        ];
        let err = resolver().resolve_player(&mixed, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSource { .. }));
        assert!(err.is_resolution_error());
    }

    #[test]
    fn test_preferred_and_pinned() {
        let video = [Source::new("p", "https://example.com/a.mp4")];
        let r = resolver();
        assert_eq!(r.resolve_downloader(&video, Some("copy")).unwrap().name(), "copy");
        assert!(matches!(
            r.resolve_player(&video, Some("feh")),
            Err(Error::UnsupportedSource { .. })
        ));
        assert!(matches!(
            r.resolve_player(&video, Some("vlc")),
            Err(Error::UnknownProgram { .. })
        ));

        let pinned = resolver().with_pinned(None, Some("copy".into()));
        assert_eq!(pinned.resolve_downloader(&video, None).unwrap().name(), "copy");
        assert_eq!(
            pinned.resolve_downloader(&video, Some("streamlink")).unwrap().name(),
            "streamlink"
        );
    }

    #[test]
    fn test_postprocessors() {
        let r = resolver();
        let chain = r.resolve_postprocessors(&["remux".to_string()]).unwrap();
        assert_eq!(chain[0].role(), ProgramRole::Postprocessor);
        assert!(matches!(
            r.resolve_postprocessors(&["remux".to_string(), "nope".to_string()]),
            Err(Error::UnknownProgram { .. })
        ));
    }

    #[test]
    fn test_empty_sources() {
        assert!(matches!(
            resolver().resolve_player(&[], None),
            Err(Error::EmptyTask)
        ));
    }
}
