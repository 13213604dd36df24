//! Media kind of a source.

use serde::{Deserialize, Serialize};

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "flv", "ts", "m3u8", "mov", "avi", "m4v", "mpd",
];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "flac", "wav"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Kind of media a source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Image,
    #[default]
    Unknown,
}

impl MediaType {
    /// Parse from the stored string, also accepting MIME types such as
    /// `video/mp4`.
    pub fn parse(s: &str) -> Self {
        let major = s.split('/').next().unwrap_or(s).trim();
        match major.to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "image" => Self::Image,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }

    /// Guess from the file extension of a URL or path.
    pub fn guess_from_locator(locator: &str) -> Self {
        let Some(ext) = locator_extension(locator) else {
            return Self::Unknown;
        };
        let ext = ext.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Audio
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension of the last path segment of a locator, ignoring any query
/// string or fragment.
pub(crate) fn locator_extension(locator: &str) -> Option<&str> {
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(MediaType::parse("video"), MediaType::Video);
        assert_eq!(MediaType::parse("audio/mpeg"), MediaType::Audio);
        assert_eq!(MediaType::parse("IMAGE"), MediaType::Image);
        assert_eq!(MediaType::parse("text/html"), MediaType::Unknown);
        assert_eq!(MediaType::parse(MediaType::Video.as_str()), MediaType::Video);
    }

    #[test]
    fn test_guess_from_locator() {
        assert_eq!(
            MediaType::guess_from_locator("https://cdn.example.com/live/index.m3u8?token=1"),
            MediaType::Video
        );
        assert_eq!(MediaType::guess_from_locator("/music/track.FLAC"), MediaType::Audio);
        assert_eq!(MediaType::guess_from_locator("file:///tmp/cover.png"), MediaType::Image);
        assert_eq!(MediaType::guess_from_locator("https://example.com/watch"), MediaType::Unknown);
        assert_eq!(MediaType::guess_from_locator("https://example.com/"), MediaType::Unknown);
    }

    #[test]
    fn test_locator_extension() {
        assert_eq!(locator_extension("https://a/b/c.mp4#t=10"), Some("mp4"));
        assert_eq!(locator_extension("https://a/b/.hidden"), None);
        assert_eq!(locator_extension("https://a/b/archive.backup"), None);
    }
}
