//! Program configuration.

use serde::{Deserialize, Serialize};

use crate::domain::{MediaType, Source};

/// How a postprocessor receives its stage input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Path substituted for `{input}`.
    #[default]
    Arg,
    /// File piped to stdin.
    Stdin,
}

/// How a stage program delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Path substituted for `{output}`.
    #[default]
    Arg,
    /// stdout redirected into the output file.
    Stdout,
}

/// A player, downloader or postprocessor as configured.
///
/// `args` may contain `{sources}` (one argument per source locator),
/// `{source}` (first locator), `{input}` and `{output}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Media types this program handles; empty means any.
    #[serde(default)]
    pub media_types: Vec<MediaType>,
    #[serde(default)]
    pub input: InputMode,
    #[serde(default)]
    pub output: OutputMode,
}

impl ProgramSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            media_types: Vec::new(),
            input: InputMode::Arg,
            output: OutputMode::Arg,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_media_types(mut self, media_types: impl Into<Vec<MediaType>>) -> Self {
        self.media_types = media_types.into();
        self
    }

    pub fn with_input(mut self, input: InputMode) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Whether this program can handle every one of `sources`.
    pub fn supports(&self, sources: &[Source]) -> bool {
        self.media_types.is_empty()
            || sources
                .iter()
                .all(|s| self.media_types.contains(&s.media_type))
    }

    pub fn default_players() -> Vec<ProgramSpec> {
        vec![ProgramSpec::new("mpv", "mpv").with_args(["--force-window=yes", "{sources}"])]
    }

    pub fn default_downloaders() -> Vec<ProgramSpec> {
        vec![
            ProgramSpec::new("streamlink", "streamlink")
                .with_args(["--force", "-o", "{output}", "{source}", "best"])
                .with_media_types([MediaType::Video, MediaType::Audio]),
            ProgramSpec::new("copy", "cp").with_args(["{source}", "{output}"]),
        ]
    }
}
