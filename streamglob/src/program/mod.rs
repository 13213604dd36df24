//! External programs: players, downloaders and postprocessors.
//!
//! A [`ProgramSpec`] is configuration. Resolving it for a set of sources
//! yields a [`Program`], which turns into a concrete
//! [`process_utils::CommandSpec`] once the stage input and output are known.

mod resolver;
mod spec;

pub use resolver::{ConfigProgramResolver, ProgramResolver};
pub use spec::{InputMode, OutputMode, ProgramSpec};

use std::collections::BTreeMap;
use std::path::Path;

use process_utils::{CommandSpec, Redirect};
use serde::{Deserialize, Serialize};

use crate::domain::Source;
use crate::pipeline::StageInput;
use crate::{Error, Result};

/// Environment variable carrying the session cookies.
pub const COOKIES_ENV: &str = "STREAMGLOB_COOKIES";
/// Environment variable carrying extra request headers, one per line.
pub const HEADERS_ENV: &str = "STREAMGLOB_HEADERS";

/// What a resolved program is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramRole {
    Player,
    Downloader,
    Postprocessor,
}

impl ProgramRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Downloader => "downloader",
            Self::Postprocessor => "postprocessor",
        }
    }
}

impl std::fmt::Display for ProgramRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session hints handed to every spawned program through its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionHints {
    pub proxy: Option<String>,
    pub cookies: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl SessionHints {
    pub fn is_empty(&self) -> bool {
        self.proxy.is_none() && self.cookies.is_none() && self.headers.is_empty()
    }

    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merged(&self, other: &SessionHints) -> SessionHints {
        let mut headers = self.headers.clone();
        headers.extend(other.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        SessionHints {
            proxy: other.proxy.clone().or_else(|| self.proxy.clone()),
            cookies: other.cookies.clone().or_else(|| self.cookies.clone()),
            headers,
        }
    }

    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(proxy) = &self.proxy {
            env.push(("http_proxy".to_string(), proxy.clone()));
            env.push(("https_proxy".to_string(), proxy.clone()));
        }
        if let Some(cookies) = &self.cookies {
            env.push((COOKIES_ENV.to_string(), cookies.clone()));
        }
        if !self.headers.is_empty() {
            let headers = self
                .headers
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect::<Vec<_>>()
                .join("\n");
            env.push((HEADERS_ENV.to_string(), headers));
        }
        env
    }
}

/// A program resolved for a particular role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    spec: ProgramSpec,
    role: ProgramRole,
}

impl Program {
    pub fn new(spec: ProgramSpec, role: ProgramRole) -> Self {
        Self { spec, role }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> ProgramRole {
        self.role
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    /// Command line for playing `sources`.
    pub fn play_command(&self, sources: &[Source], hints: &SessionHints) -> Result<CommandSpec> {
        if sources.is_empty() {
            return Err(Error::EmptyTask);
        }
        let args = expand_args(&self.spec.args, sources, None, None);
        Ok(self.base_command(args, hints))
    }

    /// Command line for one download stage.
    pub fn stage_command(
        &self,
        sources: &[Source],
        input: &StageInput,
        output: &Path,
        hints: &SessionHints,
    ) -> Result<CommandSpec> {
        if sources.is_empty() {
            return Err(Error::EmptyTask);
        }
        let input_path = match input {
            StageInput::Sources => None,
            StageInput::File(path) => Some(path.as_path()),
        };
        let args = expand_args(&self.spec.args, sources, input_path, Some(output));
        let mut command = self.base_command(args, hints);

        if let (InputMode::Stdin, Some(path)) = (self.spec.input, input_path) {
            command = command.stdin(Redirect::File(path.to_path_buf()));
        }
        if self.spec.output == OutputMode::Stdout {
            command = command.stdout(Redirect::File(output.to_path_buf()));
        }
        Ok(command)
    }

    fn base_command(&self, args: Vec<String>, hints: &SessionHints) -> CommandSpec {
        let mut command = CommandSpec::new(&self.spec.command)
            .args(args)
            .stdout(Redirect::Null);
        for (key, value) in hints.env() {
            command = command.env(key, value);
        }
        command
    }
}

fn expand_args(
    templates: &[String],
    sources: &[Source],
    input: Option<&Path>,
    output: Option<&Path>,
) -> Vec<String> {
    let first = sources.first().map(|s| s.locator.as_str()).unwrap_or("");
    let input = input.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    let output = output
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut args = Vec::with_capacity(templates.len() + sources.len());
    for template in templates {
        if template == "{sources}" {
            args.extend(sources.iter().map(|s| s.locator.clone()));
            continue;
        }
        args.push(
            template
                .replace("{source}", first)
                .replace("{input}", &input)
                .replace("{output}", &output),
        );
    }
    args
}
