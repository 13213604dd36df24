//! Output filename templates.
//!
//! Placeholders: `{self.<field>}` and `{listing.<field>}` read the source
//! and listing, `{index}` is the 1-based rank, `{num}` the sibling count,
//! `{uri}` an encoded locator and `{ext}` the file extension. Integer
//! fields take a zero-pad width (`{index:02}`). Unknown top-level names are
//! kept literally.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::domain::{Listing, Source};
use crate::utils::filename::{sanitize_filename, wildcard_regex};
use crate::{Error, Result};

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE: &str = "{listing.provider}.{self.default_name}.{self.timestamp}.{self.ext}";

/// Attributes accepted after `self.`.
pub const SOURCE_FIELDS: &[&str] = &[
    "provider",
    "provider_id",
    "locator",
    "url",
    "media_type",
    "rank",
    "ext",
    "default_name",
    "timestamp",
    "id",
];

/// Attributes accepted after `listing.`.
pub const LISTING_FIELDS: &[&str] = &["title", "safe_title", "raw_title", "provider", "provider_id", "id"];

/// How placeholders are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Everything substituted.
    Final,
    /// Values that vary between runs (`{ext}`, `{uri}`, `{self.ext}`,
    /// `{self.timestamp}`) and unknown placeholders become `*`.
    Glob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Source(String),
    Listing(String),
    Index,
    Num,
    Uri,
    Ext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { field: Field, pad: Option<usize> },
    /// Unrecognised top-level placeholder, raw text including braces.
    Unknown(String),
}

/// A parsed, validated filename template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    raw: String,
    segments: Vec<Segment>,
}

/// What a template is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub source: &'a Source,
    pub listing: Option<&'a Listing>,
    /// Number of sibling sources.
    pub num: usize,
}

impl<'a> TemplateContext<'a> {
    pub fn new(source: &'a Source, listing: Option<&'a Listing>) -> Self {
        let num = listing.map(|l| l.sources.len()).unwrap_or(1).max(1);
        Self {
            source,
            listing,
            num,
        }
    }

    fn listing_field(&self, name: &str) -> Option<String> {
        match self.listing {
            Some(listing) => listing.template_field(name),
            None => match name {
                "title" | "safe_title" | "raw_title" => Some(self.source.default_name()),
                "provider" | "provider_id" => Some(self.source.provider_id.clone()),
                "id" => Some(String::new()),
                _ => None,
            },
        }
    }
}

impl FilenameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        if template.trim().is_empty() {
            return Err(Error::template(template, "template is empty"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(Error::template(template, "nested '{'")),
                            c => inner.push(c),
                        }
                    }
                    if !closed {
                        return Err(Error::template(template, "unbalanced '{'"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(template, &inner)?);
                }
                '}' => return Err(Error::template(template, "unbalanced '}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// Parse `template`, or the built-in default when none is configured.
    pub fn parse_or_default(template: Option<&str>) -> Result<Self> {
        Self::parse(template.unwrap_or(DEFAULT_TEMPLATE))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn render(&self, ctx: &TemplateContext<'_>, mode: RenderMode) -> Result<String> {
        let mut out = String::with_capacity(self.raw.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Unknown(raw) => match mode {
                    RenderMode::Final => out.push_str(raw),
                    RenderMode::Glob => out.push('*'),
                },
                Segment::Field { field, pad } => {
                    if mode == RenderMode::Glob && is_volatile(field) {
                        out.push('*');
                        continue;
                    }
                    let value = self.field_value(ctx, field)?;
                    match pad {
                        Some(width) => out.push_str(&format!("{:0>width$}", value, width = *width)),
                        None => out.push_str(&value),
                    }
                }
            }
        }
        if mode == RenderMode::Glob {
            out = glob_braces(&out);
        }
        Ok(out)
    }

    /// Destination path for `ctx` under `dir`.
    pub fn destination(&self, dir: &Path, ctx: &TemplateContext<'_>) -> Result<PathBuf> {
        Ok(dir.join(self.render(ctx, RenderMode::Final)?))
    }

    fn field_value(&self, ctx: &TemplateContext<'_>, field: &Field) -> Result<String> {
        let value = match field {
            Field::Source(name) => ctx.source.template_field(name).map(|v| path_safe(&v)),
            Field::Listing(name) => ctx.listing_field(name).map(|v| path_safe(&v)),
            Field::Index => Some((ctx.source.rank + 1).to_string()),
            Field::Num => Some(ctx.num.to_string()),
            Field::Uri => Some(uri_token(&ctx.source.locator)),
            Field::Ext => Some(ctx.source.extension()),
        };
        value.ok_or_else(|| Error::template(&self.raw, "placeholder has no value"))
    }
}

impl std::str::FromStr for FilenameTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_placeholder(template: &str, inner: &str) -> Result<Segment> {
    let (name, spec) = match inner.split_once(':') {
        Some((name, spec)) => (name.trim(), Some(spec.trim())),
        None => (inner.trim(), None),
    };
    if name.is_empty() {
        return Err(Error::template(template, "empty placeholder"));
    }

    let field = if let Some(attr) = name.strip_prefix("self.") {
        if !SOURCE_FIELDS.contains(&attr) {
            return Err(Error::template(template, format!("unknown source attribute {:?}", attr)));
        }
        Field::Source(attr.to_string())
    } else if let Some(attr) = name.strip_prefix("listing.") {
        if !LISTING_FIELDS.contains(&attr) {
            return Err(Error::template(template, format!("unknown listing attribute {:?}", attr)));
        }
        Field::Listing(attr.to_string())
    } else {
        match name {
            "index" => Field::Index,
            "num" => Field::Num,
            "uri" => Field::Uri,
            "ext" => Field::Ext,
            _ => return Ok(Segment::Unknown(format!("{{{}}}", inner))),
        }
    };

    let pad = match spec {
        None => None,
        Some(spec) => {
            if !matches!(field, Field::Index | Field::Num) {
                return Err(Error::template(template, format!("{:?} takes no format spec", name)));
            }
            Some(spec.parse::<usize>().map_err(|_| {
                Error::template(template, format!("invalid format spec {:?}", spec))
            })?)
        }
    };

    Ok(Segment::Field { field, pad })
}

fn is_volatile(field: &Field) -> bool {
    match field {
        Field::Ext | Field::Uri => true,
        Field::Source(name) => matches!(name.as_str(), "ext" | "timestamp"),
        _ => false,
    }
}

/// Locator as a single path component: `uri=<locator with / as +>=`,
/// sanitised like any other file name.
pub fn uri_token(locator: &str) -> String {
    sanitize_filename(&format!("uri={}=", locator.replace('/', "+")))
}

fn path_safe(value: &str) -> String {
    value.replace(['/', '\\'], "_")
}

fn glob_braces(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut depth = 0usize;
    for c in rendered.chars() {
        match c {
            '{' => {
                if depth == 0 {
                    out.push('*');
                }
                depth += 1;
            }
            '}' if depth > 0 => depth -= 1,
            c if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Locate a previous download of `source` under `dir`.
///
/// Renders `template` in glob mode and returns the first matching file
/// (sorted by name), falling back to any file carrying the source's
/// `{uri}` token.
pub async fn find_downloaded(
    template: &FilenameTemplate,
    dir: &Path,
    ctx: &TemplateContext<'_>,
) -> Result<Option<PathBuf>> {
    let pattern = dir.join(template.render(ctx, RenderMode::Glob)?);
    let search_dir = pattern.parent().unwrap_or(dir).to_path_buf();

    let names = list_file_names(&search_dir).await?;

    if let Some(file_pattern) = pattern.file_name().and_then(|n| n.to_str()) {
        let re: Regex = wildcard_regex(file_pattern)
            .map_err(|e| Error::template(template.as_str(), e.to_string()))?;
        if let Some(name) = names.iter().find(|name| re.is_match(name)) {
            return Ok(Some(search_dir.join(name)));
        }
    }

    let token = uri_token(&ctx.source.locator);
    let fallback_names = if search_dir == dir {
        names
    } else {
        list_file_names(dir).await?
    };
    Ok(fallback_names
        .iter()
        .find(|name| name.contains(&token))
        .map(|name| dir.join(name)))
}

async fn list_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_path("listing", dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("listing", dir, e))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Listing {
        Listing::new("bam", "A@B")
            .with_source(Source::new("bam", "https://example.com/game/home.mp4"))
            .with_source(Source::new("bam", "https://example.com/game/away.mp4"))
    }

    #[test]
    fn test_final_render() {
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[0], Some(&listing));
        let template = FilenameTemplate::parse("{listing.title}.{index}.{ext}").unwrap();
        assert_eq!(template.render(&ctx, RenderMode::Final).unwrap(), "A@B.1.mp4");
    }

    #[test]
    fn test_glob_render() {
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[0], Some(&listing));
        let template = FilenameTemplate::parse("{listing.title}.{index}.{ext}").unwrap();
        assert_eq!(template.render(&ctx, RenderMode::Glob).unwrap(), "A@B.1.*");

        let template = FilenameTemplate::parse("{listing.title}.{uri}.{foo}.{self.timestamp}").unwrap();
        assert_eq!(template.render(&ctx, RenderMode::Glob).unwrap(), "A@B.*.*.*");
    }

    #[test]
    fn test_every_field_resolves() {
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[1], Some(&listing));
        for field in SOURCE_FIELDS {
            let template = FilenameTemplate::parse(&format!("{{self.{}}}", field)).unwrap();
            assert!(template.render(&ctx, RenderMode::Final).is_ok(), "self.{}", field);
        }
        for field in LISTING_FIELDS {
            let template = FilenameTemplate::parse(&format!("{{listing.{}}}", field)).unwrap();
            assert!(template.render(&ctx, RenderMode::Final).is_ok(), "listing.{}", field);
        }
    }

    #[test]
    fn test_index_num_uri_and_padding() {
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[1], Some(&listing));
        let template = FilenameTemplate::parse("{index:02}of{num:03}.{uri}").unwrap();
        assert_eq!(
            template.render(&ctx, RenderMode::Final).unwrap(),
            "02of002.uri=https_++example.com+game+away.mp4="
        );
    }

    #[test]
    fn test_unknown_top_level_kept() {
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[0], Some(&listing));
        let template = FilenameTemplate::parse("{foo}-{index}").unwrap();
        assert_eq!(template.render(&ctx, RenderMode::Final).unwrap(), "{foo}-1");
    }

    #[test]
    fn test_invalid_templates() {
        for bad in [
            "",
            "   ",
            "{listing.title",
            "title}",
            "{a{b}}",
            "{}",
            "{self.nope}",
            "{listing.bogus}",
            "{index:xx}",
            "{ext:02}",
        ] {
            let err = FilenameTemplate::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidFilenameTemplate { .. }),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_default_template() {
        let template = FilenameTemplate::parse_or_default(None).unwrap();
        assert_eq!(template.as_str(), DEFAULT_TEMPLATE);

        let source = Source::new("live", "https://example.com/streams/night-show.m3u8");
        let ctx = TemplateContext::new(&source, None);
        let rendered = template.render(&ctx, RenderMode::Final).unwrap();
        assert!(rendered.starts_with("live.night-showm3u8."), "{}", rendered);
        assert!(rendered.ends_with(".m3u8"));
        assert_eq!(
            template.render(&ctx, RenderMode::Glob).unwrap(),
            "live.night-showm3u8.*.*"
        );
    }

    #[test]
    fn test_values_cannot_escape_directory() {
        let source = Source::new("p", "https://example.com/a.mp4");
        let ctx = TemplateContext::new(&source, None);
        let template = FilenameTemplate::parse("{self.locator}").unwrap();
        let rendered = template.render(&ctx, RenderMode::Final).unwrap();
        assert!(!rendered.contains('/'));
    }

    #[tokio::test]
    async fn test_find_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let listing = listing();
        let template = FilenameTemplate::parse("{listing.title}.{index}.{ext}").unwrap();

        let ctx = TemplateContext::new(&listing.sources[0], Some(&listing));
        assert_eq!(find_downloaded(&template, dir.path(), &ctx).await.unwrap(), None);

        std::fs::write(dir.path().join("A@B.2.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("A@B.1.mkv"), b"x").unwrap();
        assert_eq!(
            find_downloaded(&template, dir.path(), &ctx).await.unwrap(),
            Some(dir.path().join("A@B.1.mkv"))
        );
    }

    #[tokio::test]
    async fn test_find_downloaded_uri_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let listing = listing();
        let ctx = TemplateContext::new(&listing.sources[0], Some(&listing));

        let written = FilenameTemplate::parse("{listing.title}.{uri}.{ext}")
            .unwrap()
            .destination(dir.path(), &ctx)
            .unwrap();
        assert!(!written.file_name().unwrap().to_str().unwrap().contains(':'));
        std::fs::write(&written, b"x").unwrap();

        let renamed = FilenameTemplate::parse("{listing.title}-new.{index}.{ext}").unwrap();
        assert_eq!(
            find_downloaded(&renamed, dir.path(), &ctx).await.unwrap(),
            Some(written)
        );
    }
}
