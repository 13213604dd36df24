//! Filename utilities: cross-platform sanitising, Unicode normalisation and
//! wildcard matching for locating previously downloaded files.

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Characters that are invalid in Windows filenames (and `/` everywhere).
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved device names (case-insensitive).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FALLBACK_NAME: &str = "unnamed";

/// Make a single path component safe on every platform.
///
/// Control and reserved characters become `_` (runs collapse to one), leading
/// and trailing spaces and dots are dropped, reserved device names get a `_`
/// prefix. Everything else, including non-Latin text and symbols such as `@`,
/// is kept as is.
///
/// ```
/// use streamglob::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("A@B"), "A@B");
/// assert_eq!(sanitize_filename("what? now"), "what_ now");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
    {
        return format!("_{}", trimmed);
    }

    trimmed.to_string()
}

/// Unicode normalisation form applied to destination paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnicodeForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
}

impl UnicodeForm {
    pub fn normalize(&self, input: &str) -> String {
        match self {
            Self::Nfc => input.nfc().collect(),
            Self::Nfd => input.nfd().collect(),
            Self::Nfkc => input.nfkc().collect(),
            Self::Nfkd => input.nfkd().collect(),
        }
    }
}

impl std::str::FromStr for UnicodeForm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NFC" => Ok(Self::Nfc),
            "NFD" => Ok(Self::Nfd),
            "NFKC" => Ok(Self::Nfkc),
            "NFKD" => Ok(Self::Nfkd),
            other => Err(format!("unknown normalization form: {}", other)),
        }
    }
}

/// Compile a shell-style wildcard (`*`, `?`) into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re)
}
