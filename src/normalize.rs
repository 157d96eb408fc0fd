//! Subject normalization
//!
//! Usenet posters wrap the same release name in part counters, quotes, yEnc
//! markers and archive suffixes. [`normalize`] reduces a raw subject to a
//! canonical title (lowercase alphanumeric tokens joined by `.`) plus the
//! part index/total declared in the subject.
//!
//! Normalization is pure and idempotent: feeding a canonical title back in
//! returns it unchanged.

use regex::Regex;
use std::sync::LazyLock;

/// Separator between canonical title tokens
pub const TITLE_SEPARATOR: char = '.';

/// Language code used when no language tag is present
pub const UNDETERMINED_LANGUAGE: &str = "und";

/// Tokens that carry no title information
const FILLER_TOKENS: &[&str] = &["yenc", "repost"];

/// Trailing tokens that name archive or container formats
const EXTENSION_TOKENS: &[&str] = &[
    "rar", "par2", "par", "zip", "7z", "nfo", "sfv", "nzb", "srr", "mkv", "avi", "mp4",
];

/// Bracketed language tags and the ISO 639-1 code they map to
const LANGUAGE_TAGS: &[(&str, &str)] = &[
    ("ita", "it"),
    ("italian", "it"),
    ("french", "fr"),
    ("vostfr", "fr"),
    ("german", "de"),
    ("deutsch", "de"),
    ("spanish", "es"),
    ("dutch", "nl"),
    ("japanese", "ja"),
];

#[allow(clippy::expect_used)]
static PART_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\[(]\s*(\d+)\s*/\s*(\d+)\s*[\])]").expect("part marker pattern is valid")
});

#[allow(clippy::expect_used)]
static LANGUAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(ita|italian|french|vostfr|german|deutsch|spanish|dutch|japanese)\s*\]")
        .expect("language tag pattern is valid")
});

#[allow(clippy::expect_used)]
static PAR2_VOLUME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.vol\d+\+\d+\.par2\b").expect("par2 volume pattern is valid")
});

#[allow(clippy::expect_used)]
static BRACKET_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("bracket tag pattern is valid"));

/// Canonical form of a raw subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedSubject {
    /// Canonical title; empty when the subject carried no title text
    pub title: String,
    /// Part index from a `[NN/MM]` or `(NN/MM)` marker, 0 if absent
    pub part_index: u32,
    /// Part total from the same marker, 0 if absent
    pub part_total: u32,
}

/// Normalize a raw posting subject
///
/// # Examples
///
/// ```
/// use usenet_idx::normalize::normalize;
///
/// let n = normalize("[01/15] - \"Some.Release.part01.rar\" yEnc");
/// assert_eq!(n.title, "some.release");
/// assert_eq!((n.part_index, n.part_total), (1, 15));
/// assert_eq!(normalize(&n.title).title, n.title);
/// ```
#[must_use]
pub fn normalize(subject: &str) -> NormalizedSubject {
    let (part_index, part_total) = detect_part_marker(subject);

    let lowered = subject.to_lowercase();
    let stripped = PART_MARKER.replace_all(&lowered, " ");
    let stripped = LANGUAGE_TAG.replace_all(&stripped, " ");
    let stripped = PAR2_VOLUME.replace_all(&stripped, " ");

    let all_tokens: Vec<&str> = tokenize(&stripped).collect();
    let mut tokens: Vec<&str> = all_tokens
        .iter()
        .copied()
        .filter(|t| !FILLER_TOKENS.contains(t))
        .collect();

    // The last remaining token is kept so a lone word never collapses to nothing
    while tokens.len() > 1 && tokens.last().is_some_and(|t| is_extension_token(t)) {
        tokens.pop();
    }

    // A subject made only of filler still yields a best-effort title
    let title_tokens = if tokens.is_empty() { all_tokens } else { tokens };

    NormalizedSubject {
        title: join_tokens(&title_tokens),
        part_index,
        part_total,
    }
}

/// Extract the first part marker as `(index, total)`, `(0, 0)` if absent
#[must_use]
pub fn detect_part_marker(subject: &str) -> (u32, u32) {
    PART_MARKER
        .captures(subject)
        .and_then(|caps| {
            let index = caps.get(1)?.as_str().parse().ok()?;
            let total = caps.get(2)?.as_str().parse().ok()?;
            Some((index, total))
        })
        .unwrap_or((0, 0))
}

/// Lowercased bracket tags, part markers excluded, in order of first appearance
///
/// ```
/// use usenet_idx::normalize::extract_tags;
///
/// assert_eq!(extract_tags("[FRENCH, HDR] Movie [01/20]"), vec!["french", "hdr"]);
/// ```
#[must_use]
pub fn extract_tags(subject: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for caps in BRACKET_TAG.captures_iter(subject) {
        let Some(inner) = caps.get(1) else { continue };
        if PART_MARKER.is_match(inner.as_str()) || is_bare_counter(inner.as_str()) {
            continue;
        }
        for tag in inner
            .as_str()
            .split(|c: char| c.is_whitespace() || c == ',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            let tag = tag.to_lowercase();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags
}

/// Language code from bracketed language tags, [`UNDETERMINED_LANGUAGE`] if none
#[must_use]
pub fn detect_language(subject: &str) -> &'static str {
    let Some(caps) = LANGUAGE_TAG.captures(subject) else {
        return UNDETERMINED_LANGUAGE;
    };
    let Some(tag) = caps.get(1) else {
        return UNDETERMINED_LANGUAGE;
    };
    let tag = tag.as_str().to_lowercase();
    LANGUAGE_TAGS
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, code)| *code)
        .unwrap_or(UNDETERMINED_LANGUAGE)
}

fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

fn join_tokens(tokens: &[&str]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(TITLE_SEPARATOR);
        }
        out.push_str(token);
    }
    out
}

/// `rar`, `par2`, `r01`, `001`, `part07`, `vol003` and friends
fn is_extension_token(token: &str) -> bool {
    if EXTENSION_TOKENS.contains(&token) {
        return true;
    }
    let numbered = |prefix: &str, min: usize, max: usize| {
        token.strip_prefix(prefix).is_some_and(|digits| {
            (min..=max).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
        })
    };
    numbered("r", 2, 3)
        || numbered("part", 1, 4)
        || numbered("vol", 1, 4)
        || (token.len() == 3 && token.starts_with('0') && numbered("", 3, 3))
}

fn is_bare_counter(s: &str) -> bool {
    let s = s.trim();
    s.split_once('/').is_some_and(|(a, b)| {
        let (a, b) = (a.trim(), b.trim());
        !a.is_empty()
            && !b.is_empty()
            && a.bytes().all(|c| c.is_ascii_digit())
            && b.bytes().all(|c| c.is_ascii_digit())
    })
}
