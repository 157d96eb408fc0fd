//! Newznab category taxonomy and adult-content gating
//!
//! Categories are numeric ids in Newznab ranges (`2000` movies, `5000` TV,
//! ...). The `6000..=6999` range is the adult tree: it is hidden from search
//! results unless the caller opts in with `safesearch = false` and
//! `allow_xxx = true`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// First id of the adult category tree
pub const ADULT_MIN: u32 = 6000;
/// Last id of the adult category tree
pub const ADULT_MAX: u32 = 6999;
/// Fallback when nothing in the subject or group hints at a category
pub const OTHER: u32 = 7000;

const CONSOLE: u32 = 1000;
const MOVIES: u32 = 2000;
const MOVIES_SD: u32 = 2030;
const MOVIES_HD: u32 = 2040;
const MOVIES_UHD: u32 = 2050;
const AUDIO: u32 = 3000;
const AUDIO_MP3: u32 = 3010;
const AUDIO_LOSSLESS: u32 = 3040;
const PC: u32 = 4000;
const TV: u32 = 5000;
const TV_SD: u32 = 5030;
const TV_HD: u32 = 5040;
const TV_UHD: u32 = 5045;
const XXX: u32 = 6000;
const BOOKS_EBOOK: u32 = 7020;

/// Whether `category_id` belongs to the adult tree
pub fn is_adult(category_id: u32) -> bool {
    (ADULT_MIN..=ADULT_MAX).contains(&category_id)
}

/// Caller-supplied content gate for a search
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPolicy {
    /// Hide adult content regardless of `allow_xxx`
    pub safesearch: bool,
    /// Caller is allowed to see adult content
    pub allow_xxx: bool,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            safesearch: true,
            allow_xxx: false,
        }
    }
}

impl CategoryPolicy {
    /// Whether adult categories may appear in results
    pub fn adult_visible(&self) -> bool {
        self.allow_xxx && !self.safesearch
    }

    /// Whether a release in `category_id` may appear in results
    pub fn permits(&self, category_id: u32) -> bool {
        !is_adult(category_id) || self.adult_visible()
    }
}

/// Category id to display name map served to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    names: BTreeMap<u32, String>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let entries: &[(u32, &str)] = &[
            (CONSOLE, "Console"),
            (MOVIES, "Movies"),
            (MOVIES_SD, "Movies/SD"),
            (MOVIES_HD, "Movies/HD"),
            (MOVIES_UHD, "Movies/UHD"),
            (2060, "Movies/BluRay"),
            (AUDIO, "Audio"),
            (AUDIO_MP3, "Audio/MP3"),
            (3030, "Audio/Audiobook"),
            (AUDIO_LOSSLESS, "Audio/Lossless"),
            (PC, "PC"),
            (TV, "TV"),
            (TV_SD, "TV/SD"),
            (TV_HD, "TV/HD"),
            (TV_UHD, "TV/UHD"),
            (5060, "TV/Sport"),
            (XXX, "XXX"),
            (6010, "XXX/DVD"),
            (6020, "XXX/WMV"),
            (6030, "XXX/XviD"),
            (6040, "XXX/x264"),
            (OTHER, "Other"),
            (7010, "Other/Misc"),
            (BOOKS_EBOOK, "Other/Ebook"),
            (7030, "Other/Comics"),
        ];
        Self {
            names: entries
                .iter()
                .map(|(id, name)| (*id, (*name).to_string()))
                .collect(),
        }
    }
}

impl Taxonomy {
    /// Display name for `category_id`, falling back to its parent
    pub fn name(&self, category_id: u32) -> Option<&str> {
        self.names
            .get(&category_id)
            .or_else(|| self.names.get(&parent(category_id)))
            .map(String::as_str)
    }

    /// Categories visible under `policy`, in id order
    pub fn visible(&self, policy: CategoryPolicy) -> impl Iterator<Item = (u32, &str)> {
        self.names
            .iter()
            .filter(move |(id, _)| policy.permits(**id))
            .map(|(id, name)| (*id, name.as_str()))
    }
}

/// Top-level category of `category_id` (`2040` -> `2000`)
pub fn parent(category_id: u32) -> u32 {
    category_id - category_id % 1000
}

/// Whether `category_id` matches a requested filter id
///
/// A top-level filter (`5000`) matches all of its children.
pub fn matches_filter(category_id: u32, filter: u32) -> bool {
    if filter % 1000 == 0 {
        parent(category_id) == filter
    } else {
        category_id == filter
    }
}

#[allow(clippy::expect_used)]
static EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(s\d{1,2}e\d{1,3}|\d{1,2}x\d{2})\b").expect("episode pattern is valid")
});

#[allow(clippy::expect_used)]
static RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(2160p|4k|uhd|1080p|720p|480p|576p|dvdrip|xvid)\b")
        .expect("resolution pattern is valid")
});

#[allow(clippy::expect_used)]
static ADULT_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(xxx|porn)\b").expect("adult pattern is valid"));

#[allow(clippy::expect_used)]
static AUDIO_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(flac|mp3|320kbps|v0|discography)\b").expect("audio pattern is valid")
});

#[allow(clippy::expect_used)]
static EBOOK_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(epub|mobi|azw3)\b").expect("ebook pattern is valid"));

#[allow(clippy::expect_used)]
static PC_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(win(32|64)|x64|keygen|iso|setup)\b").expect("pc pattern is valid")
});

/// Guess a category from a raw subject and its group
///
/// Adult hints win over everything else so nothing adult leaks into a
/// non-adult category. Falls back to [`OTHER`].
pub fn infer_category(subject: &str, group: &str) -> u32 {
    let group = group.to_ascii_lowercase();

    if ADULT_HINT.is_match(subject) || group.contains("erotica") || group.contains(".xxx") {
        return XXX;
    }

    let resolution = RESOLUTION
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase());

    if EPISODE.is_match(subject) || group.contains(".tv") {
        return match resolution.as_deref() {
            Some("2160p" | "4k" | "uhd") => TV_UHD,
            Some("1080p" | "720p") => TV_HD,
            Some(_) => TV_SD,
            None => TV,
        };
    }

    if let Some(res) = resolution.as_deref() {
        return match res {
            "2160p" | "4k" | "uhd" => MOVIES_UHD,
            "1080p" | "720p" => MOVIES_HD,
            _ => MOVIES_SD,
        };
    }
    if group.contains(".movies") || group.contains(".hdtv") {
        return MOVIES;
    }

    if let Some(hint) = AUDIO_HINT.captures(subject).and_then(|c| c.get(1)) {
        return if hint.as_str().eq_ignore_ascii_case("flac") {
            AUDIO_LOSSLESS
        } else {
            AUDIO_MP3
        };
    }
    if group.contains(".sounds") || group.contains(".mp3") {
        return AUDIO;
    }

    if EBOOK_HINT.is_match(subject) || group.contains(".ebook") {
        return BOOKS_EBOOK;
    }
    if PC_HINT.is_match(subject) || group.contains(".warez") {
        return PC;
    }
    if group.contains(".games") || group.contains(".console") {
        return CONSOLE;
    }

    OTHER
}
