//! Genre merging and normalization
//!
//! Combines any number of per-source genre sets into one list.
//!
//! **Algorithm:**
//! 1. Clean each entry: collapse whitespace, strip noise prefixes
//! 2. Drop noise: too short/long, numeric or date-like, "… century", format terms
//! 3. Deduplicate case-insensitively, keeping the best-capitalized variant
//! 4. Sort by lowercase form
//!
//! The result does not depend on source order or entry order, and
//! `merge(merge(x)) == merge(x)`.

use crate::config::NormalizerConfig;
use crate::models::ProcessedGenreSet;
use std::collections::BTreeMap;

/// Genre normalizer, configured once and shared read-only
#[derive(Debug, Clone)]
pub struct GenreNormalizer {
    config: NormalizerConfig,
    excluded: Vec<String>,
}

impl GenreNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        let excluded = config
            .excluded_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { config, excluded }
    }

    /// Merge processed sets from any number of sources
    pub fn merge(&self, sets: &[ProcessedGenreSet]) -> Vec<String> {
        self.normalize(sets.iter().flat_map(|s| s.genres.iter().map(String::as_str)))
    }

    /// Normalize a flat list of raw genre strings
    pub fn normalize<'a>(&self, genres: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        // lowercase form → best variant seen so far
        let mut by_key: BTreeMap<String, String> = BTreeMap::new();

        for raw in genres {
            let Some(genre) = self.clean(raw) else {
                continue;
            };
            let key = genre.to_lowercase();
            match by_key.get_mut(&key) {
                Some(existing) => {
                    if prefer(&genre, existing) {
                        *existing = genre;
                    }
                }
                None => {
                    by_key.insert(key, genre);
                }
            }
        }

        by_key.into_values().collect()
    }

    /// Cleaned form of one entry, or `None` when it is noise
    pub fn clean(&self, raw: &str) -> Option<String> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let stripped = self.strip_prefixes(&collapsed);

        if self.is_noise(stripped) {
            return None;
        }
        Some(stripped.to_string())
    }

    fn strip_prefixes<'a>(&self, mut genre: &'a str) -> &'a str {
        loop {
            let before = genre;
            for prefix in &self.config.strip_prefixes {
                let matches = genre
                    .get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
                if !prefix.is_empty() && matches {
                    genre = genre[prefix.len()..].trim_start_matches(['=', ':', '-', ' ']);
                }
            }
            if genre == before {
                return genre.trim();
            }
        }
    }

    fn is_noise(&self, genre: &str) -> bool {
        let len = genre.chars().count();
        if len < self.config.min_length || len > self.config.max_length {
            return true;
        }

        let lower = genre.to_lowercase();
        if self.config.drop_date_like && is_date_like(&lower) {
            return true;
        }
        if self.config.drop_century && (lower == "century" || lower.ends_with(" century")) {
            return true;
        }
        self.excluded.iter().any(|t| *t == lower)
    }
}

/// Pure numbers, decades ("1990s") and dates ("2001-05-03", "12/1999")
fn is_date_like(lower: &str) -> bool {
    let body = lower
        .strip_suffix("'s")
        .or_else(|| lower.strip_suffix('s'))
        .unwrap_or(lower);
    body.chars().any(|c| c.is_ascii_digit())
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '/' | '.'))
}

/// Title case in the usual sense: every cased run starts upper, continues lower
fn is_title_case(s: &str) -> bool {
    let mut previous_cased = false;
    let mut any_cased = false;
    for c in s.chars() {
        if c.is_uppercase() {
            if previous_cased {
                return false;
            }
            previous_cased = true;
            any_cased = true;
        } else if c.is_lowercase() {
            if !previous_cased {
                return false;
            }
            previous_cased = true;
            any_cased = true;
        } else {
            previous_cased = false;
        }
    }
    any_cased
}

/// Whether `candidate` is a better spelling than `current`
///
/// Title case wins, then any capitalization over none, then the smaller
/// string so the choice does not depend on arrival order.
fn prefer(candidate: &str, current: &str) -> bool {
    let rank = |s: &str| (is_title_case(s), s.chars().any(char::is_uppercase));
    match rank(candidate).cmp(&rank(current)) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate < current,
    }
}
