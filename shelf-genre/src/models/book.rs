//! Book identity and the stable item key derived from it
//!
//! The item key is the only thing that ties a queue message, a persisted
//! per-item result and a report entry together. It is a pure function of
//! the identity, so retries, duplicate deliveries and reruns all land on
//! the same key regardless of list position or arrival order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest external id used verbatim inside a key
const MAX_VERBATIM_ID_LEN: usize = 64;

/// One book as supplied by the library export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookIdentity {
    /// Book title
    pub title: String,
    /// Primary author
    pub author: String,
    /// Goodreads book id
    #[serde(default, alias = "goodreads_id", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// ISBN-10 as exported (may carry `="…"` spreadsheet quoting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    /// ISBN-13 as exported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn13: Option<String>,
}

impl BookIdentity {
    /// Identity with only title and author
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            external_id: None,
            isbn: None,
            isbn13: None,
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_isbn(mut self, isbn: impl Into<String>) -> Self {
        self.isbn = Some(isbn.into());
        self
    }

    pub fn with_isbn13(mut self, isbn13: impl Into<String>) -> Self {
        self.isbn13 = Some(isbn13.into());
        self
    }

    /// External id, if present and non-blank
    pub fn external_id(&self) -> Option<&str> {
        self.external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Cleaned ISBN-13, if any
    pub fn clean_isbn13(&self) -> Option<String> {
        self.isbn13.as_deref().and_then(clean_isbn)
    }

    /// Cleaned ISBN-10, if any
    pub fn clean_isbn(&self) -> Option<String> {
        self.isbn.as_deref().and_then(clean_isbn)
    }

    /// Preferred identifier for lookups: ISBN-13, then ISBN-10
    pub fn best_isbn(&self) -> Option<String> {
        self.clean_isbn13().or_else(|| self.clean_isbn())
    }

    /// Normalized (title, author) tuple used when no external id exists
    pub fn normalized_title_author(&self) -> (String, String) {
        (normalize_text(&self.title), normalize_text(&self.author))
    }

    /// Stable item key
    ///
    /// External id preferred (`gr-<id>`), otherwise a hash of the
    /// normalized title and author (`ta-<hex>`).
    pub fn item_key(&self) -> ItemKey {
        if let Some(id) = self.external_id() {
            let verbatim = id.len() <= MAX_VERBATIM_ID_LEN
                && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if verbatim {
                return ItemKey(format!("gr-{}", id));
            }
            return ItemKey(format!("gr-{}", short_hash(id, 16)));
        }

        let (title, author) = self.normalized_title_author();
        ItemKey(format!("ta-{}", short_hash(&format!("{}\u{1f}{}", title, author), 32)))
    }

    /// Short label for logs
    pub fn label(&self) -> String {
        format!("'{}' by {}", self.title, self.author)
    }
}

/// Deterministic key identifying one book within a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep ISBN digits (and a trailing check `X`); `None` when nothing is left
pub fn clean_isbn(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn short_hash(input: &str, hex_len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..hex_len.min(hex.len())].to_string()
}
