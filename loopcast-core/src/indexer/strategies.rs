//! Text-extraction strategies for remote folder listing pages.
//!
//! The listing has no structured API; each strategy recognises one
//! serialization shape the page is known to use and emits raw
//! `(title, identifier)` candidates. Candidates are advisory only.

use std::sync::LazyLock;

use regex::Regex;

use super::{PLACEHOLDER_IDENTIFIER, is_plausible_identifier};

/// Raw `(title, identifier)` pair emitted by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub title: String,
    pub identifier: String,
}

impl Candidate {
    fn new(title: &str, identifier: &str) -> Self {
        Self {
            title: decode_entities(title.trim()),
            identifier: identifier.to_string(),
        }
    }
}

/// One way of pulling candidates out of a listing page body.
pub trait ExtractionStrategy: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether emitted candidates carry real identifiers.
    ///
    /// Only pairing strategies are consulted when resolving a placeholder.
    fn pairs_identifiers(&self) -> bool {
        true
    }

    /// Extracts candidates from an already unescaped page body.
    fn extract(&self, body: &str) -> Vec<Candidate>;
}

/// Strategies in priority order. Earlier strategies win title conflicts.
pub fn default_strategies() -> Vec<Box<dyn ExtractionStrategy>> {
    vec![
        Box::new(EmbeddedArrayStrategy),
        Box::new(DataIdStrategy),
        Box::new(FileLinkStrategy),
        Box::new(BareTitleStrategy),
    ]
}

/// Entries serialized into the page's inline data arrays:
/// `["<id>",["<parent>"],"<title>", ...`
#[derive(Debug, Default)]
pub struct EmbeddedArrayStrategy;

static EMBEDDED_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\["([A-Za-z0-9_-]{20,})",\["[A-Za-z0-9_-]+"\],"([^"]{1,300})""#)
        .expect("embedded array pattern is valid")
});

impl ExtractionStrategy for EmbeddedArrayStrategy {
    fn name(&self) -> &'static str {
        "embedded-array"
    }

    fn extract(&self, body: &str) -> Vec<Candidate> {
        EMBEDDED_ARRAY
            .captures_iter(body)
            .map(|caps| Candidate::new(&caps[2], &caps[1]))
            .collect()
    }
}

/// Grid/list markup: `data-id="<id>" ... aria-label="<title> Video"`.
#[derive(Debug, Default)]
pub struct DataIdStrategy;

static DATA_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"data-id="([A-Za-z0-9_-]{20,})"[^>]*?(?:data-tooltip|aria-label|title)="([^"]{1,300})""#,
    )
    .expect("data-id pattern is valid")
});

impl ExtractionStrategy for DataIdStrategy {
    fn name(&self) -> &'static str {
        "data-id"
    }

    fn extract(&self, body: &str) -> Vec<Candidate> {
        DATA_ID
            .captures_iter(body)
            .filter_map(|caps| {
                // Labels append the file kind after the name ("clip.mp4 Video")
                let title = truncate_after_extension(&caps[2])?;
                Some(Candidate::new(title, &caps[1]))
            })
            .collect()
    }
}

/// Anchors pointing at per-file pages: `/file/d/<id>/view">title<`.
#[derive(Debug, Default)]
pub struct FileLinkStrategy;

static FILE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"/file/d/([A-Za-z0-9_-]{20,})[^"]*"[^>]*>([^<]{1,300})<"#)
        .expect("file link pattern is valid")
});

impl ExtractionStrategy for FileLinkStrategy {
    fn name(&self) -> &'static str {
        "file-link"
    }

    fn extract(&self, body: &str) -> Vec<Candidate> {
        FILE_LINK
            .captures_iter(body)
            .map(|caps| Candidate::new(&caps[2], &caps[1]))
            .collect()
    }
}

/// Quoted media filenames with no identifier nearby.
///
/// Emits the placeholder identifier; such entries need an explicit
/// resolution step before they can be downloaded.
#[derive(Debug, Default)]
pub struct BareTitleStrategy;

static BARE_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"([^"\\/<>]{1,200}\.(?:mp4|flv|mov|avi|mkv|wmv))""#)
        .expect("bare title pattern is valid")
});

impl ExtractionStrategy for BareTitleStrategy {
    fn name(&self) -> &'static str {
        "bare-title"
    }

    fn pairs_identifiers(&self) -> bool {
        false
    }

    fn extract(&self, body: &str) -> Vec<Candidate> {
        BARE_TITLE
            .captures_iter(body)
            .map(|caps| Candidate::new(&caps[1], PLACEHOLDER_IDENTIFIER))
            .collect()
    }
}

static QUOTED_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([A-Za-z0-9_-]{20,})""#).expect("quoted token pattern is valid")
});

/// How far before a title occurrence an identifier may appear.
const PROXIMITY_WINDOW: usize = 600;

/// Finds the identifier-shaped token closest before an occurrence of `title`.
pub fn identifier_near_title(body: &str, title: &str) -> Option<String> {
    let quoted = format!("\"{title}\"");
    body.match_indices(&quoted).find_map(|(position, _)| {
        let mut start = position.saturating_sub(PROXIMITY_WINDOW);
        while !body.is_char_boundary(start) {
            start += 1;
        }
        QUOTED_TOKEN
            .captures_iter(&body[start..position])
            .map(|caps| caps[1].to_string())
            .filter(|token| is_plausible_identifier(token))
            .last()
    })
}

/// Undoes the JavaScript string escaping used for inline page data.
pub fn unescape_page(raw: &str) -> String {
    raw.replace("\\x22", "\"")
        .replace("\\x27", "'")
        .replace("\\x5b", "[")
        .replace("\\x5d", "]")
        .replace("\\u003d", "=")
        .replace("\\u0026", "&")
        .replace("\\/", "/")
        .replace("\\\"", "\"")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

static TITLE_WITH_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?\.(?:mp4|flv|mov|avi|mkv|wmv))\b").expect("title pattern is valid")
});

fn truncate_after_extension(label: &str) -> Option<&str> {
    TITLE_WITH_EXTENSION
        .captures(label.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
