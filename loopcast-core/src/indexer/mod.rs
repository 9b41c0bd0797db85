//! Remote folder indexing.
//!
//! Turns a folder reference into a deduplicated, title-sorted list of
//! candidate video entries by scraping the folder's listing page. Scraping
//! is best effort: an empty result is a normal outcome, and
//! `RemoteEntry::manual` offers an equally valid way to build entries
//! without any extraction.

pub mod strategies;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use self::strategies::{
    Candidate, ExtractionStrategy, default_strategies, identifier_near_title, unescape_page,
};
use crate::config::IndexerConfig;
use crate::transport::{Transport, TransportError};

/// Marker some strategies emit when a title has no identifier next to it.
pub const PLACEHOLDER_IDENTIFIER: &str = "NOT_RESOLVED";

/// Shortest token accepted as a real entry identifier.
pub const MIN_IDENTIFIER_LEN: usize = 20;

/// Media extensions recognised in remote titles and local filenames.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "flv", "mov", "avi", "mkv", "wmv"];

/// Path segment that precedes the folder identifier in a folder reference.
const FOLDER_SEGMENT: &str = "folders";

/// Errors raised by folder indexing and identifier resolution.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Reference does not follow the folder-listing URL scheme
    #[error("Invalid folder reference '{reference}': {reason}")]
    InvalidFolderReference { reference: String, reason: String },

    /// Manually supplied entry failed validation
    #[error("Invalid entry '{title}': {reason}")]
    InvalidEntry { title: String, reason: String },

    /// Entry title could not be paired with an identifier on the listing page
    #[error("No identifier found for '{title}' on the folder listing")]
    IdentifierNotFound { title: String },

    /// Listing page could not be fetched during resolution
    #[error("Folder listing unavailable: {0}")]
    Transport(#[from] TransportError),
}

/// Candidate remote video: human-readable title plus opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub title: String,
    pub identifier: String,
}

impl RemoteEntry {
    /// Builds an entry from operator-supplied values, skipping extraction.
    ///
    /// # Errors
    ///
    /// - `IndexError::InvalidEntry` - Empty title or implausible identifier
    pub fn manual(title: &str, identifier: &str) -> Result<Self, IndexError> {
        let title = title.trim();
        let identifier = identifier.trim();
        let invalid = |reason: &str| IndexError::InvalidEntry {
            title: title.to_string(),
            reason: reason.to_string(),
        };
        if title.is_empty() {
            return Err(invalid("title is empty"));
        }
        if !is_plausible_identifier(identifier) {
            return Err(invalid("identifier is not a plausible token"));
        }
        Ok(Self {
            title: title.to_string(),
            identifier: identifier.to_string(),
        })
    }

    /// Whether the identifier is usable for a transfer.
    pub fn is_resolved(&self) -> bool {
        is_plausible_identifier(&self.identifier)
    }

    /// Attaches an identifier found by a deferred resolution step.
    pub fn attach_identifier(&mut self, identifier: String) {
        self.identifier = identifier;
    }
}

/// Checks that `identifier` looks like a real opaque token.
///
/// Rejects the placeholder marker, short tokens, and anything outside the
/// alphanumeric/dash/underscore alphabet.
pub fn is_plausible_identifier(identifier: &str) -> bool {
    identifier != PLACEHOLDER_IDENTIFIER
        && identifier.len() >= MIN_IDENTIFIER_LEN
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Whether `name` ends in a recognised media extension (case-insensitive).
pub fn has_video_extension(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty()
            && VIDEO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

/// Extracts the folder identifier from a folder-listing URL.
///
/// # Errors
///
/// - `IndexError::InvalidFolderReference` - Not a URL, or no folder segment followed by an identifier
pub fn parse_folder_reference(reference: &str) -> Result<String, IndexError> {
    let invalid = |reason: &str| IndexError::InvalidFolderReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(reference.trim()).map_err(|_| invalid("not a URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("unsupported scheme"));
    }

    let mut segments = url
        .path_segments()
        .ok_or_else(|| invalid("URL has no path"))?;
    segments
        .find(|segment| *segment == FOLDER_SEGMENT)
        .ok_or_else(|| invalid("missing folder segment"))?;

    let identifier = segments
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| invalid("missing folder identifier"))?;
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("malformed folder identifier"));
    }

    Ok(identifier.to_string())
}

/// Merges strategy output into the final entry list.
///
/// Applies the extension filter, keeps the first-seen title per identifier,
/// drops placeholder entries whose title already has a real identifier,
/// and sorts by title.
pub fn merge_candidates(candidates: impl IntoIterator<Item = Candidate>) -> Vec<RemoteEntry> {
    let mut by_identifier: HashMap<String, RemoteEntry> = HashMap::new();
    let mut unresolved: Vec<RemoteEntry> = Vec::new();

    for candidate in candidates {
        if !has_video_extension(&candidate.title) {
            continue;
        }
        let entry = RemoteEntry {
            title: candidate.title,
            identifier: candidate.identifier,
        };
        if entry.is_resolved() {
            by_identifier
                .entry(entry.identifier.clone())
                .or_insert(entry);
        } else if !unresolved.iter().any(|e| e.title == entry.title) {
            unresolved.push(entry);
        }
    }

    let resolved_titles: HashSet<&str> = by_identifier.values().map(|e| e.title.as_str()).collect();
    let unresolved: Vec<RemoteEntry> = unresolved
        .into_iter()
        .filter(|e| !resolved_titles.contains(e.title.as_str()))
        .collect();

    let mut entries: Vec<RemoteEntry> = by_identifier.into_values().chain(unresolved).collect();
    entries.sort_by(|a, b| a.title.cmp(&b.title).then(a.identifier.cmp(&b.identifier)));
    entries
}

/// Scrapes folder listing pages into `RemoteEntry` lists.
pub struct FolderIndexer {
    transport: Arc<dyn Transport>,
    config: IndexerConfig,
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl FolderIndexer {
    /// Creates an indexer using the default strategy list.
    pub fn new(transport: Arc<dyn Transport>, config: IndexerConfig) -> Self {
        Self::with_strategies(transport, config, default_strategies())
    }

    /// Creates an indexer with an explicit, priority-ordered strategy list.
    pub fn with_strategies(
        transport: Arc<dyn Transport>,
        config: IndexerConfig,
        strategies: Vec<Box<dyn ExtractionStrategy>>,
    ) -> Self {
        Self {
            transport,
            config,
            strategies,
        }
    }

    /// Lists the video entries of a remote folder.
    ///
    /// Transport and parse failures are not errors: they yield an empty list
    /// and a warning, and callers fall back to manual entry.
    ///
    /// # Errors
    ///
    /// - `IndexError::InvalidFolderReference` - Reference rejected before any network call
    pub async fn index(&self, folder_reference: &str) -> Result<Vec<RemoteEntry>, IndexError> {
        let folder_id = parse_folder_reference(folder_reference)?;

        let body = match self.fetch_listing(&folder_id).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Folder listing fetch failed for {}: {}", folder_id, e);
                return Ok(Vec::new());
            }
        };

        let entries = merge_candidates(self.run_strategies(&body, false));
        if entries.is_empty() {
            warn!("No video entries recognised in folder {}", folder_id);
        } else {
            info!("Indexed {} video entries in folder {}", entries.len(), folder_id);
        }
        Ok(entries)
    }

    /// Re-scans the listing page for the identifier of a placeholder entry.
    ///
    /// Entries that are already resolved are left untouched.
    ///
    /// # Errors
    ///
    /// - `IndexError::InvalidFolderReference` - Reference rejected before any network call
    /// - `IndexError::Transport` - Listing page could not be fetched
    /// - `IndexError::IdentifierNotFound` - Page fetched but no identifier pairs with the title
    pub async fn resolve_identifier(
        &self,
        folder_reference: &str,
        entry: &mut RemoteEntry,
    ) -> Result<(), IndexError> {
        if entry.is_resolved() {
            return Ok(());
        }

        let folder_id = parse_folder_reference(folder_reference)?;
        let body = self.fetch_listing(&folder_id).await?;

        let paired = self
            .run_strategies(&body, true)
            .into_iter()
            .filter(|c| is_plausible_identifier(&c.identifier))
            .find(|c| c.title.eq_ignore_ascii_case(&entry.title))
            .map(|c| c.identifier);

        let identifier = paired.or_else(|| identifier_near_title(&body, &entry.title));
        match identifier {
            Some(identifier) => {
                info!("Resolved identifier for '{}'", entry.title);
                entry.attach_identifier(identifier);
                Ok(())
            }
            None => Err(IndexError::IdentifierNotFound {
                title: entry.title.clone(),
            }),
        }
    }

    async fn fetch_listing(&self, folder_id: &str) -> Result<String, TransportError> {
        let url = self.config.index_url_template.replace("{id}", folder_id);
        debug!("Fetching folder listing {}", url);
        let raw = self.transport.get_text(&url).await?;
        Ok(unescape_page(&raw))
    }

    fn run_strategies(&self, body: &str, pairing_only: bool) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for strategy in &self.strategies {
            if pairing_only && !strategy.pairs_identifiers() {
                continue;
            }
            let found = strategy.extract(body);
            debug!("Strategy {} produced {} candidates", strategy.name(), found.len());
            candidates.extend(found);
        }
        candidates
    }
}
