use chrono::{DateTime, TimeZone, Utc};
use feed_rs::parser;
use serde::Deserialize;

use super::types::FetchError;
use crate::storage::ParsedItem;
use crate::util::{strip_control_chars, strip_markup, truncate_chars, MAX_SUMMARY_CHARS};

// ============================================================================
// RSS / Atom
// ============================================================================

/// Parse an RSS or Atom document into raw items.
///
/// Fields are taken as-is; [`normalize`] cleans them afterwards. Entries
/// without an author inherit the feed's author or, failing that, its title,
/// which for account feeds is the account name.
pub(crate) fn parse_feed(bytes: &[u8]) -> Result<Vec<ParsedItem>, FetchError> {
    let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let feed_author = feed
        .authors
        .first()
        .map(|p| p.name.clone())
        .or_else(|| feed.title.as_ref().map(|t| t.content.clone()))
        .unwrap_or_default();

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
                .or_else(|| entry.links.first())
                .map(|l| l.href.clone())
                .unwrap_or_default();
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let author = entry
                .authors
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| feed_author.clone());

            ParsedItem {
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                link,
                summary,
                author,
                publish_time: entry.published.or(entry.updated),
            }
        })
        .collect();

    Ok(items)
}

// ============================================================================
// Search API JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    title: Option<String>,
    link: Option<String>,
    digest: Option<String>,
    author: Option<String>,
    publish_time: Option<PublishTime>,
}

/// Search results carry either unix seconds or an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublishTime {
    Unix(i64),
    Text(String),
}

impl PublishTime {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            PublishTime::Unix(secs) => Utc.timestamp_opt(*secs, 0).single(),
            PublishTime::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Parse a search API response (`{"items": [...]}`) into raw items.
///
/// An unparsable `publish_time` is dropped, not treated as an error.
pub(crate) fn parse_search_response(bytes: &[u8]) -> Result<Vec<ParsedItem>, FetchError> {
    let response: SearchResponse =
        serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    Ok(response
        .items
        .into_iter()
        .map(|entry| ParsedItem {
            title: entry.title.unwrap_or_default(),
            link: entry.link.unwrap_or_default(),
            summary: entry.digest.unwrap_or_default(),
            author: entry.author.unwrap_or_default(),
            publish_time: entry.publish_time.as_ref().and_then(PublishTime::to_datetime),
        })
        .collect())
}

// ============================================================================
// Normalization
// ============================================================================

/// Map raw items into the stored shape and cap them at `limit`.
///
/// Titles and authors lose markup and surrounding whitespace, links lose
/// control characters, summaries are stripped to plain text and cut at
/// [`MAX_SUMMARY_CHARS`]. Items left without a title or link are dropped.
pub(crate) fn normalize(raw: Vec<ParsedItem>, limit: usize) -> Vec<ParsedItem> {
    let total = raw.len();
    let items: Vec<ParsedItem> = raw
        .into_iter()
        .filter_map(|item| {
            let title = strip_markup(&item.title);
            let link = strip_control_chars(item.link.trim()).trim().to_string();
            if title.is_empty() || link.is_empty() {
                return None;
            }
            let summary = strip_markup(&item.summary);
            Some(ParsedItem {
                title,
                link,
                summary: truncate_chars(&summary, MAX_SUMMARY_CHARS).into_owned(),
                author: strip_markup(&item.author),
                publish_time: item.publish_time,
            })
        })
        .collect();

    let dropped = total - items.len();
    if dropped > 0 {
        tracing::debug!(dropped = dropped, total = total, "Dropped items without title or link");
    }

    items.into_iter().take(limit).collect()
}
