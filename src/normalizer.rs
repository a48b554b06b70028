use chrono::{DateTime, Utc};
use tracing::warn;
use url::Url;

use crate::types::{ContentItem, PipelineError, RawRecord, Result, ScanBatch, SourceType};

/// Canonicalizes a raw scan record into a uniform [`ContentItem`].
///
/// Required fields are `title` and `link`; everything else degrades to a
/// sensible default (a missing `published_at` becomes the scan date).
pub fn normalize(
    raw: &RawRecord,
    source_type: SourceType,
    scanned_at: DateTime<Utc>,
) -> Result<ContentItem> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(PipelineError::MalformedRecord {
            reason: "missing or empty title".to_string(),
        });
    }

    let link = raw.link.trim();
    if link.is_empty() {
        return Err(PipelineError::MalformedRecord {
            reason: format!("missing or empty link for '{title}'"),
        });
    }

    Ok(ContentItem {
        source_type,
        identity_key: canonical_link(link),
        title: title.to_string(),
        link: link.to_string(),
        summary: raw
            .summary
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        authors: raw.authors.clone(),
        published_at: raw.published_at.unwrap_or_else(|| scanned_at.date_naive()),
        scanned_at,
        topic_tags: Vec::new(),
    })
}

/// Normalizes a whole batch, dropping malformed records.
///
/// Returns the surviving items plus the number of records dropped; a
/// malformed record is never fatal to the batch.
pub fn normalize_batch(batch: &ScanBatch) -> (Vec<ContentItem>, usize) {
    let mut items = Vec::with_capacity(batch.records.len());
    let mut dropped = 0;

    for raw in &batch.records {
        match normalize(raw, batch.source_type, batch.collected_at) {
            Ok(item) => items.push(item),
            Err(e) => {
                dropped += 1;
                warn!(
                    batch_id = %batch.batch_id,
                    source_type = %batch.source_type,
                    "dropping record: {e}"
                );
            }
        }
    }

    (items, dropped)
}

/// The identity key is the canonical form of the link: fragment removed,
/// `utm_*` tracking params stripped, trailing slash trimmed. The source
/// site lives in the URL's origin, so the same content reached through two
/// scanners collapses to one key. Links that don't parse as URLs fall back
/// to their trimmed lowercase text so they still dedup consistently.
fn canonical_link(link: &str) -> String {
    let Ok(mut url) = Url::parse(link) else {
        return link.to_lowercase();
    };

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        drop(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(title: &str, link: &str) -> RawRecord {
        RawRecord {
            title: title.to_string(),
            link: link.to_string(),
            ..RawRecord::default()
        }
    }

    fn scanned_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn normalizes_complete_record() {
        let raw = RawRecord {
            title: "  Attention Is All You Need  ".to_string(),
            link: "https://example.org/papers/attention".to_string(),
            summary: Some("transformers".to_string()),
            published_at: NaiveDate::from_ymd_opt(2025, 1, 3),
            authors: vec!["A. Vaswani".to_string()],
        };

        let item = normalize(&raw, SourceType::Paper, scanned_at()).unwrap();
        assert_eq!(item.title, "Attention Is All You Need");
        assert_eq!(item.identity_key, "https://example.org/papers/attention");
        assert_eq!(item.published_at, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
        assert!(item.topic_tags.is_empty());
    }

    #[test]
    fn missing_published_at_defaults_to_scan_date() {
        let item = normalize(
            &record("Post", "https://example.org/post"),
            SourceType::BlogPost,
            scanned_at(),
        )
        .unwrap();
        assert_eq!(item.published_at, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn empty_title_or_link_is_malformed() {
        let err = normalize(&record("   ", "https://example.org"), SourceType::Paper, scanned_at())
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { .. }));

        let err =
            normalize(&record("Title", ""), SourceType::Paper, scanned_at()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { .. }));
    }

    #[test]
    fn identity_key_ignores_fragments_tracking_and_trailing_slash() {
        let base = normalize(
            &record("Post", "https://example.org/post"),
            SourceType::BlogPost,
            scanned_at(),
        )
        .unwrap();
        let noisy = normalize(
            &record(
                "Post",
                "https://example.org/post/?utm_source=rss&utm_medium=feed#section-2",
            ),
            SourceType::BlogPost,
            scanned_at(),
        )
        .unwrap();
        assert_eq!(base.identity_key, noisy.identity_key);
    }

    #[test]
    fn identity_key_is_shared_across_source_types() {
        // The same content reached via the paper scan and a blog scan must
        // collapse to one key so the deduplicator can merge them.
        let paper = normalize(
            &record("X", "https://example.org/x"),
            SourceType::Paper,
            scanned_at(),
        )
        .unwrap();
        let post = normalize(
            &record("X", "https://example.org/x"),
            SourceType::BlogPost,
            scanned_at(),
        )
        .unwrap();
        assert_eq!(paper.identity_key, post.identity_key);
    }

    #[test]
    fn batch_normalization_drops_malformed_only() {
        let batch = ScanBatch::new(
            SourceType::Paper,
            scanned_at(),
            vec![
                record("Good", "https://example.org/good"),
                record("", "https://example.org/untitled"),
                record("Also good", "https://example.org/also-good"),
            ],
        );

        let (items, dropped) = normalize_batch(&batch);
        assert_eq!(items.len(), 2);
        assert_eq!(dropped, 1);
    }
}
