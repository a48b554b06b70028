use std::collections::HashMap;

use tracing::debug;

use crate::types::ContentItem;

/// Collapses items sharing an identity key, possibly across scan batches.
///
/// The item with the latest `scanned_at` wins (the first occurrence wins
/// ties), `topic_tags` are merged as a union preserving first-seen order,
/// and output order is stable by first-occurrence position. Running the
/// pass on its own output is a no-op.
pub fn dedup(items: Vec<ContentItem>) -> Vec<ContentItem> {
    let input_len = items.len();
    let mut out: Vec<ContentItem> = Vec::with_capacity(input_len);
    let mut seen: HashMap<String, usize> = HashMap::new();

    for item in items {
        match seen.get(&item.identity_key) {
            None => {
                seen.insert(item.identity_key.clone(), out.len());
                out.push(item);
            }
            Some(&index) => {
                let kept = &mut out[index];
                let tags = item.topic_tags.clone();
                if item.scanned_at > kept.scanned_at {
                    let mut merged = kept.topic_tags.clone();
                    *kept = item;
                    merge_tags(&mut merged, &kept.topic_tags);
                    kept.topic_tags = merged;
                } else {
                    merge_tags(&mut kept.topic_tags, &tags);
                }
            }
        }
    }

    if out.len() < input_len {
        debug!(merged = input_len - out.len(), "collapsed duplicate items");
    }
    out
}

fn merge_tags(into: &mut Vec<String>, from: &[String]) {
    for tag in from {
        if !into.iter().any(|t| t == tag) {
            into.push(tag.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, Utc};
    use crate::types::SourceType;

    fn item(key: &str, scanned: &str, tags: &[&str]) -> ContentItem {
        ContentItem {
            source_type: SourceType::Paper,
            identity_key: key.to_string(),
            title: format!("title for {key}"),
            link: format!("https://example.org/{key}"),
            summary: String::new(),
            authors: Vec::new(),
            published_at: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            scanned_at: DateTime::parse_from_rfc3339(scanned)
                .unwrap()
                .with_timezone(&Utc),
            topic_tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn unique_keys_pass_through_in_order() {
        let items = vec![
            item("a", "2025-01-01T00:00:00Z", &[]),
            item("b", "2025-01-02T00:00:00Z", &[]),
            item("c", "2025-01-03T00:00:00Z", &[]),
        ];
        let out = dedup(items.clone());
        assert_eq!(out, items);
    }

    #[test]
    fn latest_scan_wins_at_first_occurrence_position() {
        let out = dedup(vec![
            item("a", "2025-01-01T00:00:00Z", &[]),
            item("b", "2025-01-01T00:00:00Z", &[]),
            item("a", "2025-01-05T00:00:00Z", &[]),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].identity_key, "a");
        assert_eq!(
            out[0].scanned_at,
            DateTime::parse_from_rfc3339("2025-01-05T00:00:00Z").unwrap()
        );
        assert_eq!(out[1].identity_key, "b");
    }

    #[test]
    fn older_duplicate_does_not_replace() {
        let out = dedup(vec![
            item("a", "2025-01-05T00:00:00Z", &[]),
            item("a", "2025-01-01T00:00:00Z", &[]),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].scanned_at,
            DateTime::parse_from_rfc3339("2025-01-05T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn pre_tagged_duplicates_merge_tags_as_union() {
        let out = dedup(vec![
            item("a", "2025-01-01T00:00:00Z", &["emerging_trends"]),
            item("a", "2025-01-05T00:00:00Z", &["tools_and_projects", "emerging_trends"]),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic_tags, vec!["emerging_trends", "tools_and_projects"]);
    }

    #[test]
    fn no_two_outputs_share_identity_key() {
        let out = dedup(vec![
            item("a", "2025-01-01T00:00:00Z", &[]),
            item("b", "2025-01-01T00:00:00Z", &[]),
            item("a", "2025-01-02T00:00:00Z", &[]),
            item("b", "2025-01-03T00:00:00Z", &[]),
            item("a", "2025-01-04T00:00:00Z", &[]),
        ]);
        let mut keys: Vec<_> = out.iter().map(|i| i.identity_key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), out.len());
    }

    #[test]
    fn dedup_is_idempotent() {
        let once = dedup(vec![
            item("a", "2025-01-01T00:00:00Z", &["x"]),
            item("b", "2025-01-02T00:00:00Z", &[]),
            item("a", "2025-01-03T00:00:00Z", &["y"]),
        ]);
        let twice = dedup(once.clone());
        assert_eq!(once, twice);
    }
}
