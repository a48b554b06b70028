use std::collections::HashMap;

use chrono::Utc;
use tracing::info;

use crate::classifier::GENERAL_SECTION;
use crate::types::{
    ContentItem, DigestDocument, DigestSection, PeriodId, PipelineError, Result, SourceCounts,
};

/// Assembles deduplicated, classified items into a [`DigestDocument`].
#[derive(Debug, Clone)]
pub struct DigestCompiler {
    section_order: Vec<String>,
    section_titles: HashMap<String, String>,
}

impl DigestCompiler {
    pub fn new(section_order: Vec<String>, section_titles: HashMap<String, String>) -> Self {
        Self {
            section_order,
            section_titles,
        }
    }

    /// Routes each item into the section named by its primary tag and
    /// produces the digest for `period_id`.
    ///
    /// Within a section items are ordered by `published_at` descending,
    /// ties broken by `identity_key` ascending; `source_counts` is derived
    /// from the routed items. Zero items is a fatal
    /// [`PipelineError::EmptyDigest`].
    pub fn compile(
        &self,
        period_id: PeriodId,
        title: String,
        items: Vec<ContentItem>,
    ) -> Result<DigestDocument> {
        if items.is_empty() {
            return Err(PipelineError::EmptyDigest {
                period_id: period_id.to_string(),
            });
        }

        let mut buckets: HashMap<String, Vec<ContentItem>> = HashMap::new();
        let mut section_order = self.section_order.clone();

        for item in items {
            let key = item
                .primary_tag()
                .unwrap_or(GENERAL_SECTION)
                .to_string();
            if !section_order.iter().any(|k| *k == key) {
                section_order.push(key.clone());
            }
            buckets.entry(key).or_default().push(item);
        }

        let mut sections = Vec::new();
        let mut source_counts = SourceCounts::default();

        for key in section_order {
            let Some(mut items) = buckets.remove(&key) else {
                continue;
            };
            items.sort_by(|a, b| {
                b.published_at
                    .cmp(&a.published_at)
                    .then_with(|| a.identity_key.cmp(&b.identity_key))
            });
            for item in &items {
                source_counts.add(item.source_type);
            }
            sections.push(DigestSection {
                title: self.section_title(&key),
                key,
                items,
            });
        }

        let digest = DigestDocument {
            period_id,
            title,
            generated_at: Utc::now(),
            sections,
            source_counts,
        };

        info!(
            period_id = %digest.period_id,
            sections = digest.sections.len(),
            items = digest.item_count(),
            "compiled digest"
        );
        Ok(digest)
    }

    /// Display title for a section key, falling back to title-cased
    /// snake_case (`tools_and_projects` -> `Tools And Projects`).
    fn section_title(&self, key: &str) -> String {
        self.section_titles
            .get(key)
            .cloned()
            .unwrap_or_else(|| title_case(key))
    }
}

/// The stock display titles matching the default classifier rules.
pub fn default_section_titles() -> HashMap<String, String> {
    [
        ("emerging_trends", "Emerging Trends in Data Science"),
        ("tools_and_projects", "Innovative Tools & Projects"),
        ("learning_resources", "Learning & Development"),
        (GENERAL_SECTION, "General"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
