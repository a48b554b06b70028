use tracing::debug;

use crate::types::ContentItem;

/// Sentinel section for items no rule matches.
pub const GENERAL_SECTION: &str = "general";

/// One classification rule: a section key plus the keywords that route an
/// item into it. Rules are evaluated in list order and that order is the
/// tie-break, so classification stays reproducible.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub section_key: String,
    pub keywords: Vec<String>,
}

impl ClassifierRule {
    pub fn new(section_key: &str, keywords: &[&str]) -> Self {
        Self {
            section_key: section_key.to_string(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|keyword| text.contains(keyword))
    }
}

/// Deterministic keyword classifier over an explicit ordered rule list.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassifierRule>,
}

impl Classifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    /// Populates `topic_tags` with every matching section key, in rule
    /// priority order. An item no rule matches degrades to the sentinel
    /// `general` tag; the result is never empty.
    pub fn classify(&self, mut item: ContentItem) -> ContentItem {
        let text = format!("{} {}", item.title, item.summary).to_lowercase();

        let mut tags: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(&text))
            .map(|rule| rule.section_key.clone())
            .collect();
        tags.dedup();

        if tags.is_empty() {
            tags.push(GENERAL_SECTION.to_string());
        }

        debug!(identity_key = %item.identity_key, tags = ?tags, "classified item");
        item.topic_tags = tags;
        item
    }

    pub fn classify_all(&self, items: Vec<ContentItem>) -> Vec<ContentItem> {
        items.into_iter().map(|item| self.classify(item)).collect()
    }

    /// Section keys in rule-priority order, with the sentinel section last.
    /// This is the section order of compiled digests.
    pub fn section_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self.rules.iter().map(|r| r.section_key.clone()).collect();
        order.dedup();
        if !order.iter().any(|key| key == GENERAL_SECTION) {
            order.push(GENERAL_SECTION.to_string());
        }
        order
    }
}

impl Default for Classifier {
    /// The stock rule table for the open-data digest: research trends
    /// first, then tooling, then learning material.
    fn default() -> Self {
        Self::new(vec![
            ClassifierRule::new(
                "emerging_trends",
                &[
                    "machine learning",
                    "deep learning",
                    "artificial intelligence",
                    " ai ",
                    "neural",
                    "llm",
                    "research",
                    "emerging",
                    "trend",
                    "data science",
                ],
            ),
            ClassifierRule::new(
                "tools_and_projects",
                &[
                    "tool",
                    "library",
                    "framework",
                    "open source",
                    "open-source",
                    "release",
                    "project",
                    "github",
                    "api",
                ],
            ),
            ClassifierRule::new(
                "learning_resources",
                &[
                    "tutorial",
                    "course",
                    "guide",
                    "learning resource",
                    "workshop",
                    "how to",
                    "introduction to",
                ],
            ),
        ])
    }
}
