use tracing::{info, warn};

use crate::emitter::EmitReport;
use crate::types::{DeliveryJob, DigestDocument, Frequency, Subscriber};

/// A subscriber who matched the cycle but could not be served because
/// their preferred format did not render.
#[derive(Debug, Clone)]
pub struct SkippedDelivery {
    pub subscriber_id: uuid::Uuid,
    pub email: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DeliverySelection {
    pub jobs: Vec<DeliveryJob>,
    pub skipped: Vec<SkippedDelivery>,
}

/// Filters the subscriber snapshot down to per-subscriber delivery jobs.
///
/// A subscriber qualifies when their frequency matches the cycle and their
/// category set is empty or intersects the digest's section keys. Each
/// qualifying subscriber gets exactly one job; subscribers whose preferred
/// format failed to render are surfaced in `skipped`, never silently lost.
pub fn select_delivery_jobs(
    digest: &DigestDocument,
    report: &EmitReport,
    subscribers: &[Subscriber],
    cycle_frequency: Frequency,
) -> DeliverySelection {
    let section_keys = digest.section_keys();
    let mut selection = DeliverySelection::default();

    for subscriber in subscribers {
        let preference = &subscriber.preference;

        if preference.frequency != cycle_frequency {
            continue;
        }

        let category_match = preference.categories.is_empty()
            || preference
                .categories
                .iter()
                .any(|category| section_keys.iter().any(|key| key == category));
        if !category_match {
            continue;
        }

        match report.artifacts.get(&preference.format) {
            Some(artifact) => selection.jobs.push(DeliveryJob {
                subscriber_id: subscriber.subscriber_id,
                email: subscriber.email.clone(),
                format: preference.format,
                artifact: artifact.clone(),
            }),
            None => {
                warn!(
                    subscriber_id = %subscriber.subscriber_id,
                    format = %preference.format,
                    "subscriber's preferred format unavailable this cycle"
                );
                selection.skipped.push(SkippedDelivery {
                    subscriber_id: subscriber.subscriber_id,
                    email: subscriber.email.clone(),
                    reason: format!("format {} not rendered", preference.format),
                });
            }
        }
    }

    info!(
        period_id = %digest.period_id,
        jobs = selection.jobs.len(),
        skipped = selection.skipped.len(),
        "selected delivery jobs"
    );
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use crate::types::{
        DigestSection, OutputFormat, SourceCounts, Subscriber, SubscriberPreference,
    };

    fn digest() -> DigestDocument {
        DigestDocument {
            period_id: "2025-01".parse().unwrap(),
            title: "Digest".to_string(),
            generated_at: Utc::now(),
            sections: vec![DigestSection {
                key: "emerging_trends".to_string(),
                title: "Emerging Trends".to_string(),
                items: Vec::new(),
            }],
            source_counts: SourceCounts::default(),
        }
    }

    fn report() -> EmitReport {
        let mut report = EmitReport::default();
        report
            .artifacts
            .insert(OutputFormat::Html, "<html>".to_string());
        report
            .artifacts
            .insert(OutputFormat::Text, "text".to_string());
        report
    }

    fn subscriber(format: OutputFormat, frequency: Frequency, categories: &[&str]) -> Subscriber {
        Subscriber {
            subscriber_id: Uuid::new_v4(),
            email: "reader@example.org".to_string(),
            preference: SubscriberPreference {
                format,
                frequency,
                categories: categories.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    #[test]
    fn frequency_mismatch_excludes() {
        let subscribers = vec![
            subscriber(OutputFormat::Html, Frequency::Monthly, &[]),
            subscriber(OutputFormat::Html, Frequency::Weekly, &[]),
        ];
        let selection =
            select_delivery_jobs(&digest(), &report(), &subscribers, Frequency::Monthly);
        assert_eq!(selection.jobs.len(), 1);
        assert_eq!(selection.jobs[0].subscriber_id, subscribers[0].subscriber_id);
    }

    #[test]
    fn empty_categories_means_all() {
        let subscribers = vec![subscriber(OutputFormat::Text, Frequency::Monthly, &[])];
        let selection =
            select_delivery_jobs(&digest(), &report(), &subscribers, Frequency::Monthly);
        assert_eq!(selection.jobs.len(), 1);
        assert_eq!(selection.jobs[0].artifact, "text");
    }

    #[test]
    fn categories_must_intersect_section_keys() {
        let subscribers = vec![
            subscriber(OutputFormat::Html, Frequency::Monthly, &["emerging_trends"]),
            subscriber(OutputFormat::Html, Frequency::Monthly, &["sports"]),
        ];
        let selection =
            select_delivery_jobs(&digest(), &report(), &subscribers, Frequency::Monthly);
        assert_eq!(selection.jobs.len(), 1);
        assert_eq!(selection.jobs[0].subscriber_id, subscribers[0].subscriber_id);
    }

    #[test]
    fn one_job_per_subscriber() {
        let subscribers = vec![subscriber(
            OutputFormat::Html,
            Frequency::Monthly,
            &["emerging_trends"],
        )];
        let selection =
            select_delivery_jobs(&digest(), &report(), &subscribers, Frequency::Monthly);
        assert_eq!(selection.jobs.len(), 1);
    }

    #[test]
    fn failed_format_is_skipped_with_reason() {
        let subscribers = vec![subscriber(OutputFormat::Markdown, Frequency::Monthly, &[])];
        let selection =
            select_delivery_jobs(&digest(), &report(), &subscribers, Frequency::Monthly);
        assert!(selection.jobs.is_empty());
        assert_eq!(selection.skipped.len(), 1);
        assert!(selection.skipped[0].reason.contains("markdown"));
    }
}
