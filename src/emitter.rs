use std::collections::HashMap;

use tracing::{error, info};

use crate::traits::Renderer;
use crate::types::{DigestDocument, OutputFormat, PipelineError};

/// One format's render failure, surfaced instead of swallowed.
#[derive(Debug, Clone)]
pub struct RenderFailure {
    pub format: OutputFormat,
    pub message: String,
}

/// Result of emitting one digest: every requested format lands either in
/// `artifacts` or in `failures`, never nowhere.
#[derive(Debug, Default)]
pub struct EmitReport {
    pub artifacts: HashMap<OutputFormat, String>,
    pub failures: Vec<RenderFailure>,
}

impl EmitReport {
    /// True when not a single requested format rendered.
    pub fn all_failed(&self) -> bool {
        self.artifacts.is_empty() && !self.failures.is_empty()
    }
}

/// Fans one digest snapshot out to the per-format renderers.
///
/// Every format renders from the identical document; one format failing
/// never stops its siblings.
pub struct MultiFormatEmitter {
    renderers: Vec<Box<dyn Renderer>>,
}

impl MultiFormatEmitter {
    pub fn new(renderers: Vec<Box<dyn Renderer>>) -> Self {
        Self { renderers }
    }

    pub fn register(&mut self, renderer: Box<dyn Renderer>) {
        self.renderers.push(renderer);
    }

    pub fn emit(&self, digest: &DigestDocument, formats: &[OutputFormat]) -> EmitReport {
        let mut report = EmitReport::default();

        for &format in formats {
            let Some(renderer) = self.renderers.iter().find(|r| r.format() == format) else {
                report.failures.push(RenderFailure {
                    format,
                    message: "no renderer registered".to_string(),
                });
                error!(%format, "no renderer registered for requested format");
                continue;
            };

            match renderer.render(digest) {
                Ok(artifact) => {
                    report.artifacts.insert(format, artifact);
                }
                Err(e) => {
                    let message = match e {
                        PipelineError::Render { message, .. } => message,
                        other => other.to_string(),
                    };
                    error!(%format, period_id = %digest.period_id, "render failed: {message}");
                    report.failures.push(RenderFailure { format, message });
                }
            }
        }

        info!(
            period_id = %digest.period_id,
            rendered = report.artifacts.len(),
            failed = report.failures.len(),
            "emitted digest formats"
        );
        report
    }
}
