//! Built-in renderers for the three delivery formats. All three walk the
//! same digest snapshot; none reorders or filters content.

use crate::traits::Renderer;
use crate::types::{ContentItem, DigestDocument, OutputFormat, Result};

/// Markdown rendition: `# title`, `## section`, one list entry per item.
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    fn render(&self, digest: &DigestDocument) -> Result<String> {
        let mut out = format!("# {}\n\n", digest.title);

        for section in &digest.sections {
            out.push_str(&format!("## {}\n\n", section.title));
            for item in &section.items {
                out.push_str(&format!(
                    "- [{}]({}) ({})\n",
                    item.title, item.link, item.published_at
                ));
                if !item.summary.is_empty() {
                    out.push_str(&format!("  {}\n", item.summary));
                }
            }
            out.push('\n');
        }

        out.push_str("---\n");
        out.push_str(&format!("Generated: {}\n", digest.generated_at.to_rfc3339()));
        Ok(out)
    }
}

/// Plain-text rendition for email bodies: underlined headings, indented
/// summaries.
pub struct TextRenderer;

impl Renderer for TextRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Text
    }

    fn render(&self, digest: &DigestDocument) -> Result<String> {
        let mut out = format!("{}\n{}\n\n", digest.title, "=".repeat(digest.title.len()));

        for section in &digest.sections {
            out.push_str(&format!(
                "{}\n{}\n\n",
                section.title,
                "-".repeat(section.title.len())
            ));
            for item in &section.items {
                out.push_str(&format!("* {} ({})\n", item.title, item.published_at));
                out.push_str(&format!("  {}\n", item.link));
                if !item.summary.is_empty() {
                    out.push_str(&format!("  {}\n", item.summary));
                }
                out.push('\n');
            }
        }

        out.push_str(&format!("Generated: {}\n", digest.generated_at.to_rfc3339()));
        Ok(out)
    }
}

/// Minimal HTML rendition; styling is left to downstream templates.
pub struct HtmlRenderer;

impl Renderer for HtmlRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Html
    }

    fn render(&self, digest: &DigestDocument) -> Result<String> {
        let mut out = String::from("<!DOCTYPE html>\n<html>\n<body>\n");
        out.push_str(&format!("<h1>{}</h1>\n", escape(&digest.title)));

        for section in &digest.sections {
            out.push_str(&format!("<h2>{}</h2>\n<ul>\n", escape(&section.title)));
            for item in &section.items {
                out.push_str(&render_item_html(item));
            }
            out.push_str("</ul>\n");
        }

        out.push_str(&format!(
            "<p><em>Generated: {}</em></p>\n</body>\n</html>\n",
            digest.generated_at.to_rfc3339()
        ));
        Ok(out)
    }
}

fn render_item_html(item: &ContentItem) -> String {
    let mut li = format!(
        "<li><a href=\"{}\">{}</a> <small>{}</small>",
        escape(&item.link),
        escape(&item.title),
        item.published_at
    );
    if !item.authors.is_empty() {
        li.push_str(&format!(" by {}", escape(&item.authors.join(", "))));
    }
    if !item.summary.is_empty() {
        li.push_str(&format!("<br/>{}", escape(&item.summary)));
    }
    li.push_str("</li>\n");
    li
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// The default renderer set covering every [`OutputFormat`].
pub fn default_renderers() -> Vec<Box<dyn Renderer>> {
    vec![
        Box::new(HtmlRenderer),
        Box::new(TextRenderer),
        Box::new(MarkdownRenderer),
    ]
}
