use owo_colors::OwoColorize;
use serde::Serialize;
use synthscan_core::{Message, ScanSummary};
use synthscan_page::{Document, ImageElement, Marker};

/// Detection rate as shown on the panel: one decimal place, or `-` when
/// nothing was scanned.
pub fn format_rate(summary: &ScanSummary) -> String {
    match summary.detection_rate() {
        Some(rate) => format!("{rate:.1}%"),
        None => "-".to_string(),
    }
}

fn paint(marker: Marker, color: bool) -> String {
    let label = format!("{:<5}", marker.label());
    if !color {
        return label;
    }
    match marker {
        Marker::Synthetic => label.red().bold().to_string(),
        Marker::Authentic => label.green().to_string(),
        Marker::Error => label.yellow().to_string(),
    }
}

fn describe(image: &ImageElement) -> &str {
    image
        .resolved_source()
        .or(image.src.as_deref())
        .unwrap_or("<no source>")
}

/// Plain-text report: one row per annotated image, then the summary.
pub fn text_report(document: &Document, summary: &ScanSummary, color: bool) -> String {
    let mut out = String::new();

    for image in document.annotated() {
        let Some(marker) = image.marker else {
            continue;
        };
        out.push_str(&format!("  {}  {}", paint(marker, color), describe(image)));
        if let (Marker::Error, Some(title)) = (marker, &image.title) {
            out.push_str(&format!("\n         {title}"));
        }
        out.push('\n');
    }

    if !out.is_empty() {
        out.push('\n');
    }
    let ai = if color && summary.ai_images > 0 {
        summary.ai_images.red().bold().to_string()
    } else {
        summary.ai_images.to_string()
    };
    out.push_str(&format!("Total images:   {}\n", summary.total_images));
    out.push_str(&format!("AI images:      {ai}\n"));
    out.push_str(&format!("Detection rate: {}\n", format_rate(summary)));
    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: Message,
    images: Vec<&'a ImageElement>,
}

/// `--json` output: the `scanComplete` message and every annotated element.
pub fn json_report(document: &Document, summary: &ScanSummary) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        summary: Message::from(*summary),
        images: document.annotated().collect(),
    })
}
