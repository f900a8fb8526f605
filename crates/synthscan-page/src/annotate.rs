//! Applying a result batch to the page.
//!
//! Annotation is best effort: an outcome that matches no element is logged
//! and reported, never raised.

use serde::{Deserialize, Serialize};
use synthscan_core::{ImageRef, ScanOutcome};

use crate::document::{Document, ImageElement, Marker};

/// Attribute set on elements whose scan failed.
pub const DETECTION_ATTR: &str = "data-ai-detection";
/// Attribute holding the boolean verdict of a classified element.
pub const DETECTED_ATTR: &str = "data-ai-detected";

/// How outcomes are matched to elements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Exact source match; if nothing matches exactly, fall back to elements
    /// whose source is a suffix of the reference or vice versa. The fallback
    /// is permissive and may match several unrelated elements.
    #[default]
    ExactThenSuffix,
    /// Exact source match only.
    ExactOnly,
}

/// What one call to [`apply_results`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Number of element annotations written (an element may be counted more than once).
    pub annotated: usize,
    /// References that matched no element.
    pub unmatched: Vec<ImageRef>,
}

/// Indices of the elements an outcome for `src` applies to.
pub fn matching_elements(document: &Document, src: &str, policy: MatchPolicy) -> Vec<usize> {
    let sources = || {
        document
            .images()
            .iter()
            .enumerate()
            .filter_map(|(i, img)| img.resolved_source().map(|s| (i, s)))
    };

    let exact: Vec<usize> = sources().filter(|(_, s)| *s == src).map(|(i, _)| i).collect();
    if !exact.is_empty() || policy == MatchPolicy::ExactOnly || src.is_empty() {
        return exact;
    }

    sources()
        .filter(|(_, s)| s.ends_with(src) || src.ends_with(s))
        .map(|(i, _)| i)
        .collect()
}

/// Mark every element matched by each outcome.
pub fn apply_results(
    document: &mut Document,
    results: &[ScanOutcome],
    policy: MatchPolicy,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for outcome in results {
        let matches = matching_elements(document, &outcome.src, policy);
        if matches.is_empty() {
            log::warn!("no <img> match for {}", outcome.src);
            report.unmatched.push(outcome.src.clone());
            continue;
        }

        let images = document.images_mut();
        for i in matches {
            annotate(&mut images[i], outcome);
            report.annotated += 1;
        }
    }

    report
}

fn annotate(img: &mut ImageElement, outcome: &ScanOutcome) {
    match &outcome.verdict {
        Err(failure) => {
            let reason = if failure.message.is_empty() {
                "unknown"
            } else {
                failure.message.as_str()
            };
            mark(img, Marker::Error, format!("AI detection error: {}", reason));
            img.set_attribute(DETECTION_ATTR, "error");
        }
        Ok(verdict) => {
            let synthetic = verdict.is_synthetic();
            if synthetic {
                mark(img, Marker::Synthetic, "AI-generated (detected)".to_string());
            } else {
                mark(img, Marker::Authentic, "Likely real (not detected)".to_string());
            }
            img.set_attribute(DETECTED_ATTR, synthetic.to_string());
        }
    }
}

fn mark(img: &mut ImageElement, marker: Marker, title: String) {
    img.outline = Some(marker.outline().to_string());
    img.title = Some(title);
    img.marker = Some(marker);
}
