use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod acquire;
pub mod bus;
pub mod classify;
pub mod messages;
pub mod orchestrator;
pub mod pool;
pub mod scan;

#[cfg(test)]
mod testutil;

pub use acquire::{ImageFetcher, is_data_uri};
pub use bus::{Bus, DeliveryError, Envelope, PageId};
pub use classify::Classifier;
pub use messages::Message;
pub use orchestrator::Orchestrator;
pub use pool::{ImageJob, ScanPool};
pub use scan::{ImagePipeline, run_scan};

/// Source identifier (URL) of one image found on a page.
pub type ImageRef = String;

/// Multipart field carrying the image bytes in a backend submission.
pub const UPLOAD_FIELD: &str = "file";

/// Filename attached to every uploaded image, whatever its real format.
pub const UPLOAD_FILENAME: &str = "image.jpg";

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid cookie URL {url}: {reason}")]
    InvalidCookieUrl { url: String, reason: String },
}

/// Why a single acquisition attempt failed.
#[derive(Error, Debug)]
pub enum FetchAttemptError {
    #[error("fetch status {0}")]
    Status(u16),
    #[error("empty body")]
    EmptyBody,
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("network error posting to backend for {src}: {source}")]
    Network {
        src: ImageRef,
        #[source]
        source: reqwest::Error,
    },
    #[error("backend returned {status} for {src}. Body: {body}")]
    Status {
        src: ImageRef,
        status: u16,
        body: String,
    },
    #[error("backend returned non-JSON for {src}: {body}")]
    Malformed { src: ImageRef, body: String },
}

/// Everything that can go wrong while scanning one image.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("data: URI skipped")]
    DataUriSkipped,
    #[error("fetch failed: {plain}; fallback with credentials failed: {credentialed}")]
    Acquisition {
        plain: FetchAttemptError,
        credentialed: FetchAttemptError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ScanError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ScanError::DataUriSkipped => FailureKind::DataUriSkipped,
            ScanError::Acquisition { .. } => FailureKind::Acquisition,
            ScanError::Backend(_) => FailureKind::Backend,
        }
    }
}

/// Category of a failed outcome, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    DataUriSkipped,
    Acquisition,
    Backend,
    /// The worker stopped before it produced an outcome.
    Interrupted,
    /// Reported by a producer that did not tag its failure.
    Unknown,
}

/// A per-image failure, flattened to what crosses a context boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ScanFailure {
    pub fn interrupted() -> Self {
        Self {
            kind: FailureKind::Interrupted,
            message: "scan worker stopped before completing this image".to_string(),
        }
    }
}

impl From<ScanError> for ScanFailure {
    fn from(err: ScanError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Classification returned by the backend.
///
/// Only `ai` is interpreted; any other fields are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Verdict {
    pub fn with_ai(ai: bool) -> Self {
        Self {
            ai: Some(ai),
            extra: serde_json::Map::new(),
        }
    }

    /// An absent `ai` field reads as not synthetic.
    pub fn is_synthetic(&self) -> bool {
        self.ai.unwrap_or(false)
    }
}

/// The result of scanning a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireOutcome", from = "WireOutcome")]
pub struct ScanOutcome {
    pub src: ImageRef,
    pub verdict: Result<Verdict, ScanFailure>,
}

impl ScanOutcome {
    pub fn success(src: impl Into<ImageRef>, verdict: Verdict) -> Self {
        Self {
            src: src.into(),
            verdict: Ok(verdict),
        }
    }

    pub fn failure(src: impl Into<ImageRef>, failure: impl Into<ScanFailure>) -> Self {
        Self {
            src: src.into(),
            verdict: Err(failure.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.verdict.is_ok()
    }

    /// True only for a successful outcome whose verdict is synthetic-positive.
    pub fn is_synthetic(&self) -> bool {
        self.verdict.as_ref().is_ok_and(Verdict::is_synthetic)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutcome {
    src: ImageRef,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<FailureKind>,
}

impl From<ScanOutcome> for WireOutcome {
    fn from(outcome: ScanOutcome) -> Self {
        match outcome.verdict {
            Ok(verdict) => WireOutcome {
                src: outcome.src,
                ok: true,
                result: Some(verdict),
                error: None,
                error_kind: None,
            },
            Err(failure) => WireOutcome {
                src: outcome.src,
                ok: false,
                result: None,
                error: Some(failure.message),
                error_kind: Some(failure.kind),
            },
        }
    }
}

impl From<WireOutcome> for ScanOutcome {
    fn from(wire: WireOutcome) -> Self {
        let verdict = if wire.ok {
            Ok(wire.result.unwrap_or_default())
        } else {
            Err(ScanFailure {
                kind: wire.error_kind.unwrap_or(FailureKind::Unknown),
                message: wire.error.unwrap_or_else(|| "unknown".to_string()),
            })
        };
        Self {
            src: wire.src,
            verdict,
        }
    }
}

/// One user-triggered scan: the images to check and the page that asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub page: Option<PageId>,
    pub images: Vec<ImageRef>,
}

/// Aggregate counts for one completed scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub total_images: usize,
    pub ai_images: usize,
}

impl ScanSummary {
    pub fn from_outcomes(outcomes: &[ScanOutcome]) -> Self {
        Self {
            total_images: outcomes.len(),
            ai_images: outcomes.iter().filter(|o| o.is_synthetic()).count(),
        }
    }

    /// Percentage of flagged images, `None` for an empty scan.
    pub fn detection_rate(&self) -> Option<f64> {
        if self.total_images == 0 {
            None
        } else {
            Some(self.ai_images as f64 / self.total_images as f64 * 100.0)
        }
    }
}

/// Emitted by a pool worker each time one image of a scan settles.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Position of the image in its scan request.
    pub index: usize,
    pub total: usize,
    pub outcome: Box<ScanOutcome>,
}

/// What happens when a page asks for a scan while one of its scans is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Run every request; overlapping scans proceed independently.
    #[default]
    Allow,
    /// Drop a request from a page that already has a scan in flight.
    Reject,
}

/// A cookie offered on the credentialed acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteCookie {
    pub url: String,
    pub cookie: String,
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_endpoint: String,
    pub max_concurrent_images: usize,
    pub fetch_timeout_secs: u64,
    pub backend_timeout_secs: u64,
    pub overlap: OverlapPolicy,
    pub cookies: Vec<SiteCookie>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_endpoint: "http://127.0.0.1:8000/detect".to_string(),
            max_concurrent_images: 1,
            fetch_timeout_secs: 15,
            backend_timeout_secs: 30,
            overlap: OverlapPolicy::Allow,
            cookies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(src: &str) -> ScanOutcome {
        ScanOutcome::failure(src, ScanError::DataUriSkipped)
    }

    #[test]
    fn summary_counts_only_successful_synthetic_outcomes() {
        let outcomes = vec![
            ScanOutcome::success("https://x/a.jpg", Verdict::with_ai(true)),
            ScanOutcome::success("https://x/b.jpg", Verdict::with_ai(false)),
            ScanOutcome::success("https://x/c.jpg", Verdict::default()),
            failed("https://x/d.jpg"),
        ];
        let summary = ScanSummary::from_outcomes(&outcomes);
        assert_eq!(summary.total_images, 4);
        assert_eq!(summary.ai_images, 1);
    }

    #[test]
    fn detection_rate_empty_scan() {
        assert_eq!(ScanSummary::default().detection_rate(), None);
        let summary = ScanSummary {
            total_images: 4,
            ai_images: 1,
        };
        assert_eq!(summary.detection_rate(), Some(25.0));
    }

    #[test]
    fn verdict_ignores_unknown_fields() {
        let verdict: Verdict =
            serde_json::from_str(r#"{"ai": true, "confidence": 0.91, "label": "sdxl"}"#).unwrap();
        assert!(verdict.is_synthetic());
        assert_eq!(verdict.extra.len(), 2);
    }

    #[test]
    fn verdict_without_ai_field_is_not_synthetic() {
        let verdict: Verdict = serde_json::from_str("{}").unwrap();
        assert_eq!(verdict.ai, None);
        assert!(!verdict.is_synthetic());
    }

    #[test]
    fn outcome_wire_shape_success() {
        let outcome = ScanOutcome::success("https://x/a.jpg", Verdict::with_ai(true));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"src": "https://x/a.jpg", "ok": true, "result": {"ai": true}})
        );
    }

    #[test]
    fn outcome_wire_shape_failure() {
        let json = serde_json::to_value(failed("data:image/png;base64,AAAA")).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "data: URI skipped");
        assert_eq!(json["errorKind"], "dataUriSkipped");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn outcome_from_untagged_failure() {
        let outcome: ScanOutcome =
            serde_json::from_str(r#"{"src": "https://x/a.jpg", "ok": false}"#).unwrap();
        let failure = outcome.verdict.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unknown);
        assert_eq!(failure.message, "unknown");
    }

    #[test]
    fn config_defaults_are_sequential() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_images, 1);
        assert_eq!(config.overlap, OverlapPolicy::Allow);
        assert_eq!(config.backend_endpoint, "http://127.0.0.1:8000/detect");
    }
}
