//! The per-image pipeline and the scan loop that drives it.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::oneshot;

use crate::pool::{ImageJob, ScanPool};
use crate::{
    Classifier, Config, CoreError, ImageFetcher, ProgressEvent, ScanError, ScanFailure,
    ScanOutcome, ScanRequest, ScanSummary,
};

/// Acquire-then-classify for a single image.
pub struct ImagePipeline {
    fetcher: ImageFetcher,
    classifier: Classifier,
}

impl ImagePipeline {
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        Ok(Self {
            fetcher: ImageFetcher::new(config)?,
            classifier: Classifier::new(config)?,
        })
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Run the full pipeline for `src`. Every failure becomes a failed outcome.
    pub async fn process(&self, src: &str) -> ScanOutcome {
        let bytes = match self.fetcher.fetch(src).await {
            Ok(bytes) => bytes,
            Err(ScanError::DataUriSkipped) => {
                log::info!("skipping inline image {}", abbreviate(src));
                return ScanOutcome::failure(src, ScanError::DataUriSkipped);
            }
            Err(e) => {
                log::error!("error processing {}: {}", src, e);
                return ScanOutcome::failure(src, e);
            }
        };
        log::debug!("fetched {} ({} bytes)", src, bytes.len());

        match self.classifier.classify(bytes, src).await {
            Ok(verdict) => {
                log::debug!("backend response for {} -> {:?}", src, verdict);
                ScanOutcome::success(src, verdict)
            }
            Err(e) => {
                log::error!("error processing {}: {}", src, e);
                ScanOutcome::failure(src, ScanError::Backend(e))
            }
        }
    }
}

/// Scan every image of `request` through `pool`.
///
/// The returned batch has exactly one outcome per requested image, in
/// submission order, however the pool schedules the work. An image whose
/// worker never answered is reported as interrupted.
pub async fn run_scan(
    pool: &ScanPool,
    request: &ScanRequest,
    progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
) -> (Vec<ScanOutcome>, ScanSummary) {
    let total = request.images.len();
    let mut receivers = Vec::with_capacity(total);

    for (index, src) in request.images.iter().enumerate() {
        let (result_tx, result_rx) = oneshot::channel();
        pool.submit(ImageJob {
            src: src.clone(),
            result_tx,
            index,
            total,
            progress: progress.clone(),
        })
        .await;
        receivers.push(result_rx);
    }

    let outcomes: Vec<ScanOutcome> = join_all(receivers)
        .await
        .into_iter()
        .zip(&request.images)
        .map(|(settled, src)| {
            settled.unwrap_or_else(|_| {
                ScanOutcome::failure(src.clone(), ScanFailure::interrupted())
            })
        })
        .collect();

    let summary = ScanSummary::from_outcomes(&outcomes);
    (outcomes, summary)
}

fn abbreviate(src: &str) -> String {
    const MAX: usize = 48;
    match src.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &src[..cut]),
        None => src.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn no_progress() -> Arc<dyn Fn(ProgressEvent) + Send + Sync> {
        Arc::new(|_| {})
    }

    fn pool_for(server: &MockServer, workers: usize) -> ScanPool {
        let config = Config {
            backend_endpoint: format!("{}/detect", server.uri()),
            max_concurrent_images: workers,
            ..Config::default()
        };
        let pipeline = Arc::new(ImagePipeline::new(&config).unwrap());
        ScanPool::new(pipeline, CancellationToken::new(), workers)
    }

    async fn serve_image(server: &MockServer, name: &str, bytes: &str, delay_ms: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(bytes)
                    .set_delay(Duration::from_millis(delay_ms)),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn single_image_flagged_synthetic() {
        let server = MockServer::start().await;
        serve_image(&server, "a.jpg", "AAA", 0).await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ai": true}"#))
            .mount(&server)
            .await;

        let pool = pool_for(&server, 1);
        let request = ScanRequest {
            page: None,
            images: vec![format!("{}/a.jpg", server.uri())],
        };
        let (batch, summary) = run_scan(&pool, &request, no_progress()).await;
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is_synthetic());
        assert_eq!(
            summary,
            ScanSummary {
                total_images: 1,
                ai_images: 1
            }
        );
    }

    #[tokio::test]
    async fn batch_order_survives_parallel_completion() {
        let server = MockServer::start().await;
        // The first image is the slowest, so it completes last.
        serve_image(&server, "slow.jpg", "SLOW", 300).await;
        serve_image(&server, "mid.jpg", "MID", 100).await;
        serve_image(&server, "fast.jpg", "FAST", 0).await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .and(body_string_contains("MID"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ai": true}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ai": false}"#))
            .mount(&server)
            .await;

        let pool = pool_for(&server, 3);
        let images: Vec<String> = ["slow.jpg", "mid.jpg", "fast.jpg"]
            .iter()
            .map(|n| format!("{}/{}", server.uri(), n))
            .collect();
        let request = ScanRequest {
            page: None,
            images: images.clone(),
        };

        let finished = Arc::new(Mutex::new(Vec::new()));
        let finished_cb = finished.clone();
        let progress: Arc<dyn Fn(ProgressEvent) + Send + Sync> =
            Arc::new(move |event: ProgressEvent| finished_cb.lock().unwrap().push(event.index));

        let (batch, summary) = run_scan(&pool, &request, progress).await;
        let srcs: Vec<&str> = batch.iter().map(|o| o.src.as_str()).collect();
        assert_eq!(srcs, images.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(batch[1].is_synthetic());
        assert_eq!(summary.ai_images, 1);
        assert_eq!(*finished.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn every_image_gets_an_outcome_under_failure() {
        let server = MockServer::start().await;
        serve_image(&server, "ok.jpg", "OK", 0).await;
        Mock::given(method("GET"))
            .and(path("/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(500).set_body_string("server error"))
            .mount(&server)
            .await;

        let pool = pool_for(&server, 1);
        let request = ScanRequest {
            page: None,
            images: vec![
                format!("{}/ok.jpg", server.uri()),
                format!("{}/missing.jpg", server.uri()),
                "data:image/png;base64,AAAA".to_string(),
            ],
        };
        let (batch, summary) = run_scan(&pool, &request, no_progress()).await;
        assert_eq!(batch.len(), 3);
        assert_eq!(summary.total_images, 3);
        assert_eq!(summary.ai_images, 0);

        let kinds: Vec<FailureKind> = batch
            .iter()
            .map(|o| o.verdict.as_ref().unwrap_err().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FailureKind::Backend,
                FailureKind::Acquisition,
                FailureKind::DataUriSkipped
            ]
        );
        let backend_message = &batch[0].verdict.as_ref().unwrap_err().message;
        assert!(backend_message.contains("500"));
        assert!(backend_message.contains("server error"));
    }

    #[tokio::test]
    async fn data_uri_never_reaches_network() {
        let server = MockServer::start().await;
        let pool = pool_for(&server, 1);
        let request = ScanRequest {
            page: None,
            images: vec!["data:image/gif;base64,R0lGOD".to_string()],
        };
        let (batch, _) = run_scan(&pool, &request, no_progress()).await;
        assert_eq!(
            batch[0].verdict.as_ref().unwrap_err().kind,
            FailureKind::DataUriSkipped
        );
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_pool_reports_interrupted_outcomes() {
        let server = MockServer::start().await;
        let pool = pool_for(&server, 1);
        pool.close();

        let request = ScanRequest {
            page: None,
            images: vec!["https://x/a.jpg".into(), "https://x/b.jpg".into()],
        };
        let (batch, summary) = run_scan(&pool, &request, no_progress()).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(summary.total_images, 2);
        assert!(batch
            .iter()
            .all(|o| o.verdict.as_ref().unwrap_err().kind == FailureKind::Interrupted));
    }

    #[tokio::test]
    async fn empty_request_yields_empty_batch() {
        let server = MockServer::start().await;
        let pool = pool_for(&server, 1);
        let request = ScanRequest {
            page: None,
            images: vec![],
        };
        let (batch, summary) = run_scan(&pool, &request, no_progress()).await;
        assert!(batch.is_empty());
        assert_eq!(summary, ScanSummary::default());
    }

    #[test]
    fn abbreviate_long_sources() {
        assert_eq!(abbreviate("https://x/a.jpg"), "https://x/a.jpg");
        let long = format!("data:image/png;base64,{}", "A".repeat(100));
        assert_eq!(abbreviate(&long).chars().count(), 51);
    }
}
