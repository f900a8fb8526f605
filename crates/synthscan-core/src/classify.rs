//! Submission of image bytes to the classification backend.

use std::time::Duration;

use reqwest::multipart::{Form, Part};

use crate::{BackendError, Config, CoreError, UPLOAD_FIELD, UPLOAD_FILENAME, Verdict};

/// HTTP client for the configured detection endpoint.
pub struct Classifier {
    client: reqwest::Client,
    endpoint: String,
}

impl Classifier {
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.backend_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.backend_endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Upload `bytes` as a single-file multipart form and parse the verdict.
    ///
    /// `src` is only used to label errors.
    pub async fn classify(&self, bytes: Vec<u8>, src: &str) -> Result<Verdict, BackendError> {
        let part = Part::bytes(bytes).file_name(UPLOAD_FILENAME);
        let form = Form::new().part(UPLOAD_FIELD, part);

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|source| BackendError::Network {
                src: src.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                src: src.to_string(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        // A body cut off mid-read is a transport failure, not an empty verdict.
        let body = resp.text().await.map_err(|source| BackendError::Network {
            src: src.to_string(),
            source,
        })?;

        parse_verdict(&body).map_err(|_| BackendError::Malformed {
            src: src.to_string(),
            body,
        })
    }
}

/// Parse a successful response body. An empty body is a verdict with no fields.
pub fn parse_verdict(body: &str) -> Result<Verdict, serde_json::Error> {
    if body.is_empty() {
        return Ok(Verdict::default());
    }
    serde_json::from_str(body)
}
