//! Image byte acquisition.
//!
//! A plain GET is tried first. Any failure (transport error, non-success
//! status, or a zero-length body) triggers exactly one retry through a client
//! that carries the configured site cookies, for same-origin images behind a
//! login. Inline `data:` references never reach the network.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;

use crate::{Config, CoreError, FetchAttemptError, ScanError};

/// Fetches image bytes with a plain attempt and a credentialed fallback.
pub struct ImageFetcher {
    plain: reqwest::Client,
    credentialed: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        let timeout = Duration::from_secs(config.fetch_timeout_secs);

        let jar = Arc::new(Jar::default());
        for site in &config.cookies {
            let url = reqwest::Url::parse(&site.url).map_err(|e| CoreError::InvalidCookieUrl {
                url: site.url.clone(),
                reason: e.to_string(),
            })?;
            jar.add_cookie_str(&site.cookie, &url);
        }

        let plain = reqwest::Client::builder().timeout(timeout).build()?;
        let credentialed = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_provider(jar)
            .build()?;

        Ok(Self {
            plain,
            credentialed,
        })
    }

    /// Download the bytes behind `src`.
    pub async fn fetch(&self, src: &str) -> Result<Vec<u8>, ScanError> {
        if is_data_uri(src) {
            return Err(ScanError::DataUriSkipped);
        }

        let plain = match fetch_once(&self.plain, src).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };
        log::debug!("plain fetch of {} failed ({}); retrying with credentials", src, plain);

        match fetch_once(&self.credentialed, src).await {
            Ok(bytes) => Ok(bytes),
            Err(credentialed) => Err(ScanError::Acquisition {
                plain,
                credentialed,
            }),
        }
    }
}

async fn fetch_once(client: &reqwest::Client, src: &str) -> Result<Vec<u8>, FetchAttemptError> {
    let resp = client
        .get(src)
        .send()
        .await
        .map_err(FetchAttemptError::Network)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchAttemptError::Status(status.as_u16()));
    }

    let body = resp.bytes().await.map_err(FetchAttemptError::Network)?;
    if body.is_empty() {
        return Err(FetchAttemptError::EmptyBody);
    }
    Ok(body.to_vec())
}

/// Whether `src` is an inline `data:` reference (scheme match is case-insensitive).
pub fn is_data_uri(src: &str) -> bool {
    src.get(..5)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
}
