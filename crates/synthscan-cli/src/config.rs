use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use synthscan_core::{Config, OverlapPolicy, SiteCookie};
use synthscan_page::MatchPolicy;
use url::Url;

/// Contents of a `--config` TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub core: Config,
    pub match_policy: MatchPolicy,
}

/// Values given on the command line; `None`/`false` defers to lower layers.
#[derive(Debug, Default)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub concurrency: Option<usize>,
    pub cookie: Option<String>,
    pub exact_match: bool,
    pub reject_overlap: bool,
}

/// Fully resolved settings for one run.
#[derive(Debug)]
pub struct Settings {
    pub core: Config,
    pub match_policy: MatchPolicy,
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Resolve settings: command line > environment > config file > defaults.
///
/// A cookie from the command line or environment is scoped to the page's
/// origin, so it needs `page_url`.
pub fn resolve(
    overrides: &Overrides,
    env: impl Fn(&str) -> Option<String>,
    file: FileConfig,
    page_url: Option<&Url>,
) -> anyhow::Result<Settings> {
    let FileConfig {
        mut core,
        mut match_policy,
    } = file;

    if let Some(endpoint) = overrides
        .endpoint
        .clone()
        .or_else(|| env("SYNTHSCAN_ENDPOINT"))
    {
        core.backend_endpoint = endpoint;
    }

    let concurrency = match overrides.concurrency {
        Some(n) => Some(n),
        None => env("SYNTHSCAN_CONCURRENCY")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("SYNTHSCAN_CONCURRENCY must be a positive integer")?,
    };
    if let Some(n) = concurrency {
        anyhow::ensure!(n > 0, "concurrency must be at least 1");
        core.max_concurrent_images = n;
    }

    if let Some(cookie) = overrides.cookie.clone().or_else(|| env("SYNTHSCAN_COOKIE")) {
        let url = page_url
            .context("a cookie needs a page URL; pass an http(s) target or --base-url")?;
        core.cookies.push(SiteCookie {
            url: url.origin().ascii_serialization(),
            cookie,
        });
    }

    if overrides.reject_overlap {
        core.overlap = OverlapPolicy::Reject;
    }
    if overrides.exact_match {
        match_policy = MatchPolicy::ExactOnly;
    }

    Ok(Settings { core, match_policy })
}
