use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use synthscan_core::{Bus, Message, Orchestrator, ScanSummary};
use synthscan_page::{Document, PageAgent, ScanTrigger};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

mod config;
mod render;

use config::{FileConfig, Overrides};

/// Synthscan: flag AI-generated images on a web page.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Page URL (http or https) or path to a saved HTML file
    target: String,

    /// Base URL for resolving relative image sources of a saved HTML file
    #[arg(long)]
    base_url: Option<Url>,

    /// Detection backend endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Number of images scanned at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Cookie sent on the credentialed retry, scoped to the page origin
    #[arg(long)]
    cookie: Option<String>,

    /// Match results to images by exact source only
    #[arg(long)]
    exact_match: bool,

    /// Ignore a scan request while the page already has one running
    #[arg(long)]
    reject_overlap: bool,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the summary and annotated images as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let file = match &args.config {
        Some(path) => config::load_file(path)?,
        None => FileConfig::default(),
    };
    let (html, page_url) = load_page(&args.target, args.base_url.clone()).await?;

    // Resolve config from CLI flags > env vars > config file > defaults
    let overrides = Overrides {
        endpoint: args.endpoint.clone(),
        concurrency: args.concurrency,
        cookie: args.cookie.clone(),
        exact_match: args.exact_match,
        reject_overlap: args.reject_overlap,
    };
    let settings = config::resolve(
        &overrides,
        |key| std::env::var(key).ok(),
        file,
        page_url.as_ref(),
    )?;
    log::info!("backend endpoint: {}", settings.core.backend_endpoint);

    let cancel = CancellationToken::new();
    let (bus, inbox) = Bus::new();
    let mut panel = bus.subscribe_panel();
    let orchestrator = Orchestrator::new(settings.core, bus.clone(), cancel.clone())?.spawn(inbox);

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let page = PageAgent::spawn(
        Document::parse(&html, page_url.as_ref()),
        bus,
        settings.match_policy,
        |notice: &str| eprintln!("{notice}"),
    );
    let mut applied = page.applied();

    let trigger = page.run_scan().await?;
    let show_progress = !args.json;
    let summary = wait_for_summary(&mut panel, trigger, &cancel, show_progress).await?;

    if let ScanTrigger::Dispatched { .. } = trigger {
        // Results reach the page independently of the summary.
        let in_time = tokio::time::timeout(Duration::from_secs(5), applied.wait_for(|n| *n > 0))
            .await
            .is_ok();
        if !in_time {
            log::warn!("results were not applied to the page in time");
        }
    }
    let document = page.snapshot().await?;

    if args.json {
        println!("{}", render::json_report(&document, &summary)?);
    } else {
        print!("{}", render::text_report(&document, &summary, !args.no_color));
    }

    cancel.cancel();
    drop(page);
    join_orchestrator(orchestrator).await;
    Ok(())
}

/// Wait for the dispatcher task. Returns false if it panicked or was aborted.
async fn join_orchestrator(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("orchestrator task ended abnormally: {}", e);
            false
        }
    }
}

/// Fetch the page over HTTP, or read a saved file.
///
/// Returns the HTML and the URL relative sources resolve against.
async fn load_page(target: &str, base_url: Option<Url>) -> anyhow::Result<(String, Option<Url>)> {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let response = reqwest::get(target)
            .await
            .with_context(|| format!("fetching {target}"))?
            .error_for_status()?;
        let final_url = response.url().clone();
        let html = response.text().await?;
        return Ok((html, Some(base_url.unwrap_or(final_url))));
    }

    let path = PathBuf::from(target);
    if !path.exists() {
        anyhow::bail!("HTML file not found: {}", path.display());
    }
    let html = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok((html, base_url))
}

/// Follow front-panel broadcasts until the summary for this scan arrives.
async fn wait_for_summary(
    panel: &mut broadcast::Receiver<Message>,
    trigger: ScanTrigger,
    cancel: &CancellationToken,
    show_progress: bool,
) -> anyhow::Result<ScanSummary> {
    let bar = match trigger {
        ScanTrigger::Dispatched { images } if show_progress => {
            let bar = ProgressBar::new(images as u64);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {wide_msg}")?
                    .progress_chars("=> "),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        }
        _ => None,
    };

    let summary = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(bar) = &bar {
                    bar.abandon_with_message("interrupted");
                }
                anyhow::bail!("scan interrupted");
            }
            message = panel.recv() => message,
        };

        match message {
            Ok(Message::ScanProgress {
                completed, src, ..
            }) => {
                if let Some(bar) = &bar {
                    bar.set_position(completed as u64);
                    bar.set_message(src);
                }
            }
            Ok(Message::ScanComplete {
                total_images,
                ai_images,
            }) => {
                break ScanSummary {
                    total_images,
                    ai_images,
                };
            }
            Ok(other) => log::debug!("panel ignoring {} message", other.kind()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("front panel skipped {skipped} message(s)");
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("message bus closed before the scan finished");
            }
        }
    };

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(summary)
}
