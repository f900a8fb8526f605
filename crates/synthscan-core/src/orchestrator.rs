//! The orchestrator context.
//!
//! One dispatcher loop drains the runtime inbox for the lifetime of the
//! context. Each `scanImages` request becomes a detached task: its only
//! observable effects are the `scanResults` message routed back to the
//! originating page and the `scanComplete` broadcast to front panels, and the
//! two are delivered independently of each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scan::{ImagePipeline, run_scan};
use crate::{
    Bus, Config, CoreError, Envelope, Message, OverlapPolicy, PageId, ProgressEvent, ScanOutcome,
    ScanPool, ScanRequest, ScanSummary,
};

pub struct Orchestrator {
    config: Arc<Config>,
    bus: Bus,
    pool: Arc<ScanPool>,
    /// Number of running scans per originating page.
    in_flight: Arc<DashMap<PageId, usize>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build the orchestrator and its worker pool. Cancelling `cancel` stops
    /// the dispatcher and the pool; scans already queued are not resumed.
    pub fn new(config: Config, bus: Bus, cancel: CancellationToken) -> Result<Self, CoreError> {
        let pipeline = Arc::new(ImagePipeline::new(&config)?);
        log::info!(
            "orchestrator using backend {} with {} worker(s)",
            pipeline.classifier().endpoint(),
            config.max_concurrent_images.max(1)
        );
        let pool = ScanPool::new(pipeline, cancel.clone(), config.max_concurrent_images);

        Ok(Self {
            config: Arc::new(config),
            bus,
            pool: Arc::new(pool),
            in_flight: Arc::new(DashMap::new()),
            cancel,
        })
    }

    /// Run the dispatcher on its own task.
    pub fn spawn(self, inbox: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbox))
    }

    /// Dispatch inbox messages until the inbox closes or the context is cancelled.
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => break,
                },
            }
        }

        match Arc::try_unwrap(self.pool) {
            Ok(pool) => pool.shutdown().await,
            Err(shared) => shared.close(),
        }
        log::debug!("orchestrator stopped");
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { sender, message } = envelope;
        match message {
            Message::ScanImages { images } => self.start_scan(ScanRequest {
                page: sender,
                images,
            }),
            other => log::debug!("orchestrator ignoring {} message", other.kind()),
        }
    }

    fn start_scan(&self, request: ScanRequest) {
        let origin = describe(request.page);
        log::info!(
            "scanImages received from {}: {} image(s)",
            origin,
            request.images.len()
        );
        log::debug!("images: {:?}", request.images);

        if let Some(page) = request.page {
            if !self.try_begin(page) {
                log::warn!(
                    "{} already has a scan in flight; request for {} image(s) rejected",
                    page,
                    request.images.len()
                );
                return;
            }
        }

        let bus = self.bus.clone();
        let pool = self.pool.clone();
        let in_flight = self.in_flight.clone();
        let progress = progress_broadcaster(bus.clone());

        tokio::spawn(async move {
            let (results, summary) = run_scan(&pool, &request, progress).await;
            if let Some(page) = request.page {
                finish(&in_flight, page);
            }
            deliver(&bus, request.page, results, summary);
        });
    }

    fn try_begin(&self, page: PageId) -> bool {
        match self.config.overlap {
            OverlapPolicy::Allow => {
                *self.in_flight.entry(page).or_insert(0) += 1;
                true
            }
            OverlapPolicy::Reject => match self.in_flight.entry(page) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(1);
                    true
                }
            },
        }
    }
}

fn finish(in_flight: &DashMap<PageId, usize>, page: PageId) {
    if let Entry::Occupied(mut running) = in_flight.entry(page) {
        if *running.get() <= 1 {
            running.remove();
        } else {
            *running.get_mut() -= 1;
        }
    }
}

/// Send the batch to its page and the summary to front panels. Neither
/// delivery waits on or is affected by the other.
fn deliver(bus: &Bus, page: Option<PageId>, results: Vec<ScanOutcome>, summary: ScanSummary) {
    match page {
        Some(id) => {
            if let Err(e) = bus.send_to_page(id, Message::ScanResults { results }) {
                log::error!("failed to send scanResults: {}", e);
            }
        }
        None => log::warn!("scan has no originating page; cannot send scanResults"),
    }

    bus.broadcast(summary.into());
    log::info!(
        "scan complete summary sent: {} total, {} flagged",
        summary.total_images,
        summary.ai_images
    );
}

fn progress_broadcaster(bus: Bus) -> Arc<dyn Fn(ProgressEvent) + Send + Sync> {
    let completed = AtomicUsize::new(0);
    Arc::new(move |event: ProgressEvent| {
        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        bus.broadcast(Message::ScanProgress {
            completed: done,
            total: event.total,
            src: event.outcome.src,
        });
    })
}

fn describe(page: Option<PageId>) -> String {
    page.map(|p| p.to_string())
        .unwrap_or_else(|| "unknown sender".to_string())
}
