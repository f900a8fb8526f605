//! The page context.
//!
//! The agent task owns the document. Trigger commands from the handle and
//! inbound bus messages go through the same loop, so discovery and
//! annotation never interleave.

use std::sync::Arc;

use synthscan_core::{Bus, Envelope, Message, PageId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::annotate::{MatchPolicy, apply_results};
use crate::discover::discover_images;
use crate::document::Document;

/// Shown to the user when a page has nothing to scan.
pub const NO_IMAGES_NOTICE: &str = "No images found on this page.";

/// Result of triggering a scan from the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    /// `scanImages` was sent with this many images.
    Dispatched { images: usize },
    /// Nothing to scan; a zero summary was sent instead.
    NoImages,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("page context is closed")]
pub struct PageClosed;

enum Command {
    RunScan(oneshot::Sender<ScanTrigger>),
    Snapshot(oneshot::Sender<Document>),
}

/// Handle for driving a page context from outside (the front panel).
///
/// Dropping the handle closes the page: it leaves the bus and later results
/// addressed to it are undeliverable.
pub struct PageHandle {
    id: PageId,
    commands: mpsc::UnboundedSender<Command>,
    applied: watch::Receiver<u64>,
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The page entry point: discover images and request a scan.
    pub async fn run_scan(&self) -> Result<ScanTrigger, PageClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RunScan(tx))
            .map_err(|_| PageClosed)?;
        rx.await.map_err(|_| PageClosed)
    }

    /// A copy of the document as it is now.
    pub async fn snapshot(&self) -> Result<Document, PageClosed> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| PageClosed)?;
        rx.await.map_err(|_| PageClosed)
    }

    /// Number of result batches applied so far, updated after each batch.
    pub fn applied(&self) -> watch::Receiver<u64> {
        self.applied.clone()
    }
}

pub struct PageAgent {
    id: PageId,
    document: Document,
    bus: Bus,
    policy: MatchPolicy,
    alert: Arc<dyn Fn(&str) + Send + Sync>,
    applied_tx: watch::Sender<u64>,
}

impl PageAgent {
    /// Register a page context on `bus` and start its task.
    ///
    /// `alert` is how the page tells the user something inline.
    pub fn spawn(
        document: Document,
        bus: Bus,
        policy: MatchPolicy,
        alert: impl Fn(&str) + Send + Sync + 'static,
    ) -> PageHandle {
        let (id, inbox) = bus.register_page();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied) = watch::channel(0);

        let agent = PageAgent {
            id,
            document,
            bus,
            policy,
            alert: Arc::new(alert),
            applied_tx,
        };
        tokio::spawn(agent.run(inbox, command_rx));

        PageHandle {
            id,
            commands,
            applied,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Message>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        self.bus.unregister_page(self.id);
        log::debug!("{} closed", self.id);
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::ScanResults { results } => {
                log::info!("{} received scanResults ({} outcome(s))", self.id, results.len());
                let report = apply_results(&mut self.document, &results, self.policy);
                log::debug!(
                    "{} annotated {} element(s), {} unmatched",
                    self.id,
                    report.annotated,
                    report.unmatched.len()
                );
                self.applied_tx.send_modify(|n| *n += 1);
            }
            other => log::debug!("{} ignoring {} message", self.id, other.kind()),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::RunScan(reply) => {
                let trigger = self.run_scan();
                let _ = reply.send(trigger);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.document.clone());
            }
        }
    }

    fn run_scan(&self) -> ScanTrigger {
        log::debug!("{} runScan called", self.id);
        let images = discover_images(&self.document);

        if images.is_empty() {
            self.bus.send_runtime(Envelope {
                sender: Some(self.id),
                message: Message::ScanComplete {
                    total_images: 0,
                    ai_images: 0,
                },
            });
            (self.alert)(NO_IMAGES_NOTICE);
            return ScanTrigger::NoImages;
        }

        let count = images.len();
        self.bus.send_runtime(Envelope {
            sender: Some(self.id),
            message: Message::ScanImages { images },
        });
        ScanTrigger::Dispatched { images: count }
    }
}
