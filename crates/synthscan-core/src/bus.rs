//! Cross-context message bus.
//!
//! Each context (page, orchestrator, front panel) runs as its own task and
//! shares nothing with the others; the bus is the only path between them.
//! Runtime-wide sends are routed by message kind: scan requests go to the
//! orchestrator inbox, summaries and progress fan out to every subscribed
//! front panel. Page contexts are addressed individually by [`PageId`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::Message;

/// Capacity of the front-panel broadcast; slow panels lose the oldest messages.
const PANEL_CAPACITY: usize = 256;

/// Identity of a registered page context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// A runtime-wide message together with the page that sent it, if any.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Option<PageId>,
    pub message: Message,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{0} is not registered")]
    UnknownPage(PageId),
    #[error("{0} is no longer reachable")]
    PageGone(PageId),
}

struct BusInner {
    runtime_tx: mpsc::UnboundedSender<Envelope>,
    pages: DashMap<PageId, mpsc::UnboundedSender<Message>>,
    panel_tx: broadcast::Sender<Message>,
    next_page: AtomicU64,
}

/// Cloneable handle onto the bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus and the orchestrator's inbox.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
        let (panel_tx, _) = broadcast::channel(PANEL_CAPACITY);
        let bus = Self {
            inner: Arc::new(BusInner {
                runtime_tx,
                pages: DashMap::new(),
                panel_tx,
                next_page: AtomicU64::new(1),
            }),
        };
        (bus, runtime_rx)
    }

    /// Register a new page context and return its id and inbox.
    pub fn register_page(&self) -> (PageId, mpsc::UnboundedReceiver<Message>) {
        let id = PageId(self.inner.next_page.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pages.insert(id, tx);
        log::debug!("{} registered", id);
        (id, rx)
    }

    pub fn unregister_page(&self, id: PageId) {
        if self.inner.pages.remove(&id).is_some() {
            log::debug!("{} unregistered", id);
        }
    }

    pub fn is_registered(&self, id: PageId) -> bool {
        self.inner.pages.contains_key(&id)
    }

    /// Send a message to the whole runtime, routed by kind.
    pub fn send_runtime(&self, envelope: Envelope) {
        match envelope.message {
            Message::ScanImages { .. } => {
                if self.inner.runtime_tx.send(envelope).is_err() {
                    log::warn!("orchestrator is not running; scanImages dropped");
                }
            }
            Message::ScanComplete { .. } | Message::ScanProgress { .. } => {
                self.broadcast(envelope.message);
            }
            Message::ScanResults { .. } => {
                log::warn!("scanResults is addressed to a page, not the runtime; dropped");
            }
        }
    }

    /// Deliver a message to one page context.
    pub fn send_to_page(&self, id: PageId, message: Message) -> Result<(), DeliveryError> {
        let sent = match self.inner.pages.get(&id) {
            Some(tx) => tx.send(message).is_ok(),
            None => return Err(DeliveryError::UnknownPage(id)),
        };
        if sent {
            Ok(())
        } else {
            self.inner.pages.remove(&id);
            Err(DeliveryError::PageGone(id))
        }
    }

    /// Fan a message out to every front panel. Returns how many received it.
    pub fn broadcast(&self, message: Message) -> usize {
        let kind = message.kind();
        match self.inner.panel_tx.send(message) {
            Ok(n) => n,
            Err(_) => {
                log::debug!("no front panel listening for {}", kind);
                0
            }
        }
    }

    pub fn subscribe_panel(&self) -> broadcast::Receiver<Message> {
        self.inner.panel_tx.subscribe()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("pages", &self.inner.pages.len())
            .field("panels", &self.inner.panel_tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_images_reaches_orchestrator_inbox() {
        let (bus, mut inbox) = Bus::new();
        let (page, _rx) = bus.register_page();
        bus.send_runtime(Envelope {
            sender: Some(page),
            message: Message::ScanImages {
                images: vec!["https://x/a.jpg".into()],
            },
        });
        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.sender, Some(page));
        assert_eq!(envelope.message.kind(), "scanImages");
    }

    #[tokio::test]
    async fn summaries_fan_out_to_every_panel() {
        let (bus, mut inbox) = Bus::new();
        let mut first = bus.subscribe_panel();
        let mut second = bus.subscribe_panel();
        bus.send_runtime(Envelope {
            sender: None,
            message: Message::ScanComplete {
                total_images: 0,
                ai_images: 0,
            },
        });
        assert_eq!(first.recv().await.unwrap().kind(), "scanComplete");
        assert_eq!(second.recv().await.unwrap().kind(), "scanComplete");
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn broadcast_without_panels_is_not_an_error() {
        let (bus, _inbox) = Bus::new();
        let delivered = bus.broadcast(Message::ScanComplete {
            total_images: 1,
            ai_images: 0,
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn page_delivery_and_departure() {
        let (bus, _inbox) = Bus::new();
        let (page, mut rx) = bus.register_page();
        bus.send_to_page(page, Message::ScanResults { results: vec![] })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "scanResults");

        drop(rx);
        assert_eq!(
            bus.send_to_page(page, Message::ScanResults { results: vec![] }),
            Err(DeliveryError::PageGone(page))
        );
        assert!(!bus.is_registered(page));
        assert_eq!(
            bus.send_to_page(page, Message::ScanResults { results: vec![] }),
            Err(DeliveryError::UnknownPage(page))
        );
    }

    #[test]
    fn page_ids_are_unique() {
        let (bus, _inbox) = Bus::new();
        let (a, _ra) = bus.register_page();
        let (b, _rb) = bus.register_page();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "page-1");
    }
}
