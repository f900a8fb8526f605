//! Messages exchanged between the page, orchestrator and front-panel contexts.

use serde::{Deserialize, Serialize};

use crate::{ImageRef, ScanOutcome, ScanSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Page → orchestrator: images discovered on the page.
    ScanImages { images: Vec<ImageRef> },
    /// Orchestrator → originating page: one outcome per requested image.
    ScanResults { results: Vec<ScanOutcome> },
    /// Orchestrator (or page, for an empty page) → front panels.
    #[serde(rename_all = "camelCase")]
    ScanComplete {
        total_images: usize,
        ai_images: usize,
    },
    /// Orchestrator → front panels, once per finished image.
    ScanProgress {
        completed: usize,
        total: usize,
        src: ImageRef,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ScanImages { .. } => "scanImages",
            Message::ScanResults { .. } => "scanResults",
            Message::ScanComplete { .. } => "scanComplete",
            Message::ScanProgress { .. } => "scanProgress",
        }
    }
}

impl From<ScanSummary> for Message {
    fn from(summary: ScanSummary) -> Self {
        Message::ScanComplete {
            total_images: summary.total_images,
            ai_images: summary.ai_images,
        }
    }
}
