pub mod agent;
pub mod annotate;
pub mod discover;
pub mod document;

pub use agent::{NO_IMAGES_NOTICE, PageAgent, PageClosed, PageHandle, ScanTrigger};
pub use annotate::{ApplyReport, MatchPolicy, apply_results, matching_elements};
pub use discover::discover_images;
pub use document::{Document, ImageElement, Marker};
