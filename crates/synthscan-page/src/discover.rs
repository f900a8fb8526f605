use std::collections::HashSet;

use synthscan_core::{ImageRef, is_data_uri};

use crate::document::{Document, ImageElement};

/// Collect the distinct, fetchable image sources of `document` in first-seen order.
///
/// Elements with no source or an inline `data:` source are skipped. An empty
/// result is a valid outcome.
pub fn discover_images(document: &Document) -> Vec<ImageRef> {
    let mut seen = HashSet::new();
    let images: Vec<ImageRef> = document
        .images()
        .iter()
        .filter_map(ImageElement::resolved_source)
        .filter(|src| !is_data_uri(src))
        .filter(|src| seen.insert(*src))
        .map(str::to_string)
        .collect();

    log::info!("collected {} image(s)", images.len());
    log::debug!("collected images: {:?}", images);
    images
}
