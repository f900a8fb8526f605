//! In-memory model of the `<img>` elements of a page.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Serialize;
use url::Url;

/// Lazy-load placeholder attribute, consulted after the loaded and declared sources.
pub const DATA_SRC_ATTR: &str = "data-src";

static IMG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img").expect("static selector is valid"));

/// Visual marker applied to an annotated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Marker {
    /// The image could not be scanned.
    Error,
    /// Flagged as AI-generated.
    Synthetic,
    /// Classified and not flagged.
    Authentic,
}

impl Marker {
    pub fn outline(self) -> &'static str {
        match self {
            Marker::Error => "3px dashed orange",
            Marker::Synthetic => "4px solid red",
            Marker::Authentic => "3px solid limegreen",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Marker::Error => "error",
            Marker::Synthetic => "AI",
            Marker::Authentic => "real",
        }
    }
}

/// One `<img>` element.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageElement {
    /// Source the renderer actually loaded, when known.
    pub current_src: Option<String>,
    /// Declared `src`, resolved against the document base.
    pub src: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub outline: Option<String>,
    pub title: Option<String>,
    pub marker: Option<Marker>,
}

impl ImageElement {
    pub fn with_src(src: impl Into<String>) -> Self {
        Self {
            src: Some(src.into()),
            ..Self::default()
        }
    }

    pub fn with_current_src(mut self, current_src: impl Into<String>) -> Self {
        self.current_src = Some(current_src.into());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Loaded source, else declared source, else the lazy-load placeholder.
    /// Empty values are skipped.
    pub fn resolved_source(&self) -> Option<&str> {
        [
            self.current_src.as_deref(),
            self.src.as_deref(),
            self.attribute(DATA_SRC_ATTR),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.is_empty())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_string(), value.into());
    }
}

/// The image elements of one page, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Document {
    images: Vec<ImageElement>,
}

impl Document {
    /// Collect the `<img>` elements of `html`. Declared sources are resolved
    /// against `base_url` when one is given.
    pub fn parse(html: &str, base_url: Option<&Url>) -> Self {
        let html = Html::parse_document(html);
        let images = html
            .select(&IMG_SELECTOR)
            .map(|node| {
                let el = node.value();
                let attributes = el
                    .attrs()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                ImageElement {
                    src: el.attr("src").map(|raw| resolve(raw, base_url)),
                    attributes,
                    ..ImageElement::default()
                }
            })
            .collect();
        Self { images }
    }

    pub fn from_elements(images: Vec<ImageElement>) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &[ImageElement] {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut [ImageElement] {
        &mut self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Elements that carry a marker.
    pub fn annotated(&self) -> impl Iterator<Item = &ImageElement> {
        self.images.iter().filter(|img| img.marker.is_some())
    }
}

fn resolve(raw: &str, base_url: Option<&Url>) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    match base_url {
        Some(base) => base
            .join(raw)
            .map(String::from)
            .unwrap_or_else(|_| raw.to_string()),
        None => raw.to_string(),
    }
}
