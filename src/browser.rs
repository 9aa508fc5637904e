//! External collaborator (core spec §1): a headless-browser-backed search
//! of the third-party ads-library surface. The core only depends on the
//! [`HeadlessBrowser`] trait; [`StubBrowser`] stands in for the real
//! browser-automation backend, which is out of scope here.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::error::AppResult;

/// One search result from the ads-library surface.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub account_name: String,
    pub account_url: String,
    pub start_date: i64,
    pub text: String,
}

/// Raised when the browser surface returns something the parser cannot
/// make sense of.
#[derive(Debug, thiserror::Error)]
#[error("could not extract search results: {0}")]
pub struct ResultParseError(pub String);

/// Blocking, possibly-slow, possibly-failing call into a third-party
/// ads-library surface (core spec §1). Implementations are expected to run
/// on a dedicated single-thread executor, since the underlying browser
/// session is inherently serial (core spec §5).
#[async_trait]
pub trait HeadlessBrowser: Send + Sync {
    async fn query(&self, text: &str) -> AppResult<Vec<SearchResult>>;

    /// Fetches rendered screenshots for the given external ids. Ids with no
    /// screenshot available are simply absent from the result.
    async fn screenshot_ids(&self, ids: &[String]) -> AppResult<Vec<(String, Vec<u8>)>>;
}

/// Re-encodes a screenshot to JPEG quality 85 RGB (core spec §4.2 step 7).
/// Missing or unparseable input yields empty bytes rather than an error.
pub fn reencode_screenshot(bytes: &[u8]) -> Vec<u8> {
    if bytes.is_empty() {
        return Vec::new();
    }

    let Ok(img) = image::load_from_memory(bytes) else {
        return Vec::new();
    };
    let rgb = img.to_rgb8();

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, 85);
    match encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8) {
        Ok(()) => out,
        Err(_) => Vec::new(),
    }
}

/// Demo implementation returning no results. A real deployment swaps this
/// for a browser-automation-backed implementation; that integration is out
/// of core scope (core spec §1).
pub struct StubBrowser;

#[async_trait]
impl HeadlessBrowser for StubBrowser {
    async fn query(&self, _text: &str) -> AppResult<Vec<SearchResult>> {
        Ok(Vec::new())
    }

    async fn screenshot_ids(&self, _ids: &[String]) -> AppResult<Vec<(String, Vec<u8>)>> {
        Ok(Vec::new())
    }
}
