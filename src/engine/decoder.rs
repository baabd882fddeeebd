//! Document decoder collaborator interface

use std::path::{Path, PathBuf};
use std::task::Poll;

use super::types::{ColorSpace, PixelRect, Rotation};

/// Native page size reported by the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub width: u32,
    pub height: u32,
}

impl PageInfo {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Where an outline entry points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutlineTarget {
    /// Internal page (0-indexed)
    Page(usize),
    /// Internal link the decoder could not resolve to a page
    Unresolved,
    /// Link outside the document
    External(String),
}

/// A node of the document outline tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineNode {
    pub title: String,
    pub target: OutlineTarget,
    pub children: Vec<OutlineNode>,
}

impl OutlineNode {
    #[must_use]
    pub fn page(title: impl Into<String>, page: usize) -> Self {
        Self {
            title: title.into(),
            target: OutlineTarget::Page(page),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<OutlineNode>) -> Self {
        self.children = children;
        self
    }
}

/// Region rasterization request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionRequest {
    /// Full page size in pixels at the current layout, after rotation.
    pub page_width: u32,
    pub page_height: u32,
    pub rotation: Rotation,
    /// Sub-rectangle of the scaled page to rasterize.
    pub rect: PixelRect,
    /// Output pixel format.
    pub format: ColorSpace,
    /// Bytes between the starts of consecutive output rows.
    pub stride: usize,
}

/// Errors reported by a decoder.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot open {}: {detail}", path.display())]
    Open { path: PathBuf, detail: String },

    #[error("page {page} out of range (document has {count})")]
    PageOutOfRange { page: usize, count: usize },

    #[error("no document is open")]
    NoDocument,

    #[error("decoder failure: {0}")]
    Failed(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A document decoder.
///
/// Decoding may be asynchronous: `page_info` and `outline` return
/// [`Poll::Pending`] while the decoder still waits for data, and a loaded page
/// is usable only once [`Decoder::is_decode_done`] reports so. Callers drive
/// progress with [`Decoder::pump`]. Any `Err` is a hard decoder error.
pub trait Decoder: Send {
    /// Opaque per-page handle.
    type Page: Send;

    /// Opens a document, releasing the previous one.
    fn open(&mut self, path: &Path) -> Result<(), DecodeError>;

    /// Releases the open document, if any.
    fn close(&mut self);

    /// Number of pages in the open document (0 when none is open).
    fn page_count(&self) -> usize;

    /// Native dimensions of page `index`.
    fn page_info(&mut self, index: usize) -> Result<Poll<PageInfo>, DecodeError>;

    /// Starts decoding page `index`.
    fn load_page(&mut self, index: usize) -> Result<Self::Page, DecodeError>;

    /// Whether `page` has finished decoding.
    fn is_decode_done(&mut self, page: &Self::Page) -> bool;

    /// Processes the decoder's message queue, blocking for at least one message when `wait` is set
    /// and work is outstanding.
    fn pump(&mut self, wait: bool) -> Result<(), DecodeError>;

    /// Rasterizes `request.rect` of a decoded page into `out`, rows `request.stride` bytes apart.
    fn render_region(
        &mut self,
        page: &Self::Page,
        request: &RegionRequest,
        out: &mut [u8],
    ) -> Result<(), DecodeError>;

    /// The document outline; `None` when the document has none.
    fn outline(&mut self) -> Result<Poll<Option<Vec<OutlineNode>>>, DecodeError>;
}

/// Blocks on `poll` until it yields, pumping the decoder in between.
pub(crate) fn wait_for<D, T>(
    decoder: &mut D,
    mut poll: impl FnMut(&mut D) -> Result<Poll<T>, DecodeError>,
) -> Result<T, DecodeError>
where
    D: Decoder + ?Sized,
{
    loop {
        if let Poll::Ready(value) = poll(decoder)? {
            return Ok(value);
        }
        decoder.pump(true)?;
    }
}
