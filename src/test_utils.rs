//! Scripted collaborators for unit and integration tests

use std::path::{Path, PathBuf};
use std::task::Poll;
use std::thread;
use std::time::Duration;

use crate::engine::{ColorSpace, DecodeError, Decoder, OutlineNode, PageInfo, RegionRequest};

/// Colour of page pixel (`x`, `y`) as rendered by [`MockDecoder`], in page space.
#[must_use]
pub fn mock_rgb(page_no: usize, x: usize, y: usize) -> [u8; 3] {
    [(x % 251) as u8, (y % 241) as u8, (page_no * 40 % 256) as u8]
}

/// [`mock_rgb`] converted to `format`.
#[must_use]
pub fn mock_pixel(page_no: usize, x: usize, y: usize, format: ColorSpace) -> Vec<u8> {
    let [r, g, b] = mock_rgb(page_no, x, y);
    match format {
        ColorSpace::Rgb => vec![r, g, b],
        ColorSpace::Bgr => vec![b, g, r],
        ColorSpace::Grey => vec![r ^ g],
    }
}

/// Page handle of a [`MockDecoder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockPage {
    pub index: usize,
    ready_at: usize,
}

/// In-memory decoder with fixed page sizes.
///
/// Page info and page decodes can be made to lag behind by a number of pumps,
/// which exercises the waiting paths of the session.
#[derive(Debug, Default)]
pub struct MockDecoder {
    pages: Vec<PageInfo>,
    open: bool,
    pending_polls: usize,
    polls_left: usize,
    decode_steps: usize,
    pump_delay: Duration,
    outline: Option<Vec<OutlineNode>>,
    fail_open: bool,
    pumps: usize,
    outline_calls: usize,
    opened: Vec<PathBuf>,
    renders: Vec<(usize, RegionRequest)>,
}

impl MockDecoder {
    /// Document with one page per `(width, height)` pair.
    #[must_use]
    pub fn with_pages(sizes: &[(u32, u32)]) -> Self {
        Self {
            pages: sizes.iter().map(|&(w, h)| PageInfo::new(w, h)).collect(),
            ..Self::default()
        }
    }

    /// Page info stays pending for `n` pumps after each open.
    #[must_use]
    pub fn pending_polls(mut self, n: usize) -> Self {
        self.pending_polls = n;
        self
    }

    /// Loaded pages need `n` pumps before they finish decoding.
    #[must_use]
    pub fn decode_steps(mut self, n: usize) -> Self {
        self.decode_steps = n;
        self
    }

    /// Every pump sleeps for `delay`, stretching decodes out in wall-clock time.
    #[must_use]
    pub fn pump_delay(mut self, delay: Duration) -> Self {
        self.pump_delay = delay;
        self
    }

    #[must_use]
    pub fn outline(mut self, outline: Vec<OutlineNode>) -> Self {
        self.outline = Some(outline);
        self
    }

    /// Every open fails.
    #[must_use]
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    #[must_use]
    pub fn pumps(&self) -> usize {
        self.pumps
    }

    /// How often the outline was requested.
    #[must_use]
    pub fn outline_calls(&self) -> usize {
        self.outline_calls
    }

    /// Paths passed to successful opens, in order.
    #[must_use]
    pub fn opened(&self) -> &[PathBuf] {
        &self.opened
    }

    /// Every region rendered so far, with its page index.
    #[must_use]
    pub fn renders(&self) -> &[(usize, RegionRequest)] {
        &self.renders
    }
}

impl Decoder for MockDecoder {
    type Page = MockPage;

    fn open(&mut self, path: &Path) -> Result<(), DecodeError> {
        if self.fail_open {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                detail: "scripted failure".to_string(),
            });
        }
        self.open = true;
        self.polls_left = self.pending_polls;
        self.opened.push(path.to_path_buf());
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn page_count(&self) -> usize {
        if self.open { self.pages.len() } else { 0 }
    }

    fn page_info(&mut self, index: usize) -> Result<Poll<PageInfo>, DecodeError> {
        let info = *self.pages.get(index).ok_or(DecodeError::PageOutOfRange {
            page: index,
            count: self.pages.len(),
        })?;
        if self.polls_left > 0 {
            return Ok(Poll::Pending);
        }
        Ok(Poll::Ready(info))
    }

    fn load_page(&mut self, index: usize) -> Result<MockPage, DecodeError> {
        if !self.open {
            return Err(DecodeError::NoDocument);
        }
        if index >= self.pages.len() {
            return Err(DecodeError::PageOutOfRange {
                page: index,
                count: self.pages.len(),
            });
        }
        Ok(MockPage {
            index,
            ready_at: self.pumps + self.decode_steps,
        })
    }

    fn is_decode_done(&mut self, page: &MockPage) -> bool {
        self.pumps >= page.ready_at
    }

    fn pump(&mut self, _wait: bool) -> Result<(), DecodeError> {
        if !self.pump_delay.is_zero() {
            thread::sleep(self.pump_delay);
        }
        self.pumps += 1;
        self.polls_left = self.polls_left.saturating_sub(1);
        Ok(())
    }

    fn render_region(
        &mut self,
        page: &MockPage,
        request: &RegionRequest,
        out: &mut [u8],
    ) -> Result<(), DecodeError> {
        self.renders.push((page.index, *request));
        let channels = request.format.channels();
        let rect = request.rect;
        for y in 0..rect.height {
            for x in 0..rect.width {
                let at = y * request.stride + x * channels;
                let px = mock_pixel(page.index, rect.x + x, rect.y + y, request.format);
                out.get_mut(at..at + channels)
                    .ok_or_else(|| DecodeError::failed("output buffer too small"))?
                    .copy_from_slice(&px);
            }
        }
        Ok(())
    }

    fn outline(&mut self) -> Result<Poll<Option<Vec<OutlineNode>>>, DecodeError> {
        self.outline_calls += 1;
        Ok(Poll::Ready(self.outline.clone()))
    }
}
