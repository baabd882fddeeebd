//! Page layout: per dimension group pixel size and horizontal offset
//!
//! Pages are grouped into [`PageDim`] runs of consecutive pages sharing the
//! same native size. Layout is a pure function of those native sizes, the
//! viewport and the fit mode, recomputed in place.

use super::decoder::PageInfo;
use super::types::{FitMode, Rotation, Viewport};

/// One run of consecutive pages with identical native dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageDim {
    /// First page of the run (0-indexed)
    pub page_no: usize,
    /// Native page size as reported by the decoder
    pub bounds: PageInfo,
    /// Rotation the layout was computed under
    pub rotation: Rotation,
    /// Laid out width in pixels
    pub width: u32,
    /// Laid out height in pixels
    pub height: u32,
    /// Horizontal offset in pixels from the viewport's left edge
    pub left: i32,
}

impl PageDim {
    #[must_use]
    pub fn new(page_no: usize, bounds: PageInfo) -> Self {
        Self {
            page_no,
            bounds,
            rotation: Rotation::default(),
            width: 0,
            height: 0,
            left: 0,
        }
    }

    /// Native size as seen after rotation.
    #[must_use]
    pub fn oriented(&self, rotation: Rotation) -> (f64, f64) {
        let (w, h) = (f64::from(self.bounds.width), f64::from(self.bounds.height));
        if rotation.swaps_axes() {
            (h, w)
        } else {
            (w, h)
        }
    }
}

/// Accumulates page sizes into dimension groups.
#[derive(Debug, Default)]
pub struct PageDimBuilder {
    dims: Vec<PageDim>,
}

impl PageDimBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records page `page_no`; a new group starts when its size differs from the previous page.
    pub fn push(&mut self, page_no: usize, info: PageInfo) {
        match self.dims.last() {
            Some(last) if last.bounds == info => {}
            _ => self.dims.push(PageDim::new(page_no, info)),
        }
    }

    #[must_use]
    pub fn finish(self) -> Vec<PageDim> {
        self.dims
    }
}

/// Groups an ordered sequence of page sizes.
#[must_use]
pub fn group_page_dims(infos: impl IntoIterator<Item = PageInfo>) -> Vec<PageDim> {
    let mut builder = PageDimBuilder::new();
    for (page_no, info) in infos.into_iter().enumerate() {
        builder.push(page_no, info);
    }
    builder.finish()
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

/// Recomputes pixel sizes and offsets of every group in place.
///
/// Returns true when any pixel size changed. A no-op for an empty table.
pub fn layout(dims: &mut [PageDim], viewport: Viewport, fit: FitMode, rotation: Rotation) -> bool {
    if dims.is_empty() {
        return false;
    }

    let view_w = f64::from(viewport.width);
    let view_h = f64::from(viewport.height);
    let max_width = dims
        .iter()
        .map(|d| d.oriented(rotation).0)
        .fold(0.0_f64, f64::max);

    let mut changed = false;
    for dim in dims.iter_mut() {
        let (page_w, page_h) = dim.oriented(rotation);

        let (zoom, left) = match fit {
            FitMode::Width => (ratio(view_w, page_w), 0.0),
            FitMode::Proportional => {
                let zoom = ratio(view_w, max_width);
                (zoom, (max_width - page_w) * zoom / 2.0)
            }
            FitMode::Page => {
                // The widest page spans the whole viewport, so the baseline is the viewport width.
                let zoom = ratio(view_w, page_w).min(ratio(view_h, page_h));
                (zoom, (view_w - page_w * zoom) / 2.0)
            }
        };

        let width = (page_w * zoom).round() as u32;
        let height = (page_h * zoom).round() as u32;
        if dim.width != width || dim.height != height {
            changed = true;
        }
        dim.width = width;
        dim.height = height;
        dim.left = left.round() as i32;
        dim.rotation = rotation;
    }
    changed
}

/// Index of the group that contains `page`.
#[must_use]
pub fn dim_index_for_page(dims: &[PageDim], page: usize) -> Option<usize> {
    match dims.partition_point(|d| d.page_no <= page) {
        0 => None,
        n => Some(n - 1),
    }
}
