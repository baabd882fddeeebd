//! Rendered page regions and their slicing

use std::time::Instant;

use log::{debug, warn};

use super::decoder::{Decoder, DecodeError, RegionRequest};
use super::types::{ColorSpace, PixelRect, Rotation};
use crate::gpu::StagingBuffer;

/// A horizontal band of a tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slice {
    height: usize,
    slot: Option<usize>,
}

impl Slice {
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Texture slot this slice was last uploaded to. The slot may have been
    /// reclaimed since; the slot cache checks before trusting it.
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }
}

/// Where a tile's pixels live.
#[derive(Debug)]
pub enum TilePixels {
    Heap(Vec<u8>),
    Staged(StagingBuffer),
}

#[derive(Debug)]
pub struct Tile {
    page_no: usize,
    width: usize,
    height: usize,
    colorspace: ColorSpace,
    slice_height: usize,
    slices: Vec<Slice>,
    pixels: TilePixels,
}

/// Heights of the slices covering `height` rows: all `slice_height` except a shorter last one.
#[must_use]
pub fn slice_heights(height: usize, slice_height: usize) -> Vec<usize> {
    let step = slice_height.max(1);
    (0..height)
        .step_by(step)
        .map(|y| step.min(height - y))
        .collect()
}

impl Tile {
    fn with_pixels(
        page_no: usize,
        width: usize,
        height: usize,
        colorspace: ColorSpace,
        slice_height: usize,
        pixels: TilePixels,
    ) -> Self {
        let slice_height = slice_height.max(1);
        let slices = slice_heights(height, slice_height)
            .into_iter()
            .map(|height| Slice { height, slot: None })
            .collect();
        Self {
            page_no,
            width,
            height,
            colorspace,
            slice_height,
            slices,
            pixels,
        }
    }

    /// Builds a heap tile from ready pixels (rows `width * channels` bytes apart).
    #[must_use]
    pub fn from_pixels(
        page_no: usize,
        width: usize,
        height: usize,
        colorspace: ColorSpace,
        slice_height: usize,
        pixels: Vec<u8>,
    ) -> Self {
        Self::with_pixels(
            page_no,
            width,
            height,
            colorspace,
            slice_height,
            TilePixels::Heap(pixels),
        )
    }

    #[must_use]
    pub fn page_no(&self) -> usize {
        self.page_no
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn colorspace(&self) -> ColorSpace {
        self.colorspace
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.colorspace.channels()
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.width * self.channels()
    }

    /// Pixel bytes the tile holds, as reported to the controller.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.stride() * self.height
    }

    #[must_use]
    pub fn slice_height(&self) -> usize {
        self.slice_height
    }

    #[must_use]
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Byte offset of slice `index` within the pixel buffer.
    #[must_use]
    pub fn slice_offset(&self, index: usize) -> usize {
        index * self.slice_height * self.stride()
    }

    pub(crate) fn set_slice_slot(&mut self, index: usize, slot: Option<usize>) {
        if let Some(slice) = self.slices.get_mut(index) {
            slice.slot = slot;
        }
    }

    #[must_use]
    pub fn pixels(&self) -> &TilePixels {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut TilePixels {
        &mut self.pixels
    }

    #[must_use]
    pub fn is_staged(&self) -> bool {
        matches!(self.pixels, TilePixels::Staged(_))
    }

    pub fn staging_mut(&mut self) -> Option<&mut StagingBuffer> {
        match &mut self.pixels {
            TilePixels::Staged(buffer) => Some(buffer),
            TilePixels::Heap(_) => None,
        }
    }

    /// Gives up the staging buffer, if any. The tile keeps no pixels afterwards.
    pub fn take_staging(&mut self) -> Option<StagingBuffer> {
        match std::mem::replace(&mut self.pixels, TilePixels::Heap(Vec::new())) {
            TilePixels::Staged(buffer) => Some(buffer),
            heap => {
                self.pixels = heap;
                None
            }
        }
    }
}

/// Region of a laid out page to rasterize.
#[derive(Clone, Copy, Debug)]
pub struct TileRequest {
    pub page_no: usize,
    /// Page size at the current layout
    pub page_width: u32,
    pub page_height: u32,
    pub rotation: Rotation,
    pub rect: PixelRect,
    pub colorspace: ColorSpace,
    pub slice_height: usize,
}

/// Renders a tile, blocking until the page has finished decoding.
///
/// Pixels go straight into `staging` when it is mapped and large enough.
/// Otherwise they land in heap memory and the unusable buffer is handed back
/// so the caller can get it released.
pub fn render_tile<D: Decoder + ?Sized>(
    decoder: &mut D,
    page: &D::Page,
    request: &TileRequest,
    staging: Option<StagingBuffer>,
) -> Result<(Tile, Option<StagingBuffer>), DecodeError> {
    let PixelRect { width, height, .. } = request.rect;
    let stride = width * request.colorspace.channels();
    let len = stride * height;

    let wait_started = Instant::now();
    while !decoder.is_decode_done(page) {
        decoder.pump(true)?;
    }
    debug!(
        "wait page {} [{},{},{},{}] {}x{} {:.6}",
        request.page_no,
        request.rect.x,
        request.rect.y,
        width,
        height,
        request.page_width,
        request.page_height,
        wait_started.elapsed().as_secs_f64()
    );

    let region = RegionRequest {
        page_width: request.page_width,
        page_height: request.page_height,
        rotation: request.rotation,
        rect: request.rect,
        format: request.colorspace,
        stride,
    };

    let (pixels, rejected) = match staging {
        Some(mut buffer) => {
            let fits = buffer.mapped_mut().is_some_and(|m| m.len() >= len);
            if fits {
                (TilePixels::Staged(buffer), None)
            } else {
                warn!(
                    "staging buffer {:?} unusable for {len} bytes, rendering to heap",
                    buffer.id()
                );
                (TilePixels::Heap(vec![0xff; len]), Some(buffer))
            }
        }
        None => (TilePixels::Heap(vec![0xff; len]), None),
    };

    let mut tile = Tile::with_pixels(
        request.page_no,
        width,
        height,
        request.colorspace,
        request.slice_height,
        pixels,
    );

    let render_started = Instant::now();
    match &mut tile.pixels {
        TilePixels::Heap(bytes) => decoder.render_region(page, &region, bytes)?,
        TilePixels::Staged(buffer) => {
            if let Some(mapped) = buffer.mapped_mut() {
                let out = &mut mapped[..len];
                out.fill(0xff);
                decoder.render_region(page, &region, out)?;
            }
        }
    }
    debug!(
        "page {} [{},{},{},{}] rendered in {:.6}",
        request.page_no,
        request.rect.x,
        request.rect.y,
        width,
        height,
        render_started.elapsed().as_secs_f64()
    );

    Ok((tile, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_cover_height_without_gaps() {
        for (h, s) in [(0, 4), (1, 4), (4, 4), (5, 4), (1000, 256), (7, 1), (3, 10)] {
            let heights = slice_heights(h, s);
            assert_eq!(heights.len(), h.div_ceil(s), "h={h} s={s}");
            assert_eq!(heights.iter().sum::<usize>(), h);
            if let Some((last, rest)) = heights.split_last() {
                assert!(rest.iter().all(|&x| x == s));
                assert!(*last >= 1 && *last <= s);
            }
        }
    }

    #[test]
    fn zero_slice_height_is_treated_as_one() {
        assert_eq!(slice_heights(3, 0), vec![1, 1, 1]);
    }

    #[test]
    fn tile_geometry_helpers() {
        let tile = Tile::from_pixels(2, 10, 5, ColorSpace::Rgb, 2, vec![0; 150]);
        assert_eq!(tile.page_no(), 2);
        assert_eq!(tile.stride(), 30);
        assert_eq!(tile.byte_len(), 150);
        assert_eq!(tile.slice_count(), 3);
        assert_eq!(tile.slice_offset(1), 60);
        assert_eq!(tile.slices()[2].height(), 1);
        assert!(tile.slices().iter().all(|s| s.slot().is_none()));
    }

    #[test]
    fn heap_tile_has_no_staging() {
        let mut tile = Tile::from_pixels(0, 1, 1, ColorSpace::Grey, 1, vec![7]);
        assert!(!tile.is_staged());
        assert!(tile.take_staging().is_none());
        assert!(matches!(tile.pixels(), TilePixels::Heap(p) if p == &vec![7]));
    }
}
