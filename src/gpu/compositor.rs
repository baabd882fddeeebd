//! Render context: draws tiles through the texture slot cache

use std::sync::PoisonError;

use flume::Receiver;
use log::{debug, error, info};

use super::slots::{SlotNotice, TextureSlotCache, UploadKind};
use super::staging::{StagingCapability, StagingManager};
use super::{GpuBackend, Quad};
use crate::engine::{ColorSpace, Handle, StagingStore, TileStore};

/// Errors raised on the render side. All of them are broken caller contracts.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown tile {0}")]
    UnknownTile(Handle),

    #[error(
        "draw of {rows} rows from tile row {tile_y} runs past tile {tile} ({slices} slices, height {height})"
    )]
    GeometryMismatch {
        tile: Handle,
        tile_y: usize,
        rows: usize,
        slices: usize,
        height: usize,
    },

    #[error("slice {index} out of range ({count} slices)")]
    SliceOutOfRange { index: usize, count: usize },

    #[error("tile pixels too short: need {needed} bytes, have {available}")]
    ShortPixels { needed: usize, available: usize },

    #[error("texture pool is empty")]
    NoTextures,

    #[error("staging: {0}")]
    Staging(String),
}

/// Where and what part of a tile to draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawRect {
    /// Destination position in framebuffer pixels
    pub dest_x: i32,
    pub dest_y: i32,
    /// Size of the drawn area, in both framebuffer and tile pixels
    pub width: usize,
    pub height: usize,
    /// Origin of the drawn area inside the tile
    pub tile_x: usize,
    pub tile_y: usize,
}

/// Owns every GPU object the engine creates. Lives on the thread that owns
/// the GPU context and must not leave it.
pub struct RenderContext<G: GpuBackend> {
    gpu: G,
    slots: TextureSlotCache,
    staging: StagingManager,
    notices: Receiver<SlotNotice>,
    tiles: TileStore,
    staging_store: StagingStore,
}

impl<G: GpuBackend> RenderContext<G> {
    pub fn new(
        mut gpu: G,
        texture_count: usize,
        use_staging_buffers: bool,
        notices: Receiver<SlotNotice>,
        tiles: TileStore,
        staging_store: StagingStore,
    ) -> Self {
        let capability = if use_staging_buffers {
            StagingCapability::probe(&gpu)
        } else {
            StagingCapability::Unavailable
        };
        let slots = TextureSlotCache::new(&mut gpu, texture_count);
        info!(
            "render context: {} texture slots, staging buffers {:?}",
            slots.len(),
            capability
        );
        Self {
            gpu,
            slots,
            staging: StagingManager::new(capability),
            notices,
            tiles,
            staging_store,
        }
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn slots(&self) -> &TextureSlotCache {
        &self.slots
    }

    #[must_use]
    pub fn staging_available(&self) -> bool {
        self.staging.is_available()
    }

    /// Applies every pending invalidation notice.
    pub fn drain_notices(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(notice) = self.notices.try_recv() {
            self.slots.apply(&mut self.gpu, notice);
            applied += 1;
        }
        applied
    }

    pub fn realloc_textures(&mut self, count: usize) {
        self.drain_notices();
        self.slots.realloc(&mut self.gpu, count);
    }

    /// Starts a frame of tile drawing.
    pub fn begin_tiles(&mut self) {
        self.drain_notices();
        self.gpu.set_texturing(true);
    }

    pub fn end_tiles(&mut self) {
        self.gpu.set_texturing(false);
    }

    /// Uploads (or rebinds) one slice of a tile.
    pub fn upload_slice(&mut self, tile: Handle, index: usize) -> Result<UploadKind, RenderError> {
        self.drain_notices();
        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tiles.get_mut(tile).ok_or(RenderError::UnknownTile(tile))?;
        self.slots.upload_slice(&mut self.gpu, tile, entry, index)
    }

    /// Paints `rect` of a tile, one slice band at a time.
    pub fn draw_tile(&mut self, tile: Handle, rect: DrawRect) -> Result<(), RenderError> {
        self.drain_notices();
        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tiles.get_mut(tile).ok_or(RenderError::UnknownTile(tile))?;

        let slice_height = entry.slice_height();
        let mut index = rect.tile_y / slice_height;
        let mut slice_y = rect.tile_y % slice_height;
        let mut dest_y = f64::from(rect.dest_y);
        let mut remaining = rect.height;

        let x0 = f64::from(rect.dest_x);
        let x1 = x0 + rect.width as f64;
        let s0 = rect.tile_x as f64;
        let s1 = s0 + rect.width as f64;

        while remaining > 0 {
            let band = entry
                .slices()
                .get(index)
                .map(|s| s.height())
                .filter(|&h| h > slice_y);
            let Some(band) = band else {
                let err = RenderError::GeometryMismatch {
                    tile,
                    tile_y: rect.tile_y,
                    rows: rect.height,
                    slices: entry.slice_count(),
                    height: entry.height(),
                };
                error!("{err}");
                return Err(err);
            };

            let rows = remaining.min(band - slice_y);
            self.slots.upload_slice(&mut self.gpu, tile, entry, index)?;
            self.gpu.draw_quad(&Quad {
                dest: [x0 as f32, dest_y as f32, x1 as f32, (dest_y + rows as f64) as f32],
                tex: [
                    s0 as f32,
                    slice_y as f32,
                    s1 as f32,
                    (slice_y + rows) as f32,
                ],
            });

            dest_y += rows as f64;
            remaining -= rows;
            slice_y = 0;
            index += 1;
        }
        Ok(())
    }

    /// Creates a mapped staging buffer for a future `tile` command.
    ///
    /// `None` means no staging buffer is available; the controller sends `0`.
    pub fn acquire_staging(
        &mut self,
        width: usize,
        height: usize,
        colorspace: ColorSpace,
    ) -> Option<Handle> {
        let buffer = self
            .staging
            .acquire(&mut self.gpu, width, height, colorspace)?;
        let handle = self
            .staging_store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(buffer);
        debug!("staging buffer {handle} acquired for {width}x{height} {colorspace:?}");
        Some(handle)
    }

    /// Releases a staging buffer that was never handed to a tile.
    pub fn discard_staging(&mut self, handle: Handle) -> bool {
        let buffer = self
            .staging_store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        match buffer {
            Some(mut buffer) => {
                buffer.release(&mut self.gpu);
                true
            }
            None => false,
        }
    }

    /// Unmaps the staging buffer of a tile. A no-op for unstaged tiles.
    pub fn unmap_staging(&mut self, tile: Handle) -> Result<(), RenderError> {
        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tiles.get_mut(tile).ok_or(RenderError::UnknownTile(tile))?;
        if let Some(buffer) = entry.staging_mut() {
            if !buffer.unmap(&mut self.gpu) {
                return Err(RenderError::Staging(format!(
                    "unmapping buffer {:?} of tile {tile} failed",
                    buffer.id()
                )));
            }
        }
        Ok(())
    }

    /// Deletes the staging buffer of a tile. The tile's pixels are gone afterwards.
    pub fn release_staging(&mut self, tile: Handle) -> Result<(), RenderError> {
        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tiles.get_mut(tile).ok_or(RenderError::UnknownTile(tile))?;
        if let Some(buffer) = entry.staging_mut() {
            buffer.release(&mut self.gpu);
        }
        Ok(())
    }
}

impl<G: GpuBackend> Drop for RenderContext<G> {
    fn drop(&mut self) {
        self.drain_notices();

        let leftovers = self
            .staging_store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for (_, mut buffer) in leftovers {
            buffer.release(&mut self.gpu);
        }

        let mut tiles = self.tiles.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, tile) in tiles.iter_mut() {
            if let Some(buffer) = tile.staging_mut() {
                buffer.release(&mut self.gpu);
            }
        }
        drop(tiles);

        self.slots.release(&mut self.gpu);
        debug!("render context torn down");
    }
}
