//! Texture slot cache
//!
//! A fixed pool of texture objects claimed round-robin. Each slot remembers
//! the size of its last upload and which slice currently lives in it; a
//! slice remembers the slot it was last uploaded to. Both links are checked
//! before cached content is reused.

use log::{debug, info};

use super::compositor::RenderError;
use super::{GpuBackend, PixelSource, StagingBuffer, TextureId};
use crate::engine::{Handle, Tile, TilePixels};

/// Identity of one slice: its tile handle plus the slice index.
///
/// Tile handles are generation tagged, so a key left behind by a freed tile
/// never matches a slice of a newer tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SliceKey {
    pub tile: Handle,
    pub index: usize,
}

#[derive(Debug)]
struct TextureSlot {
    texture: TextureId,
    width: Option<usize>,
    height: Option<usize>,
    resident: Option<SliceKey>,
}

impl TextureSlot {
    fn new(texture: TextureId) -> Self {
        Self {
            texture,
            width: None,
            height: None,
            resident: None,
        }
    }
}

/// Invalidation messages sent by the worker and applied by the render context.
#[derive(Debug)]
pub enum SlotNotice {
    /// Clear every resident slice (viewport width changed).
    Detach,
    /// Clear residents and recorded widths (colour format change, new document).
    Unvalidate,
    /// Clear residents and recorded sizes (slice height change).
    Forget,
    /// A tile was freed; slots holding its slices become empty.
    Unlink(Handle),
    /// A staging buffer no longer owned by anything; delete it.
    ReleaseStaging(StagingBuffer),
}

/// What an upload did on the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    /// Slice was still resident; texture bound, nothing transferred.
    Bound,
    /// Existing storage reused with a sub-image transfer.
    Partial,
    /// New storage allocated.
    Full,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub binds: u64,
    pub partial_uploads: u64,
    pub full_uploads: u64,
}

pub struct TextureSlotCache {
    slots: Vec<TextureSlot>,
    cursor: usize,
    stats: SlotStats,
}

impl TextureSlotCache {
    /// Generates `count` textures (at least one).
    pub fn new<G: GpuBackend + ?Sized>(gpu: &mut G, count: usize) -> Self {
        let count = count.max(1);
        let slots: Vec<TextureSlot> = gpu
            .gen_textures(count)
            .into_iter()
            .map(TextureSlot::new)
            .collect();
        info!("texture slot pool ready: {} slots", slots.len());
        Self {
            slots,
            cursor: 0,
            stats: SlotStats::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots claimed so far; the next claim takes `cursor % len`.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn stats(&self) -> SlotStats {
        self.stats
    }

    /// Slice currently resident in `slot`.
    #[must_use]
    pub fn resident(&self, slot: usize) -> Option<SliceKey> {
        self.slots.get(slot).and_then(|s| s.resident)
    }

    /// Recorded size of the last upload into `slot`.
    #[must_use]
    pub fn recorded_size(&self, slot: usize) -> Option<(Option<usize>, Option<usize>)> {
        self.slots.get(slot).map(|s| (s.width, s.height))
    }

    #[must_use]
    pub fn texture(&self, slot: usize) -> Option<TextureId> {
        self.slots.get(slot).map(|s| s.texture)
    }

    pub fn detach_all(&mut self) {
        for slot in &mut self.slots {
            slot.resident = None;
        }
    }

    pub fn unvalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.resident = None;
            slot.width = None;
        }
    }

    pub fn forget_all(&mut self) {
        for slot in &mut self.slots {
            slot.resident = None;
            slot.width = None;
            slot.height = None;
        }
    }

    /// Empties every slot holding a slice of `tile`.
    pub fn unlink(&mut self, tile: Handle) {
        for slot in &mut self.slots {
            if slot.resident.is_some_and(|key| key.tile == tile) {
                slot.resident = None;
            }
        }
    }

    pub fn apply<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G, notice: SlotNotice) {
        debug!("slot notice: {notice:?}");
        match notice {
            SlotNotice::Detach => self.detach_all(),
            SlotNotice::Unvalidate => self.unvalidate_all(),
            SlotNotice::Forget => self.forget_all(),
            SlotNotice::Unlink(tile) => self.unlink(tile),
            SlotNotice::ReleaseStaging(mut buffer) => buffer.release(gpu),
        }
    }

    /// Resizes the pool. Shrinking deletes the tail textures, growing adds
    /// empty slots; either way the cursor restarts at slot 0.
    pub fn realloc<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G, count: usize) {
        let count = count.max(1);
        if count == self.slots.len() {
            return;
        }

        if count < self.slots.len() {
            let doomed: Vec<TextureId> = self.slots[count..].iter().map(|s| s.texture).collect();
            gpu.delete_textures(&doomed);
            self.slots.truncate(count);
        } else {
            let extra = count - self.slots.len();
            self.slots
                .extend(gpu.gen_textures(extra).into_iter().map(TextureSlot::new));
        }
        self.cursor = 0;
        info!("texture slot pool resized to {} slots", self.slots.len());
    }

    /// Deletes every texture; the cache is unusable afterwards.
    pub fn release<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G) {
        let textures: Vec<TextureId> = self.slots.drain(..).map(|s| s.texture).collect();
        gpu.delete_textures(&textures);
        self.cursor = 0;
    }

    /// Makes slice `index` of `tile` the bound texture, uploading it unless
    /// it is still resident where it was last put.
    pub fn upload_slice<G: GpuBackend + ?Sized>(
        &mut self,
        gpu: &mut G,
        handle: Handle,
        tile: &mut Tile,
        index: usize,
    ) -> Result<UploadKind, RenderError> {
        let key = SliceKey {
            tile: handle,
            index,
        };
        let slice = tile
            .slices()
            .get(index)
            .ok_or(RenderError::SliceOutOfRange {
                index,
                count: tile.slice_count(),
            })?;
        let slice_height = slice.height();

        if let Some(slot) = slice.slot().and_then(|i| self.slots.get(i)) {
            if slot.resident == Some(key) {
                gpu.bind_texture(slot.texture);
                self.stats.binds += 1;
                return Ok(UploadKind::Bound);
            }
        }

        if self.slots.is_empty() {
            return Err(RenderError::NoTextures);
        }
        let slot_index = self.cursor % self.slots.len();
        self.cursor = self.cursor.wrapping_add(1);

        let width = tile.width();
        let format = tile.colorspace();
        let offset = tile.slice_offset(index);
        let len = width * slice_height * tile.channels();

        let slot = &mut self.slots[slot_index];
        let partial = slot.width == Some(width) && slot.height.is_some_and(|h| h >= slice_height);
        gpu.bind_texture(slot.texture);

        match tile.pixels_mut() {
            TilePixels::Heap(bytes) => {
                let data = bytes
                    .get(offset..offset + len)
                    .ok_or(RenderError::ShortPixels {
                        needed: offset + len,
                        available: bytes.len(),
                    })?;
                transfer(gpu, partial, format, width, slice_height, PixelSource::Bytes(data));
            }
            TilePixels::Staged(buffer) => {
                if buffer.is_released() || buffer.size() < offset + len {
                    return Err(RenderError::Staging(format!(
                        "staging buffer {:?} cannot supply {} bytes at {offset}",
                        buffer.id(),
                        len
                    )));
                }
                buffer.unmap(gpu);
                gpu.bind_unpack_buffer(Some(buffer.id()));
                transfer(gpu, partial, format, width, slice_height, PixelSource::Unpack { offset });
                gpu.bind_unpack_buffer(None);
            }
        }

        if partial {
            self.stats.partial_uploads += 1;
        } else {
            slot.height = Some(slice_height);
            self.stats.full_uploads += 1;
        }
        slot.width = Some(width);
        slot.resident = Some(key);
        tile.set_slice_slot(index, Some(slot_index));

        Ok(if partial {
            UploadKind::Partial
        } else {
            UploadKind::Full
        })
    }
}

fn transfer<G: GpuBackend + ?Sized>(
    gpu: &mut G,
    partial: bool,
    format: crate::engine::ColorSpace,
    width: usize,
    height: usize,
    source: PixelSource<'_>,
) {
    if partial {
        gpu.tex_sub_image_2d(format, width, height, source);
    } else {
        gpu.tex_image_2d(format, width, height, source);
    }
}

impl std::fmt::Debug for TextureSlotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureSlotCache")
            .field("slots", &self.slots.len())
            .field("cursor", &self.cursor)
            .field("stats", &self.stats)
            .finish()
    }
}
