//! Pixel staging buffers (pixel buffer objects)
//!
//! The renderer writes tile pixels straight into driver-mapped memory so the
//! upload needs no extra CPU copy. The whole path is optional: it is probed
//! once when the render context starts and, when unavailable, every
//! acquisition yields `None` and tiles render into heap memory instead.

use std::fmt;
use std::ptr::NonNull;

use log::{debug, info, warn};

use super::{BufferId, GpuBackend};
use crate::engine::ColorSpace;

/// Entry points the staging path needs; missing any disables it.
pub const REQUIRED_ENTRY_POINTS: [&str; 6] = [
    "bind_unpack_buffer",
    "unmap_buffer",
    "map_buffer",
    "buffer_data",
    "gen_buffer",
    "delete_buffer",
];

/// Bytes a staging buffer for a `width` x `height` tile needs.
#[must_use]
pub fn staging_size(width: usize, height: usize, colorspace: ColorSpace) -> usize {
    width
        .saturating_mul(height)
        .saturating_mul(colorspace.staging_bytes_per_pixel())
}

/// Driver-mapped memory.
///
/// The backend guarantees the memory stays valid until the buffer is
/// unmapped or deleted; [`StagingBuffer`] drops the region before doing either.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is exclusively owned by one staging buffer, which moves
// between the render context and the worker but is never accessed by both at once.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Wraps a mapping returned by a driver.
    ///
    /// # Safety
    /// `ptr` must point to `len` writable bytes that stay valid until the
    /// owning buffer is unmapped or deleted, with no other live references.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the `from_raw` contract; `&mut self` makes the borrow exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum StagingState {
    Mapped(MappedRegion),
    Unmapped,
    Released,
}

/// A buffer object plus its mapping state.
#[derive(Debug)]
pub struct StagingBuffer {
    id: BufferId,
    size: usize,
    state: StagingState,
}

impl StagingBuffer {
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.state, StagingState::Mapped(_))
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(self.state, StagingState::Released)
    }

    /// The mapped memory, if currently mapped.
    pub fn mapped_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.state {
            StagingState::Mapped(region) => Some(region.as_mut_slice()),
            _ => None,
        }
    }

    /// Unmaps before use as an upload source. A no-op unless mapped.
    ///
    /// Returns false if the driver reported a failure; the contents are then undefined.
    pub fn unmap<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G) -> bool {
        if !self.is_mapped() {
            return true;
        }
        self.state = StagingState::Unmapped;
        gpu.bind_unpack_buffer(Some(self.id));
        let ok = gpu.unmap_buffer(self.id);
        gpu.bind_unpack_buffer(None);
        if !ok {
            warn!("unmapping staging buffer {:?} failed", self.id);
        }
        ok
    }

    /// Maps an unmapped buffer again. Returns whether it is mapped afterwards.
    pub fn remap<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G) -> bool {
        match self.state {
            StagingState::Mapped(_) => true,
            StagingState::Released => false,
            StagingState::Unmapped => {
                gpu.bind_unpack_buffer(Some(self.id));
                let mapped = gpu.map_buffer(self.id);
                gpu.bind_unpack_buffer(None);
                match mapped {
                    Some(region) => {
                        self.state = StagingState::Mapped(region);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Deletes the buffer object. Further calls are no-ops.
    pub fn release<G: GpuBackend + ?Sized>(&mut self, gpu: &mut G) {
        if self.is_released() {
            return;
        }
        self.unmap(gpu);
        gpu.delete_buffer(self.id);
        self.state = StagingState::Released;
        debug!("staging buffer {:?} released", self.id);
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if !self.is_released() && !std::thread::panicking() {
            warn!(
                "staging buffer {:?} ({} bytes) dropped without release",
                self.id, self.size
            );
        }
    }
}

/// Whether the driver supports the staging path, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingCapability {
    Available,
    Unavailable,
}

impl StagingCapability {
    /// Checks every required entry point.
    pub fn probe<G: GpuBackend + ?Sized>(gpu: &G) -> Self {
        match REQUIRED_ENTRY_POINTS
            .iter()
            .find(|name| !gpu.has_entry_point(name))
        {
            Some(missing) => {
                info!("staging buffers disabled: driver lacks {missing}");
                Self::Unavailable
            }
            None => Self::Available,
        }
    }
}

/// Hands out mapped staging buffers when the capability is present.
#[derive(Debug)]
pub struct StagingManager {
    capability: StagingCapability,
}

impl StagingManager {
    #[must_use]
    pub fn new(capability: StagingCapability) -> Self {
        Self { capability }
    }

    #[must_use]
    pub fn capability(&self) -> StagingCapability {
        self.capability
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.capability == StagingCapability::Available
    }

    /// Creates and maps a buffer for a tile.
    ///
    /// Returns `None` when the capability is absent or the driver refuses to
    /// map; the caller then renders into heap memory.
    pub fn acquire<G: GpuBackend + ?Sized>(
        &self,
        gpu: &mut G,
        width: usize,
        height: usize,
        colorspace: ColorSpace,
    ) -> Option<StagingBuffer> {
        if !self.is_available() {
            return None;
        }

        let size = staging_size(width, height, colorspace);
        let id = gpu.gen_buffer();
        gpu.bind_unpack_buffer(Some(id));
        gpu.buffer_data(id, size);
        let mapped = gpu.map_buffer(id);
        gpu.bind_unpack_buffer(None);

        match mapped {
            Some(region) => Some(StagingBuffer {
                id,
                size,
                state: StagingState::Mapped(region),
            }),
            None => {
                warn!("mapping staging buffer {id:?} ({size} bytes) failed, using heap memory");
                gpu.delete_buffer(id);
                None
            }
        }
    }
}
