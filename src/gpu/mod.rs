//! Render-context side: texture slots, staging buffers and tile drawing
//!
//! Everything in here issues GPU calls and must run on the thread that owns
//! the GPU context. The worker talks to this side only through
//! [`slots::SlotNotice`] messages.

pub mod compositor;
pub mod slots;
pub mod software;
pub mod staging;

pub use compositor::{DrawRect, RenderContext, RenderError};
pub use slots::{SliceKey, SlotNotice, SlotStats, TextureSlotCache, UploadKind};
pub use software::{GpuStats, SoftwareGpu};
pub use staging::{
    MappedRegion, REQUIRED_ENTRY_POINTS, StagingBuffer, StagingCapability, StagingManager,
    staging_size,
};

use crate::engine::ColorSpace;

/// Texture object name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Buffer object name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Where texture upload data comes from.
#[derive(Clone, Copy, Debug)]
pub enum PixelSource<'a> {
    /// CPU memory
    Bytes(&'a [u8]),
    /// Byte offset into the currently bound unpack buffer
    Unpack { offset: usize },
}

/// A textured quad: destination rectangle in framebuffer pixels and source
/// rectangle in texel coordinates (rectangle textures are addressed in texels).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad {
    pub dest: [f32; 4],
    pub tex: [f32; 4],
}

/// GPU / window backend collaborator.
///
/// Buffer-object methods are only called after [`StagingCapability::probe`]
/// found every entry point in [`REQUIRED_ENTRY_POINTS`].
pub trait GpuBackend {
    fn gen_textures(&mut self, count: usize) -> Vec<TextureId>;
    fn delete_textures(&mut self, ids: &[TextureId]);
    fn bind_texture(&mut self, id: TextureId);

    /// Allocates new storage for the bound texture and uploads into it.
    fn tex_image_2d(
        &mut self,
        format: ColorSpace,
        width: usize,
        height: usize,
        source: PixelSource<'_>,
    );

    /// Overwrites the top-left `width` x `height` texels of the bound texture.
    fn tex_sub_image_2d(
        &mut self,
        format: ColorSpace,
        width: usize,
        height: usize,
        source: PixelSource<'_>,
    );

    fn set_texturing(&mut self, enabled: bool);
    fn draw_quad(&mut self, quad: &Quad);

    /// Whether the driver exposes the named optional entry point.
    fn has_entry_point(&self, name: &str) -> bool;

    fn bind_unpack_buffer(&mut self, id: Option<BufferId>);
    fn gen_buffer(&mut self) -> BufferId;
    fn buffer_data(&mut self, id: BufferId, size: usize);
    /// Maps the buffer for read/write; `None` when the driver refuses.
    fn map_buffer(&mut self, id: BufferId) -> Option<MappedRegion>;
    /// Returns false when the driver reports the unmap failed.
    fn unmap_buffer(&mut self, id: BufferId) -> bool;
    fn delete_buffer(&mut self, id: BufferId);
}
