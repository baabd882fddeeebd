//! In-memory GPU backend
//!
//! Keeps textures and buffer objects in plain memory and composites quads
//! into an RGB framebuffer with nearest-neighbour sampling. Used for the
//! headless `render` command and throughout the tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use image::RgbImage;
use log::warn;

use super::staging::{MappedRegion, REQUIRED_ENTRY_POINTS};
use super::{BufferId, GpuBackend, PixelSource, Quad, TextureId};
use crate::engine::ColorSpace;

struct SoftTexture {
    format: ColorSpace,
    width: usize,
    height: usize,
    data: Vec<u8>,
}

struct SoftBuffer {
    data: Box<[u8]>,
    mapped: bool,
}

/// Call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub binds: u64,
    pub image_uploads: u64,
    pub sub_uploads: u64,
    pub quads: u64,
}

pub struct SoftwareGpu {
    width: usize,
    height: usize,
    framebuffer: Vec<u8>,
    textures: HashMap<u32, SoftTexture>,
    next_texture: u32,
    bound_texture: Option<u32>,
    buffers: HashMap<u32, SoftBuffer>,
    next_buffer: u32,
    bound_unpack: Option<u32>,
    texturing: bool,
    missing: HashSet<String>,
    fail_map: bool,
    quads: Vec<Quad>,
    stats: GpuStats,
}

impl SoftwareGpu {
    /// A backend with a white `width` x `height` framebuffer.
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            framebuffer: vec![0xff; width * height * 3],
            textures: HashMap::new(),
            next_texture: 1,
            bound_texture: None,
            buffers: HashMap::new(),
            next_buffer: 1,
            bound_unpack: None,
            texturing: false,
            missing: HashSet::new(),
            fail_map: false,
            quads: Vec::new(),
            stats: GpuStats::default(),
        }
    }

    /// Pretends the driver lacks one entry point.
    #[must_use]
    pub fn without_entry_point(mut self, name: &str) -> Self {
        self.missing.insert(name.to_string());
        self
    }

    /// Pretends the driver has no buffer objects at all.
    #[must_use]
    pub fn without_buffer_objects(mut self) -> Self {
        self.missing
            .extend(REQUIRED_ENTRY_POINTS.iter().map(|n| (*n).to_string()));
        self
    }

    /// Makes every `map_buffer` call fail.
    #[must_use]
    pub fn with_map_failures(mut self) -> Self {
        self.fail_map = true;
        self
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
    pub fn stats(&self) -> GpuStats {
        self.stats
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Quads drawn since the last [`SoftwareGpu::clear`].
    #[must_use]
    pub fn quads(&self) -> &[Quad] {
        &self.quads
    }

    #[must_use]
    pub fn texturing(&self) -> bool {
        self.texturing
    }

    /// Size of the storage allocated for a texture.
    #[must_use]
    pub fn texture_size(&self, id: TextureId) -> Option<(usize, usize)> {
        self.textures.get(&id.0).map(|t| (t.width, t.height))
    }

    pub fn clear(&mut self, rgb: [u8; 3]) {
        for px in self.framebuffer.chunks_exact_mut(3) {
            px.copy_from_slice(&rgb);
        }
        self.quads.clear();
    }

    #[must_use]
    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) * 3;
        Some([
            self.framebuffer[i],
            self.framebuffer[i + 1],
            self.framebuffer[i + 2],
        ])
    }

    /// Copies the framebuffer into an image.
    #[must_use]
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(
            u32::try_from(self.width).ok()?,
            u32::try_from(self.height).ok()?,
            self.framebuffer.clone(),
        )
    }

    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        match self.to_image() {
            Some(img) => img.save_with_format(path, image::ImageFormat::Png),
            None => Err(image::ImageError::Parameter(
                image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ),
            )),
        }
    }

    /// Resolves an upload source into owned bytes (`len` of them).
    fn fetch(&self, source: PixelSource<'_>, len: usize) -> Vec<u8> {
        let bytes: &[u8] = match source {
            PixelSource::Bytes(bytes) => bytes,
            PixelSource::Unpack { offset } => {
                let buffer = self.bound_unpack.and_then(|id| self.buffers.get(&id));
                match buffer {
                    Some(buffer) if buffer.mapped => {
                        warn!("upload from a mapped unpack buffer ignored");
                        &[]
                    }
                    Some(buffer) => buffer.data.get(offset..).unwrap_or(&[]),
                    None => {
                        warn!("unpack upload without a bound buffer");
                        &[]
                    }
                }
            }
        };
        let mut out = vec![0; len];
        let n = bytes.len().min(len);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    fn sample(texture: &SoftTexture, s: usize, t: usize) -> [u8; 3] {
        let channels = texture.format.channels();
        let i = (t * texture.width + s) * channels;
        match texture.format {
            ColorSpace::Rgb => [texture.data[i], texture.data[i + 1], texture.data[i + 2]],
            ColorSpace::Bgr => [texture.data[i + 2], texture.data[i + 1], texture.data[i]],
            ColorSpace::Grey => [texture.data[i]; 3],
        }
    }
}

impl GpuBackend for SoftwareGpu {
    fn gen_textures(&mut self, count: usize) -> Vec<TextureId> {
        (0..count)
            .map(|_| {
                let id = self.next_texture;
                self.next_texture += 1;
                self.textures.insert(
                    id,
                    SoftTexture {
                        format: ColorSpace::Rgb,
                        width: 0,
                        height: 0,
                        data: Vec::new(),
                    },
                );
                TextureId(id)
            })
            .collect()
    }

    fn delete_textures(&mut self, ids: &[TextureId]) {
        for id in ids {
            self.textures.remove(&id.0);
            if self.bound_texture == Some(id.0) {
                self.bound_texture = None;
            }
        }
    }

    fn bind_texture(&mut self, id: TextureId) {
        self.bound_texture = Some(id.0);
        self.stats.binds += 1;
    }

    fn tex_image_2d(
        &mut self,
        format: ColorSpace,
        width: usize,
        height: usize,
        source: PixelSource<'_>,
    ) {
        let data = self.fetch(source, width * height * format.channels());
        if let Some(texture) = self.bound_texture.and_then(|id| self.textures.get_mut(&id)) {
            *texture = SoftTexture {
                format,
                width,
                height,
                data,
            };
        }
        self.stats.image_uploads += 1;
    }

    fn tex_sub_image_2d(
        &mut self,
        format: ColorSpace,
        width: usize,
        height: usize,
        source: PixelSource<'_>,
    ) {
        let channels = format.channels();
        let data = self.fetch(source, width * height * channels);
        if let Some(texture) = self.bound_texture.and_then(|id| self.textures.get_mut(&id)) {
            texture.format = format;
            let dst_stride = texture.width * channels;
            let src_stride = width * channels;
            let rows = height.min(texture.height);
            let cols = src_stride.min(dst_stride);
            texture.data.resize(dst_stride * texture.height, 0);
            for row in 0..rows {
                texture.data[row * dst_stride..row * dst_stride + cols]
                    .copy_from_slice(&data[row * src_stride..row * src_stride + cols]);
            }
        }
        self.stats.sub_uploads += 1;
    }

    fn set_texturing(&mut self, enabled: bool) {
        self.texturing = enabled;
    }

    fn draw_quad(&mut self, quad: &Quad) {
        self.quads.push(*quad);
        self.stats.quads += 1;

        let Some(texture) = self.bound_texture.and_then(|id| self.textures.get(&id)) else {
            return;
        };
        if texture.width == 0 || texture.height == 0 {
            return;
        }

        let [x0, y0, x1, y1] = quad.dest;
        let [s0, t0, s1, t1] = quad.tex;
        if x1 <= x0 || y1 <= y0 {
            return;
        }

        let px_start = x0.max(0.0).floor() as usize;
        let py_start = y0.max(0.0).floor() as usize;
        let px_end = (x1.ceil().max(0.0) as usize).min(self.width);
        let py_end = (y1.ceil().max(0.0) as usize).min(self.height);

        for py in py_start..py_end {
            let cy = py as f32 + 0.5;
            if cy < y0 || cy >= y1 {
                continue;
            }
            let t = t0 + (cy - y0) / (y1 - y0) * (t1 - t0);
            let t = (t.floor().max(0.0) as usize).min(texture.height - 1);
            for px in px_start..px_end {
                let cx = px as f32 + 0.5;
                if cx < x0 || cx >= x1 {
                    continue;
                }
                let s = s0 + (cx - x0) / (x1 - x0) * (s1 - s0);
                let s = (s.floor().max(0.0) as usize).min(texture.width - 1);
                let rgb = Self::sample(texture, s, t);
                let i = (py * self.width + px) * 3;
                self.framebuffer[i..i + 3].copy_from_slice(&rgb);
            }
        }
    }

    fn has_entry_point(&self, name: &str) -> bool {
        !self.missing.contains(name)
    }

    fn bind_unpack_buffer(&mut self, id: Option<BufferId>) {
        self.bound_unpack = id.map(|b| b.0);
    }

    fn gen_buffer(&mut self) -> BufferId {
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            SoftBuffer {
                data: Box::default(),
                mapped: false,
            },
        );
        BufferId(id)
    }

    fn buffer_data(&mut self, id: BufferId, size: usize) {
        if let Some(buffer) = self.buffers.get_mut(&id.0) {
            buffer.data = vec![0; size].into_boxed_slice();
            buffer.mapped = false;
        }
    }

    fn map_buffer(&mut self, id: BufferId) -> Option<MappedRegion> {
        if self.fail_map {
            return None;
        }
        let buffer = self.buffers.get_mut(&id.0)?;
        if buffer.mapped {
            return None;
        }
        buffer.mapped = true;
        // SAFETY: the boxed slice never moves or shrinks while mapped; `buffer_data`
        // and `delete_buffer` are only called on unmapped buffers by `StagingBuffer`,
        // and uploads refuse mapped buffers.
        unsafe { MappedRegion::from_raw(buffer.data.as_mut_ptr(), buffer.data.len()) }
    }

    fn unmap_buffer(&mut self, id: BufferId) -> bool {
        match self.buffers.get_mut(&id.0) {
            Some(buffer) if buffer.mapped => {
                buffer.mapped = false;
                true
            }
            _ => false,
        }
    }

    fn delete_buffer(&mut self, id: BufferId) {
        self.buffers.remove(&id.0);
        if self.bound_unpack == Some(id.0) {
            self.bound_unpack = None;
        }
    }
}

impl std::fmt::Debug for SoftwareGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareGpu")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("textures", &self.textures.len())
            .field("buffers", &self.buffers.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(gpu: &mut SoftwareGpu, format: ColorSpace, w: usize, h: usize, data: &[u8]) {
        let id = gpu.gen_textures(1)[0];
        gpu.bind_texture(id);
        gpu.tex_image_2d(format, w, h, PixelSource::Bytes(data));
    }

    #[test]
    fn quad_samples_nearest_texel() {
        let mut gpu = SoftwareGpu::new(4, 4);
        upload(&mut gpu, ColorSpace::Grey, 2, 2, &[10, 20, 30, 40]);
        gpu.draw_quad(&Quad {
            dest: [0.0, 0.0, 4.0, 4.0],
            tex: [0.0, 0.0, 2.0, 2.0],
        });
        assert_eq!(gpu.pixel(0, 0), Some([10, 10, 10]));
        assert_eq!(gpu.pixel(3, 0), Some([20, 20, 20]));
        assert_eq!(gpu.pixel(0, 3), Some([30, 30, 30]));
        assert_eq!(gpu.pixel(3, 3), Some([40, 40, 40]));
        assert_eq!(gpu.pixel(4, 0), None);
    }

    #[test]
    fn bgr_texels_are_swapped_on_output() {
        let mut gpu = SoftwareGpu::new(1, 1);
        upload(&mut gpu, ColorSpace::Bgr, 1, 1, &[1, 2, 3]);
        gpu.draw_quad(&Quad {
            dest: [0.0, 0.0, 1.0, 1.0],
            tex: [0.0, 0.0, 1.0, 1.0],
        });
        assert_eq!(gpu.pixel(0, 0), Some([3, 2, 1]));
    }

    #[test]
    fn sub_image_keeps_storage_size() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let id = gpu.gen_textures(1)[0];
        gpu.bind_texture(id);
        gpu.tex_image_2d(ColorSpace::Grey, 2, 3, PixelSource::Bytes(&[0; 6]));
        gpu.tex_sub_image_2d(ColorSpace::Grey, 2, 1, PixelSource::Bytes(&[9, 9]));
        assert_eq!(gpu.texture_size(id), Some((2, 3)));
        assert_eq!(gpu.stats().sub_uploads, 1);
    }

    #[test]
    fn unpack_upload_reads_unmapped_buffer() {
        let mut gpu = SoftwareGpu::new(1, 1);
        let buf = gpu.gen_buffer();
        gpu.bind_unpack_buffer(Some(buf));
        gpu.buffer_data(buf, 4);
        let mut region = gpu.map_buffer(buf).expect("mapped");
        region.as_mut_slice().copy_from_slice(&[0, 0, 77, 0]);
        assert!(gpu.unmap_buffer(buf));

        let id = gpu.gen_textures(1)[0];
        gpu.bind_texture(id);
        gpu.tex_image_2d(ColorSpace::Grey, 1, 1, PixelSource::Unpack { offset: 2 });
        gpu.bind_unpack_buffer(None);
        gpu.draw_quad(&Quad {
            dest: [0.0, 0.0, 1.0, 1.0],
            tex: [0.0, 0.0, 1.0, 1.0],
        });
        assert_eq!(gpu.pixel(0, 0), Some([77, 77, 77]));
    }

    #[test]
    fn png_export_matches_framebuffer() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fb.png");
        let mut gpu = SoftwareGpu::new(3, 2);
        gpu.clear([1, 2, 3]);
        gpu.save_png(&path).unwrap();
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1).0, [1, 2, 3]);
    }
}
