//! Decoder for documents made of raster images
//!
//! A document is either a single image file or a directory whose image files,
//! sorted by name, are its pages. Page sizes come from the image headers.
//! Pixels are decoded on a background thread and scaled on demand.

use std::collections::{HashMap, HashSet};
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use fast_image_resize as fr;
use flume::{Receiver, Sender};
use image::RgbImage;
use log::{debug, info, warn};
use lru::LruCache;
use rayon::prelude::*;

use super::decoder::{DecodeError, Decoder, OutlineNode, PageInfo, RegionRequest};
use super::types::{ColorSpace, Rotation};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];

/// Page of an [`ImageDocDecoder`] document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImagePage {
    index: usize,
    epoch: u64,
}

impl ImagePage {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

struct DecodeJob {
    epoch: u64,
    index: usize,
    path: PathBuf,
}

enum DecodeEvent {
    Decoded {
        epoch: u64,
        index: usize,
        image: Arc<RgbImage>,
    },
    Failed {
        epoch: u64,
        index: usize,
        detail: String,
    },
}

/// Last scaled page, reused while consecutive tiles hit the same page size.
struct Scaled {
    index: usize,
    epoch: u64,
    width: u32,
    height: u32,
    rotation: Rotation,
    rgb: Vec<u8>,
}

pub struct ImageDocDecoder {
    pages: Vec<PathBuf>,
    infos: Vec<Option<PageInfo>>,
    epoch: u64,
    decoded: LruCache<usize, Arc<RgbImage>>,
    pending: HashSet<usize>,
    failed: HashMap<usize, String>,
    scaled: Option<Scaled>,
    jobs: Option<Sender<DecodeJob>>,
    events_tx: Sender<DecodeEvent>,
    events: Receiver<DecodeEvent>,
    thread: Option<JoinHandle<()>>,
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn decode_loop(jobs: Receiver<DecodeJob>, events: Sender<DecodeEvent>) {
    for job in jobs.iter() {
        let started = Instant::now();
        let event = match image::open(&job.path) {
            Ok(img) => {
                debug!(
                    "decoded {:?} in {:.6}",
                    job.path,
                    started.elapsed().as_secs_f64()
                );
                DecodeEvent::Decoded {
                    epoch: job.epoch,
                    index: job.index,
                    image: Arc::new(img.to_rgb8()),
                }
            }
            Err(e) => DecodeEvent::Failed {
                epoch: job.epoch,
                index: job.index,
                detail: format!("{}: {e}", job.path.display()),
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

impl ImageDocDecoder {
    /// A decoder keeping up to `cache_pages` decoded pages in memory.
    #[must_use]
    pub fn new(cache_pages: usize) -> Self {
        let (events_tx, events) = flume::unbounded();
        Self {
            pages: Vec::new(),
            infos: Vec::new(),
            epoch: 0,
            decoded: LruCache::new(
                NonZeroUsize::new(cache_pages)
                    .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero")),
            ),
            pending: HashSet::new(),
            failed: HashMap::new(),
            scaled: None,
            jobs: None,
            events_tx,
            events,
            thread: None,
        }
    }

    /// Paths of the pages of the open document, in page order.
    #[must_use]
    pub fn pages(&self) -> &[PathBuf] {
        &self.pages
    }

    fn reset(&mut self) {
        self.pages.clear();
        self.infos.clear();
        self.decoded.clear();
        self.pending.clear();
        self.failed.clear();
        self.scaled = None;
        self.epoch += 1;
    }

    fn submit(&mut self, index: usize) -> Result<(), DecodeError> {
        if self.jobs.is_none() {
            let (jobs_tx, jobs_rx) = flume::unbounded();
            let events = self.events_tx.clone();
            let handle = thread::Builder::new()
                .name("pagetex-decode".to_string())
                .spawn(move || decode_loop(jobs_rx, events))?;
            self.jobs = Some(jobs_tx);
            self.thread = Some(handle);
        }

        let path = self.pages.get(index).cloned().ok_or(DecodeError::PageOutOfRange {
            page: index,
            count: self.pages.len(),
        })?;
        let job = DecodeJob {
            epoch: self.epoch,
            index,
            path,
        };
        match &self.jobs {
            Some(jobs) if jobs.send(job).is_ok() => {
                self.pending.insert(index);
                Ok(())
            }
            _ => Err(DecodeError::failed("decode thread is gone")),
        }
    }

    fn handle_event(&mut self, event: DecodeEvent) {
        match event {
            DecodeEvent::Decoded {
                epoch,
                index,
                image,
            } if epoch == self.epoch => {
                self.pending.remove(&index);
                self.decoded.put(index, image);
            }
            DecodeEvent::Failed {
                epoch,
                index,
                detail,
            } if epoch == self.epoch => {
                warn!("page {index} failed to decode: {detail}");
                self.pending.remove(&index);
                self.failed.insert(index, detail);
            }
            _ => {}
        }
    }

    fn scaled_page(
        &mut self,
        index: usize,
        request: &RegionRequest,
    ) -> Result<&[u8], DecodeError> {
        let hit = self.scaled.as_ref().is_some_and(|s| {
            s.index == index
                && s.epoch == self.epoch
                && s.width == request.page_width
                && s.height == request.page_height
                && s.rotation == request.rotation
        });

        if !hit {
            let source = match self.decoded.get(&index) {
                Some(image) => Arc::clone(image),
                None => {
                    return Err(match self.failed.get(&index) {
                        Some(detail) => DecodeError::failed(detail.clone()),
                        None => DecodeError::failed(format!("page {index} is not decoded")),
                    });
                }
            };
            let rgb = scale(&source, request.rotation, request.page_width, request.page_height)?;
            self.scaled = Some(Scaled {
                index,
                epoch: self.epoch,
                width: request.page_width,
                height: request.page_height,
                rotation: request.rotation,
                rgb,
            });
        }

        self.scaled
            .as_ref()
            .map(|s| s.rgb.as_slice())
            .ok_or_else(|| DecodeError::failed("scaled page missing"))
    }
}

impl Default for ImageDocDecoder {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Drop for ImageDocDecoder {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("decode thread panicked");
            }
        }
    }
}

/// Rotates clockwise by `rotation` and resizes to `width`x`height` RGB.
fn scale(
    source: &RgbImage,
    rotation: Rotation,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, DecodeError> {
    let rotated;
    let oriented = match rotation.degrees() {
        90 => {
            rotated = image::imageops::rotate90(source);
            &rotated
        }
        180 => {
            rotated = image::imageops::rotate180(source);
            &rotated
        }
        270 => {
            rotated = image::imageops::rotate270(source);
            &rotated
        }
        _ => source,
    };

    let (Some(dst_width), Some(dst_height)) = (NonZeroU32::new(width), NonZeroU32::new(height))
    else {
        return Ok(Vec::new());
    };
    if oriented.width() == width && oriented.height() == height {
        return Ok(oriented.as_raw().clone());
    }

    let src_image = fr::Image::from_vec_u8(
        NonZeroU32::new(oriented.width()).ok_or_else(|| DecodeError::failed("empty image"))?,
        NonZeroU32::new(oriented.height()).ok_or_else(|| DecodeError::failed("empty image"))?,
        oriented.as_raw().clone(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| DecodeError::failed(format!("resize source: {e}")))?;
    let mut dst_image = fr::Image::new(dst_width, dst_height, fr::PixelType::U8x3);
    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    resizer
        .resize(&src_image.view(), &mut dst_image.view_mut())
        .map_err(|e| DecodeError::failed(format!("resize: {e}")))?;
    Ok(dst_image.into_vec())
}

/// Copies a window of an RGB page into `out`, converting to `format`.
/// Pixels outside the page are left untouched.
fn blit_region(page: &[u8], page_width: usize, page_height: usize, request: &RegionRequest, out: &mut [u8]) {
    let rect = request.rect;
    let channels = request.format.channels();
    let format = request.format;
    let stride = request.stride.max(1);
    let rows = rect.height.min(page_height.saturating_sub(rect.y));
    let cols = rect.width.min(page_width.saturating_sub(rect.x));
    if rows == 0 || cols == 0 {
        return;
    }

    out.par_chunks_mut(stride)
        .take(rows)
        .enumerate()
        .for_each(|(y, row)| {
            let src_start = ((rect.y + y) * page_width + rect.x) * 3;
            let src = &page[src_start..src_start + cols * 3];
            for (x, px) in src.chunks_exact(3).enumerate() {
                let dst = x * channels;
                if dst + channels > row.len() {
                    break;
                }
                match format {
                    ColorSpace::Rgb => row[dst..dst + 3].copy_from_slice(px),
                    ColorSpace::Bgr => {
                        row[dst] = px[2];
                        row[dst + 1] = px[1];
                        row[dst + 2] = px[0];
                    }
                    ColorSpace::Grey => {
                        let luma = (77 * u32::from(px[0])
                            + 150 * u32::from(px[1])
                            + 29 * u32::from(px[2]))
                            >> 8;
                        row[dst] = luma as u8;
                    }
                }
            }
        });
}

impl Decoder for ImageDocDecoder {
    type Page = ImagePage;

    fn open(&mut self, path: &Path) -> Result<(), DecodeError> {
        self.reset();

        let pages = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image_file(p))
                .collect();
            files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            files
        } else if is_image_file(path) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        };

        if pages.is_empty() {
            return Err(DecodeError::Open {
                path: path.to_path_buf(),
                detail: "no images found".to_string(),
            });
        }

        info!("image document {:?} with {} pages", path, pages.len());
        self.infos = vec![None; pages.len()];
        self.pages = pages;
        Ok(())
    }

    fn close(&mut self) {
        self.reset();
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page_info(&mut self, index: usize) -> Result<Poll<PageInfo>, DecodeError> {
        let count = self.pages.len();
        let slot = self
            .infos
            .get_mut(index)
            .ok_or(DecodeError::PageOutOfRange { page: index, count })?;
        if let Some(info) = slot {
            return Ok(Poll::Ready(*info));
        }

        let path = &self.pages[index];
        let size = imagesize::size(path)
            .map_err(|e| DecodeError::failed(format!("{}: {e}", path.display())))?;
        let info = PageInfo::new(
            u32::try_from(size.width).unwrap_or(u32::MAX),
            u32::try_from(size.height).unwrap_or(u32::MAX),
        );
        *slot = Some(info);
        Ok(Poll::Ready(info))
    }

    fn load_page(&mut self, index: usize) -> Result<ImagePage, DecodeError> {
        if self.pages.is_empty() {
            return Err(DecodeError::NoDocument);
        }
        if index >= self.pages.len() {
            return Err(DecodeError::PageOutOfRange {
                page: index,
                count: self.pages.len(),
            });
        }
        if !self.decoded.contains(&index) && !self.pending.contains(&index) {
            self.failed.remove(&index);
            self.submit(index)?;
        }
        Ok(ImagePage {
            index,
            epoch: self.epoch,
        })
    }

    fn is_decode_done(&mut self, page: &ImagePage) -> bool {
        if page.epoch != self.epoch {
            return true;
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        if self.decoded.contains(&page.index) || self.failed.contains_key(&page.index) {
            return true;
        }
        // Evicted from the cache since it was loaded
        if !self.pending.contains(&page.index) && self.submit(page.index).is_err() {
            return true;
        }
        false
    }

    fn pump(&mut self, wait: bool) -> Result<(), DecodeError> {
        if wait && !self.pending.is_empty() {
            let event = self
                .events
                .recv()
                .map_err(|_| DecodeError::failed("decode thread is gone"))?;
            self.handle_event(event);
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        Ok(())
    }

    fn render_region(
        &mut self,
        page: &ImagePage,
        request: &RegionRequest,
        out: &mut [u8],
    ) -> Result<(), DecodeError> {
        if page.epoch != self.epoch {
            return Err(DecodeError::failed("page belongs to a closed document"));
        }
        let rect = request.rect;
        if rect.width == 0 || rect.height == 0 {
            return Ok(());
        }
        let needed = request.stride * (rect.height - 1) + rect.width * request.format.channels();
        if out.len() < needed {
            return Err(DecodeError::failed(format!(
                "output buffer holds {} bytes, region needs {needed}",
                out.len()
            )));
        }

        let page_width = request.page_width as usize;
        let page_height = request.page_height as usize;
        let scaled = self.scaled_page(page.index, request)?;
        blit_region(scaled, page_width, page_height, request, out);
        Ok(())
    }

    fn outline(&mut self) -> Result<Poll<Option<Vec<OutlineNode>>>, DecodeError> {
        if self.pages.len() < 2 {
            return Ok(Poll::Ready(None));
        }
        let entries = self
            .pages
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let title = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("Page {}", i + 1));
                OutlineNode::page(title, i)
            })
            .collect();
        Ok(Poll::Ready(Some(entries)))
    }
}
