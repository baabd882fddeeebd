//! Document session: open document, page dimension table, generations

use std::path::{Path, PathBuf};

use log::{debug, info};

use super::decoder::{Decoder, OutlineNode, OutlineTarget, wait_for};
use super::handles::{Handle, HandleTable};
use super::layout::{self, PageDim, PageDimBuilder};
use super::request::WorkerFault;
use super::tile::{self, Tile, TileRequest};
use super::types::{ColorSpace, FitMode, Generations, PixelRect, Rotation, Viewport};
use crate::gpu::StagingBuffer;
use crate::settings::EngineConfig;

/// A decoder page plus the generations it was created under.
pub struct Page<P> {
    inner: P,
    page_no: usize,
    dim_index: usize,
    stamp: Generations,
}

impl<P> Page<P> {
    #[must_use]
    pub fn page_no(&self) -> usize {
        self.page_no
    }

    #[must_use]
    pub fn dim_index(&self) -> usize {
        self.dim_index
    }

    #[must_use]
    pub fn stamp(&self) -> Generations {
        self.stamp
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Whether the page still matches the document and page sizes of `now`.
    #[must_use]
    pub fn is_current(&self, now: &Generations) -> bool {
        now.is_current(&self.stamp)
    }
}

/// One flattened outline line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineEntry {
    pub level: usize,
    pub page_no: usize,
    pub title: String,
}

/// Depth-first flattening. External links are skipped with their subtrees;
/// unresolved internal links print nothing but their children still do.
pub fn flatten_outline(nodes: &[OutlineNode]) -> Vec<OutlineEntry> {
    fn walk(nodes: &[OutlineNode], level: usize, out: &mut Vec<OutlineEntry>) {
        for node in nodes {
            match &node.target {
                OutlineTarget::External(_) => continue,
                OutlineTarget::Page(page_no) => out.push(OutlineEntry {
                    level,
                    page_no: *page_no,
                    title: node.title.clone(),
                }),
                OutlineTarget::Unresolved => {}
            }
            walk(&node.children, level + 1, out);
        }
    }

    let mut out = Vec::new();
    walk(nodes, 0, &mut out);
    out
}

/// Document and layout state. Every mutation happens under one lock held by the worker.
pub struct Session<D: Decoder> {
    decoder: D,
    path: Option<PathBuf>,
    page_count: usize,
    dims: Vec<PageDim>,
    generations: Generations,
    viewport: Viewport,
    fit: FitMode,
    rotation: Rotation,
    colorspace: ColorSpace,
    slice_height: usize,
    /// Flattened outline of the open document, fetched on the first layout.
    outline: Option<Vec<OutlineEntry>>,
    pages: HandleTable<Page<D::Page>>,
}

impl<D: Decoder> Session<D> {
    pub fn new(decoder: D, config: &EngineConfig) -> Self {
        Self {
            decoder,
            path: None,
            page_count: 0,
            dims: Vec::new(),
            generations: Generations::default(),
            viewport: Viewport::default(),
            fit: config.fit_mode,
            rotation: Rotation::from_degrees(config.rotation),
            colorspace: config.colorspace,
            slice_height: config.slice_height.max(1),
            outline: None,
            pages: HandleTable::new(),
        }
    }

    /// Replaces the open document and rebuilds the dimension table.
    pub fn open_document(&mut self, path: &Path) -> Result<usize, WorkerFault> {
        self.decoder.close();
        self.dims.clear();
        self.page_count = 0;
        self.path = None;
        self.outline = None;
        self.generations.access += 1;

        self.decoder.open(path)?;
        self.page_count = self.decoder.page_count();

        let mut builder = PageDimBuilder::new();
        for page_no in 0..self.page_count {
            let info = wait_for(&mut self.decoder, |d| d.page_info(page_no))?;
            builder.push(page_no, info);
        }
        self.dims = builder.finish();
        self.path = Some(path.to_path_buf());

        info!(
            "opened {:?}: {} pages, {} dimension groups",
            path,
            self.page_count,
            self.dims.len()
        );
        Ok(self.page_count)
    }

    /// Creates a page handle stamped with the current generations.
    pub fn load_page(&mut self, page_no: usize, dim_index: usize) -> Result<Handle, WorkerFault> {
        if dim_index >= self.dims.len() {
            return Err(WorkerFault::DimOutOfRange {
                index: dim_index,
                count: self.dims.len(),
            });
        }
        let inner = self.decoder.load_page(page_no)?;
        let handle = self.pages.insert(Page {
            inner,
            page_no,
            dim_index,
            stamp: self.generations,
        });
        debug!("page {page_no} loaded as {handle}");
        Ok(handle)
    }

    pub fn free_page(&mut self, handle: Handle) -> Result<(), WorkerFault> {
        self.pages
            .remove(handle)
            .map(|_| ())
            .ok_or(WorkerFault::StaleHandle {
                kind: "page",
                handle,
            })
    }

    #[must_use]
    pub fn page(&self, handle: Handle) -> Option<&Page<D::Page>> {
        self.pages.get(handle)
    }

    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }

    /// Sets viewport size and fit mode. Returns true when the width changed.
    pub fn set_geometry(&mut self, width: u32, height: u32, fit: FitMode) -> bool {
        let width_changed = self.viewport.width != width;
        self.viewport = Viewport::new(width, height);
        self.fit = fit;
        width_changed
    }

    /// Sets rotation, fit mode and viewport height. A rotation or fit change
    /// bumps the layout generation on top of the usual relayout bump.
    pub fn set_layout(&mut self, rotation: Rotation, fit: FitMode, height: u32) -> bool {
        let changed = rotation != self.rotation || fit != self.fit;
        if changed {
            self.generations.layout += 1;
        }
        self.rotation = rotation;
        self.fit = fit;
        self.viewport.height = height;
        changed
    }

    /// Lays out every dimension group for the current viewport.
    pub fn relayout(&mut self) -> &[PageDim] {
        if layout::layout(&mut self.dims, self.viewport, self.fit, self.rotation) {
            self.generations.size += 1;
        }
        self.generations.layout += 1;
        &self.dims
    }

    /// The flattened outline of the open document. The decoder is asked once
    /// per document; every later call reuses that answer.
    pub fn outline(&mut self) -> Result<&[OutlineEntry], WorkerFault> {
        if self.path.is_none() {
            return Ok(&[]);
        }
        if self.outline.is_none() {
            let tree = wait_for(&mut self.decoder, |d| d.outline())?;
            self.outline = Some(tree.as_deref().map(flatten_outline).unwrap_or_default());
        }
        Ok(self.outline.as_deref().unwrap_or_default())
    }

    /// Renders a region of a loaded page at its group's current layout.
    pub fn render_tile(
        &mut self,
        handle: Handle,
        rect: PixelRect,
        staging: Option<StagingBuffer>,
    ) -> Result<(Tile, Option<StagingBuffer>), WorkerFault> {
        let page = self.pages.get(handle).ok_or(WorkerFault::StaleHandle {
            kind: "page",
            handle,
        })?;
        let dim = self
            .dims
            .get(page.dim_index)
            .ok_or(WorkerFault::DimOutOfRange {
                index: page.dim_index,
                count: self.dims.len(),
            })?;

        let request = TileRequest {
            page_no: page.page_no,
            page_width: dim.width,
            page_height: dim.height,
            rotation: dim.rotation,
            rect,
            colorspace: self.colorspace,
            slice_height: self.slice_height,
        };
        Ok(tile::render_tile(
            &mut self.decoder,
            &page.inner,
            &request,
            staging,
        )?)
    }

    pub fn set_colorspace(&mut self, colorspace: ColorSpace) {
        self.colorspace = colorspace;
    }

    /// Returns true when the height actually changed.
    pub fn set_slice_height(&mut self, height: usize) -> bool {
        let height = height.max(1);
        if height == self.slice_height {
            return false;
        }
        self.slice_height = height;
        true
    }

    #[must_use]
    pub fn generations(&self) -> Generations {
        self.generations
    }

    #[must_use]
    pub fn dims(&self) -> &[PageDim] {
        &self.dims
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    #[must_use]
    pub fn fit(&self) -> FitMode {
        self.fit
    }

    #[must_use]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    #[must_use]
    pub fn colorspace(&self) -> ColorSpace {
        self.colorspace
    }

    #[must_use]
    pub fn slice_height(&self) -> usize {
        self.slice_height
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }
}
