//! Worker side: document session, layout, tile rendering and the command loop
//!
//! [`Engine`] is the explicit context object tying the two sides together.
//! It owns the stores shared with the render context and the link through
//! which the worker sends texture slot invalidations.

pub mod decoder;
pub mod handles;
pub mod imagedoc;
pub mod layout;
pub mod request;
pub mod session;
pub mod tile;
pub mod types;
pub mod wire;
pub mod worker;

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::Sender;

pub use decoder::{DecodeError, Decoder, OutlineNode, OutlineTarget, PageInfo, RegionRequest};
pub use handles::{Handle, HandleTable};
pub use imagedoc::ImageDocDecoder;
pub use layout::{PageDim, dim_index_for_page, group_page_dims, layout};
pub use request::{Command, ProtocolError, Reply, WorkerFault};
pub use session::{OutlineEntry, Page, Session, flatten_outline};
pub use tile::{Slice, Tile, TilePixels, TileRequest, render_tile, slice_heights};
pub use types::{ColorSpace, FitMode, Generations, PixelRect, Rotation, Viewport};
pub use wire::ControllerLink;
pub use worker::Worker;

use crate::gpu::{GpuBackend, RenderContext, SlotNotice, StagingBuffer};
use crate::settings::EngineConfig;

pub type SharedSession<D> = Arc<Mutex<Session<D>>>;
/// Rendered tiles, shared between the worker (insert/free) and the render context (draw).
pub type TileStore = Arc<Mutex<HandleTable<Tile>>>;
/// Staging buffers created by the render context and not yet claimed by a tile.
pub type StagingStore = Arc<Mutex<HandleTable<StagingBuffer>>>;
/// Sender half of the attached render context's notice queue, if one is attached.
pub type NoticeLink = Arc<Mutex<Option<Sender<SlotNotice>>>>;

pub struct Engine<D: Decoder> {
    config: EngineConfig,
    session: SharedSession<D>,
    tiles: TileStore,
    staging: StagingStore,
    notices: NoticeLink,
}

impl<D: Decoder + 'static> Engine<D> {
    pub fn new(decoder: D, config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            session: Arc::new(Mutex::new(Session::new(decoder, config))),
            tiles: Arc::new(Mutex::new(HandleTable::new())),
            staging: Arc::new(Mutex::new(HandleTable::new())),
            notices: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A worker reading commands from `reader` and replying on `writer`.
    pub fn worker<R: Read, W: Write>(&self, reader: R, writer: W) -> Worker<D, R, W> {
        Worker::new(
            Arc::clone(&self.session),
            Arc::clone(&self.tiles),
            Arc::clone(&self.staging),
            Arc::clone(&self.notices),
            reader,
            writer,
        )
    }

    /// Runs a worker on its own thread.
    pub fn spawn_worker<R, W>(
        &self,
        reader: R,
        writer: W,
    ) -> io::Result<JoinHandle<Result<(), WorkerFault>>>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let worker = self.worker(reader, writer);
        thread::Builder::new()
            .name("pagetex-worker".to_string())
            .spawn(move || worker.run())
    }

    /// The render side. Call on the thread that owns the GPU context.
    ///
    /// Attaches a fresh notice queue; a previously created context stops
    /// receiving notices.
    pub fn render_context<G: GpuBackend>(&self, gpu: G) -> RenderContext<G> {
        let (tx, rx) = flume::unbounded();
        *self.notices.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        RenderContext::new(
            gpu,
            self.config.texture_count,
            self.config.use_staging_buffers,
            rx,
            Arc::clone(&self.tiles),
            Arc::clone(&self.staging),
        )
    }

    /// Notices waiting for the attached render context to drain them.
    #[must_use]
    pub fn pending_notices(&self) -> usize {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Sender::len)
    }

    #[must_use]
    pub fn session(&self) -> SharedSession<D> {
        Arc::clone(&self.session)
    }

    #[must_use]
    pub fn tiles(&self) -> TileStore {
        Arc::clone(&self.tiles)
    }

    /// Current generations; blocks while the worker holds the session.
    #[must_use]
    pub fn generations(&self) -> Generations {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generations()
    }

    /// Layout of a dimension group, or `None` while the worker is busy.
    #[must_use]
    pub fn try_page_dim(&self, index: usize) -> Option<PageDim> {
        let session = self.session.try_lock().ok()?;
        session.dims().get(index).cloned()
    }
}
