//! Command worker: reads framed commands and runs them one at a time

use std::io::{Read, Write};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, error, info};

use super::decoder::Decoder;
use super::request::{Command, Reply, WorkerFault};
use super::session::Session;
use super::types::PixelRect;
use super::wire;
use super::{NoticeLink, SharedSession, StagingStore, TileStore};
use crate::gpu::SlotNotice;

/// The worker side of the engine. Owns the inbound half of the channel.
pub struct Worker<D: Decoder, R, W> {
    session: SharedSession<D>,
    tiles: TileStore,
    staging: StagingStore,
    notices: NoticeLink,
    reader: R,
    writer: W,
}

impl<D: Decoder, R: Read, W: Write> Worker<D, R, W> {
    pub fn new(
        session: SharedSession<D>,
        tiles: TileStore,
        staging: StagingStore,
        notices: NoticeLink,
        reader: R,
        writer: W,
    ) -> Self {
        Self {
            session,
            tiles,
            staging,
            notices,
            reader,
            writer,
        }
    }

    /// Runs until the controller closes the channel (`Ok`) or something fatal happens.
    pub fn run(mut self) -> Result<(), WorkerFault> {
        info!("worker started");
        let result = self.serve();
        match &result {
            Ok(()) => info!("controller closed the channel, worker exiting"),
            Err(e) => error!("worker stopped: {e}"),
        }
        result
    }

    fn serve(&mut self) -> Result<(), WorkerFault> {
        while let Some(line) = wire::read_frame(&mut self.reader)? {
            debug!("<- {line}");
            let command = Command::parse(&line)?;
            self.dispatch(command)?;
        }
        Ok(())
    }

    fn lock_session(session: &SharedSession<D>) -> MutexGuard<'_, Session<D>> {
        session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply(&mut self, reply: &Reply) -> Result<(), WorkerFault> {
        debug!("-> {reply}");
        wire::write_frame(&mut self.writer, &reply.to_string())?;
        Ok(())
    }

    fn replies(&mut self, replies: &[Reply]) -> Result<(), WorkerFault> {
        replies.iter().try_for_each(|r| self.reply(r))
    }

    /// Queues a notice for the render context. Without a live render context
    /// there are no slots to invalidate and the notice is dropped.
    fn notify(&self, notice: SlotNotice) {
        let link = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = link.as_ref() {
            if let Err(flume::SendError(notice)) = tx.send(notice) {
                debug!("no render context, dropped {notice:?}");
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<(), WorkerFault> {
        let session = Arc::clone(&self.session);

        match command {
            Command::Open { wthack, ack, path } => {
                {
                    let mut s = Self::lock_session(&session);
                    s.open_document(&path)?;
                    self.notify(SlotNotice::Unvalidate);
                }
                debug!("open acknowledged as {ack}");
                if !wthack {
                    self.reply(&Reply::Msg(format!("Opened {}", path.display())))?;
                }
            }

            Command::ColorSpace(colorspace) => {
                let mut s = Self::lock_session(&session);
                s.set_colorspace(colorspace);
                self.notify(SlotNotice::Unvalidate);
            }

            Command::FreePage(handle) => {
                Self::lock_session(&session).free_page(handle)?;
            }

            Command::FreeTile(handle) => {
                let tile = self
                    .tiles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(handle);
                let mut tile = tile.ok_or(WorkerFault::StaleHandle {
                    kind: "tile",
                    handle,
                })?;
                self.notify(SlotNotice::Unlink(handle));
                if let Some(buffer) = tile.take_staging() {
                    self.notify(SlotNotice::ReleaseStaging(buffer));
                }
            }

            Command::Geometry { width, height, fit } => {
                self.reply(&Reply::Clear)?;
                let replies = {
                    let mut s = Self::lock_session(&session);
                    if s.set_geometry(width, height, fit) {
                        self.notify(SlotNotice::Detach);
                    }
                    Self::layout_replies(&mut s)?
                };
                self.replies(&replies)?;
            }

            Command::ReqLayout {
                rotation,
                fit,
                height,
            } => {
                self.reply(&Reply::Clear)?;
                let replies = {
                    let mut s = Self::lock_session(&session);
                    s.set_layout(rotation, fit, height);
                    Self::layout_replies(&mut s)?
                };
                self.replies(&replies)?;
            }

            Command::Page { page_no, dim_index } => {
                let (handle, secs) = {
                    let mut s = Self::lock_session(&session);
                    let started = Instant::now();
                    let handle = s.load_page(page_no, dim_index)?;
                    (handle, started.elapsed().as_secs_f64())
                };
                self.reply(&Reply::Page { handle, secs })?;
            }

            Command::Tile {
                page,
                x,
                y,
                width,
                height,
                staging,
            } => {
                let buffer = match staging {
                    Some(handle) => Some(
                        self.staging
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(handle)
                            .ok_or(WorkerFault::StaleHandle {
                                kind: "staging",
                                handle,
                            })?,
                    ),
                    None => None,
                };

                let (tile, rejected, secs) = {
                    let mut s = Self::lock_session(&session);
                    let started = Instant::now();
                    let (tile, rejected) =
                        s.render_tile(page, PixelRect::new(x, y, width, height), buffer)?;
                    (tile, rejected, started.elapsed().as_secs_f64())
                };
                if let Some(buffer) = rejected {
                    self.notify(SlotNotice::ReleaseStaging(buffer));
                }

                let bytes = tile.byte_len();
                let handle = self
                    .tiles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(tile);
                self.reply(&Reply::Tile {
                    x,
                    y,
                    handle,
                    bytes,
                    secs,
                })?;
            }

            Command::SliceHeight(height) => {
                let mut s = Self::lock_session(&session);
                if s.set_slice_height(height) {
                    self.notify(SlotNotice::Forget);
                }
            }

            Command::Interrupt => {
                self.reply(&Reply::VMsg("interrupted".to_string()))?;
            }

            Command::TrimSet => debug!("trimset ignored"),
        }
        Ok(())
    }

    /// Relayout, outline and the closing `continue`, computed under the session lock.
    fn layout_replies(s: &mut Session<D>) -> Result<Vec<Reply>, WorkerFault> {
        let mut replies: Vec<Reply> = s
            .relayout()
            .iter()
            .map(|dim| Reply::PageDim {
                page_no: dim.page_no,
                width: dim.width,
                height: dim.height,
                left: dim.left,
            })
            .collect();
        replies.extend(s.outline()?.iter().map(|entry| Reply::Outline {
            level: entry.level,
            page_no: entry.page_no,
            title: entry.title.clone(),
        }));
        replies.push(Reply::Continue(s.page_count()));
        Ok(replies)
    }
}
