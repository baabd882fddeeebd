use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagetex::engine::{Engine, FitMode, ImageDocDecoder};
use pagetex::panic_handler;
use pagetex::settings::{self, EngineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "pagetex",
    version,
    about = "Background layout and tile rendering engine for paginated documents"
)]
struct Args {
    /// Configuration file (defaults to the per-user config)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log file
    #[arg(long, global = true, value_name = "PATH", default_value = "pagetex.log")]
    log_file: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the worker on stdin/stdout, with image files or directories as documents
    Serve,

    /// Lay out a document and composite one page into a PNG
    Render {
        /// Image file or directory of images
        document: PathBuf,

        #[arg(short, long, value_name = "PATH", default_value = "page.png")]
        output: PathBuf,

        /// Page to render (0-indexed)
        #[arg(long, default_value_t = 0)]
        page: usize,

        #[arg(long, default_value_t = 800)]
        width: u32,

        #[arg(long, default_value_t = 1000)]
        height: u32,

        #[arg(long, value_enum)]
        fit: Option<FitArg>,

        /// Edge length of the square tiles requested from the worker
        #[arg(long, default_value_t = 256)]
        tile_size: usize,
    },

    /// Write the default configuration file
    InitConfig,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FitArg {
    Width,
    Proportional,
    Page,
}

impl From<FitArg> for FitMode {
    fn from(fit: FitArg) -> Self {
        match fit {
            FitArg::Width => FitMode::Width,
            FitArg::Proportional => FitMode::Proportional,
            FitArg::Page => FitMode::Page,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    WriteLogger::init(
        args.log_level.into(),
        Config::default(),
        File::create(&args.log_file)
            .with_context(|| format!("create log file {}", args.log_file.display()))?,
    )?;
    panic_handler::initialize_panic_handler();

    info!("Starting pagetex {}", env!("CARGO_PKG_VERSION"));

    let result = match args.command {
        Mode::InitConfig => init_config(args.config.as_deref()),
        Mode::Serve => {
            let config = settings::load_config(args.config.as_deref())?;
            serve(&config)
        }
        Mode::Render {
            document,
            output,
            page,
            width,
            height,
            fit,
            tile_size,
        } => {
            let config = settings::load_config(args.config.as_deref())?;
            let fit = fit.map(FitMode::from).unwrap_or(config.fit_mode);
            render::run(
                &config,
                &render::Job {
                    document,
                    output,
                    page,
                    width,
                    height,
                    fit,
                    tile_size: tile_size.max(1),
                },
            )
        }
    };

    if let Err(err) = &result {
        error!("{err:?}");
    }
    info!("Shutting down pagetex");
    result
}

fn init_config(explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(settings::preferred_config_path)
        .ok_or_else(|| anyhow!("no configuration directory on this system"))?;
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    settings::save_config_to_file(&EngineConfig::default(), &path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn serve(config: &EngineConfig) -> Result<()> {
    let engine = Engine::new(ImageDocDecoder::new(config.decode_cache_pages), config);
    let reader = BufReader::new(io::stdin().lock());
    let writer = BufWriter::new(io::stdout().lock());
    engine.worker(reader, writer).run()?;
    Ok(())
}

mod render {
    use std::path::PathBuf;
    use std::time::Instant;

    use anyhow::{Context, Result, anyhow, bail};
    use log::{debug, info, warn};

    use pagetex::engine::{Command, ControllerLink, Engine, FitMode, Handle, ImageDocDecoder, Reply};
    use pagetex::gpu::{DrawRect, RenderContext, SoftwareGpu};
    use pagetex::settings::EngineConfig;

    pub struct Job {
        pub document: PathBuf,
        pub output: PathBuf,
        pub page: usize,
        pub width: u32,
        pub height: u32,
        pub fit: FitMode,
        pub tile_size: usize,
    }

    struct PlacedTile {
        handle: Handle,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    }

    #[cfg(unix)]
    pub fn run(config: &EngineConfig, job: &Job) -> Result<()> {
        use std::os::unix::net::UnixStream;

        let started = Instant::now();
        let engine = Engine::new(ImageDocDecoder::new(config.decode_cache_pages), config);
        let (controller, worker_end) = UnixStream::pair().context("create worker channel")?;
        let worker = engine.spawn_worker(worker_end.try_clone()?, worker_end)?;
        let mut link = ControllerLink::new(controller.try_clone()?, controller);
        let mut ctx = engine.render_context(SoftwareGpu::new(
            job.width as usize,
            job.height as usize,
        ));

        let drawn = drive(&mut link, &mut ctx, config, job);

        // Closing the link ends the worker loop
        drop(link);
        let worker_result = worker
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))?;
        let placed = drawn?;
        worker_result.context("worker failed")?;

        ctx.gpu()
            .save_png(&job.output)
            .with_context(|| format!("write {}", job.output.display()))?;
        info!(
            "page {} of {} composited from {placed} tiles into {} in {:.3}s",
            job.page,
            job.document.display(),
            job.output.display(),
            started.elapsed().as_secs_f64()
        );
        println!("{}", job.output.display());
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn run(_config: &EngineConfig, _job: &Job) -> Result<()> {
        bail!("render needs Unix domain sockets")
    }

    fn drive<R, W>(
        link: &mut ControllerLink<R, W>,
        ctx: &mut RenderContext<SoftwareGpu>,
        config: &EngineConfig,
        job: &Job,
    ) -> Result<usize>
    where
        R: std::io::Read,
        W: std::io::Write,
    {
        let colorspace = config.colorspace;
        link.send(&Command::Open {
            wthack: false,
            ack: 0,
            path: job.document.clone(),
        })?;
        link.send(&Command::ColorSpace(colorspace))?;
        link.send(&Command::SliceHeight(config.slice_height))?;
        link.send(&Command::Geometry {
            width: job.width,
            height: job.height,
            fit: job.fit,
        })?;

        let (_, replies) = link
            .recv_until(|r| matches!(r, Reply::Continue(_)))
            .context("waiting for layout")?;
        let mut dims = Vec::new();
        for reply in replies {
            match reply {
                Reply::PageDim {
                    page_no,
                    width,
                    height,
                    left,
                } => dims.push((page_no, width, height, left)),
                Reply::Msg(text) => info!("worker: {text}"),
                Reply::Outline { level, page_no, title } => {
                    debug!("outline {level} {page_no} {title}");
                }
                other => debug!("skipped {other}"),
            }
        }

        let dim_index = dims
            .iter()
            .rposition(|&(first, ..)| first <= job.page)
            .ok_or_else(|| anyhow!("document has no page {}", job.page))?;
        let (_, page_width, page_height, left) = dims[dim_index];
        let page_width = page_width as usize;
        let page_height = (page_height as usize).min(job.height as usize);

        link.send(&Command::Page {
            page_no: job.page,
            dim_index,
        })?;
        let Reply::Page { handle: page, secs } = link.recv()? else {
            bail!("unexpected reply to page request");
        };
        debug!("page {page} loaded in {secs:.6}");

        let mut placed = Vec::new();
        for y in (0..page_height).step_by(job.tile_size) {
            for x in (0..page_width).step_by(job.tile_size) {
                let width = job.tile_size.min(page_width - x);
                let height = job.tile_size.min(page_height - y);
                let staging = ctx.acquire_staging(width, height, colorspace);
                link.send(&Command::Tile {
                    page,
                    x,
                    y,
                    width,
                    height,
                    staging,
                })?;
                let Reply::Tile { handle, bytes, .. } = link.recv()? else {
                    bail!("unexpected reply to tile request");
                };
                debug!("tile {handle} at {x},{y} holds {bytes} bytes");
                placed.push(PlacedTile {
                    handle,
                    x,
                    y,
                    width,
                    height,
                });
            }
        }

        ctx.begin_tiles();
        for tile in &placed {
            let rect = DrawRect {
                dest_x: left + tile.x as i32,
                dest_y: tile.y as i32,
                width: tile.width,
                height: tile.height,
                tile_x: 0,
                tile_y: 0,
            };
            if let Err(e) = ctx.draw_tile(tile.handle, rect) {
                warn!("tile {} not drawn: {e}", tile.handle);
            }
        }
        ctx.end_tiles();

        for tile in &placed {
            link.send(&Command::FreeTile(tile.handle))?;
        }
        link.send(&Command::FreePage(page))?;
        link.send(&Command::Interrupt)?;
        link.recv_until(|r| matches!(r, Reply::VMsg(_)))?;
        ctx.drain_notices();
        Ok(placed.len())
    }
}
