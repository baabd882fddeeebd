use std::io::Cursor;
use std::path::Path;

use image::{Rgb, RgbImage};
use pagetex::engine::{ColorSpace, Engine, Handle, ImageDocDecoder, Reply, wire};
use pagetex::gpu::{DrawRect, SoftwareGpu};
use pagetex::settings::EngineConfig;
use tempfile::TempDir;

fn replies(engine: &Engine<ImageDocDecoder>, commands: &[String]) -> Vec<Reply> {
    let mut input = Vec::new();
    for c in commands {
        wire::write_frame(&mut input, c).unwrap();
    }
    let mut output = Vec::new();
    engine
        .worker(Cursor::new(input), &mut output)
        .run()
        .unwrap();
    let mut cursor = Cursor::new(output);
    let mut out = Vec::new();
    while let Some(frame) = wire::read_frame(&mut cursor).unwrap() {
        out.push(frame.parse().unwrap());
    }
    out
}

fn two_tone(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgb([255, 0, 0])
        } else {
            Rgb([0, 0, 255])
        }
    });
    img.save(path).unwrap();
}

#[test]
fn image_directory_renders_through_the_engine() {
    let dir = TempDir::new().unwrap();
    two_tone(&dir.path().join("001.png"), 40, 20);
    RgbImage::from_pixel(20, 20, Rgb([0, 200, 0]))
        .save(dir.path().join("002.png"))
        .unwrap();

    let config = EngineConfig {
        slice_height: 8,
        colorspace: ColorSpace::Bgr,
        ..EngineConfig::default()
    };
    let engine = Engine::new(ImageDocDecoder::new(config.decode_cache_pages), &config);
    let mut ctx = engine.render_context(SoftwareGpu::new(80, 60));

    let out = replies(
        &engine,
        &[
            format!("open 0 0 {}", dir.path().display()),
            "geometry 80 60 0".to_string(),
        ],
    );
    assert!(matches!(&out[0], Reply::Msg(m) if m.starts_with("Opened ")));
    assert!(out.contains(&Reply::PageDim {
        page_no: 0,
        width: 80,
        height: 40,
        left: 0
    }));
    assert!(out.contains(&Reply::PageDim {
        page_no: 1,
        width: 80,
        height: 80,
        left: 0
    }));
    assert!(out.contains(&Reply::Outline {
        level: 0,
        page_no: 1,
        title: "002".into()
    }));
    assert_eq!(out.last(), Some(&Reply::Continue(2)));

    let out = replies(
        &engine,
        &[
            "page 0 0".to_string(),
            "tile 100000000 0 0 80 40".to_string(),
        ],
    );
    let tile: Handle = out
        .iter()
        .find_map(|r| match r {
            Reply::Tile { handle, bytes, .. } => {
                assert_eq!(*bytes, 80 * 40 * 3);
                Some(*handle)
            }
            _ => None,
        })
        .unwrap();

    ctx.begin_tiles();
    ctx.draw_tile(
        tile,
        DrawRect {
            dest_x: 0,
            dest_y: 10,
            width: 80,
            height: 40,
            tile_x: 0,
            tile_y: 0,
        },
    )
    .unwrap();
    ctx.end_tiles();

    let left = ctx.gpu().pixel(5, 30).unwrap();
    let right = ctx.gpu().pixel(75, 30).unwrap();
    assert!(left[0] > 200 && left[2] < 50, "{left:?}");
    assert!(right[2] > 200 && right[0] < 50, "{right:?}");
    assert_eq!(ctx.gpu().pixel(5, 5), Some([0xff; 3]));

    let png = dir.path().join("frame.png");
    ctx.gpu().save_png(&png).unwrap();
    assert_eq!(imagesize::size(&png).unwrap().width, 80);
}

#[test]
fn single_image_has_no_outline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("only.png");
    two_tone(&path, 10, 10);

    let engine = Engine::new(ImageDocDecoder::default(), &EngineConfig::default());
    let out = replies(
        &engine,
        &[
            format!("open 1 0 {}", path.display()),
            "geometry 10 10 2".to_string(),
        ],
    );
    assert!(!out.iter().any(|r| matches!(r, Reply::Outline { .. })));
    assert_eq!(
        out,
        vec![
            Reply::Clear,
            Reply::PageDim {
                page_no: 0,
                width: 10,
                height: 10,
                left: 0
            },
            Reply::Continue(1)
        ]
    );
}
