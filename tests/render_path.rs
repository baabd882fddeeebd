use std::io::Cursor;

use pagetex::engine::{ColorSpace, Engine, Handle, wire};
use pagetex::gpu::{DrawRect, RenderContext, RenderError, SoftwareGpu, UploadKind};
use pagetex::settings::EngineConfig;
use pagetex::test_utils::{MockDecoder, mock_pixel, mock_rgb};

/// Runs `commands` through a worker to completion and returns its replies.
fn drive(engine: &Engine<MockDecoder>, commands: &[String]) -> Vec<String> {
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
    let mut replies = Vec::new();
    while let Some(frame) = wire::read_frame(&mut cursor).unwrap() {
        replies.push(frame);
    }
    replies
}

fn tile_handles(replies: &[String]) -> Vec<Handle> {
    replies
        .iter()
        .filter(|r| r.starts_with("tile "))
        .map(|r| {
            let token = r.split_whitespace().nth(3).unwrap();
            Handle::from_wire(Handle::parse_hex(token).unwrap()).unwrap()
        })
        .collect()
}

fn config(texture_count: usize, colorspace: ColorSpace) -> EngineConfig {
    EngineConfig {
        texture_count,
        colorspace,
        ..EngineConfig::default()
    }
}

fn setup(slice_height: usize, tile: &str) -> Vec<String> {
    vec![
        "open 1 0 doc".to_string(),
        format!("sliceh {slice_height}"),
        "geometry 64 64 0".to_string(),
        "page 0 0".to_string(),
        tile.to_string(),
    ]
}

fn draw(ctx: &mut RenderContext<SoftwareGpu>, tile: Handle, rect: DrawRect) {
    ctx.begin_tiles();
    ctx.draw_tile(tile, rect).unwrap();
    ctx.end_tiles();
}

fn whole(x: i32, y: i32, width: usize, height: usize) -> DrawRect {
    DrawRect {
        dest_x: x,
        dest_y: y,
        width,
        height,
        tile_x: 0,
        tile_y: 0,
    }
}

#[test]
fn composited_tile_matches_decoder_pixels() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(8, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(4, "tile 100000000 8 8 16 10"));
    let tile = tile_handles(&replies)[0];

    draw(&mut ctx, tile, whole(8, 8, 16, 10));

    for y in 0..10 {
        for x in 0..16 {
            assert_eq!(
                ctx.gpu().pixel(8 + x, 8 + y),
                Some(mock_rgb(0, 8 + x, 8 + y)),
                "pixel {x},{y}"
            );
        }
    }
    assert_eq!(ctx.gpu().pixel(7, 8), Some([0xff; 3]));
    // 10 rows in slices of 4: 4 + 4 + 2
    assert_eq!(ctx.gpu().quads().len(), 3);
}

#[test]
fn bgr_and_grey_tiles_composite_to_rgb() {
    for colorspace in [ColorSpace::Bgr, ColorSpace::Grey] {
        let engine = Engine::new(MockDecoder::with_pages(&[(64, 64)]), &config(4, colorspace));
        let mut ctx = engine.render_context(SoftwareGpu::new(32, 32));
        let replies = drive(&engine, &setup(8, "tile 100000000 0 0 8 8"));
        let tile = tile_handles(&replies)[0];
        assert!(replies.iter().any(|r| r.contains(&format!(
            " {} ",
            8 * 8 * colorspace.channels()
        ))));

        draw(&mut ctx, tile, whole(0, 0, 8, 8));
        let expected = match colorspace {
            ColorSpace::Grey => {
                let v = mock_pixel(0, 5, 3, ColorSpace::Grey)[0];
                [v, v, v]
            }
            _ => mock_rgb(0, 5, 3),
        };
        assert_eq!(ctx.gpu().pixel(5, 3), Some(expected), "{colorspace:?}");
    }
}

#[test]
fn slots_are_claimed_round_robin() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(2, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(4, "tile 100000000 0 0 8 12"));
    let tile = tile_handles(&replies)[0];

    assert_eq!(ctx.upload_slice(tile, 0).unwrap(), UploadKind::Full);
    assert_eq!(ctx.upload_slice(tile, 1).unwrap(), UploadKind::Full);
    // Third slice evicts the first one from slot 0, reusing its storage.
    assert_eq!(ctx.upload_slice(tile, 2).unwrap(), UploadKind::Partial);
    assert_eq!(ctx.slots().resident(0).map(|k| k.index), Some(2));
    assert_eq!(ctx.slots().resident(1).map(|k| k.index), Some(1));

    assert_eq!(ctx.upload_slice(tile, 1).unwrap(), UploadKind::Bound);
    assert_eq!(ctx.upload_slice(tile, 0).unwrap(), UploadKind::Partial);
    assert_eq!(ctx.slots().resident(1).map(|k| k.index), Some(0));
    assert_eq!(ctx.slots().cursor(), 4);
}

#[test]
fn redraw_only_binds_resident_slices() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(8, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(4, "tile 100000000 0 0 16 16"));
    let tile = tile_handles(&replies)[0];

    draw(&mut ctx, tile, whole(0, 0, 16, 16));
    let first = ctx.slots().stats();
    assert_eq!(first.full_uploads, 4);

    draw(&mut ctx, tile, whole(0, 0, 16, 16));
    let second = ctx.slots().stats();
    assert_eq!(second.full_uploads, 4);
    assert_eq!(second.partial_uploads, 0);
    assert_eq!(second.binds, 4);
    assert_eq!(ctx.gpu().stats().image_uploads, 4);
}

#[test]
fn freed_tile_vacates_its_slots() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(8, "tile 100000000 0 0 8 8"));
    let tile = tile_handles(&replies)[0];
    draw(&mut ctx, tile, whole(0, 0, 8, 8));
    assert!(ctx.slots().resident(0).is_some());

    drive(&engine, &[format!("freetile {tile}")]);
    ctx.drain_notices();
    assert!(ctx.slots().resident(0).is_none());
    assert!(matches!(
        ctx.draw_tile(tile, whole(0, 0, 8, 8)),
        Err(RenderError::UnknownTile(_))
    ));
}

#[test]
fn width_change_forces_reupload_on_next_draw() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(8, "tile 100000000 0 0 8 8"));
    let tile = tile_handles(&replies)[0];
    draw(&mut ctx, tile, whole(0, 0, 8, 8));

    drive(&engine, &["geometry 32 64 0".to_string()]);
    assert_ne!(ctx.upload_slice(tile, 0).unwrap(), UploadKind::Bound);
}

#[test]
fn draw_beyond_tile_is_rejected() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    let replies = drive(&engine, &setup(4, "tile 100000000 0 0 8 8"));
    let tile = tile_handles(&replies)[0];

    let rect = DrawRect {
        tile_y: 4,
        ..whole(0, 0, 8, 8)
    };
    assert!(matches!(
        ctx.draw_tile(tile, rect),
        Err(RenderError::GeometryMismatch { .. })
    ));
}

#[test]
fn staged_tile_renders_into_the_staging_buffer() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(64, 64));
    assert!(ctx.staging_available());
    let staging = ctx.acquire_staging(8, 8, ColorSpace::Rgb).unwrap();

    let replies = drive(
        &engine,
        &setup(4, &format!("tile 100000000 16 16 8 8 {staging}")),
    );
    let tile = tile_handles(&replies)[0];
    assert!(engine.tiles().lock().unwrap().get(tile).unwrap().is_staged());

    draw(&mut ctx, tile, whole(0, 0, 8, 8));
    assert_eq!(ctx.gpu().pixel(2, 6), Some(mock_rgb(0, 18, 22)));
    assert_eq!(ctx.gpu().live_buffers(), 1);

    drive(&engine, &[format!("freetile {tile}")]);
    ctx.drain_notices();
    assert_eq!(ctx.gpu().live_buffers(), 0);
}

#[test]
fn staging_disabled_without_buffer_objects() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(8, 8).without_buffer_objects());
    assert!(!ctx.staging_available());
    assert!(ctx.acquire_staging(8, 8, ColorSpace::Rgb).is_none());

    let replies = drive(&engine, &setup(8, "tile 100000000 0 0 8 8 0"));
    let tile = tile_handles(&replies)[0];
    assert!(!engine.tiles().lock().unwrap().get(tile).unwrap().is_staged());
    draw(&mut ctx, tile, whole(0, 0, 8, 8));
    assert_eq!(ctx.gpu().pixel(1, 1), Some(mock_rgb(0, 1, 1)));
}

#[test]
fn texture_pool_resizes() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut ctx = engine.render_context(SoftwareGpu::new(8, 8));
    assert_eq!(ctx.gpu().live_textures(), 4);
    ctx.realloc_textures(2);
    assert_eq!(ctx.gpu().live_textures(), 2);
    ctx.realloc_textures(6);
    assert_eq!(ctx.gpu().live_textures(), 6);
    drop(ctx);
}

#[test]
fn notices_are_dropped_without_a_render_context() {
    let engine = Engine::new(
        MockDecoder::with_pages(&[(64, 64)]),
        &config(4, ColorSpace::Rgb),
    );
    let mut commands = vec!["open 1 0 doc".to_string()];
    for i in 0..100 {
        commands.push(format!("geometry {} 100 0", 64 + i));
        commands.push("cs 0".to_string());
    }
    drive(&engine, &commands);
    assert_eq!(engine.pending_notices(), 0);

    let mut ctx = engine.render_context(SoftwareGpu::new(8, 8));
    drive(&engine, &["geometry 32 100 0".to_string(), "cs 1".to_string()]);
    assert_eq!(engine.pending_notices(), 2);
    assert_eq!(ctx.drain_notices(), 2);
    assert_eq!(engine.pending_notices(), 0);

    // A torn down context stops collecting notices too.
    drop(ctx);
    drive(&engine, &["cs 2".to_string(), "sliceh 16".to_string()]);
    assert_eq!(engine.pending_notices(), 0);
}
