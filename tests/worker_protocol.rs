#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pagetex::engine::{
    Command, ControllerLink, Engine, FitMode, ProtocolError, Reply, Rotation, WorkerFault,
};
use pagetex::settings::EngineConfig;
use pagetex::test_utils::MockDecoder;

type Link = ControllerLink<UnixStream, UnixStream>;

fn start(decoder: MockDecoder) -> (Engine<MockDecoder>, Link, JoinHandle<Result<(), WorkerFault>>) {
    let engine = Engine::new(decoder, &EngineConfig::default());
    let (controller, worker_end) = UnixStream::pair().unwrap();
    let worker = engine
        .spawn_worker(worker_end.try_clone().unwrap(), worker_end)
        .unwrap();
    let link = ControllerLink::new(controller.try_clone().unwrap(), controller);
    (engine, link, worker)
}

fn open(link: &mut Link, path: &str) {
    link.send(&Command::Open {
        wthack: false,
        ack: 0,
        path: path.into(),
    })
    .unwrap();
    assert_eq!(link.recv().unwrap(), Reply::Msg(format!("Opened {path}")));
}

fn geometry(link: &mut Link, width: u32, height: u32, fit: FitMode) -> Vec<Reply> {
    link.send(&Command::Geometry { width, height, fit }).unwrap();
    assert_eq!(link.recv().unwrap(), Reply::Clear);
    let (last, replies) = link
        .recv_until(|r| matches!(r, Reply::Continue(_)))
        .unwrap();
    assert!(matches!(last, Reply::Continue(_)));
    replies
}

fn pdims(replies: &[Reply]) -> Vec<(usize, u32, u32, i32)> {
    replies
        .iter()
        .filter_map(|r| match *r {
            Reply::PageDim {
                page_no,
                width,
                height,
                left,
            } => Some((page_no, width, height, left)),
            _ => None,
        })
        .collect()
}

#[test]
fn full_session_over_a_socket() {
    let (engine, mut link, worker) = start(MockDecoder::with_pages(&[(800, 1000), (800, 1000)]));
    open(&mut link, "book.pdf");

    link.send(&Command::Geometry {
        width: 400,
        height: 300,
        fit: FitMode::Width,
    })
    .unwrap();
    assert_eq!(link.recv().unwrap(), Reply::Clear);
    assert_eq!(
        link.recv().unwrap(),
        Reply::PageDim {
            page_no: 0,
            width: 400,
            height: 500,
            left: 0
        }
    );
    assert_eq!(link.recv().unwrap(), Reply::Continue(2));

    link.send(&Command::Page {
        page_no: 1,
        dim_index: 0,
    })
    .unwrap();
    let Reply::Page { handle: page, .. } = link.recv().unwrap() else {
        panic!("expected a page reply");
    };

    link.send_raw(&format!("tile {page} 0 100 400 50")).unwrap();
    let Reply::Tile { x, y, handle, bytes, .. } = link.recv().unwrap() else {
        panic!("expected a tile reply");
    };
    assert_eq!((x, y, bytes), (0, 100, 400 * 50 * 3));

    let tiles = engine.tiles();
    {
        let tiles = tiles.lock().unwrap();
        let tile = tiles.get(handle).unwrap();
        assert_eq!(tile.page_no(), 1);
        assert_eq!(tile.slice_count(), 1);
    }

    link.send(&Command::FreeTile(handle)).unwrap();
    link.send(&Command::FreePage(page)).unwrap();
    link.send(&Command::Interrupt).unwrap();
    assert_eq!(link.recv().unwrap(), Reply::VMsg("interrupted".into()));
    assert!(tiles.lock().unwrap().is_empty());

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn fit_modes_over_mixed_page_sizes() {
    let (_engine, mut link, worker) = start(MockDecoder::with_pages(&[(500, 1000), (1000, 500)]));
    open(&mut link, "mixed");

    let width = pdims(&geometry(&mut link, 1000, 800, FitMode::Width));
    assert_eq!(width, vec![(0, 1000, 2000, 0), (1, 1000, 500, 0)]);

    let proportional = pdims(&geometry(&mut link, 1000, 800, FitMode::Proportional));
    assert_eq!(proportional, vec![(0, 500, 1000, 250), (1, 1000, 500, 0)]);

    let page = pdims(&geometry(&mut link, 1000, 800, FitMode::Page));
    assert_eq!(page, vec![(0, 400, 800, 300), (1, 1000, 500, 0)]);

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn reqlayout_rotation_swaps_axes_and_bumps_layout_twice() {
    let (engine, mut link, worker) = start(MockDecoder::with_pages(&[(800, 1000)]));
    open(&mut link, "doc");
    geometry(&mut link, 1000, 700, FitMode::Width);
    let before = engine.generations();

    link.send(&Command::ReqLayout {
        rotation: Rotation::from_degrees(90),
        fit: FitMode::Width,
        height: 700,
    })
    .unwrap();
    assert_eq!(link.recv().unwrap(), Reply::Clear);
    let (_, replies) = link
        .recv_until(|r| matches!(r, Reply::Continue(_)))
        .unwrap();
    assert_eq!(pdims(&replies), vec![(0, 1000, 800, 0)]);

    let after = engine.generations();
    assert_eq!(after.layout, before.layout + 2);
    assert_eq!(after.size, before.size + 1);
    assert_eq!(engine.try_page_dim(0).map(|d| d.height), Some(800));

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn page_handles_go_stale_after_a_resize() {
    let (engine, mut link, worker) = start(MockDecoder::with_pages(&[(100, 100)]));
    open(&mut link, "doc");
    geometry(&mut link, 100, 100, FitMode::Width);
    link.send(&Command::Page {
        page_no: 0,
        dim_index: 0,
    })
    .unwrap();
    let Reply::Page { handle, .. } = link.recv().unwrap() else {
        panic!("expected a page reply");
    };

    let session = engine.session();
    let current = |session: &pagetex::engine::SharedSession<MockDecoder>| {
        let s = session.lock().unwrap();
        s.page(handle).unwrap().is_current(&s.generations())
    };
    assert!(current(&session));

    geometry(&mut link, 100, 50, FitMode::Width);
    assert!(current(&session), "height-only change keeps page sizes");

    geometry(&mut link, 60, 50, FitMode::Width);
    assert!(!current(&session));

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn outline_follows_every_layout() {
    let decoder = MockDecoder::with_pages(&[(10, 10); 2]).outline(vec![
        pagetex::engine::OutlineNode::page("Chapter", 1),
    ]);
    let (_engine, mut link, worker) = start(decoder);
    open(&mut link, "doc");

    let chapter = Reply::Outline {
        level: 0,
        page_no: 1,
        title: "Chapter".into(),
    };
    let first = geometry(&mut link, 10, 10, FitMode::Width);
    assert!(first.contains(&chapter));
    let second = geometry(&mut link, 20, 10, FitMode::Width);
    assert!(second.contains(&chapter));

    link.send(&Command::ReqLayout {
        rotation: Rotation::from_degrees(180),
        fit: FitMode::Page,
        height: 10,
    })
    .unwrap();
    assert_eq!(link.recv().unwrap(), Reply::Clear);
    let (_, replies) = link
        .recv_until(|r| matches!(r, Reply::Continue(_)))
        .unwrap();
    assert!(replies.contains(&chapter));

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn slow_tile_holds_the_session_until_it_replies() {
    let decoder = MockDecoder::with_pages(&[(100, 100)])
        .decode_steps(20)
        .pump_delay(Duration::from_millis(25));
    let (engine, mut link, worker) = start(decoder);
    open(&mut link, "doc");
    geometry(&mut link, 100, 100, FitMode::Width);
    assert!(engine.try_page_dim(0).is_some());

    link.send(&Command::Page {
        page_no: 0,
        dim_index: 0,
    })
    .unwrap();
    let Reply::Page { handle: page, .. } = link.recv().unwrap() else {
        panic!("expected a page reply");
    };

    link.send_raw(&format!("tile {page} 0 0 10 10")).unwrap();
    link.send(&Command::Interrupt).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_busy = false;
    while Instant::now() < deadline {
        if engine.try_page_dim(0).is_none() {
            saw_busy = true;
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(saw_busy, "session never locked during the tile render");

    // The interrupt queued behind the tile is answered only after it.
    assert!(matches!(link.recv().unwrap(), Reply::Tile { .. }));
    assert_eq!(link.recv().unwrap(), Reply::VMsg("interrupted".into()));
    assert!(engine.try_page_dim(0).is_some());

    drop(link);
    worker.join().unwrap().unwrap();
}

#[test]
fn failed_open_ends_the_worker() {
    let (_engine, mut link, worker) = start(MockDecoder::with_pages(&[(10, 10)]).failing_open());
    link.send(&Command::Open {
        wthack: false,
        ack: 0,
        path: Path::new("missing.pdf").into(),
    })
    .unwrap();
    assert!(matches!(link.recv(), Err(ProtocolError::Closed)));
    assert!(matches!(
        worker.join().unwrap(),
        Err(WorkerFault::Decode(_))
    ));
}

#[test]
fn zero_length_frame_is_fatal() {
    let (_engine, mut link, worker) = start(MockDecoder::default());
    link.send(&Command::Interrupt).unwrap();
    assert_eq!(link.recv().unwrap(), Reply::VMsg("interrupted".into()));
    link.send_raw("").unwrap();
    assert!(matches!(
        worker.join().unwrap(),
        Err(WorkerFault::Protocol(ProtocolError::EmptyFrame))
    ));
}
