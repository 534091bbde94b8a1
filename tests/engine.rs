// End-to-end checks of the engine through its public API: undo history laws,
// pixel-area walks, curves files and per-precision dispatch.

use cinetile::canvas::{Canvas, Storage};
use cinetile::drawable::{DrawableId, FillType};
use cinetile::ops::curves::{self, CurveChannel, CurvesConfig, POINTS};
use cinetile::ops::histogram::HistogramChannel;
use cinetile::ops::levels::{self, LevelsParams};
use cinetile::pixelarea::{self, PixelArea};
use cinetile::project::Project;
use cinetile::settings::EngineSettings;
use cinetile::tag::{Alpha, Format, Precision, Tag};
use cinetile::undo::UndoKind;

fn settings(levels: usize, tile: u32) -> EngineSettings {
    EngineSettings { levels_of_undo: levels, tile_size: tile, ..EngineSettings::default() }
}

fn gray_project(w: u32, h: u32, levels: usize) -> (Project, DrawableId) {
    let p = Project::with_background(w, h, Format::Gray, Precision::U8, FillType::Black, settings(levels, 4)).unwrap();
    let id = p.active_layer().unwrap().id();
    (p, id)
}

fn pixels(p: &Project, id: DrawableId) -> Vec<u8> {
    p.drawable(id).unwrap().data().to_raw()
}

fn gray(v: f32) -> FillType {
    FillType::Color([v, v, v, 1.0])
}

/// Small deterministic generator so the sequences below are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, n: u32) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) % n as u64) as u32
    }
}

// ---- undo ------------------------------------------------------------------

#[test]
fn four_by_four_snapshot_undo_redo() {
    let (mut p, id) = gray_project(4, 4, 4);
    assert!(p.apply_image(id, 0, 0, 2, 2).unwrap());
    {
        let canvas = p.drawable_mut(id).unwrap().data_mut();
        for y in 0..2 {
            for x in 0..2 {
                canvas.put_pixel(x, y, &[255]).unwrap();
            }
        }
    }

    assert!(p.undo().unwrap());
    assert!(pixels(&p, id).iter().all(|&v| v == 0));

    assert!(p.redo().unwrap());
    let canvas = p.drawable(id).unwrap().data();
    for y in 0..4 {
        for x in 0..4 {
            let expected = if x < 2 && y < 2 { 255 } else { 0 };
            assert_eq!(canvas.get_pixel(x, y), Some(&[expected][..]), "pixel ({x}, {y})");
        }
    }
}

#[test]
fn undo_then_redo_walks_back_through_every_state() {
    let (mut p, id) = gray_project(11, 7, 32);
    let mut rng = Lcg(7);

    // Interleave pushes with pops; a pop followed by a push drops the
    // redo branch, so `states` tracks only the live history.
    let mut states = vec![pixels(&p, id)];
    for step in 0..12 {
        if step % 5 == 4 {
            assert!(p.undo().unwrap());
            states.pop();
            assert_eq!(&pixels(&p, id), states.last().unwrap());
            continue;
        }
        let (x, y) = (rng.next(10), rng.next(6));
        let (w, h) = (1 + rng.next(11 - x), 1 + rng.next(7 - y));
        p.fill_region(id, x, y, w, h, gray(rng.next(256) as f32 / 255.0)).unwrap();
        states.push(pixels(&p, id));
    }

    let n = states.len() - 1;
    for i in (0..n).rev() {
        assert!(p.undo().unwrap());
        assert_eq!(pixels(&p, id), states[i], "after undoing to state {i}");
    }
    assert!(!p.undo().unwrap());

    for state in states.iter().skip(1) {
        assert!(p.redo().unwrap());
        assert_eq!(&pixels(&p, id), state);
    }
    assert!(!p.redo().unwrap());
}

#[test]
fn history_never_exceeds_levels_of_undo() {
    let (mut p, id) = gray_project(8, 8, 3);
    for v in 1..=10u8 {
        p.fill_region(id, 0, 0, 8, 8, gray(v as f32 / 255.0)).unwrap();
        assert!(p.undo.undo_levels() <= 3);
    }
    let mut undone = 0;
    while p.undo().unwrap() {
        undone += 1;
    }
    assert_eq!(undone, 3);
    // The oldest surviving snapshot is the state before the eighth fill.
    assert!(pixels(&p, id).iter().all(|&v| v == 7));
}

#[test]
fn group_undo_matches_individual_undos() {
    let ops = [(0, 0, 4, 4, 0.2), (2, 2, 4, 4, 0.6), (1, 3, 6, 2, 1.0)];

    let (mut grouped, gid) = gray_project(8, 8, 8);
    let (mut single, sid) = gray_project(8, 8, 8);
    grouped.fill_region(gid, 0, 0, 8, 8, gray(0.4)).unwrap();
    single.fill_region(sid, 0, 0, 8, 8, gray(0.4)).unwrap();

    grouped.undo.push_group_start(UndoKind::Misc).unwrap();
    for (x, y, w, h, v) in ops {
        grouped.fill_region(gid, x, y, w, h, gray(v)).unwrap();
        single.fill_region(sid, x, y, w, h, gray(v)).unwrap();
    }
    grouped.undo.push_group_end().unwrap();
    assert_eq!(pixels(&grouped, gid), pixels(&single, sid));
    assert_eq!(grouped.undo.undo_levels(), 2);

    assert!(grouped.undo().unwrap());
    for _ in 0..ops.len() {
        assert!(single.undo().unwrap());
    }
    assert_eq!(pixels(&grouped, gid), pixels(&single, sid));

    assert!(grouped.redo().unwrap());
    for _ in 0..ops.len() {
        assert!(single.redo().unwrap());
    }
    assert_eq!(pixels(&grouped, gid), pixels(&single, sid));
}

// ---- pixel areas -------------------------------------------------------------

#[test]
fn walks_cover_rectangles_exactly_once() {
    let tag = Tag::new(Precision::U8, Format::Gray, Alpha::No);
    let mut rng = Lcg(42);
    for tile in [1, 3, 4, 16, 64] {
        let (w, h) = (5 + rng.next(40), 5 + rng.next(40));
        let canvas = Canvas::with_tile_size(tag, w, h, Storage::Tiled, tile).unwrap();
        let flat = Canvas::new(tag, w, h, Storage::Flat).unwrap();
        let (x, y) = (rng.next(w), rng.next(h));
        let (rw, rh) = (1 + rng.next(w - x), 1 + rng.next(h - y));
        let a = PixelArea::new(&canvas, x, y, rw, rh);
        let b = PixelArea::new(&flat, 0, 0, rw, rh);

        let mut seen = vec![0u8; (rw * rh) as usize];
        let mut last = None;
        for c in pixelarea::chunks(&[a.spec(), b.spec()]) {
            if let Some(prev) = last {
                assert!((c.dy, c.dx) > prev, "chunks out of row-major order");
            }
            last = Some((c.dy, c.dx));
            for yy in c.dy..c.dy + c.height {
                for xx in c.dx..c.dx + c.width {
                    seen[(yy * rw + xx) as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1), "tile size {tile}");
    }
}

// ---- curves ------------------------------------------------------------------

#[test]
fn curves_files_round_trip_sampled_tables() {
    let mut rng = Lcg(3);
    for _ in 0..8 {
        let mut cfg = CurvesConfig::default();
        for ch in CurveChannel::ALL {
            for i in 0..POINTS {
                if rng.next(3) == 0 {
                    cfg.set_point(ch, i, -1, -1);
                } else {
                    cfg.set_point(ch, i, rng.next(256) as i32, rng.next(256) as i32);
                }
            }
        }
        let mut buf = Vec::new();
        cfg.write_to(&mut buf).unwrap();
        let back = CurvesConfig::read_from(&buf[..]).unwrap();
        assert_eq!(back.points, cfg.points);
    }
}

#[test]
fn curves_file_applies_through_the_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invert.curves");
    let mut cfg = CurvesConfig::default();
    cfg.set_point(CurveChannel::Value, 0, 0, 255);
    cfg.set_point(CurveChannel::Value, POINTS - 1, 255, 0);
    cfg.save(&path).unwrap();

    let (mut p, id) = gray_project(6, 5, 4);
    let loaded = CurvesConfig::load(&path).unwrap();
    curves::apply_curves(&mut p, id, &loaded).unwrap();
    assert!(pixels(&p, id).iter().all(|&v| v == 255));
    p.undo().unwrap();
    assert!(pixels(&p, id).iter().all(|&v| v == 0));
}

// ---- precision dispatch ------------------------------------------------------------

#[test]
fn every_precision_dispatches_deterministically() {
    for precision in Precision::ALL {
        let tag = Tag::new(precision, Format::Rgb, Alpha::Yes);
        assert_eq!(levels::levels_funcs(tag), levels::levels_funcs(tag), "{precision:?}");
        assert_eq!(curves::curves_funcs(tag), curves::curves_funcs(tag), "{precision:?}");

        let mut params = LevelsParams::new(precision);
        params.set_channel(HistogramChannel::Value, 0.1, 0.8, 1.4, 0.0, 1.0);
        params.set_channel(HistogramChannel::Red, 0.0, 1.0, 0.7, 0.1, 0.9);
        let mut cfg = CurvesConfig::default();
        cfg.set_point(CurveChannel::Green, 8, 128, 200);

        let run = || {
            let fill = FillType::Color([0.25, 0.5, 0.75, 1.0]);
            let mut p = Project::with_background(9, 6, Format::Rgb, precision, fill, settings(4, 4)).unwrap();
            let id = p.active_layer().unwrap().id();
            p.fill_region(id, 2, 1, 4, 3, FillType::Color([0.9, 0.1, 0.4, 0.5])).unwrap();
            levels::apply_levels(&mut p, id, &params).unwrap();
            curves::apply_curves(&mut p, id, &cfg).unwrap();
            pixels(&p, id)
        };
        assert_eq!(run(), run(), "{precision:?}");
    }
}

#[test]
fn auto_levels_is_undoable_at_every_precision() {
    for precision in Precision::ALL {
        let mut p =
            Project::with_background(16, 4, Format::Gray, precision, gray(0.3), settings(8, 4)).unwrap();
        let id = p.active_layer().unwrap().id();
        p.fill_region(id, 0, 0, 4, 4, gray(0.7)).unwrap();
        let before = pixels(&p, id);
        levels::auto_levels(&mut p, id).unwrap();
        assert_ne!(pixels(&p, id), before, "{precision:?}");
        p.undo().unwrap();
        assert_eq!(pixels(&p, id), before, "{precision:?}");
    }
}
