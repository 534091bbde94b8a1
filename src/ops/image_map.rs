//! Apply a per-pixel kernel to a drawable with preview and undo.
//!
//! The original pixels of the affected region are copied once, on the first
//! [`ImageMap::apply`]. Every apply reads from that copy, writes the
//! drawable's shadow and merges it back, so repeated applies (live preview
//! with changing parameters) never compound. [`ImageMap::commit`] records the
//! copy as one undo step; [`ImageMap::abort`] or dropping the map restores it.

use crate::canvas::{Canvas, Storage};
use crate::drawable::DrawableId;
use crate::error::ImageError;
use crate::pixelarea::{self, ChunkMut, ChunkRef, PixelArea, PixelAreaMut};
use crate::project::{Bounds, Project};

pub struct ImageMap<'p> {
    project: &'p mut Project,
    drawable: DrawableId,
    bounds: Bounds,
    undo_tiles: Option<Canvas>,
    finished: bool,
}

impl<'p> ImageMap<'p> {
    /// Bind to `id` over its mask bounds.
    pub fn new(project: &'p mut Project, id: DrawableId) -> Result<Self, ImageError> {
        project.drawable(id)?;
        let bounds = project.mask_bounds(id).ok_or(ImageError::EmptySelection)?;
        Ok(Self { project, drawable: id, bounds, undo_tiles: None, finished: false })
    }

    pub fn drawable(&self) -> DrawableId {
        self.drawable
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn size(&self) -> (u32, u32) {
        let (x1, y1, x2, y2) = self.bounds;
        (x2 - x1, y2 - y1)
    }

    fn ensure_undo_tiles(&mut self) -> Result<(), ImageError> {
        if self.undo_tiles.is_some() {
            return Ok(());
        }
        let (x1, y1, _, _) = self.bounds;
        let (w, h) = self.size();
        let d = self.project.drawable(self.drawable)?;
        let mut tiles = Canvas::with_tile_size(d.tag(), w, h, Storage::Tiled, self.project.settings.tile_size)?;
        let src = PixelArea::new(d.data(), x1, y1, w, h);
        let mut dest = PixelAreaMut::new(&mut tiles, 0, 0, w, h, false);
        pixelarea::copy_area(&src, &mut dest)?;
        self.undo_tiles = Some(tiles);
        Ok(())
    }

    /// Run `kernel` over the region: source chunks come from the original
    /// pixels, destination chunks from the shadow, which is then merged.
    pub fn apply<F>(&mut self, mut kernel: F) -> Result<(), ImageError>
    where
        F: FnMut(&ChunkRef<'_>, &mut ChunkMut<'_>),
    {
        self.ensure_undo_tiles()?;
        let (x1, y1, _, _) = self.bounds;
        let (w, h) = self.size();
        let Some(undo) = self.undo_tiles.as_ref() else {
            return Ok(());
        };
        let d = self.project.drawable_mut(self.drawable)?;
        {
            let shadow = d.shadow()?;
            let src = PixelArea::new(undo, 0, 0, w, h);
            let mut dest = PixelAreaMut::new(shadow, x1, y1, w, h, true);
            for c in pixelarea::chunks(&[src.spec(), dest.spec()]) {
                let s = src.chunk(&c);
                let mut out = dest.chunk_mut(&c)?;
                kernel(&s, &mut out);
            }
        }
        d.merge_shadow(x1, y1, w, h)?;
        Ok(())
    }

    /// Keep the result and record one undo step for the region.
    pub fn commit(mut self) -> Result<(), ImageError> {
        self.finished = true;
        let Some(tiles) = self.undo_tiles.take() else {
            return Ok(());
        };
        let (x1, y1, x2, y2) = self.bounds;
        self.project.drawable_mut(self.drawable)?.discard_shadow();
        self.project
            .apply_image_mod(self.drawable, x1 as i32, y1 as i32, x2 as i32, y2 as i32, tiles)?;
        Ok(())
    }

    /// Put the original pixels back.
    pub fn abort(mut self) -> Result<(), ImageError> {
        self.finished = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<(), ImageError> {
        let Some(tiles) = self.undo_tiles.take() else {
            return Ok(());
        };
        let (x1, y1, _, _) = self.bounds;
        let (w, h) = self.size();
        let d = self.project.drawable_mut(self.drawable)?;
        d.discard_shadow();
        let src = PixelArea::new(&tiles, 0, 0, w, h);
        let mut dest = PixelAreaMut::new(d.data_mut(), x1, y1, w, h, true);
        pixelarea::copy_area(&src, &mut dest)?;
        Ok(())
    }
}

impl Drop for ImageMap<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.restore()
        {
            log::warn!("image map: restoring {} failed: {}", self.drawable, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawable::FillType;
    use crate::settings::EngineSettings;
    use crate::tag::{Format, Precision};

    fn project() -> (Project, DrawableId) {
        let settings = EngineSettings { levels_of_undo: 4, tile_size: 4, ..Default::default() };
        let p = Project::with_background(6, 5, Format::Gray, Precision::U8, FillType::Color([0.2, 0.2, 0.2, 1.0]), settings)
            .unwrap();
        let id = p.image.layers()[0].id();
        (p, id)
    }

    fn invert(s: &ChunkRef<'_>, d: &mut ChunkMut<'_>) {
        for r in 0..s.height {
            let src = s.row(r);
            let mut dst = d.row_mut(r);
            for (a, b) in src.data().iter().zip(dst.data_mut()) {
                *b = 255 - *a;
            }
        }
    }

    fn raw(p: &Project, id: DrawableId) -> Vec<u8> {
        p.drawable(id).unwrap().data().to_raw()
    }

    #[test]
    fn repeated_apply_reads_original_pixels() {
        let (mut p, id) = project();
        let before = raw(&p, id);
        let mut map = ImageMap::new(&mut p, id).unwrap();
        map.apply(invert).unwrap();
        map.apply(invert).unwrap();
        map.commit().unwrap();
        let after = raw(&p, id);
        assert!(before.iter().zip(&after).all(|(a, b)| *b == 255 - *a));
        assert!(!p.drawable(id).unwrap().has_shadow());

        assert!(p.undo().unwrap());
        assert_eq!(raw(&p, id), before);
        assert!(p.redo().unwrap());
        assert_eq!(raw(&p, id), after);
    }

    #[test]
    fn abort_and_drop_restore() {
        let (mut p, id) = project();
        let before = raw(&p, id);
        let mut map = ImageMap::new(&mut p, id).unwrap();
        map.apply(invert).unwrap();
        map.abort().unwrap();
        assert_eq!(raw(&p, id), before);

        {
            let mut map = ImageMap::new(&mut p, id).unwrap();
            map.apply(invert).unwrap();
        }
        assert_eq!(raw(&p, id), before);
        assert!(!p.undo.can_undo());
    }

    #[test]
    fn selection_limits_the_region() {
        let (mut p, id) = project();
        let before = raw(&p, id);
        p.set_selection(Some((1, 1, 3, 2)));
        let mut map = ImageMap::new(&mut p, id).unwrap();
        assert_eq!(map.bounds(), (1, 1, 3, 2));
        map.apply(invert).unwrap();
        map.commit().unwrap();
        let after = raw(&p, id);
        let bpp = 2;
        for y in 0..5 {
            for x in 0..6 {
                let i = (y * 6 + x) * bpp;
                let inside = (1..3).contains(&x) && y == 1;
                assert_eq!(after[i] != before[i], inside, "pixel {},{}", x, y);
            }
        }

        p.set_selection(Some((5, 5, 5, 5)));
        assert!(matches!(ImageMap::new(&mut p, id), Err(ImageError::EmptySelection)));
    }
}
