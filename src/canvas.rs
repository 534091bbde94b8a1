use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::CanvasError;
use crate::tag::{Precision, Tag};

/// Default tile edge for tiled canvases.
pub const DEFAULT_TILE_SIZE: u32 = 64;

/// Pixel-count ceiling for a single canvas (~256 megapixels).
pub const MAX_PIXELS: u64 = 256_000_000;

/// Backing layout of a canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    /// One contiguous buffer, allocated up front.
    Flat,
    /// Fixed-size square tiles, allocated on first write.
    Tiled,
}

// ============================================================================
// PORTIONS - the piece of storage covering one coordinate
// ============================================================================

/// Read view of the storage run that covers a pixel.
///
/// `data` starts at the requested pixel. Row `r` of the portion begins at
/// `r * rowstride`, and no row is longer than `width` pixels. Callers must
/// re-resolve at the portion edge instead of reading past it.
pub struct Portion<'a> {
    pub data: &'a [u8],
    pub rowstride: usize,
    pub width: u32,
    pub height: u32,
}

/// Write view of the storage run that covers a pixel.
pub struct PortionMut<'a> {
    pub data: &'a mut [u8],
    pub rowstride: usize,
    pub width: u32,
    pub height: u32,
}

// ============================================================================
// CANVAS
// ============================================================================

/// Owned 2D pixel buffer of one [`Tag`].
///
/// Flat canvases are a single tile the size of the whole image. Tiled
/// canvases hold sparse `Arc` tiles: `clone()` only bumps reference counts,
/// and writes go through `Arc::make_mut` so only touched tiles are copied.
/// A tile that was never written reads as zeros.
#[derive(Clone)]
pub struct Canvas {
    tag: Tag,
    width: u32,
    height: u32,
    storage: Storage,
    tile_width: u32,
    tile_height: u32,
    tiles_per_row: u32,
    tiles: Vec<Option<Arc<Vec<u8>>>>,
    blank: Arc<Vec<u8>>,
    generation: u64,
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("tag", &self.tag)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("storage", &self.storage)
            .field("allocated_tiles", &self.allocated_tiles())
            .finish()
    }
}

fn alloc_zeroed(bytes: usize) -> Result<Vec<u8>, CanvasError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|_| CanvasError::Allocation { bytes })?;
    buf.resize(bytes, 0);
    Ok(buf)
}

impl Canvas {
    // ---- construction -------------------------------------------------------

    /// Allocate a zeroed canvas with the default tile size.
    pub fn new(tag: Tag, width: u32, height: u32, storage: Storage) -> Result<Self, CanvasError> {
        Self::with_tile_size(tag, width, height, storage, DEFAULT_TILE_SIZE)
    }

    pub fn with_tile_size(
        tag: Tag,
        width: u32,
        height: u32,
        storage: Storage,
        tile_size: u32,
    ) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height });
        }
        if (width as u64) * (height as u64) > MAX_PIXELS {
            return Err(CanvasError::TooLarge { width, height, limit: MAX_PIXELS });
        }
        if !tag.is_valid() {
            return Err(CanvasError::InvalidTag(tag));
        }

        let (tile_width, tile_height) = match storage {
            Storage::Flat => (width, height),
            Storage::Tiled => {
                let ts = tile_size.max(1);
                (ts, ts)
            }
        };
        let tiles_per_row = width.div_ceil(tile_width);
        let tiles_per_col = height.div_ceil(tile_height);
        let tile_bytes = tile_width as usize * tile_height as usize * tag.bytes();

        let (tiles, blank) = match storage {
            Storage::Flat => (vec![Some(Arc::new(alloc_zeroed(tile_bytes)?))], Arc::new(Vec::new())),
            Storage::Tiled => (
                vec![None; (tiles_per_row * tiles_per_col) as usize],
                Arc::new(alloc_zeroed(tile_bytes)?),
            ),
        };

        log::debug!("canvas {}x{} {} {:?} allocated", width, height, tag, storage);

        Ok(Self {
            tag,
            width,
            height,
            storage,
            tile_width,
            tile_height,
            tiles_per_row,
            tiles,
            blank,
            generation: 0,
        })
    }

    /// A zeroed canvas with the same tag, size and layout.
    pub fn new_like(&self) -> Result<Self, CanvasError> {
        Self::with_tile_size(self.tag, self.width, self.height, self.storage, self.tile_width)
    }

    /// Import tightly packed rows (`width * tag.bytes()` per row).
    /// Tile conversion is parallelised with rayon; all-zero tiles stay sparse.
    pub fn from_raw(
        tag: Tag,
        width: u32,
        height: u32,
        storage: Storage,
        data: &[u8],
    ) -> Result<Self, CanvasError> {
        let mut canvas = Self::new(tag, width, height, storage)?;
        let bpp = tag.bytes();
        let expected = width as usize * height as usize * bpp;
        if data.len() != expected {
            return Err(CanvasError::PixelSize { got: data.len(), expected });
        }

        if storage == Storage::Flat {
            if let Some(Some(tile)) = canvas.tiles.get_mut(0) {
                Arc::make_mut(tile).copy_from_slice(data);
            }
            return Ok(canvas);
        }

        let tw = canvas.tile_width;
        let th = canvas.tile_height;
        let tiles_x = canvas.tiles_per_row as usize;
        let total = canvas.tiles.len();
        let tile_stride = tw as usize * bpp;
        let src_stride = width as usize * bpp;

        let results: Vec<(usize, Option<Arc<Vec<u8>>>)> = (0..total)
            .into_par_iter()
            .map(|flat| {
                let base_x = (flat % tiles_x) as u32 * tw;
                let base_y = (flat / tiles_x) as u32 * th;
                let cw = tw.min(width - base_x) as usize;
                let ch = th.min(height - base_y);
                let mut tile = vec![0u8; tile_stride * th as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = (base_y + ly) as usize * src_stride + base_x as usize * bpp;
                    let dst_start = ly as usize * tile_stride;
                    let row = &data[src_start..src_start + cw * bpp];
                    tile[dst_start..dst_start + cw * bpp].copy_from_slice(row);
                    if !has_content {
                        has_content = row.iter().any(|&b| b != 0);
                    }
                }

                (flat, has_content.then(|| Arc::new(tile)))
            })
            .collect();

        for (idx, tile) in results {
            canvas.tiles[idx] = tile;
        }
        Ok(canvas)
    }

    /// Export as tightly packed rows.
    pub fn to_raw(&self) -> Vec<u8> {
        let bpp = self.tag.bytes();
        let row_bytes = self.width as usize * bpp;
        let mut out = vec![0u8; row_bytes * self.height as usize];
        out.par_chunks_mut(row_bytes).enumerate().for_each(|(y, row)| {
            self.read_row(0, y as u32, row);
        });
        out
    }

    // ---- accessors ----------------------------------------------------------

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// Bytes per pixel.
    pub fn bytes(&self) -> usize {
        self.tag.bytes()
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// Distance in bytes between two rows of one tile.
    pub fn rowstride(&self) -> usize {
        self.tile_width as usize * self.tag.bytes()
    }

    pub fn tile_bytes(&self) -> usize {
        self.rowstride() * self.tile_height as usize
    }

    /// Bumped every time a dirty write view touches the canvas.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mark_dirty(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn allocated_tiles(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_some()).count()
    }

    /// Bytes actually held by allocated tiles.
    pub fn memory_bytes(&self) -> usize {
        self.allocated_tiles() * self.tile_bytes()
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    // ---- tile addressing ----------------------------------------------------

    fn tile_index(&self, x: u32, y: u32) -> usize {
        ((y / self.tile_height) * self.tiles_per_row + x / self.tile_width) as usize
    }

    fn tile_offset(&self, x: u32, y: u32) -> usize {
        let lx = (x % self.tile_width) as usize;
        let ly = (y % self.tile_height) as usize;
        (ly * self.tile_width as usize + lx) * self.tag.bytes()
    }

    /// Columns from `x` to the right edge of its tile, clipped to the canvas.
    pub fn portion_width(&self, x: u32, y: u32) -> u32 {
        if !self.contains(x, y) {
            return 0;
        }
        (self.tile_width - x % self.tile_width).min(self.width - x)
    }

    /// Rows from `y` to the bottom edge of its tile, clipped to the canvas.
    pub fn portion_height(&self, x: u32, y: u32) -> u32 {
        if !self.contains(x, y) {
            return 0;
        }
        (self.tile_height - y % self.tile_height).min(self.height - y)
    }

    /// Whether the tile covering `(x, y)` has backing memory.
    pub fn portion_alloced(&self, x: u32, y: u32) -> bool {
        self.contains(x, y) && self.tiles[self.tile_index(x, y)].is_some()
    }

    /// Read access to the storage covering `(x, y)`.
    pub fn portion_data(&self, x: u32, y: u32) -> Option<Portion<'_>> {
        if !self.contains(x, y) {
            return None;
        }
        let buf: &[u8] = match &self.tiles[self.tile_index(x, y)] {
            Some(tile) => tile.as_slice(),
            None => self.blank.as_slice(),
        };
        Some(Portion {
            data: &buf[self.tile_offset(x, y)..],
            rowstride: self.rowstride(),
            width: self.portion_width(x, y),
            height: self.portion_height(x, y),
        })
    }

    /// Write access to the storage covering `(x, y)`, allocating the tile
    /// (or un-sharing it) as needed.
    pub fn portion_data_mut(&mut self, x: u32, y: u32) -> Result<PortionMut<'_>, CanvasError> {
        if !self.contains(x, y) {
            return Err(CanvasError::OutOfBounds { x, y, width: 1, height: 1 });
        }
        let idx = self.tile_index(x, y);
        let offset = self.tile_offset(x, y);
        let rowstride = self.rowstride();
        let width = self.portion_width(x, y);
        let height = self.portion_height(x, y);
        let tile_bytes = self.tile_bytes();

        if self.tiles[idx].is_none() {
            self.tiles[idx] = Some(Arc::new(alloc_zeroed(tile_bytes)?));
        }
        let tile = match self.tiles[idx].as_mut() {
            Some(tile) => Arc::make_mut(tile),
            None => return Err(CanvasError::Allocation { bytes: tile_bytes }),
        };
        Ok(PortionMut {
            data: &mut tile[offset..],
            rowstride,
            width,
            height,
        })
    }

    // ---- whole-tile access (serialization) ----------------------------------

    /// Coordinates of every allocated tile.
    pub fn tile_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let per_row = self.tiles_per_row;
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(move |(i, _)| (i as u32 % per_row, i as u32 / per_row))
    }

    pub fn tile(&self, tx: u32, ty: u32) -> Option<&[u8]> {
        if tx >= self.tiles_per_row {
            return None;
        }
        let idx = (ty * self.tiles_per_row + tx) as usize;
        self.tiles.get(idx)?.as_deref().map(|t| t.as_slice())
    }

    pub fn set_tile(&mut self, tx: u32, ty: u32, data: Vec<u8>) -> Result<(), CanvasError> {
        let expected = self.tile_bytes();
        if data.len() != expected {
            return Err(CanvasError::PixelSize { got: data.len(), expected });
        }
        let idx = (ty * self.tiles_per_row + tx) as usize;
        if tx >= self.tiles_per_row || idx >= self.tiles.len() {
            return Err(CanvasError::OutOfBounds {
                x: tx * self.tile_width,
                y: ty * self.tile_height,
                width: self.tile_width,
                height: self.tile_height,
            });
        }
        self.tiles[idx] = Some(Arc::new(data));
        Ok(())
    }

    // ---- pixels and rows ----------------------------------------------------

    pub fn get_pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        let bpp = self.tag.bytes();
        self.portion_data(x, y).map(|p| &p.data[..bpp])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: &[u8]) -> Result<(), CanvasError> {
        let bpp = self.tag.bytes();
        if pixel.len() != bpp {
            return Err(CanvasError::PixelSize { got: pixel.len(), expected: bpp });
        }
        let portion = self.portion_data_mut(x, y)?;
        portion.data[..bpp].copy_from_slice(pixel);
        Ok(())
    }

    /// Copy `out.len() / bytes` pixels starting at `(x, y)` into `out`.
    /// Pixels past the right edge are left untouched.
    pub fn read_row(&self, x: u32, y: u32, out: &mut [u8]) {
        let bpp = self.tag.bytes();
        let mut cx = x;
        let mut written = 0;
        while written < out.len() {
            let Some(p) = self.portion_data(cx, y) else { break };
            let n = (p.width as usize * bpp).min(out.len() - written);
            out[written..written + n].copy_from_slice(&p.data[..n]);
            written += n;
            cx += p.width;
        }
    }

    pub fn write_row(&mut self, x: u32, y: u32, src: &[u8]) -> Result<(), CanvasError> {
        let bpp = self.tag.bytes();
        let mut cx = x;
        let mut done = 0;
        while done < src.len() {
            let p = self.portion_data_mut(cx, y)?;
            let n = (p.width as usize * bpp).min(src.len() - done);
            p.data[..n].copy_from_slice(&src[done..done + n]);
            done += n;
            cx += p.width;
        }
        Ok(())
    }

    pub fn read_col(&self, x: u32, y: u32, out: &mut [u8]) {
        let bpp = self.tag.bytes();
        for (i, px) in out.chunks_exact_mut(bpp).enumerate() {
            match self.get_pixel(x, y + i as u32) {
                Some(src) => px.copy_from_slice(src),
                None => break,
            }
        }
    }

    pub fn write_col(&mut self, x: u32, y: u32, src: &[u8]) -> Result<(), CanvasError> {
        let bpp = self.tag.bytes();
        for (i, px) in src.chunks_exact(bpp).enumerate() {
            self.put_pixel(x, y + i as u32, px)?;
        }
        Ok(())
    }

    /// Set every pixel to `pixel`. A zero pixel just drops tiled storage.
    pub fn fill(&mut self, pixel: &[u8]) -> Result<(), CanvasError> {
        let bpp = self.tag.bytes();
        if pixel.len() != bpp {
            return Err(CanvasError::PixelSize { got: pixel.len(), expected: bpp });
        }
        if self.storage == Storage::Tiled && pixel.iter().all(|&b| b == 0) {
            self.tiles.iter_mut().for_each(|t| *t = None);
            return Ok(());
        }
        let mut tile = alloc_zeroed(self.tile_bytes())?;
        for px in tile.chunks_exact_mut(bpp) {
            px.copy_from_slice(pixel);
        }
        let tile = Arc::new(tile);
        self.tiles.iter_mut().for_each(|t| *t = Some(Arc::clone(&tile)));
        Ok(())
    }

    /// A copy of this canvas with every sample re-encoded at `precision`.
    pub fn convert_precision(&self, precision: Precision) -> Result<Canvas, CanvasError> {
        let tag = self.tag.with_precision(precision);
        let mut out = Canvas::with_tile_size(tag, self.width, self.height, self.storage, self.tile_width)?;
        let from = self.tag.precision();
        let from_bytes = from.bytes();
        let to_bytes = precision.bytes();

        out.tiles = self
            .tiles
            .par_iter()
            .map(|tile| {
                tile.as_ref().map(|src| {
                    let samples = src.len() / from_bytes;
                    let mut dst = vec![0u8; samples * to_bytes];
                    for (s, d) in src.chunks_exact(from_bytes).zip(dst.chunks_exact_mut(to_bytes)) {
                        precision.write(from.read(s), d);
                    }
                    Arc::new(dst)
                })
            })
            .collect();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Alpha, Format};

    fn gray8() -> Tag {
        Tag::new(Precision::U8, Format::Gray, Alpha::No)
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert!(matches!(
            Canvas::new(gray8(), 0, 4, Storage::Flat),
            Err(CanvasError::InvalidSize { .. })
        ));
        assert!(matches!(
            Canvas::new(Tag::null(), 4, 4, Storage::Flat),
            Err(CanvasError::InvalidTag(_))
        ));
        assert!(matches!(
            Canvas::new(gray8(), 100_000, 100_000, Storage::Tiled),
            Err(CanvasError::TooLarge { .. })
        ));
    }

    #[test]
    fn tiled_canvas_is_sparse_until_written() {
        let mut c = Canvas::with_tile_size(gray8(), 10, 10, Storage::Tiled, 4).unwrap();
        assert_eq!(c.allocated_tiles(), 0);
        assert_eq!(c.get_pixel(9, 9), Some(&[0u8][..]));
        c.put_pixel(5, 5, &[7]).unwrap();
        assert_eq!(c.allocated_tiles(), 1);
        assert!(c.portion_alloced(4, 4));
        assert!(!c.portion_alloced(0, 0));
        assert_eq!(c.get_pixel(5, 5), Some(&[7u8][..]));
    }

    #[test]
    fn portion_extents_stop_at_tile_edges() {
        let c = Canvas::with_tile_size(gray8(), 10, 10, Storage::Tiled, 4).unwrap();
        assert_eq!(c.portion_width(1, 0), 3);
        assert_eq!(c.portion_height(0, 9), 1);
        assert_eq!(c.portion_width(8, 0), 2);
        let flat = Canvas::new(gray8(), 10, 10, Storage::Flat).unwrap();
        assert_eq!(flat.portion_width(3, 3), 7);
        assert_eq!(flat.portion_height(3, 3), 7);
        assert!(c.portion_data(10, 0).is_none());
    }

    #[test]
    fn clone_is_copy_on_write() {
        let mut a = Canvas::with_tile_size(gray8(), 8, 8, Storage::Tiled, 4).unwrap();
        a.put_pixel(0, 0, &[1]).unwrap();
        let mut b = a.clone();
        b.put_pixel(0, 0, &[2]).unwrap();
        assert_eq!(a.get_pixel(0, 0), Some(&[1u8][..]));
        assert_eq!(b.get_pixel(0, 0), Some(&[2u8][..]));
    }

    #[test]
    fn raw_round_trip_across_layouts() {
        let data: Vec<u8> = (0..(7 * 5) as u32).map(|v| (v * 3 % 251) as u8).collect();
        for storage in [Storage::Flat, Storage::Tiled] {
            let c = Canvas::from_raw(gray8(), 7, 5, storage, &data).unwrap();
            assert_eq!(c.to_raw(), data);
        }
    }

    #[test]
    fn rows_cross_tile_boundaries() {
        let mut c = Canvas::with_tile_size(gray8(), 9, 3, Storage::Tiled, 4).unwrap();
        let row: Vec<u8> = (1..=9).collect();
        c.write_row(0, 1, &row).unwrap();
        let mut back = vec![0u8; 9];
        c.read_row(0, 1, &mut back);
        assert_eq!(back, row);

        c.write_col(8, 0, &[5, 6, 7]).unwrap();
        let mut col = vec![0u8; 3];
        c.read_col(8, 0, &mut col);
        assert_eq!(col, vec![5, 6, 7]);
    }

    #[test]
    fn fill_then_convert_precision() {
        let mut c = Canvas::with_tile_size(gray8(), 5, 5, Storage::Tiled, 4).unwrap();
        c.fill(&[255]).unwrap();
        let wide = c.convert_precision(Precision::U16).unwrap();
        assert_eq!(wide.tag().bytes(), 2);
        assert_eq!(wide.get_pixel(4, 4), Some(&65535u16.to_ne_bytes()[..]));
        let back = wide.convert_precision(Precision::U8).unwrap();
        assert_eq!(back.to_raw(), c.to_raw());
    }
}
