//! Rectangular views over canvases and the lock-step chunk walk used to
//! stream pixel transforms through tiled storage.
//!
//! A walk is started with [`register`] over the geometry of one or more
//! areas of equal size and advanced with [`AreaWalk::process`]. Every chunk
//! lies inside a single tile of every registered area, so a kernel sees a
//! plain row-strided buffer per area:
//!
//! ```ignore
//! let mut walk = pixelarea::register(&[src.spec(), dest.spec()]);
//! while let Some(w) = walk {
//!     let chunk = w.chunk();
//!     kernel(&src.chunk(&chunk), &mut dest.chunk_mut(&chunk)?);
//!     walk = w.process();
//! }
//! ```
//!
//! Chunks are visited row-major: bands top to bottom, chunks left to right
//! within a band. No pixel is visited twice.

use crate::canvas::Canvas;
use crate::error::CanvasError;
use crate::tag::Tag;

// ============================================================================
// PIXEL ROWS
// ============================================================================

/// A typed run of `width` pixels.
#[derive(Clone, Copy)]
pub struct PixelRow<'a> {
    tag: Tag,
    data: &'a [u8],
    width: u32,
}

impl<'a> PixelRow<'a> {
    pub fn new(tag: Tag, data: &'a [u8], width: u32) -> Self {
        let len = (width as usize * tag.bytes()).min(data.len());
        Self { tag, data: &data[..len], width }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn pixel(&self, i: u32) -> &'a [u8] {
        let bpp = self.tag.bytes();
        let start = i as usize * bpp;
        &self.data[start..start + bpp]
    }

    pub fn pixels(&self) -> std::slice::ChunksExact<'a, u8> {
        self.data.chunks_exact(self.tag.bytes().max(1))
    }
}

/// Mutable counterpart of [`PixelRow`].
pub struct PixelRowMut<'a> {
    tag: Tag,
    data: &'a mut [u8],
    width: u32,
}

impl<'a> PixelRowMut<'a> {
    pub fn new(tag: Tag, data: &'a mut [u8], width: u32) -> Self {
        let len = (width as usize * tag.bytes()).min(data.len());
        Self { tag, data: &mut data[..len], width }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn data(&self) -> &[u8] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    pub fn pixels_mut(&mut self) -> std::slice::ChunksExactMut<'_, u8> {
        let bpp = self.tag.bytes().max(1);
        self.data.chunks_exact_mut(bpp)
    }
}

// ============================================================================
// CHUNKS
// ============================================================================

/// Position of one chunk of a walk, relative to each area's origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSet {
    pub dx: u32,
    pub dy: u32,
    pub width: u32,
    pub height: u32,
}

/// Flat read view of one chunk of one area.
pub struct ChunkRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub rowstride: usize,
    pub tag: Tag,
    pub x: u32,
    pub y: u32,
}

impl<'a> ChunkRef<'a> {
    pub fn row(&self, r: u32) -> PixelRow<'a> {
        let start = r as usize * self.rowstride;
        PixelRow::new(self.tag, &self.data[start..], self.width)
    }

    pub fn rows(&self) -> impl Iterator<Item = PixelRow<'a>> + '_ {
        (0..self.height).map(move |r| self.row(r))
    }
}

/// Flat write view of one chunk of one area.
pub struct ChunkMut<'a> {
    pub data: &'a mut [u8],
    pub width: u32,
    pub height: u32,
    pub rowstride: usize,
    pub tag: Tag,
    pub x: u32,
    pub y: u32,
}

impl ChunkMut<'_> {
    pub fn row(&self, r: u32) -> PixelRow<'_> {
        let start = r as usize * self.rowstride;
        PixelRow::new(self.tag, &self.data[start..], self.width)
    }

    pub fn row_mut(&mut self, r: u32) -> PixelRowMut<'_> {
        let start = r as usize * self.rowstride;
        PixelRowMut::new(self.tag, &mut self.data[start..], self.width)
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.tag.bytes()
    }
}

// ============================================================================
// AREAS
// ============================================================================

/// Geometry of an area as seen by the walk: its rectangle and the tile grid
/// of the canvas under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AreaSpec {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

fn clip(canvas: &Canvas, x: u32, y: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x = x.min(canvas.width());
    let y = y.min(canvas.height());
    let (mut w, mut h) = (width, height);
    if w == 0 && h == 0 {
        w = canvas.width() - x;
        h = canvas.height() - y;
    }
    (x, y, w.min(canvas.width() - x), h.min(canvas.height() - y))
}

/// Read-only rectangular view of a canvas.
pub struct PixelArea<'a> {
    canvas: &'a Canvas,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl<'a> PixelArea<'a> {
    /// Bind a view to `(x, y, width, height)`, clipped to the canvas.
    /// A `0 x 0` size means everything right of and below `(x, y)`.
    pub fn new(canvas: &'a Canvas, x: u32, y: u32, width: u32, height: u32) -> Self {
        let (x, y, width, height) = clip(canvas, x, y, width, height);
        Self { canvas, x, y, width, height }
    }

    pub fn whole(canvas: &'a Canvas) -> Self {
        Self::new(canvas, 0, 0, 0, 0)
    }

    pub fn canvas(&self) -> &'a Canvas {
        self.canvas
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tag(&self) -> Tag {
        self.canvas.tag()
    }

    pub fn bytes(&self) -> usize {
        self.canvas.bytes()
    }

    pub fn spec(&self) -> AreaSpec {
        AreaSpec {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            tile_width: self.canvas.tile_width(),
            tile_height: self.canvas.tile_height(),
        }
    }

    pub fn chunk(&self, c: &ChunkSet) -> ChunkRef<'a> {
        let (x, y) = (self.x + c.dx, self.y + c.dy);
        let tag = self.canvas.tag();
        match self.canvas.portion_data(x, y) {
            Some(p) => ChunkRef {
                data: p.data,
                width: c.width.min(p.width),
                height: c.height.min(p.height),
                rowstride: p.rowstride,
                tag,
                x,
                y,
            },
            None => ChunkRef { data: &[], width: 0, height: 0, rowstride: 0, tag, x, y },
        }
    }

    /// Pixels of row `row` (relative to the area) as one packed buffer.
    pub fn copy_row(&self, row: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.width as usize * self.bytes()];
        if row < self.height {
            self.canvas.read_row(self.x, self.y + row, &mut out);
        }
        out
    }

    pub fn copy_col(&self, col: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.height as usize * self.bytes()];
        if col < self.width {
            self.canvas.read_col(self.x + col, self.y, &mut out);
        }
        out
    }
}

/// Writable rectangular view of a canvas.
pub struct PixelAreaMut<'a> {
    canvas: &'a mut Canvas,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    dirty: bool,
}

impl<'a> PixelAreaMut<'a> {
    /// Like [`PixelArea::new`]. When `dirty` is set every chunk handed out
    /// bumps the canvas generation.
    pub fn new(canvas: &'a mut Canvas, x: u32, y: u32, width: u32, height: u32, dirty: bool) -> Self {
        let (x, y, width, height) = clip(canvas, x, y, width, height);
        Self { canvas, x, y, width, height, dirty }
    }

    pub fn whole(canvas: &'a mut Canvas) -> Self {
        Self::new(canvas, 0, 0, 0, 0, true)
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tag(&self) -> Tag {
        self.canvas.tag()
    }

    pub fn bytes(&self) -> usize {
        self.canvas.bytes()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn spec(&self) -> AreaSpec {
        AreaSpec {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            tile_width: self.canvas.tile_width(),
            tile_height: self.canvas.tile_height(),
        }
    }

    /// Read-only view of the same rectangle.
    pub fn as_area(&self) -> PixelArea<'_> {
        PixelArea {
            canvas: &*self.canvas,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn chunk_mut(&mut self, c: &ChunkSet) -> Result<ChunkMut<'_>, CanvasError> {
        if self.dirty {
            self.canvas.mark_dirty();
        }
        let (x, y) = (self.x + c.dx, self.y + c.dy);
        let tag = self.canvas.tag();
        let p = self.canvas.portion_data_mut(x, y)?;
        Ok(ChunkMut {
            width: c.width.min(p.width),
            height: c.height.min(p.height),
            rowstride: p.rowstride,
            data: p.data,
            tag,
            x,
            y,
        })
    }

    pub fn write_row(&mut self, row: u32, data: &[u8]) -> Result<(), CanvasError> {
        if row >= self.height {
            return Err(CanvasError::OutOfBounds { x: self.x, y: self.y + row, width: self.width, height: 1 });
        }
        let n = (self.width as usize * self.bytes()).min(data.len());
        self.canvas.write_row(self.x, self.y + row, &data[..n])
    }

    pub fn write_col(&mut self, col: u32, data: &[u8]) -> Result<(), CanvasError> {
        if col >= self.width {
            return Err(CanvasError::OutOfBounds { x: self.x + col, y: self.y, width: 1, height: self.height });
        }
        let n = (self.height as usize * self.bytes()).min(data.len());
        self.canvas.write_col(self.x + col, self.y, &data[..n])
    }
}

// ============================================================================
// WALK
// ============================================================================

/// Handle on the current chunk of a lock-step walk over registered areas.
#[derive(Clone, Debug)]
pub struct AreaWalk {
    areas: Vec<AreaSpec>,
    width: u32,
    height: u32,
    current: ChunkSet,
    exhausted: bool,
}

/// Start a walk over `areas`. All areas must share the same size.
/// Returns `None` for an empty region or mismatched sizes.
pub fn register(areas: &[AreaSpec]) -> Option<AreaWalk> {
    let first = areas.first()?;
    if let Some(bad) = areas.iter().find(|a| a.width != first.width || a.height != first.height) {
        log::warn!(
            "pixelarea register: size mismatch {}x{} vs {}x{}",
            first.width, first.height, bad.width, bad.height
        );
        return None;
    }
    if first.width == 0 || first.height == 0 {
        return None;
    }
    let mut walk = AreaWalk {
        areas: areas.to_vec(),
        width: first.width,
        height: first.height,
        current: ChunkSet { dx: 0, dy: 0, width: 0, height: 0 },
        exhausted: false,
    };
    let height = walk.band_height(0);
    walk.current = ChunkSet { dx: 0, dy: 0, width: walk.chunk_width(0), height };
    Some(walk)
}

/// Iterate every chunk of a walk over `areas`.
pub fn chunks(areas: &[AreaSpec]) -> impl Iterator<Item = ChunkSet> {
    register(areas).into_iter().flatten()
}

impl AreaWalk {
    pub fn chunk(&self) -> ChunkSet {
        self.current
    }

    /// Width of the registered region.
    pub fn area_width(&self) -> u32 {
        self.width
    }

    pub fn area_height(&self) -> u32 {
        self.height
    }

    /// Advance to the next chunk; `None` once the region is covered.
    pub fn process(mut self) -> Option<AreaWalk> {
        let next = self.advance(self.current)?;
        self.current = next;
        Some(self)
    }

    /// Abandon the walk early.
    pub fn stop(self) {}

    fn band_height(&self, dy: u32) -> u32 {
        self.areas
            .iter()
            .map(|a| a.tile_height - (a.y + dy) % a.tile_height)
            .min()
            .unwrap_or(0)
            .min(self.height - dy)
    }

    fn chunk_width(&self, dx: u32) -> u32 {
        self.areas
            .iter()
            .map(|a| a.tile_width - (a.x + dx) % a.tile_width)
            .min()
            .unwrap_or(0)
            .min(self.width - dx)
    }

    fn advance(&self, c: ChunkSet) -> Option<ChunkSet> {
        let dx = c.dx + c.width;
        if dx < self.width {
            return Some(ChunkSet { dx, dy: c.dy, width: self.chunk_width(dx), height: c.height });
        }
        let dy = c.dy + c.height;
        if dy >= self.height {
            return None;
        }
        Some(ChunkSet { dx: 0, dy, width: self.chunk_width(0), height: self.band_height(dy) })
    }
}

impl Iterator for AreaWalk {
    type Item = ChunkSet;

    fn next(&mut self) -> Option<ChunkSet> {
        if self.exhausted {
            return None;
        }
        let c = self.current;
        match self.advance(c) {
            Some(next) => self.current = next,
            None => self.exhausted = true,
        }
        Some(c)
    }
}

// ============================================================================
// AREA OPERATIONS
// ============================================================================

fn check_sizes(a: AreaSpec, b: AreaSpec) -> Result<(), CanvasError> {
    if a.width != b.width || a.height != b.height {
        return Err(CanvasError::SizeMismatch(a.width, a.height, b.width, b.height));
    }
    Ok(())
}

/// Copy `src` into `dest`. Both must have the same tag and size.
pub fn copy_area(src: &PixelArea<'_>, dest: &mut PixelAreaMut<'_>) -> Result<(), CanvasError> {
    if src.tag() != dest.tag() {
        return Err(CanvasError::TagMismatch { left: src.tag(), right: dest.tag() });
    }
    check_sizes(src.spec(), dest.spec())?;
    for c in chunks(&[src.spec(), dest.spec()]) {
        let s = src.chunk(&c);
        let mut d = dest.chunk_mut(&c)?;
        let n = d.row_bytes();
        for r in 0..c.height {
            let so = r as usize * s.rowstride;
            let dof = r as usize * d.rowstride;
            d.data[dof..dof + n].copy_from_slice(&s.data[so..so + n]);
        }
    }
    Ok(())
}

/// Exchange the contents of two areas in place.
pub fn swap_area(a: &mut PixelAreaMut<'_>, b: &mut PixelAreaMut<'_>) -> Result<(), CanvasError> {
    if a.tag() != b.tag() {
        return Err(CanvasError::TagMismatch { left: a.tag(), right: b.tag() });
    }
    check_sizes(a.spec(), b.spec())?;
    for c in chunks(&[a.spec(), b.spec()]) {
        let mut ca = a.chunk_mut(&c)?;
        let mut cb = b.chunk_mut(&c)?;
        let n = ca.row_bytes();
        for r in 0..c.height {
            let oa = r as usize * ca.rowstride;
            let ob = r as usize * cb.rowstride;
            ca.data[oa..oa + n].swap_with_slice(&mut cb.data[ob..ob + n]);
        }
    }
    Ok(())
}

/// Fill an area with one pixel value.
pub fn color_area(dest: &mut PixelAreaMut<'_>, pixel: &[u8]) -> Result<(), CanvasError> {
    let bpp = dest.bytes();
    if pixel.len() != bpp {
        return Err(CanvasError::PixelSize { got: pixel.len(), expected: bpp });
    }
    for c in chunks(&[dest.spec()]) {
        let mut d = dest.chunk_mut(&c)?;
        for r in 0..c.height {
            let mut row = d.row_mut(r);
            for px in row.pixels_mut() {
                px.copy_from_slice(pixel);
            }
        }
    }
    Ok(())
}

/// Copy `src` into `dest`, re-encoding samples when the precisions differ.
/// Format and alpha must match.
pub fn convert_area(src: &PixelArea<'_>, dest: &mut PixelAreaMut<'_>) -> Result<(), CanvasError> {
    let (st, dt) = (src.tag(), dest.tag());
    if st.format() != dt.format() || st.alpha() != dt.alpha() {
        return Err(CanvasError::TagMismatch { left: st, right: dt });
    }
    if st == dt {
        return copy_area(src, dest);
    }
    check_sizes(src.spec(), dest.spec())?;
    let (sp, dp) = (st.precision(), dt.precision());
    let (sb, db) = (sp.bytes(), dp.bytes());
    for c in chunks(&[src.spec(), dest.spec()]) {
        let s = src.chunk(&c);
        let mut d = dest.chunk_mut(&c)?;
        for r in 0..c.height {
            let srow = s.row(r);
            let mut drow = d.row_mut(r);
            for (si, di) in srow.data().chunks_exact(sb).zip(drow.data_mut().chunks_exact_mut(db)) {
                dp.write(sp.read(si), di);
            }
        }
    }
    Ok(())
}
