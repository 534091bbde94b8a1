// ============================================================================
// CURVES - Catmull-Rom tone curves, per precision
// ============================================================================
//
// A curve is edited as up to 17 control points in 0..=255 UI space (or as a
// free-hand 256-entry table). Before pixels are touched the points are
// scaled to the drawable's precision and sampled into a lookup table.
// ============================================================================

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use super::image_map::ImageMap;
use super::levels::interpolate_mid;
use super::{LutSample, U8Sample, U16Sample};
use crate::drawable::DrawableId;
use crate::error::{CurvesError, ImageError};
use crate::pixelarea::{ChunkMut, ChunkRef};
use crate::project::Project;
use crate::tag::{ONE_BFP, Precision, Tag};

pub const CURVES: usize = 6;
pub const POINTS: usize = 17;

const FILE_HEADER: &str = "# GIMP Curves File\n";

const UI_STEPS: u32 = 1000;
const U16_STEPS: u32 = 200_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurveChannel {
    Value,
    Red,
    Green,
    Blue,
    Alpha,
    /// Chroma radius; kept in files but not applied by the RGB kernels.
    Saturation,
}

impl CurveChannel {
    pub const ALL: [CurveChannel; CURVES] = [
        CurveChannel::Value,
        CurveChannel::Red,
        CurveChannel::Green,
        CurveChannel::Blue,
        CurveChannel::Alpha,
        CurveChannel::Saturation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CurveChannel::Value => "Value",
            CurveChannel::Red => "Red",
            CurveChannel::Green => "Green",
            CurveChannel::Blue => "Blue",
            CurveChannel::Alpha => "Alpha",
            CurveChannel::Saturation => "Saturation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name().eq_ignore_ascii_case(s))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CurveType {
    #[default]
    Smooth,
    Free,
}

/// Unused control point.
pub const NO_POINT: [i32; 2] = [-1, -1];

pub type PointTable = [[[i32; 2]; POINTS]; CURVES];

// ============================================================================
// CONFIG
// ============================================================================

/// Editable state of all six curves.
#[derive(Clone, PartialEq, Eq)]
pub struct CurvesConfig {
    pub points: PointTable,
    pub curve_type: [CurveType; CURVES],
    /// 0..=255 sampling of each curve, edited directly for free curves.
    pub ui_curves: [[u8; 256]; CURVES],
}

impl fmt::Debug for CurvesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurvesConfig")
            .field("points", &self.points)
            .field("curve_type", &self.curve_type)
            .finish_non_exhaustive()
    }
}

impl Default for CurvesConfig {
    fn default() -> Self {
        let mut cfg = Self {
            points: [[NO_POINT; POINTS]; CURVES],
            curve_type: [CurveType::Smooth; CURVES],
            ui_curves: [[0; 256]; CURVES],
        };
        for ch in CurveChannel::ALL {
            cfg.reset_channel(ch);
        }
        cfg
    }
}

impl CurvesConfig {
    /// Straight line from (0, 0) to (255, 255).
    pub fn reset_channel(&mut self, channel: CurveChannel) {
        let c = channel.index();
        self.points[c] = [NO_POINT; POINTS];
        self.points[c][0] = [0, 0];
        self.points[c][POINTS - 1] = [255, 255];
        self.curve_type[c] = CurveType::Smooth;
        for (i, v) in self.ui_curves[c].iter_mut().enumerate() {
            *v = i as u8;
        }
    }

    /// Set control point `index` and resample the UI curve.
    pub fn set_point(&mut self, channel: CurveChannel, index: usize, x: i32, y: i32) {
        if index >= POINTS {
            return;
        }
        self.points[channel.index()][index] = [x.clamp(-1, 255), y.clamp(-1, 255)];
        self.calculate_ui_curve(channel);
    }

    pub fn set_curve_type(&mut self, channel: CurveChannel, curve_type: CurveType) {
        self.curve_type[channel.index()] = curve_type;
        self.calculate_ui_curve(channel);
    }

    /// Replace the free-hand table of a channel; the channel becomes free.
    pub fn set_free_curve(&mut self, channel: CurveChannel, curve: [u8; 256]) {
        let c = channel.index();
        self.curve_type[c] = CurveType::Free;
        self.ui_curves[c] = curve;
    }

    /// Resample the 0..=255 UI curve of a smooth channel from its points.
    pub fn calculate_ui_curve(&mut self, channel: CurveChannel) {
        let c = channel.index();
        if self.curve_type[c] == CurveType::Free {
            return;
        }
        let points = ui_points(&self.points[c], |v| v as f64);
        let mut table: Vec<u16> = self.ui_curves[c].iter().map(|&v| v as u16).collect();
        calculate_curve(&mut table, &points, plot_boundary_pts_u8, plot_curve_u8);
        for (dst, v) in self.ui_curves[c].iter_mut().zip(table) {
            *dst = v.min(255) as u8;
        }
    }

    /// Control points as they are written to a file: free curves contribute
    /// nine samples of their table at every other point.
    pub fn file_points(&self) -> PointTable {
        let mut points = self.points;
        for c in 0..CURVES {
            if self.curve_type[c] == CurveType::Free {
                for j in 0..=8 {
                    let index = (j * 32).min(255);
                    points[c][j * 2] = [index as i32, self.ui_curves[c][index] as i32];
                }
            }
        }
        points
    }

    /// Parse a curves file. Every curve comes back smooth.
    pub fn read_from<R: BufRead>(mut reader: R) -> Result<Self, CurvesError> {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        if header != FILE_HEADER {
            return Err(CurvesError::BadHeader);
        }
        let mut rest = String::new();
        reader.read_to_string(&mut rest)?;
        let mut fields = rest.split_whitespace();

        let mut cfg = Self::default();
        for c in 0..CURVES {
            for p in 0..POINTS {
                let mut next = || -> Result<i32, CurvesError> {
                    let value: i32 = fields
                        .next()
                        .and_then(|f| f.parse().ok())
                        .ok_or(CurvesError::BadField { curve: c, point: p })?;
                    if !(-1..=255).contains(&value) {
                        return Err(CurvesError::OutOfRange { curve: c, point: p, value });
                    }
                    Ok(value)
                };
                let x = next()?;
                let y = next()?;
                cfg.points[c][p] = [x, y];
            }
        }
        for ch in CurveChannel::ALL {
            cfg.calculate_ui_curve(ch);
        }
        Ok(cfg)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), CurvesError> {
        writer.write_all(FILE_HEADER.as_bytes())?;
        for curve in self.file_points() {
            for [x, y] in curve {
                write!(writer, "{} {} ", x, y)?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CurvesError> {
        let file = std::fs::File::open(path)?;
        let cfg = Self::read_from(BufReader::new(file))?;
        log::info!("curves: loaded {}", path.display());
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), CurvesError> {
        let file = std::fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))?;
        log::info!("curves: saved {}", path.display());
        Ok(())
    }
}

// ============================================================================
// SAMPLING
// ============================================================================

/// Sampled curves, one table per channel. u8 tables hold 256 entries, all
/// other precisions 65536.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurveTables {
    pub curves: [Vec<u16>; CURVES],
}

impl CurveTables {
    fn with_len(len: usize) -> Self {
        Self { curves: std::array::from_fn(|_| vec![0; len]) }
    }

    pub fn len(&self) -> usize {
        self.curves[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn get(&self, channel: usize, v: usize) -> u16 {
        self.curves[channel][v]
    }
}

type CrMatrix = [[f64; 4]; 4];

const CR_BASIS: CrMatrix = [
    [-0.5, 1.5, -1.5, 0.5],
    [1.0, -2.5, 2.0, -0.5],
    [-0.5, 0.0, 0.5, 0.0],
    [0.0, 1.0, 0.0, 0.0],
];

fn cr_compose(a: &CrMatrix, b: &CrMatrix) -> CrMatrix {
    let mut ab = [[0.0; 4]; 4];
    for (i, row) in ab.iter_mut().enumerate() {
        for (j, v) in row.iter_mut().enumerate() {
            *v = (0..4).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    ab
}

/// Plot one Catmull-Rom segment between `p2` and `p3` by forward
/// differencing in `steps` steps, writing into `curve` whose entries span
/// `0..=max`.
fn plot_segment(curve: &mut [u16], pts: [[f64; 2]; 4], steps: u32, max: i64) {
    let mut geometry = [[0.0; 4]; 4];
    for (row, p) in geometry.iter_mut().zip(pts) {
        row[0] = p[0];
        row[1] = p[1];
    }

    let d = 1.0 / steps as f64;
    let (d2, d3) = (d * d, d * d * d);
    let tmp2: CrMatrix = [
        [0.0, 0.0, 0.0, 1.0],
        [d3, d2, d, 0.0],
        [6.0 * d3, 2.0 * d2, 0.0, 0.0],
        [6.0 * d3, 0.0, 0.0, 0.0],
    ];
    let deltas = cr_compose(&tmp2, &cr_compose(&CR_BASIS, &geometry));

    let (mut x, mut dx, mut dx2, dx3) = (deltas[0][0], deltas[1][0], deltas[2][0], deltas[3][0]);
    let (mut y, mut dy, mut dy2, dy3) = (deltas[0][1], deltas[1][1], deltas[2][1], deltas[3][1]);

    let mut last_x = (x as i64).clamp(0, max);
    let mut last_y = (y as i64).clamp(0, max);
    curve[last_x as usize] = last_y as u16;

    for _ in 0..steps {
        x += dx;
        dx += dx2;
        dx2 += dx3;

        y += dy;
        dy += dy2;
        dy2 += dy3;

        let new_x = ((x + 0.5) as i64).clamp(0, max);
        let new_y = ((y + 0.5) as i64).clamp(0, max);
        if new_x != last_x || new_y != last_y {
            curve[new_x as usize] = new_y as u16;
        }
        last_x = new_x;
        last_y = new_y;
    }
}

/// Hold the first point's value left of it and the last point's value from
/// it rightwards. `pts` lists the used point indices in order.
fn plot_boundary(curve: &mut [u16], points: &[[f64; 2]; POINTS], pts: &[usize], max: f64) {
    let (Some(&first), Some(&last)) = (pts.first(), pts.last()) else {
        return;
    };
    let [fx, fy] = points[first];
    let [lx, ly] = points[last];
    let first_y = fy.clamp(0.0, max) as u16;
    let last_y = ly.clamp(0.0, max) as u16;
    let first_x = (fx.ceil().max(0.0) as usize).min(curve.len());
    let last_x = (lx.max(0.0) as usize).min(curve.len());
    curve[..first_x].fill(first_y);
    curve[last_x..].fill(last_y);
}

fn plot_boundary_pts_u8(curve: &mut [u16], points: &[[f64; 2]; POINTS], pts: &[usize]) {
    plot_boundary(curve, points, pts, 255.0)
}

fn plot_boundary_pts_u16(curve: &mut [u16], points: &[[f64; 2]; POINTS], pts: &[usize]) {
    plot_boundary(curve, points, pts, 65535.0)
}

fn plot_curve_u8(curve: &mut [u16], p1: [f64; 2], p2: [f64; 2], p3: [f64; 2], p4: [f64; 2]) {
    plot_segment(curve, [p1, p2, p3, p4], UI_STEPS, 255)
}

fn plot_curve_u16(curve: &mut [u16], p1: [f64; 2], p2: [f64; 2], p3: [f64; 2], p4: [f64; 2]) {
    plot_segment(curve, [p1, p2, p3, p4], U16_STEPS, 65535)
}

pub type BoundaryFn = fn(&mut [u16], &[[f64; 2]; POINTS], &[usize]);
pub type PlotFn = fn(&mut [u16], [f64; 2], [f64; 2], [f64; 2], [f64; 2]);

fn ui_points(points: &[[i32; 2]; POINTS], convert: impl Fn(i32) -> f64) -> [[f64; 2]; POINTS] {
    points.map(|p| if p[0] == -1 { [-1.0, -1.0] } else { [convert(p[0]), convert(p[1])] })
}

/// Sample a smooth curve through the used points of `points` into `curve`.
pub fn calculate_curve(curve: &mut [u16], points: &[[f64; 2]; POINTS], boundary: BoundaryFn, plot: PlotFn) {
    let pts: Vec<usize> = (0..POINTS).filter(|&i| points[i][0] != -1.0).collect();
    let num = pts.len();
    if num == 0 {
        return;
    }
    boundary(curve, points, &pts);
    for i in 0..num - 1 {
        let p1 = if i == 0 { pts[i] } else { pts[i - 1] };
        let p2 = pts[i];
        let p3 = pts[i + 1];
        let p4 = if i == num - 2 { pts[num - 1] } else { pts[i + 2] };
        plot(curve, points[p1], points[p2], points[p3], points[p4]);
    }
}

fn alloc_u8() -> CurveTables {
    CurveTables::with_len(256)
}

fn alloc_u16() -> CurveTables {
    CurveTables::with_len(65536)
}

fn init_curve_u8(t: &mut CurveTables, channel: usize) {
    for (i, v) in t.curves[channel].iter_mut().enumerate() {
        *v = i as u16;
    }
}

fn init_curve_u16(t: &mut CurveTables, channel: usize) {
    init_curve_u8(t, channel)
}

fn convert_ui_value_u8(v: i32) -> f64 {
    v as f64
}

fn convert_ui_value_u16(v: i32) -> f64 {
    v as f64 / 255.0 * 65535.0
}

fn convert_ui_value_bfp(v: i32) -> f64 {
    v as f64 / 255.0 * ONE_BFP as f64
}

fn calculate_free_curve_u8(ui: &[u8; 256], curve: &mut [u16]) {
    for (dst, &v) in curve.iter_mut().zip(ui.iter()) {
        *dst = v as u16;
    }
}

fn calculate_free_curve_u16(ui: &[u8; 256], curve: &mut [u16]) {
    for (i, dst) in curve.iter_mut().enumerate().take(65536) {
        let (index, frac) = (i / 257, (i % 257) as f32);
        let y1 = ui[index] as f32 * 257.0;
        *dst = if index + 1 < 256 {
            let m = ui[index + 1] as f32 - ui[index] as f32;
            (y1 + m * frac) as u16
        } else {
            y1 as u16
        };
    }
}

fn calculate_free_curve_bfp(ui: &[u8; 256], curve: &mut [u16]) {
    for (i, dst) in curve.iter_mut().enumerate() {
        let pos = (i as f64 / ONE_BFP as f64).min(1.0) * 255.0;
        let index = (pos as usize).min(254);
        let frac = pos - index as f64;
        let y = ui[index] as f64 + (ui[index + 1] as f64 - ui[index] as f64) * frac;
        *dst = (y / 255.0 * ONE_BFP as f64 + 0.5) as u16;
    }
}

// ============================================================================
// KERNELS
// ============================================================================

const VALUE: usize = 0;
const ALPHA: usize = 4;

fn lut_kernel<S: LutSample>(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    let tag = src.tag;
    let n = tag.num_channels() * S::BYTES;
    let color = tag.is_rgb();
    let alpha = tag.alpha_index().map(|a| a * S::BYTES);
    let (w, h) = (src.width.min(dest.width), src.height.min(dest.height));

    for r in 0..h {
        let srow = src.row(r);
        let mut drow = dest.row_mut(r);
        for (s, d) in srow.data().chunks_exact(n).zip(drow.data_mut().chunks_exact_mut(n)).take(w as usize) {
            if color {
                let mid = [
                    t.get(1, S::get(&s[0..])),
                    t.get(2, S::get(&s[S::BYTES..])),
                    t.get(3, S::get(&s[2 * S::BYTES..])),
                ];
                let mut out = mid.map(|v| t.get(VALUE, v as usize) as f32);
                interpolate_mid(mid.map(|v| v as f32), &mut out);
                for (c, v) in out.iter().enumerate() {
                    S::put(*v as u16, &mut d[c * S::BYTES..]);
                }
            } else {
                S::put(t.get(VALUE, S::get(s)), d);
            }
            if let Some(a) = alpha {
                S::put(t.get(ALPHA, S::get(&s[a..])), &mut d[a..]);
            }
        }
    }
}

fn curves_u8(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    lut_kernel::<U8Sample>(src, dest, t)
}

fn curves_u16(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    lut_kernel::<U16Sample>(src, dest, t)
}

/// Linear lookup of a normalized value in a 65536-entry table.
fn sample(curve: &[u16], v: f32) -> f32 {
    let pos = v.clamp(0.0, 1.0) * 65535.0;
    let i = (pos as usize).min(65534);
    let frac = pos - i as f32;
    let (a, b) = (curve[i] as f32, curve[i + 1] as f32);
    (a + (b - a) * frac) / 65535.0
}

fn float_kernel(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    let tag = src.tag;
    let precision = tag.precision();
    let bpc = precision.bytes();
    let n = tag.bytes();
    let color = tag.is_rgb();
    let alpha = tag.alpha_index().map(|a| a * bpc);
    let (w, h) = (src.width.min(dest.width), src.height.min(dest.height));

    for r in 0..h {
        let srow = src.row(r);
        let mut drow = dest.row_mut(r);
        for (s, d) in srow.data().chunks_exact(n).zip(drow.data_mut().chunks_exact_mut(n)).take(w as usize) {
            if color {
                let mid: [f32; 3] = std::array::from_fn(|c| sample(&t.curves[c + 1], precision.read(&s[c * bpc..])));
                let mut out = mid.map(|v| sample(&t.curves[VALUE], v));
                interpolate_mid(mid, &mut out);
                for (c, v) in out.iter().enumerate() {
                    precision.write(*v, &mut d[c * bpc..]);
                }
            } else {
                precision.write(sample(&t.curves[VALUE], precision.read(s)), d);
            }
            if let Some(a) = alpha {
                precision.write(sample(&t.curves[ALPHA], precision.read(&s[a..])), &mut d[a..]);
            }
        }
    }
}

fn curves_float(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    float_kernel(src, dest, t)
}

fn curves_float16(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &CurveTables) {
    float_kernel(src, dest, t)
}

// ============================================================================
// DISPATCH
// ============================================================================

pub type CurvesKernel = fn(&ChunkRef<'_>, &mut ChunkMut<'_>, &CurveTables);

/// Curves capability set for one precision.
#[derive(Clone, Copy)]
pub struct CurvesFuncs {
    pub precision: Precision,
    pub kernel: CurvesKernel,
    pub alloc_curves: fn() -> CurveTables,
    pub init_curve: fn(&mut CurveTables, usize),
    pub plot_boundary_pts: BoundaryFn,
    pub plot_curve: PlotFn,
    pub convert_ui_value: fn(i32) -> f64,
    pub calculate_free_curve: fn(&[u8; 256], &mut [u16]),
}

impl PartialEq for CurvesFuncs {
    fn eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.kernel as usize == other.kernel as usize
            && self.alloc_curves as usize == other.alloc_curves as usize
            && self.init_curve as usize == other.init_curve as usize
            && self.plot_boundary_pts as usize == other.plot_boundary_pts as usize
            && self.plot_curve as usize == other.plot_curve as usize
            && self.convert_ui_value as usize == other.convert_ui_value as usize
            && self.calculate_free_curve as usize == other.calculate_free_curve as usize
    }
}

impl fmt::Debug for CurvesFuncs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurvesFuncs").field("precision", &self.precision).finish()
    }
}

impl CurvesFuncs {
    /// Sample every curve of `config` at this precision.
    pub fn calculate_curves(&self, config: &CurvesConfig) -> CurveTables {
        let mut t = (self.alloc_curves)();
        for c in 0..CURVES {
            (self.init_curve)(&mut t, c);
            match config.curve_type[c] {
                CurveType::Free => (self.calculate_free_curve)(&config.ui_curves[c], &mut t.curves[c]),
                CurveType::Smooth => {
                    let points = ui_points(&config.points[c], self.convert_ui_value);
                    calculate_curve(&mut t.curves[c], &points, self.plot_boundary_pts, self.plot_curve);
                }
            }
        }
        t
    }
}

/// Select the curves kernels for `tag`. `None` (with a warning) for a tag
/// without precision.
pub fn curves_funcs(tag: Tag) -> Option<CurvesFuncs> {
    let precision = tag.precision();
    let wide = |kernel: CurvesKernel, convert: fn(i32) -> f64, free: fn(&[u8; 256], &mut [u16])| CurvesFuncs {
        precision,
        kernel,
        alloc_curves: alloc_u16,
        init_curve: init_curve_u16,
        plot_boundary_pts: plot_boundary_pts_u16,
        plot_curve: plot_curve_u16,
        convert_ui_value: convert,
        calculate_free_curve: free,
    };
    let funcs = match precision {
        Precision::U8 => CurvesFuncs {
            precision,
            kernel: curves_u8,
            alloc_curves: alloc_u8,
            init_curve: init_curve_u8,
            plot_boundary_pts: plot_boundary_pts_u8,
            plot_curve: plot_curve_u8,
            convert_ui_value: convert_ui_value_u8,
            calculate_free_curve: calculate_free_curve_u8,
        },
        Precision::U16 => wide(curves_u16, convert_ui_value_u16, calculate_free_curve_u16),
        Precision::Bfp => wide(curves_u16, convert_ui_value_bfp, calculate_free_curve_bfp),
        Precision::Float => wide(curves_float, convert_ui_value_u16, calculate_free_curve_u16),
        Precision::Float16 => wide(curves_float16, convert_ui_value_u16, calculate_free_curve_u16),
        Precision::None => {
            log::warn!("curves: no kernels for precision of {}", tag);
            return None;
        }
    };
    Some(funcs)
}

/// Apply curves to a drawable over its mask bounds, recording one undo step.
pub fn apply_curves(project: &mut Project, id: DrawableId, config: &CurvesConfig) -> Result<(), ImageError> {
    let tag = project.drawable(id)?.tag();
    let funcs = curves_funcs(tag).ok_or(ImageError::Unsupported(tag))?;
    let tables = funcs.calculate_curves(config);
    let mut map = ImageMap::new(project, id)?;
    map.apply(|src, dest| (funcs.kernel)(src, dest, &tables))?;
    map.commit()?;
    log::info!("curves applied to {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{Alpha, Format};

    fn u8_funcs() -> CurvesFuncs {
        curves_funcs(Tag::new(Precision::U8, Format::Rgb, Alpha::No)).unwrap()
    }

    #[test]
    fn default_curves_are_identity() {
        let cfg = CurvesConfig::default();
        let t = u8_funcs().calculate_curves(&cfg);
        for c in 0..CURVES {
            for i in 0..256 {
                assert_eq!(t.curves[c][i], i as u16, "curve {} entry {}", c, i);
            }
        }
        let t16 = curves_funcs(Tag::new(Precision::U16, Format::Gray, Alpha::No)).unwrap().calculate_curves(&cfg);
        assert_eq!(t16.curves[VALUE][0], 0);
        assert_eq!(t16.curves[VALUE][65535], 65535);
        assert!((t16.curves[VALUE][30000] as i32 - 30000).abs() <= 1);
    }

    #[test]
    fn boundary_holds_end_values() {
        let mut cfg = CurvesConfig::default();
        cfg.set_point(CurveChannel::Value, 0, 64, 32);
        cfg.set_point(CurveChannel::Value, 16, 192, 224);
        let t = u8_funcs().calculate_curves(&cfg);
        let v = &t.curves[VALUE];
        assert!(v[..64].iter().all(|&x| x == 32));
        assert!(v[192..].iter().all(|&x| x == 224));
        assert!(v.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(cfg.ui_curves[VALUE][10], 32);
    }

    #[test]
    fn free_curve_u16_expands_by_257() {
        let mut ui = [0u8; 256];
        for (i, v) in ui.iter_mut().enumerate() {
            *v = 255 - i as u8;
        }
        let mut curve = vec![0u16; 65536];
        calculate_free_curve_u16(&ui, &mut curve);
        assert_eq!(curve[0], 65535);
        assert_eq!(curve[257], 254 * 257);
        assert_eq!(curve[65535], 0);
    }

    #[test]
    fn file_round_trip() {
        let mut cfg = CurvesConfig::default();
        cfg.set_point(CurveChannel::Red, 8, 128, 90);
        cfg.set_point(CurveChannel::Alpha, 3, 40, 200);
        let mut buf = Vec::new();
        cfg.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(FILE_HEADER));
        assert_eq!(text.lines().count(), 1 + CURVES);

        let back = CurvesConfig::read_from(buf.as_slice()).unwrap();
        assert_eq!(back.points, cfg.points);
        assert_eq!(back.ui_curves, cfg.ui_curves);
    }

    #[test]
    fn free_curves_write_nine_samples() {
        let mut cfg = CurvesConfig::default();
        let mut ui = [0u8; 256];
        for (i, v) in ui.iter_mut().enumerate() {
            *v = (i / 2) as u8;
        }
        cfg.set_free_curve(CurveChannel::Green, ui);
        let pts = cfg.file_points()[CurveChannel::Green.index()];
        assert_eq!(pts[0], [0, 0]);
        assert_eq!(pts[8], [128, 64]);
        assert_eq!(pts[16], [255, 127]);
        assert_eq!(pts[1], NO_POINT);
    }

    #[test]
    fn bad_files_are_rejected() {
        assert!(matches!(CurvesConfig::read_from(&b"# GIMP Levels File\n"[..]), Err(CurvesError::BadHeader)));
        let short = format!("{}0 0 255 255\n", FILE_HEADER);
        assert!(matches!(
            CurvesConfig::read_from(short.as_bytes()),
            Err(CurvesError::BadField { curve: 0, point: 2 })
        ));
        let wide = format!("{}0 0 300 255\n", FILE_HEADER);
        assert!(matches!(
            CurvesConfig::read_from(wide.as_bytes()),
            Err(CurvesError::OutOfRange { curve: 0, point: 1, value: 300 })
        ));
    }

    #[test]
    fn dispatch_is_deterministic() {
        for precision in Precision::ALL {
            let tag = Tag::new(precision, Format::Rgb, Alpha::Yes);
            assert_eq!(curves_funcs(tag), curves_funcs(tag));
        }
        assert!(curves_funcs(Tag::null()).is_none());
        assert_ne!(
            curves_funcs(Tag::new(Precision::U16, Format::Gray, Alpha::No)),
            curves_funcs(Tag::new(Precision::Bfp, Format::Gray, Alpha::No))
        );
    }

    #[test]
    fn float_samples_table() {
        let mut curve = vec![0u16; 65536];
        for (i, v) in curve.iter_mut().enumerate() {
            *v = (65535 - i) as u16;
        }
        assert!((sample(&curve, 0.25) - 0.75).abs() < 1e-4);
        assert_eq!(sample(&curve, 2.0), 0.0);
    }
}
