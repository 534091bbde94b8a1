// ============================================================================
// LEVELS - input/output range remap with gamma, per precision
// ============================================================================
//
// Parameters are normalized (0.0..=1.0, or up to BFP_MAX for bfp). Integer
// precisions compile them into lookup tables; float precisions evaluate the
// transfer directly.
// ============================================================================

use rayon::prelude::*;

use super::histogram::{Histogram, HistogramChannel};
use super::image_map::ImageMap;
use super::{LutSample, U8Sample, U16Sample};
use crate::drawable::DrawableId;
use crate::error::ImageError;
use crate::pixelarea::{ChunkMut, ChunkRef};
use crate::project::Project;
use crate::tag::{ONE_BFP, Precision, Tag};

const CHANNELS: usize = 5;

/// Auto-levels clips this fraction of pixels at each end.
const AUTO_CLIP: f64 = 0.006;

#[derive(Clone, Debug, PartialEq)]
pub struct LevelsParams {
    pub low_input: [f32; CHANNELS],
    pub high_input: [f32; CHANNELS],
    pub gamma: [f32; CHANNELS],
    pub low_output: [f32; CHANNELS],
    pub high_output: [f32; CHANNELS],
}

impl LevelsParams {
    /// Identity levels for `precision`.
    pub fn new(precision: Precision) -> Self {
        let max = precision.max_value();
        Self {
            low_input: [0.0; CHANNELS],
            high_input: [max; CHANNELS],
            gamma: [1.0; CHANNELS],
            low_output: [0.0; CHANNELS],
            high_output: [max; CHANNELS],
        }
    }

    pub fn reset_channel(&mut self, channel: HistogramChannel, precision: Precision) {
        let i = channel.index();
        let max = precision.max_value();
        self.low_input[i] = 0.0;
        self.high_input[i] = max;
        self.gamma[i] = 1.0;
        self.low_output[i] = 0.0;
        self.high_output[i] = max;
    }

    pub fn set_channel(&mut self, channel: HistogramChannel, low_in: f32, high_in: f32, gamma: f32, low_out: f32, high_out: f32) {
        let i = channel.index();
        self.low_input[i] = low_in;
        self.high_input[i] = high_in;
        self.gamma[i] = gamma;
        self.low_output[i] = low_out;
        self.high_output[i] = high_out;
    }

    /// Stretch each color channel so about 0.6% of pixels clip at either
    /// end. Gray images stretch the value channel instead.
    pub fn auto_levels(&mut self, hist: &Histogram, precision: Precision) {
        for ch in HistogramChannel::ALL {
            self.reset_channel(ch, precision);
        }
        if hist.is_color() {
            for ch in HistogramChannel::COLORS {
                self.adjust_channel(hist, ch);
            }
        } else {
            self.adjust_channel(hist, HistogramChannel::Value);
        }
    }

    fn adjust_channel(&mut self, hist: &Histogram, channel: HistogramChannel) {
        let i = channel.index();
        let values = hist.values(channel);
        let count: f64 = values.iter().sum();
        if count == 0.0 {
            self.low_input[i] = 0.0;
            self.high_input[i] = 0.0;
            return;
        }
        let bins = values.len();

        let mut new_count = 0.0;
        for b in 0..bins.saturating_sub(1) {
            new_count += values[b];
            let pct = new_count / count;
            let next = (new_count + values[b]) / count;
            if (pct - AUTO_CLIP).abs() < (next - AUTO_CLIP).abs() {
                self.low_input[i] = hist.bin_value(b);
                break;
            }
        }

        let mut new_count = 0.0;
        for b in (0..bins).rev() {
            new_count += values[b];
            let pct = new_count / count;
            let next = (new_count + values[b]) / count;
            if (pct - AUTO_CLIP).abs() < (next - AUTO_CLIP).abs() {
                self.high_input[i] = hist.bin_value(b);
                break;
            }
        }
    }
}

// ============================================================================
// TRANSFER FUNCTIONS
// ============================================================================

fn compute_input(v: f32, low: f32, high: f32, gamma: f32, clip: bool) -> f32 {
    let mut inten = if high != low { (v - low) / (high - low) } else { v - low };
    inten = if clip { inten.clamp(0.0, 1.0) } else { inten.max(0.0) };
    if gamma != 0.0 {
        inten = inten.powf(1.0 / gamma);
    }
    inten
}

fn compute_output(v: f32, low: f32, high: f32, clip: bool) -> f32 {
    let out = if high >= low { v * (high - low) + low } else { low - v * (low - high) };
    if clip { out.clamp(0.0, 1.0) } else { out }
}

/// Keep the middle of three channels at the same relative position between
/// the other two after they have been remapped.
pub(crate) fn interpolate_mid(old: [f32; 3], new: &mut [f32; 3]) {
    const ORDERS: [(usize, usize, usize); 6] =
        [(0, 1, 2), (2, 1, 0), (1, 2, 0), (0, 2, 1), (2, 0, 1), (1, 0, 2)];
    for (lo, mid, hi) in ORDERS {
        if old[lo] < old[mid] && old[mid] < old[hi] {
            new[mid] = new[lo] + (old[mid] - old[lo]) * (new[hi] - new[lo]) / (old[hi] - old[lo]);
            return;
        }
    }
}

/// Compiled levels. Integer precisions fill the tables; float precisions
/// read `params` directly.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelsTransfers {
    pub input: [Vec<u16>; CHANNELS],
    pub output: [Vec<u16>; CHANNELS],
    pub params: LevelsParams,
}

impl LevelsTransfers {
    fn with_len(len: usize, precision: Precision) -> Self {
        Self {
            input: std::array::from_fn(|_| vec![0; len]),
            output: std::array::from_fn(|_| vec![0; len]),
            params: LevelsParams::new(precision),
        }
    }

    #[inline]
    fn map(&self, channel: usize, v: usize) -> u16 {
        self.output[channel][self.input[channel][v] as usize]
    }
}

fn alloc_u8() -> LevelsTransfers {
    LevelsTransfers::with_len(256, Precision::U8)
}

fn alloc_u16() -> LevelsTransfers {
    LevelsTransfers::with_len(65536, Precision::U16)
}

fn alloc_bfp() -> LevelsTransfers {
    LevelsTransfers::with_len(65536, Precision::Bfp)
}

fn alloc_float() -> LevelsTransfers {
    LevelsTransfers::with_len(0, Precision::Float)
}

fn alloc_float16() -> LevelsTransfers {
    LevelsTransfers::with_len(0, Precision::Float16)
}

/// Fill integer tables of `len` entries. `scale` turns a normalized
/// parameter into a fraction of the table's range.
fn fill_tables(params: &LevelsParams, t: &mut LevelsTransfers, max: f32, scale: f32) {
    t.params = params.clone();
    for ch in 0..CHANNELS {
        let (lo_in, hi_in) = (params.low_input[ch] * scale, params.high_input[ch] * scale);
        let (lo_out, hi_out) = (params.low_output[ch] * scale, params.high_output[ch] * scale);
        let gamma = params.gamma[ch];
        t.input[ch].par_iter_mut().enumerate().for_each(|(i, o)| {
            *o = (max * compute_input(i as f32 / max, lo_in, hi_in, gamma, true) + 0.5) as u16;
        });
        t.output[ch].par_iter_mut().enumerate().for_each(|(i, o)| {
            *o = (max * compute_output(i as f32 / max, lo_out, hi_out, true) + 0.5) as u16;
        });
    }
}

fn calculate_u8(params: &LevelsParams, t: &mut LevelsTransfers) {
    fill_tables(params, t, 255.0, 1.0)
}

fn calculate_u16(params: &LevelsParams, t: &mut LevelsTransfers) {
    fill_tables(params, t, 65535.0, 1.0)
}

fn calculate_bfp(params: &LevelsParams, t: &mut LevelsTransfers) {
    fill_tables(params, t, 65535.0, ONE_BFP as f32 / 65535.0)
}

fn calculate_float(params: &LevelsParams, t: &mut LevelsTransfers) {
    t.params = params.clone();
}

// ============================================================================
// KERNELS
// ============================================================================

const VALUE: usize = 0;
const ALPHA: usize = 4;

fn lut_kernel<S: LutSample>(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
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
                    t.map(1, S::get(&s[0..])),
                    t.map(2, S::get(&s[S::BYTES..])),
                    t.map(3, S::get(&s[2 * S::BYTES..])),
                ];
                let mut out = mid.map(|v| t.map(VALUE, v as usize) as f32);
                interpolate_mid(mid.map(|v| v as f32), &mut out);
                for (c, v) in out.iter().enumerate() {
                    S::put(*v as u16, &mut d[c * S::BYTES..]);
                }
            } else {
                S::put(t.map(VALUE, S::get(s)), d);
            }
            if let Some(a) = alpha {
                S::put(t.map(ALPHA, S::get(&s[a..])), &mut d[a..]);
            }
        }
    }
}

fn levels_u8(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
    lut_kernel::<U8Sample>(src, dest, t)
}

fn levels_u16(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
    lut_kernel::<U16Sample>(src, dest, t)
}

fn transfer(p: &LevelsParams, ch: usize, v: f32) -> f32 {
    let x = compute_input(v, p.low_input[ch], p.high_input[ch], p.gamma[ch], false);
    compute_output(x, p.low_output[ch], p.high_output[ch], false)
}

fn float_kernel(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
    let tag = src.tag;
    let precision = tag.precision();
    let bpc = precision.bytes();
    let n = tag.bytes();
    let color = tag.is_rgb();
    let alpha = tag.alpha_index().map(|a| a * bpc);
    let p = &t.params;
    let (w, h) = (src.width.min(dest.width), src.height.min(dest.height));

    for r in 0..h {
        let srow = src.row(r);
        let mut drow = dest.row_mut(r);
        for (s, d) in srow.data().chunks_exact(n).zip(drow.data_mut().chunks_exact_mut(n)).take(w as usize) {
            if color {
                for c in 0..3 {
                    let v = transfer(p, c + 1, precision.read(&s[c * bpc..]));
                    precision.write(transfer(p, VALUE, v), &mut d[c * bpc..]);
                }
            } else {
                precision.write(transfer(p, VALUE, precision.read(s)), d);
            }
            if let Some(a) = alpha {
                precision.write(transfer(p, ALPHA, precision.read(&s[a..])), &mut d[a..]);
            }
        }
    }
}

fn levels_float(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
    float_kernel(src, dest, t)
}

fn levels_float16(src: &ChunkRef<'_>, dest: &mut ChunkMut<'_>, t: &LevelsTransfers) {
    float_kernel(src, dest, t)
}

// ============================================================================
// DISPATCH
// ============================================================================

pub type LevelsKernel = fn(&ChunkRef<'_>, &mut ChunkMut<'_>, &LevelsTransfers);

/// Levels capability set for one precision. Built per operation by
/// [`levels_funcs`] and passed by value.
#[derive(Clone, Copy)]
pub struct LevelsFuncs {
    pub precision: Precision,
    pub kernel: LevelsKernel,
    pub alloc_transfers: fn() -> LevelsTransfers,
    pub calculate_transfers: fn(&LevelsParams, &mut LevelsTransfers),
    /// Normalized value to the number shown in a text field.
    pub to_ui: fn(f32) -> f32,
    pub from_ui: fn(f32) -> f32,
    pub format_value: fn(f32) -> String,
    /// Largest value a text field accepts, in UI units.
    pub ui_max: f32,
    /// Initial text of the low-in, high-in, low-out and high-out fields.
    pub defaults: [&'static str; 4],
}

impl PartialEq for LevelsFuncs {
    fn eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.kernel as usize == other.kernel as usize
            && self.alloc_transfers as usize == other.alloc_transfers as usize
            && self.calculate_transfers as usize == other.calculate_transfers as usize
            && self.to_ui as usize == other.to_ui as usize
            && self.from_ui as usize == other.from_ui as usize
            && self.format_value as usize == other.format_value as usize
            && self.ui_max == other.ui_max
            && self.defaults == other.defaults
    }
}

impl std::fmt::Debug for LevelsFuncs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelsFuncs").field("precision", &self.precision).finish()
    }
}

impl LevelsFuncs {
    /// Compile `params` into fresh transfer tables.
    pub fn transfers(&self, params: &LevelsParams) -> LevelsTransfers {
        let mut t = (self.alloc_transfers)();
        (self.calculate_transfers)(params, &mut t);
        t
    }

    /// Parse a text field value into a normalized parameter, clamped to the
    /// precision's range.
    pub fn parse_value(&self, text: &str) -> Option<f32> {
        let v: f32 = text.trim().parse().ok()?;
        if !v.is_finite() {
            return None;
        }
        Some((self.from_ui)(v.clamp(0.0, self.ui_max)))
    }
}

fn to_ui_u8(v: f32) -> f32 {
    v * 255.0
}

fn from_ui_u8(v: f32) -> f32 {
    v / 255.0
}

fn to_ui_u16(v: f32) -> f32 {
    v * 65535.0
}

fn from_ui_u16(v: f32) -> f32 {
    v / 65535.0
}

fn ui_identity(v: f32) -> f32 {
    v
}

fn format_int(v: f32) -> String {
    format!("{:.0}", v)
}

fn format_float(v: f32) -> String {
    format!("{:.3}", v)
}

fn format_bfp(v: f32) -> String {
    format!("{:.4}", v)
}

/// Select the levels kernels for `tag`. `None` (with a warning) for a tag
/// without precision; callers must check.
pub fn levels_funcs(tag: Tag) -> Option<LevelsFuncs> {
    let precision = tag.precision();
    let funcs = match precision {
        Precision::U8 => LevelsFuncs {
            precision,
            kernel: levels_u8,
            alloc_transfers: alloc_u8,
            calculate_transfers: calculate_u8,
            to_ui: to_ui_u8,
            from_ui: from_ui_u8,
            format_value: format_int,
            ui_max: 255.0,
            defaults: ["0", "255", "0", "255"],
        },
        Precision::U16 => LevelsFuncs {
            precision,
            kernel: levels_u16,
            alloc_transfers: alloc_u16,
            calculate_transfers: calculate_u16,
            to_ui: to_ui_u16,
            from_ui: from_ui_u16,
            format_value: format_int,
            ui_max: 65535.0,
            defaults: ["0", "65535", "0", "65535"],
        },
        Precision::Float => LevelsFuncs {
            precision,
            kernel: levels_float,
            alloc_transfers: alloc_float,
            calculate_transfers: calculate_float,
            to_ui: ui_identity,
            from_ui: ui_identity,
            format_value: format_float,
            ui_max: 1.0,
            defaults: ["0.000", "1.000", "0.000", "1.000"],
        },
        Precision::Float16 => LevelsFuncs {
            precision,
            kernel: levels_float16,
            alloc_transfers: alloc_float16,
            calculate_transfers: calculate_float,
            to_ui: ui_identity,
            from_ui: ui_identity,
            format_value: format_float,
            ui_max: 1.0,
            defaults: ["0.000", "1.000", "0.000", "1.000"],
        },
        Precision::Bfp => LevelsFuncs {
            precision,
            kernel: levels_u16,
            alloc_transfers: alloc_bfp,
            calculate_transfers: calculate_bfp,
            to_ui: ui_identity,
            from_ui: ui_identity,
            format_value: format_bfp,
            ui_max: Precision::Bfp.max_value(),
            defaults: ["0.0000", "1.9999", "0.0000", "1.9999"],
        },
        Precision::None => {
            log::warn!("levels: no kernels for precision of {}", tag);
            return None;
        }
    };
    Some(funcs)
}

// ============================================================================
// ONE-SHOT APPLICATION
// ============================================================================

/// Apply levels to a drawable over its mask bounds, recording one undo step.
pub fn apply_levels(project: &mut Project, id: DrawableId, params: &LevelsParams) -> Result<(), ImageError> {
    let tag = project.drawable(id)?.tag();
    let funcs = levels_funcs(tag).ok_or(ImageError::Unsupported(tag))?;
    let transfers = funcs.transfers(params);
    let mut map = ImageMap::new(project, id)?;
    map.apply(|src, dest| (funcs.kernel)(src, dest, &transfers))?;
    map.commit()?;
    log::info!("levels applied to {}", id);
    Ok(())
}

/// Stretch a drawable's channels from its own histogram.
pub fn auto_levels(project: &mut Project, id: DrawableId) -> Result<LevelsParams, ImageError> {
    let bins = project.settings.histogram_bins;
    let (x1, y1, x2, y2) = project.mask_bounds(id).ok_or(ImageError::EmptySelection)?;
    let d = project.drawable(id)?;
    let tag = d.tag();
    let area = crate::pixelarea::PixelArea::new(d.data(), x1, y1, x2 - x1, y2 - y1);
    let hist = Histogram::compute(&area, None, bins).ok_or(ImageError::Unsupported(tag))?;
    let mut params = LevelsParams::new(tag.precision());
    params.auto_levels(&hist, tag.precision());
    apply_levels(project, id, &params)?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use crate::canvas::{Canvas, Storage};
    use crate::pixelarea::{self, PixelArea, PixelAreaMut};
    use crate::tag::{Alpha, Format};

    fn run(funcs: &LevelsFuncs, params: &LevelsParams, src: &Canvas) -> Canvas {
        let t = funcs.transfers(params);
        let mut out = src.new_like().unwrap();
        let s = PixelArea::whole(src);
        let mut d = PixelAreaMut::whole(&mut out);
        for c in pixelarea::chunks(&[s.spec(), d.spec()]) {
            let sc = s.chunk(&c);
            let mut dc = d.chunk_mut(&c).unwrap();
            (funcs.kernel)(&sc, &mut dc, &t);
        }
        out
    }

    #[test]
    fn identity_tables() {
        let f = levels_funcs(Tag::new(Precision::U8, Format::Gray, Alpha::No)).unwrap();
        let t = f.transfers(&LevelsParams::new(Precision::U8));
        for i in 0..256 {
            assert_eq!(t.map(VALUE, i), i as u16);
        }
        let f = levels_funcs(Tag::new(Precision::Bfp, Format::Gray, Alpha::No)).unwrap();
        let t = f.transfers(&LevelsParams::new(Precision::Bfp));
        assert_eq!(t.map(VALUE, 0), 0);
        assert_eq!(t.map(VALUE, 32768), 32768);
        assert_eq!(t.map(VALUE, 65535), 65535);
    }

    #[test]
    fn input_range_stretches_gray_u8() {
        let tag = Tag::new(Precision::U8, Format::Gray, Alpha::Yes);
        let f = levels_funcs(tag).unwrap();
        let mut p = LevelsParams::new(Precision::U8);
        p.set_channel(HistogramChannel::Value, 0.0, 0.5, 1.0, 0.0, 1.0);
        let src = Canvas::from_raw(tag, 3, 1, Storage::Tiled, &[0, 10, 64, 20, 200, 30]).unwrap();
        let out = run(&f, &p, &src);
        assert_eq!(out.to_raw(), vec![0, 10, 128, 20, 255, 30]);
    }

    #[test]
    fn mid_channel_keeps_relative_position() {
        let mut out = [0.0, 0.0, 200.0];
        interpolate_mid([10.0, 20.0, 30.0], &mut out);
        assert_eq!(out, [0.0, 100.0, 200.0]);
        let mut flat = [5.0, 6.0, 7.0];
        interpolate_mid([10.0, 10.0, 30.0], &mut flat);
        assert_eq!(flat, [5.0, 6.0, 7.0]);
    }

    #[test]
    fn float_is_unclipped() {
        let tag = Tag::new(Precision::Float, Format::Gray, Alpha::No);
        let f = levels_funcs(tag).unwrap();
        let mut p = LevelsParams::new(Precision::Float);
        p.set_channel(HistogramChannel::Value, 0.0, 0.5, 1.0, 0.0, 1.0);
        let mut raw = Vec::new();
        raw.extend_from_slice(&0.25f32.to_ne_bytes());
        raw.extend_from_slice(&1.0f32.to_ne_bytes());
        let src = Canvas::from_raw(tag, 2, 1, Storage::Flat, &raw).unwrap();
        let out = run(&f, &p, &src);
        assert_eq!(out.get_pixel(0, 0), Some(&0.5f32.to_ne_bytes()[..]));
        assert_eq!(out.get_pixel(1, 0), Some(&2.0f32.to_ne_bytes()[..]));
    }

    #[test]
    fn float_alpha_uses_alpha_channel() {
        let tag = Tag::new(Precision::Float, Format::Gray, Alpha::Yes);
        let f = levels_funcs(tag).unwrap();
        let mut p = LevelsParams::new(Precision::Float);
        p.set_channel(HistogramChannel::Alpha, 0.0, 0.5, 1.0, 0.0, 1.0);
        let mut raw = Vec::new();
        raw.extend_from_slice(&0.25f32.to_ne_bytes());
        raw.extend_from_slice(&0.25f32.to_ne_bytes());
        let src = Canvas::from_raw(tag, 1, 1, Storage::Flat, &raw).unwrap();
        let out = run(&f, &p, &src);
        let mut expected = Vec::new();
        expected.extend_from_slice(&0.25f32.to_ne_bytes());
        expected.extend_from_slice(&0.5f32.to_ne_bytes());
        assert_eq!(out.get_pixel(0, 0), Some(&expected[..]));
    }

    #[test]
    fn float16_matches_float() {
        let tag = Tag::new(Precision::Float16, Format::Gray, Alpha::No);
        let f = levels_funcs(tag).unwrap();
        let mut p = LevelsParams::new(Precision::Float16);
        p.gamma[VALUE] = 2.0;
        let raw = f16::from_f32(0.25).to_bits().to_ne_bytes();
        let src = Canvas::from_raw(tag, 1, 1, Storage::Flat, &raw).unwrap();
        let out = run(&f, &p, &src);
        let v = f16::from_bits(u16::from_ne_bytes([out.to_raw()[0], out.to_raw()[1]])).to_f32();
        assert!((v - 0.5).abs() < 1e-3);
    }

    #[test]
    fn dispatch_is_deterministic() {
        for precision in Precision::ALL {
            let tag = Tag::new(precision, crate::tag::Format::Rgb, Alpha::Yes);
            assert_eq!(levels_funcs(tag), levels_funcs(tag));
        }
        assert!(levels_funcs(Tag::null()).is_none());
    }

    #[test]
    fn parse_clamps_to_range() {
        let f = levels_funcs(Tag::new(Precision::U8, Format::Rgb, Alpha::No)).unwrap();
        assert_eq!(f.parse_value("300"), Some(1.0));
        assert_eq!(f.parse_value("0"), Some(0.0));
        assert_eq!(f.parse_value("abc"), None);
        assert_eq!((f.format_value)((f.to_ui)(1.0)), "255");
    }

    #[test]
    fn auto_levels_finds_clip_points() {
        let tag = Tag::new(Precision::U8, Format::Gray, Alpha::No);
        let mut data = vec![100u8; 1000];
        data[0] = 0;
        data[999] = 255;
        data[1..500].fill(50);
        data[500..999].fill(200);
        let c = Canvas::from_raw(tag, 1000, 1, Storage::Tiled, &data).unwrap();
        let hist = Histogram::compute(&PixelArea::whole(&c), None, 256).unwrap();
        let mut p = LevelsParams::new(Precision::U8);
        p.auto_levels(&hist, Precision::U8);
        assert_eq!(p.low_input[VALUE], 50.0 / 255.0);
        assert_eq!(p.high_input[VALUE], 200.0 / 255.0);
    }
}
