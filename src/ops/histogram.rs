// ============================================================================
// HISTOGRAM - per-channel value counts over a pixel area
// ============================================================================

use half::f16;

use crate::pixelarea::{self, ChunkRef, PixelArea};
use crate::tag::{Precision, Tag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HistogramChannel {
    /// Max of the color channels, or the gray sample.
    Value,
    Red,
    Green,
    Blue,
    Alpha,
}

impl HistogramChannel {
    pub const ALL: [HistogramChannel; 5] = [
        HistogramChannel::Value,
        HistogramChannel::Red,
        HistogramChannel::Green,
        HistogramChannel::Blue,
        HistogramChannel::Alpha,
    ];

    pub const COLORS: [HistogramChannel; 3] =
        [HistogramChannel::Red, HistogramChannel::Green, HistogramChannel::Blue];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            HistogramChannel::Value => "value",
            HistogramChannel::Red => "red",
            HistogramChannel::Green => "green",
            HistogramChannel::Blue => "blue",
            HistogramChannel::Alpha => "alpha",
        }
    }
}

/// Summary of one channel over a bin range.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HistogramStats {
    pub mean: f64,
    pub std_dev: f64,
    pub median: usize,
    /// Weight of the whole channel.
    pub pixels: f64,
    /// Weight inside the range.
    pub count: f64,
    /// `count / pixels`.
    pub percentile: f64,
}

/// Weighted bin counts for the five channels.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    precision: Precision,
    bins: usize,
    color: bool,
    alpha: bool,
    values: [Vec<f64>; 5],
}

impl Histogram {
    pub fn new(tag: Tag, bins: usize) -> Self {
        let bins = bins.max(1);
        Self {
            precision: tag.precision(),
            bins,
            color: tag.is_rgb(),
            alpha: tag.has_alpha(),
            values: std::array::from_fn(|_| vec![0.0; bins]),
        }
    }

    /// Bin the pixels of `src`, weighting each by the matching `mask` pixel.
    /// `None` when no kernel exists for the area's precision.
    pub fn compute(src: &PixelArea<'_>, mask: Option<&PixelArea<'_>>, bins: usize) -> Option<Histogram> {
        let funcs = histogram_funcs(src.tag())?;
        let mut hist = Histogram::new(src.tag(), bins);
        match mask {
            Some(m) => {
                for c in pixelarea::chunks(&[src.spec(), m.spec()]) {
                    (funcs.info)(&src.chunk(&c), Some(&m.chunk(&c)), &mut hist);
                }
            }
            None => {
                for c in pixelarea::chunks(&[src.spec()]) {
                    (funcs.info)(&src.chunk(&c), None, &mut hist);
                }
            }
        }
        Some(hist)
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn is_color(&self) -> bool {
        self.color
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha
    }

    pub fn values(&self, channel: HistogramChannel) -> &[f64] {
        &self.values[channel.index()]
    }

    /// Normalized sample value at the lower edge of bin `i`.
    pub fn bin_value(&self, i: usize) -> f32 {
        i as f32 / (self.bins - 1).max(1) as f32 * self.precision.max_value()
    }

    fn add(&mut self, channel: HistogramChannel, bin: usize, weight: f64) {
        self.values[channel.index()][bin] += weight;
    }

    /// Total weight in bins `start..=end`.
    pub fn count(&self, channel: HistogramChannel, start: usize, end: usize) -> f64 {
        let v = self.values(channel);
        let end = end.min(self.bins - 1);
        if start > end {
            return 0.0;
        }
        v[start..=end].iter().sum()
    }

    pub fn stats(&self, channel: HistogramChannel, start: usize, end: usize) -> HistogramStats {
        let v = self.values(channel);
        let end = end.min(self.bins - 1);
        let pixels = self.count(channel, 0, self.bins - 1);
        let count = self.count(channel, start, end);
        if count == 0.0 || start > end {
            return HistogramStats { pixels, ..HistogramStats::default() };
        }

        let mean = (start..=end).map(|i| i as f64 * v[i]).sum::<f64>() / count;
        let variance = (start..=end).map(|i| v[i] * (i as f64 - mean).powi(2)).sum::<f64>() / count;

        let mut running = 0.0;
        let mut median = end;
        for i in start..=end {
            running += v[i];
            if running >= count / 2.0 {
                median = i;
                break;
            }
        }

        HistogramStats {
            mean,
            std_dev: variance.sqrt(),
            median,
            pixels,
            count,
            percentile: if pixels > 0.0 { count / pixels } else { 0.0 },
        }
    }
}

// ============================================================================
// PER-PRECISION BINNING
// ============================================================================

/// Maps one encoded sample to a bin index below `bins`.
pub type BinFn = fn(&[u8], usize) -> usize;

/// Capability set for histogram collection at one precision.
#[derive(Clone, Copy)]
pub struct HistogramFuncs {
    pub precision: Precision,
    pub bin: BinFn,
    pub info: fn(&ChunkRef<'_>, Option<&ChunkRef<'_>>, &mut Histogram),
}

impl PartialEq for HistogramFuncs {
    fn eq(&self, other: &Self) -> bool {
        self.precision == other.precision
            && self.bin as usize == other.bin as usize
            && self.info as usize == other.info as usize
    }
}

impl std::fmt::Debug for HistogramFuncs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramFuncs").field("precision", &self.precision).finish()
    }
}

fn bin_u8(b: &[u8], bins: usize) -> usize {
    b[0] as usize * bins / 256
}

fn bin_u16(b: &[u8], bins: usize) -> usize {
    let v = u16::from_ne_bytes([b[0], b[1]]) as usize;
    (v * bins / 65535).min(bins - 1)
}

fn bin_unit(v: f32, bins: usize) -> usize {
    ((v.clamp(0.0, 1.0) * (bins - 1) as f32) as usize).min(bins - 1)
}

fn bin_float(b: &[u8], bins: usize) -> usize {
    bin_unit(f32::from_ne_bytes([b[0], b[1], b[2], b[3]]), bins)
}

fn bin_float16(b: &[u8], bins: usize) -> usize {
    bin_unit(f16::from_bits(u16::from_ne_bytes([b[0], b[1]])).to_f32(), bins)
}

fn bin_bfp(b: &[u8], bins: usize) -> usize {
    let v = u16::from_ne_bytes([b[0], b[1]]) as usize;
    v * bins / 65536
}

fn info_with(bin: BinFn, src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    let tag = src.tag;
    let bpc = tag.bytes_per_channel();
    let bins = hist.bins;
    let alpha = tag.alpha_index();
    let color = tag.is_rgb();
    let width = match mask {
        Some(m) => src.width.min(m.width),
        None => src.width,
    };
    let height = match mask {
        Some(m) => src.height.min(m.height),
        None => src.height,
    };

    for r in 0..height {
        let row = src.row(r);
        let mask_row = mask.map(|m| m.row(r));
        for x in 0..width {
            let px = row.pixel(x);
            let weight = match &mask_row {
                Some(mr) => mr.tag().precision().read(mr.pixel(x)) as f64,
                None => 1.0,
            };
            if weight == 0.0 {
                continue;
            }
            if color {
                let rb = bin(&px[0..], bins);
                let gb = bin(&px[bpc..], bins);
                let bb = bin(&px[2 * bpc..], bins);
                hist.add(HistogramChannel::Red, rb, weight);
                hist.add(HistogramChannel::Green, gb, weight);
                hist.add(HistogramChannel::Blue, bb, weight);
                hist.add(HistogramChannel::Value, rb.max(gb).max(bb), weight);
            } else {
                hist.add(HistogramChannel::Value, bin(px, bins), weight);
            }
            if let Some(a) = alpha {
                hist.add(HistogramChannel::Alpha, bin(&px[a * bpc..], bins), weight);
            }
        }
    }
}

fn info_u8(src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    info_with(bin_u8, src, mask, hist)
}

fn info_u16(src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    info_with(bin_u16, src, mask, hist)
}

fn info_float(src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    info_with(bin_float, src, mask, hist)
}

fn info_float16(src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    info_with(bin_float16, src, mask, hist)
}

fn info_bfp(src: &ChunkRef<'_>, mask: Option<&ChunkRef<'_>>, hist: &mut Histogram) {
    info_with(bin_bfp, src, mask, hist)
}

/// Select the histogram kernels for `tag`. `None` (with a warning) for a
/// tag without precision.
pub fn histogram_funcs(tag: Tag) -> Option<HistogramFuncs> {
    let (bin, info): (BinFn, fn(&ChunkRef<'_>, Option<&ChunkRef<'_>>, &mut Histogram)) = match tag.precision() {
        Precision::U8 => (bin_u8, info_u8),
        Precision::U16 => (bin_u16, info_u16),
        Precision::Float => (bin_float, info_float),
        Precision::Float16 => (bin_float16, info_float16),
        Precision::Bfp => (bin_bfp, info_bfp),
        Precision::None => {
            log::warn!("histogram: no kernels for precision of {}", tag);
            return None;
        }
    };
    Some(HistogramFuncs { precision: tag.precision(), bin, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Canvas, Storage};
    use crate::tag::{Alpha, Format};

    #[test]
    fn value_is_max_of_colors() {
        let tag = Tag::new(Precision::U8, Format::Rgb, Alpha::Yes);
        let mut c = Canvas::with_tile_size(tag, 3, 1, Storage::Tiled, 2).unwrap();
        c.put_pixel(0, 0, &[10, 200, 30, 255]).unwrap();
        c.put_pixel(1, 0, &[0, 0, 0, 0]).unwrap();
        c.put_pixel(2, 0, &[90, 20, 30, 128]).unwrap();
        let h = Histogram::compute(&PixelArea::whole(&c), None, 256).unwrap();
        assert_eq!(h.values(HistogramChannel::Value)[200], 1.0);
        assert_eq!(h.values(HistogramChannel::Value)[90], 1.0);
        assert_eq!(h.values(HistogramChannel::Red)[0], 1.0);
        assert_eq!(h.values(HistogramChannel::Alpha)[128], 1.0);
        assert_eq!(h.count(HistogramChannel::Green, 0, 255), 3.0);
    }

    #[test]
    fn mask_weights_pixels() {
        let tag = Tag::new(Precision::U8, Format::Gray, Alpha::No);
        let mut c = Canvas::new(tag, 2, 1, Storage::Flat).unwrap();
        c.put_pixel(0, 0, &[40]).unwrap();
        c.put_pixel(1, 0, &[50]).unwrap();
        let mut m = Canvas::new(tag, 2, 1, Storage::Flat).unwrap();
        m.put_pixel(0, 0, &[255]).unwrap();
        m.put_pixel(1, 0, &[0]).unwrap();
        let h = Histogram::compute(&PixelArea::whole(&c), Some(&PixelArea::whole(&m)), 256).unwrap();
        assert_eq!(h.values(HistogramChannel::Value)[40], 1.0);
        assert_eq!(h.values(HistogramChannel::Value)[50], 0.0);
    }

    #[test]
    fn u16_top_value_lands_in_last_bin() {
        let tag = Tag::new(Precision::U16, Format::Gray, Alpha::No);
        let mut c = Canvas::new(tag, 1, 1, Storage::Flat).unwrap();
        c.put_pixel(0, 0, &65535u16.to_ne_bytes()).unwrap();
        let h = Histogram::compute(&PixelArea::whole(&c), None, 256).unwrap();
        assert_eq!(h.values(HistogramChannel::Value)[255], 1.0);
    }

    #[test]
    fn stats_over_range() {
        let tag = Tag::new(Precision::U8, Format::Gray, Alpha::No);
        let data = [0u8, 10, 10, 20];
        let c = Canvas::from_raw(tag, 4, 1, Storage::Flat, &data).unwrap();
        let h = Histogram::compute(&PixelArea::whole(&c), None, 256).unwrap();
        let s = h.stats(HistogramChannel::Value, 0, 255);
        assert_eq!(s.count, 4.0);
        assert!((s.mean - 10.0).abs() < 1e-9);
        assert_eq!(s.median, 10);
        let upper = h.stats(HistogramChannel::Value, 10, 255);
        assert!((upper.percentile - 0.75).abs() < 1e-9);
    }

    #[test]
    fn dispatch_is_stable() {
        let tag = Tag::new(Precision::Float16, Format::Rgb, Alpha::No);
        assert_eq!(histogram_funcs(tag), histogram_funcs(tag));
        assert!(histogram_funcs(Tag::null()).is_none());
    }
}
