//! Pixel operations built on the pixel-area walk: histograms, levels and
//! curves, applied to drawables through [`image_map::ImageMap`].

pub mod curves;
pub mod histogram;
pub mod image_map;
pub mod levels;

/// Integer sample encoding used by the table-driven kernels.
pub(crate) trait LutSample {
    const BYTES: usize;
    fn get(b: &[u8]) -> usize;
    fn put(v: u16, b: &mut [u8]);
}

pub(crate) struct U8Sample;
pub(crate) struct U16Sample;

impl LutSample for U8Sample {
    const BYTES: usize = 1;

    #[inline]
    fn get(b: &[u8]) -> usize {
        b[0] as usize
    }

    #[inline]
    fn put(v: u16, b: &mut [u8]) {
        b[0] = v as u8;
    }
}

impl LutSample for U16Sample {
    const BYTES: usize = 2;

    #[inline]
    fn get(b: &[u8]) -> usize {
        u16::from_ne_bytes([b[0], b[1]]) as usize
    }

    #[inline]
    fn put(v: u16, b: &mut [u8]) {
        b[..2].copy_from_slice(&v.to_ne_bytes());
    }
}
