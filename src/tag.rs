//! Pixel tags: the format, precision and alpha triple that fixes the byte
//! layout of every canvas, pixel area and pixel row.
//!
//! A tag is a plain `Copy` value. Channel count comes from the format and
//! alpha; sample width comes from the precision. Any `None` component makes
//! the tag invalid, and an invalid tag reports zero channels and zero bytes.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Fixed-point value of 1.0 in the bounded fixed point ("bfp") encoding.
pub const ONE_BFP: u32 = 32768;

/// Largest normalized value a bfp sample can hold.
pub const BFP_MAX: f32 = 65535.0 / ONE_BFP as f32;

/// Bit pattern of 1.0 as an IEEE half float.
pub const ONE_FLOAT16: u16 = 15360;

const PRECISION_SHIFT: u32 = 0;
const FORMAT_SHIFT: u32 = 8;
const ALPHA_SHIFT: u32 = 16;
const FIELD_MASK: u32 = 0xff;

// ============================================================================
// COMPONENTS
// ============================================================================

/// Numeric representation of one sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    None,
    U8,
    U16,
    Float,
    Float16,
    Bfp,
}

/// Channel layout of one pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    None,
    Rgb,
    Gray,
    Indexed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Alpha {
    None,
    No,
    Yes,
}

impl Precision {
    pub const ALL: [Precision; 5] = [
        Precision::U8,
        Precision::U16,
        Precision::Float,
        Precision::Float16,
        Precision::Bfp,
    ];

    /// Width of one sample in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Precision::None => 0,
            Precision::U8 => 1,
            Precision::U16 | Precision::Float16 | Precision::Bfp => 2,
            Precision::Float => 4,
        }
    }

    /// Largest value a sample holds once normalized to `f32`.
    pub fn max_value(self) -> f32 {
        match self {
            Precision::Bfp => BFP_MAX,
            _ => 1.0,
        }
    }

    /// Decode one sample at the start of `bytes` into normalized `f32`.
    pub fn read(self, bytes: &[u8]) -> f32 {
        match self {
            Precision::None => 0.0,
            Precision::U8 => bytes[0] as f32 / 255.0,
            Precision::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 65535.0,
            Precision::Float => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Precision::Float16 => f16::from_bits(u16::from_ne_bytes([bytes[0], bytes[1]])).to_f32(),
            Precision::Bfp => u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / ONE_BFP as f32,
        }
    }

    /// Encode a normalized value into the start of `out`.
    /// Integer encodings round to nearest and saturate at their range.
    pub fn write(self, value: f32, out: &mut [u8]) {
        match self {
            Precision::None => {}
            Precision::U8 => out[0] = (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8,
            Precision::U16 => {
                let v = (value * 65535.0 + 0.5).clamp(0.0, 65535.0) as u16;
                out[..2].copy_from_slice(&v.to_ne_bytes());
            }
            Precision::Float => out[..4].copy_from_slice(&value.to_ne_bytes()),
            Precision::Float16 => {
                out[..2].copy_from_slice(&f16::from_f32(value).to_bits().to_ne_bytes())
            }
            Precision::Bfp => {
                let v = (value * ONE_BFP as f32 + 0.5).clamp(0.0, 65535.0) as u16;
                out[..2].copy_from_slice(&v.to_ne_bytes());
            }
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Precision::U8,
            2 => Precision::U16,
            3 => Precision::Float,
            4 => Precision::Float16,
            5 => Precision::Bfp,
            _ => Precision::None,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Precision::None => 0,
            Precision::U8 => 1,
            Precision::U16 => 2,
            Precision::Float => 3,
            Precision::Float16 => 4,
            Precision::Bfp => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Precision::None => "none",
            Precision::U8 => "u8",
            Precision::U16 => "u16",
            Precision::Float => "float",
            Precision::Float16 => "float16",
            Precision::Bfp => "bfp",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "u8" | "8" => Some(Precision::U8),
            "u16" | "16" => Some(Precision::U16),
            "float" | "f32" => Some(Precision::Float),
            "float16" | "f16" | "half" => Some(Precision::Float16),
            "bfp" => Some(Precision::Bfp),
            _ => None,
        }
    }
}

impl Format {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Format::Rgb,
            2 => Format::Gray,
            3 => Format::Indexed,
            _ => Format::None,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Format::None => 0,
            Format::Rgb => 1,
            Format::Gray => 2,
            Format::Indexed => 3,
        }
    }

    /// Color channels, not counting alpha.
    pub fn color_channels(self) -> usize {
        match self {
            Format::None => 0,
            Format::Rgb => 3,
            Format::Gray | Format::Indexed => 1,
        }
    }
}

impl Alpha {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Alpha::No,
            2 => Alpha::Yes,
            _ => Alpha::None,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Alpha::None => 0,
            Alpha::No => 1,
            Alpha::Yes => 2,
        }
    }
}

// ============================================================================
// TAG
// ============================================================================

/// Pixel format descriptor. Two tags are equal iff all three parts match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    precision: Precision,
    format: Format,
    alpha: Alpha,
}

impl Default for Tag {
    fn default() -> Self {
        Self::null()
    }
}

impl Tag {
    pub const fn new(precision: Precision, format: Format, alpha: Alpha) -> Self {
        Self { precision, format, alpha }
    }

    /// The tag with every component unset.
    pub const fn null() -> Self {
        Self::new(Precision::None, Format::None, Alpha::None)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn alpha(&self) -> Alpha {
        self.alpha
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha == Alpha::Yes
    }

    pub fn is_valid(&self) -> bool {
        self.precision != Precision::None && self.format != Format::None && self.alpha != Alpha::None
    }

    pub fn is_rgb(&self) -> bool {
        self.format == Format::Rgb
    }

    pub fn is_gray(&self) -> bool {
        self.format == Format::Gray
    }

    pub fn is_indexed(&self) -> bool {
        self.format == Format::Indexed
    }

    pub fn with_precision(self, precision: Precision) -> Self {
        Self { precision, ..self }
    }

    pub fn with_format(self, format: Format) -> Self {
        Self { format, ..self }
    }

    pub fn with_alpha(self, alpha: Alpha) -> Self {
        Self { alpha, ..self }
    }

    pub fn num_channels(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.format.color_channels() + usize::from(self.has_alpha())
    }

    pub fn bytes_per_channel(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        self.precision.bytes()
    }

    /// Bytes per pixel.
    pub fn bytes(&self) -> usize {
        self.num_channels() * self.bytes_per_channel()
    }

    /// Index of the alpha sample, if the tag carries one.
    pub fn alpha_index(&self) -> Option<usize> {
        if self.is_valid() && self.has_alpha() {
            Some(self.format.color_channels())
        } else {
            None
        }
    }

    /// Encode a normalized RGBA color as one pixel of this tag.
    /// Gray and indexed pixels take the color's luminance.
    pub fn encode_color(&self, rgba: [f32; 4]) -> Vec<u8> {
        let bpc = self.bytes_per_channel();
        let mut out = vec![0u8; self.bytes()];
        if out.is_empty() {
            return out;
        }
        let color: Vec<f32> = match self.format {
            Format::Rgb => rgba[..3].to_vec(),
            _ => vec![0.299 * rgba[0] + 0.587 * rgba[1] + 0.114 * rgba[2]],
        };
        for (i, v) in color.iter().enumerate() {
            self.precision.write(*v, &mut out[i * bpc..]);
        }
        if let Some(a) = self.alpha_index() {
            self.precision.write(rgba[3], &mut out[a * bpc..]);
        }
        out
    }

    pub fn to_bits(&self) -> u32 {
        (self.precision.to_bits() << PRECISION_SHIFT)
            | (self.format.to_bits() << FORMAT_SHIFT)
            | (self.alpha.to_bits() << ALPHA_SHIFT)
    }

    /// Unpack a packed tag. Out-of-range fields decode as `None`.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            precision: Precision::from_bits((bits >> PRECISION_SHIFT) & FIELD_MASK),
            format: Format::from_bits((bits >> FORMAT_SHIFT) & FIELD_MASK),
            alpha: Alpha::from_bits((bits >> ALPHA_SHIFT) & FIELD_MASK),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = match (self.format, self.alpha) {
            (Format::Rgb, Alpha::Yes) => "rgba",
            (Format::Rgb, _) => "rgb",
            (Format::Gray, Alpha::Yes) => "graya",
            (Format::Gray, _) => "gray",
            (Format::Indexed, Alpha::Yes) => "indexeda",
            (Format::Indexed, _) => "indexed",
            (Format::None, _) => "none",
        };
        write!(f, "{}/{}", format, self.precision.name())
    }
}
