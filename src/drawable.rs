//! Drawables: the named, positioned owners of a canvas.
//!
//! Layers, channels and layer masks share one struct. What differs between
//! them lives in [`DrawableKind`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{Canvas, Storage};
use crate::error::CanvasError;
use crate::pixelarea::{self, PixelArea, PixelAreaMut};
use crate::tag::{Alpha, Format, Precision, Tag};

pub type DrawableId = Uuid;

/// Layer compositing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerMode {
    #[default]
    Normal,
    Dissolve,
    Behind,
    Multiply,
    Screen,
    Overlay,
    Difference,
    Addition,
    Subtract,
    DarkenOnly,
    LightenOnly,
    Hue,
    Saturation,
    Color,
    Value,
}

impl LayerMode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => LayerMode::Dissolve,
            2 => LayerMode::Behind,
            3 => LayerMode::Multiply,
            4 => LayerMode::Screen,
            5 => LayerMode::Overlay,
            6 => LayerMode::Difference,
            7 => LayerMode::Addition,
            8 => LayerMode::Subtract,
            9 => LayerMode::DarkenOnly,
            10 => LayerMode::LightenOnly,
            11 => LayerMode::Hue,
            12 => LayerMode::Saturation,
            13 => LayerMode::Color,
            14 => LayerMode::Value,
            _ => LayerMode::Normal,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LayerProps {
    pub opacity: f32,
    pub mode: LayerMode,
    pub preserve_trans: bool,
    pub mask: Option<Box<Drawable>>,
}

#[derive(Clone, Debug)]
pub struct ChannelProps {
    pub color: [u8; 3],
    pub opacity: f32,
    pub show_masked: bool,
}

#[derive(Clone, Debug)]
pub struct MaskProps {
    pub apply: bool,
    pub edit: bool,
    pub show: bool,
}

#[derive(Clone, Debug)]
pub enum DrawableKind {
    Layer(LayerProps),
    Channel(ChannelProps),
    LayerMask(MaskProps),
}

/// What [`Drawable::fill`] paints with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillType {
    Transparent,
    White,
    Black,
    /// Normalized RGBA.
    Color([f32; 4]),
}

impl FillType {
    pub fn rgba(self) -> [f32; 4] {
        match self {
            FillType::Transparent => [0.0, 0.0, 0.0, 0.0],
            FillType::White => [1.0, 1.0, 1.0, 1.0],
            FillType::Black => [0.0, 0.0, 0.0, 1.0],
            FillType::Color(c) => c,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Drawable {
    id: DrawableId,
    pub name: String,
    tiles: Canvas,
    pub offset_x: i32,
    pub offset_y: i32,
    pub visible: bool,
    dirty_count: u32,
    /// Image this drawable belongs to, by id.
    pub image_id: Option<Uuid>,
    shadow: Option<Canvas>,
    pub kind: DrawableKind,
}

impl Drawable {
    pub fn new(name: impl Into<String>, tiles: Canvas, kind: DrawableKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tiles,
            offset_x: 0,
            offset_y: 0,
            visible: true,
            dirty_count: 0,
            image_id: None,
            shadow: None,
            kind,
        }
    }

    pub fn new_layer(name: impl Into<String>, tiles: Canvas, opacity: f32, mode: LayerMode) -> Self {
        Self::new(
            name,
            tiles,
            DrawableKind::Layer(LayerProps { opacity, mode, preserve_trans: false, mask: None }),
        )
    }

    /// A single-sample gray channel at `precision`.
    pub fn new_channel(
        name: impl Into<String>,
        precision: Precision,
        width: u32,
        height: u32,
        color: [u8; 3],
        opacity: f32,
    ) -> Result<Self, CanvasError> {
        let tag = Tag::new(precision, Format::Gray, Alpha::No);
        let tiles = Canvas::new(tag, width, height, Storage::Tiled)?;
        Ok(Self::new(
            name,
            tiles,
            DrawableKind::Channel(ChannelProps { color, opacity, show_masked: false }),
        ))
    }

    /// A mask sized and positioned like `layer`, filled with `fill`.
    pub fn new_mask(layer: &Drawable, fill: FillType) -> Result<Self, CanvasError> {
        let tag = Tag::new(layer.tag().precision(), Format::Gray, Alpha::No);
        let tiles = Canvas::with_tile_size(
            tag,
            layer.width(),
            layer.height(),
            Storage::Tiled,
            layer.tiles.tile_width(),
        )?;
        let mut mask = Self::new(
            format!("{} mask", layer.name),
            tiles,
            DrawableKind::LayerMask(MaskProps { apply: true, edit: true, show: false }),
        );
        mask.offset_x = layer.offset_x;
        mask.offset_y = layer.offset_y;
        mask.image_id = layer.image_id;
        mask.fill(fill)?;
        Ok(mask)
    }

    // ---- identity and geometry ----------------------------------------------

    pub fn id(&self) -> DrawableId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.tiles.width()
    }

    pub fn height(&self) -> u32 {
        self.tiles.height()
    }

    pub fn tag(&self) -> Tag {
        self.tiles.tag()
    }

    pub fn bytes(&self) -> usize {
        self.tiles.bytes()
    }

    pub fn has_alpha(&self) -> bool {
        self.tag().has_alpha()
    }

    pub fn is_rgb(&self) -> bool {
        self.tag().is_rgb()
    }

    pub fn is_gray(&self) -> bool {
        self.tag().is_gray()
    }

    pub fn is_indexed(&self) -> bool {
        self.tag().is_indexed()
    }

    pub fn offsets(&self) -> (i32, i32) {
        (self.offset_x, self.offset_y)
    }

    pub fn set_offsets(&mut self, x: i32, y: i32) {
        self.offset_x = x;
        self.offset_y = y;
    }

    // ---- kind ---------------------------------------------------------------

    pub fn is_layer(&self) -> bool {
        matches!(self.kind, DrawableKind::Layer(_))
    }

    pub fn is_channel(&self) -> bool {
        matches!(self.kind, DrawableKind::Channel(_))
    }

    pub fn is_layer_mask(&self) -> bool {
        matches!(self.kind, DrawableKind::LayerMask(_))
    }

    pub fn layer_mask(&self) -> Option<&Drawable> {
        match &self.kind {
            DrawableKind::Layer(props) => props.mask.as_deref(),
            _ => None,
        }
    }

    pub fn layer_mask_mut(&mut self) -> Option<&mut Drawable> {
        match &mut self.kind {
            DrawableKind::Layer(props) => props.mask.as_deref_mut(),
            _ => None,
        }
    }

    /// Swap the layer's mask slot with `mask`, returning the old mask.
    /// Non-layers hand `mask` straight back.
    pub fn replace_layer_mask(&mut self, mask: Option<Drawable>) -> Option<Drawable> {
        match &mut self.kind {
            DrawableKind::Layer(props) => {
                std::mem::replace(&mut props.mask, mask.map(Box::new)).map(|m| *m)
            }
            _ => mask,
        }
    }

    // ---- pixel data ---------------------------------------------------------

    pub fn data(&self) -> &Canvas {
        &self.tiles
    }

    pub fn data_mut(&mut self) -> &mut Canvas {
        &mut self.tiles
    }

    /// Install a new canvas, returning the old one. Any shadow is dropped.
    pub fn replace_data(&mut self, tiles: Canvas) -> Canvas {
        self.shadow = None;
        std::mem::replace(&mut self.tiles, tiles)
    }

    // ---- dirty tracking -----------------------------------------------------

    pub fn dirty(&mut self) -> u32 {
        self.dirty_count += 1;
        self.dirty_count
    }

    /// Saturates at zero.
    pub fn clean(&mut self) -> u32 {
        self.dirty_count = self.dirty_count.saturating_sub(1);
        self.dirty_count
    }

    pub fn dirty_count(&self) -> u32 {
        self.dirty_count
    }

    // ---- shadow buffer ------------------------------------------------------

    /// Scratch canvas matching the live one, allocated on first use.
    pub fn shadow(&mut self) -> Result<&mut Canvas, CanvasError> {
        let stale = self.shadow.as_ref().is_some_and(|s| {
            s.tag() != self.tiles.tag() || s.width() != self.tiles.width() || s.height() != self.tiles.height()
        });
        if stale || self.shadow.is_none() {
            self.shadow = Some(self.tiles.new_like()?);
        }
        self.shadow
            .as_mut()
            .ok_or(CanvasError::Allocation { bytes: self.tiles.tile_bytes() })
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn discard_shadow(&mut self) {
        self.shadow = None;
    }

    /// Copy the shadow's `(x, y, width, height)` region into the live canvas.
    pub fn merge_shadow(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<(), CanvasError> {
        let Some(shadow) = self.shadow.as_ref() else {
            return Ok(());
        };
        let src = PixelArea::new(shadow, x, y, width, height);
        let mut dest = PixelAreaMut::new(&mut self.tiles, x, y, width, height, true);
        pixelarea::copy_area(&src, &mut dest)
    }

    pub fn fill(&mut self, fill: FillType) -> Result<(), CanvasError> {
        let pixel = self.tag().encode_color(fill.rgba());
        self.tiles.fill(&pixel)
    }

    /// Bytes this drawable accounts for in undo history, mask included.
    pub fn undo_size(&self) -> usize {
        let own = self.width() as usize * self.height() as usize * self.bytes() + self.name.len();
        own + self.layer_mask().map_or(0, Drawable::undo_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb8_layer(w: u32, h: u32) -> Drawable {
        let tag = Tag::new(Precision::U8, Format::Rgb, Alpha::Yes);
        let tiles = Canvas::with_tile_size(tag, w, h, Storage::Tiled, 4).unwrap();
        Drawable::new_layer("layer", tiles, 1.0, LayerMode::Normal)
    }

    #[test]
    fn dirty_count_never_goes_negative() {
        let mut d = rgb8_layer(2, 2);
        assert_eq!(d.clean(), 0);
        assert_eq!(d.dirty(), 1);
        assert_eq!(d.clean(), 0);
        assert_eq!(d.clean(), 0);
    }

    #[test]
    fn fill_and_shadow_merge() {
        let mut d = rgb8_layer(6, 6);
        d.fill(FillType::White).unwrap();
        assert_eq!(d.data().get_pixel(5, 5), Some(&[255u8, 255, 255, 255][..]));

        let shadow = d.shadow().unwrap();
        shadow.fill(&[1, 2, 3, 4]).unwrap();
        d.merge_shadow(1, 1, 2, 2).unwrap();
        assert_eq!(d.data().get_pixel(1, 1), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(d.data().get_pixel(3, 3), Some(&[255u8, 255, 255, 255][..]));
        d.discard_shadow();
        assert!(!d.has_shadow());
    }

    #[test]
    fn masks_follow_their_layer() {
        let mut layer = rgb8_layer(4, 4);
        layer.set_offsets(3, -2);
        let mask = Drawable::new_mask(&layer, FillType::White).unwrap();
        assert!(mask.is_layer_mask());
        assert_eq!(mask.offsets(), (3, -2));
        assert_eq!(mask.tag().num_channels(), 1);
        let mask_id = mask.id();
        assert!(layer.replace_layer_mask(Some(mask)).is_none());
        assert_eq!(layer.layer_mask().map(Drawable::id), Some(mask_id));
        assert!(layer.undo_size() > 4 * 4 * 4);
    }

    #[test]
    fn channel_fill_uses_luminance() {
        let mut ch = Drawable::new_channel("sel", Precision::U8, 3, 3, [255, 0, 0], 0.5).unwrap();
        ch.fill(FillType::Color([1.0, 0.0, 0.0, 1.0])).unwrap();
        assert_eq!(ch.data().get_pixel(0, 0), Some(&[76u8][..]));
    }
}
