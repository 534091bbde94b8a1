use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

use crate::canvas::{Canvas, Storage};
use crate::drawable::{Drawable, DrawableId, FillType, LayerMode};
use crate::error::{CanvasError, ImageError, UndoError};
use crate::pixelarea::{self, PixelArea, PixelAreaMut};
use crate::settings::EngineSettings;
use crate::tag::{Alpha, Format, Precision, Tag};
use crate::undo::{
    ChannelModUndo, ChannelUndo, GuideUndo, ImageModUndo, ImageUndo, LayerDisplaceUndo, LayerMaskUndo,
    LayerModUndo, LayerUndo, PaintUndo, SelectionUndo, TransformUndo, UndoAction, UndoContext, UndoKind, UndoStack,
};

// ============================================================================
// GUIDES AND TOOLS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// Ruler guide. Deleted guides keep their slot with a negative position so
/// undo can bring them back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Guide {
    pub id: u32,
    pub position: i32,
    pub orientation: Orientation,
}

pub type ToolId = u32;

#[derive(Clone, Debug, Default)]
pub struct TransformState {
    pub trans_info: [f64; 8],
    pub original: Option<Canvas>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PaintState {
    pub last_x: f64,
    pub last_y: f64,
    pub pressure: f64,
    pub xtilt: f64,
    pub ytilt: f64,
}

#[derive(Clone, Debug)]
pub enum ToolState {
    Transform(TransformState),
    Paint(PaintState),
    Other,
}

#[derive(Clone, Debug)]
pub struct ActiveTool {
    pub id: ToolId,
    pub state: ToolState,
}

// ============================================================================
// IMAGE - layers, channels and image-wide state
// ============================================================================

/// Image rectangle `(x1, y1)..(x2, y2)`, end-exclusive.
pub type Bounds = (u32, u32, u32, u32);

/// The state undo records act on. Layers are ordered top first.
pub struct Image {
    id: Uuid,
    width: u32,
    height: u32,
    base: Format,
    precision: Precision,
    layers: Vec<Drawable>,
    channels: Vec<Drawable>,
    active_layer: Option<DrawableId>,
    active_channel: Option<DrawableId>,
    selection: Option<Bounds>,
    guides: Vec<Guide>,
    next_guide_id: u32,
    tool: Option<ActiveTool>,
    dirty: i32,
}

impl Image {
    pub fn new(width: u32, height: u32, base: Format, precision: Precision) -> Self {
        Self {
            id: Uuid::new_v4(),
            width,
            height,
            base,
            precision,
            layers: Vec::new(),
            channels: Vec::new(),
            active_layer: None,
            active_channel: None,
            selection: None,
            guides: Vec::new(),
            next_guide_id: 1,
            tool: None,
            dirty: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn base(&self) -> Format {
        self.base
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Tag of the image's layers, with alpha.
    pub fn layer_tag(&self) -> Tag {
        Tag::new(self.precision, self.base, Alpha::Yes)
    }

    /// Put back a guide read from a file, outside of history.
    pub(crate) fn restore_guide(&mut self, guide: Guide) {
        self.next_guide_id = self.next_guide_id.max(guide.id + 1);
        self.guides.push(guide);
    }

    pub fn layers(&self) -> &[Drawable] {
        &self.layers
    }

    pub fn channels(&self) -> &[Drawable] {
        &self.channels
    }

    pub fn active_layer_id(&self) -> Option<DrawableId> {
        self.active_layer
    }

    pub fn active_channel_id(&self) -> Option<DrawableId> {
        self.active_channel
    }

    pub fn dirty_count(&self) -> i32 {
        self.dirty
    }

    pub fn selection(&self) -> Option<Bounds> {
        self.selection
    }

    /// Visible guides.
    pub fn guides(&self) -> impl Iterator<Item = &Guide> {
        self.guides.iter().filter(|g| g.position >= 0)
    }

    pub fn tool(&self) -> Option<&ActiveTool> {
        self.tool.as_ref()
    }

    pub fn layer_position(&self, id: DrawableId) -> Option<usize> {
        self.layers.iter().position(|l| l.id() == id)
    }

    pub fn channel_position(&self, id: DrawableId) -> Option<usize> {
        self.channels.iter().position(|c| c.id() == id)
    }

    /// Layers, then layer masks, then channels.
    pub fn drawable(&self, id: DrawableId) -> Option<&Drawable> {
        self.layers
            .iter()
            .find(|l| l.id() == id)
            .or_else(|| self.layers.iter().filter_map(Drawable::layer_mask).find(|m| m.id() == id))
            .or_else(|| self.channels.iter().find(|c| c.id() == id))
    }

    /// Every drawable in lookup order, masks included.
    pub fn drawables(&self) -> impl Iterator<Item = &Drawable> {
        self.layers
            .iter()
            .flat_map(|l| std::iter::once(l).chain(l.layer_mask()))
            .chain(self.channels.iter())
    }

    /// Region of the drawable that pixel operations touch: the selection
    /// bounds intersected with the drawable, in drawable coordinates.
    /// `None` when they do not intersect.
    pub fn mask_bounds(&self, id: DrawableId) -> Option<Bounds> {
        let d = self.drawable(id)?;
        let (ox, oy) = d.offsets();
        let (dw, dh) = (d.width() as i64, d.height() as i64);
        let (x1, y1, x2, y2) = match self.selection {
            Some((sx1, sy1, sx2, sy2)) => (
                (sx1 as i64 - ox as i64).clamp(0, dw),
                (sy1 as i64 - oy as i64).clamp(0, dh),
                (sx2 as i64 - ox as i64).clamp(0, dw),
                (sy2 as i64 - oy as i64).clamp(0, dh),
            ),
            None => (0, 0, dw, dh),
        };
        (x2 > x1 && y2 > y1).then_some((x1 as u32, y1 as u32, x2 as u32, y2 as u32))
    }
}

impl UndoContext for Image {
    fn drawable_mut(&mut self, id: DrawableId) -> Option<&mut Drawable> {
        if let Some(i) = self.layer_position(id) {
            return Some(&mut self.layers[i]);
        }
        if let Some(i) = self
            .layers
            .iter()
            .position(|l| l.layer_mask().is_some_and(|m| m.id() == id))
        {
            return self.layers[i].layer_mask_mut();
        }
        self.channels.iter_mut().find(|c| c.id() == id)
    }

    fn insert_layer(&mut self, mut layer: Drawable, position: usize) {
        layer.image_id = Some(self.id);
        let position = position.min(self.layers.len());
        self.layers.insert(position, layer);
    }

    fn remove_layer(&mut self, id: DrawableId) -> Option<(Drawable, usize)> {
        let position = self.layer_position(id)?;
        let mut layer = self.layers.remove(position);
        layer.image_id = None;
        Some((layer, position))
    }

    fn insert_channel(&mut self, mut channel: Drawable, position: usize) {
        channel.image_id = Some(self.id);
        let position = position.min(self.channels.len());
        self.channels.insert(position, channel);
    }

    fn remove_channel(&mut self, id: DrawableId) -> Option<(Drawable, usize)> {
        let position = self.channel_position(id)?;
        let mut channel = self.channels.remove(position);
        channel.image_id = None;
        Some((channel, position))
    }

    fn active_layer(&self) -> Option<DrawableId> {
        self.active_layer
    }

    fn set_active_layer(&mut self, id: Option<DrawableId>) {
        self.active_layer = id.filter(|id| self.layer_position(*id).is_some());
    }

    fn active_channel(&self) -> Option<DrawableId> {
        self.active_channel
    }

    fn set_active_channel(&mut self, id: Option<DrawableId>) {
        self.active_channel = id.filter(|id| self.channel_position(*id).is_some());
    }

    fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_image_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn image_type(&self) -> (Format, Precision) {
        (self.base, self.precision)
    }

    fn set_image_type(&mut self, base: Format, precision: Precision) {
        self.base = base;
        self.precision = precision;
    }

    fn guides_mut(&mut self) -> &mut Vec<Guide> {
        &mut self.guides
    }

    fn selection_mut(&mut self) -> &mut Option<Bounds> {
        &mut self.selection
    }

    fn active_tool(&mut self) -> Option<(ToolId, &mut ToolState)> {
        self.tool.as_mut().map(|t| (t.id, &mut t.state))
    }

    fn image_dirty(&mut self) -> i32 {
        self.dirty += 1;
        self.dirty
    }

    fn image_clean(&mut self) -> i32 {
        self.dirty -= 1;
        self.dirty
    }
}

// ============================================================================
// PROJECT - one open image with its history
// ============================================================================

/// Undo and drawable memory at a glance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryReport {
    pub undo_bytes: usize,
    pub undo_levels: usize,
    pub redo_levels: usize,
    pub drawable_bytes: usize,
    pub layers: usize,
    pub channels: usize,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} layers, {} channels, {} KiB pixels, undo {}/{} levels ({} KiB)",
            self.layers,
            self.channels,
            self.drawable_bytes / 1024,
            self.undo_levels,
            self.redo_levels,
            self.undo_bytes / 1024
        )
    }
}

/// Single open document.
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub image: Image,
    pub undo: UndoStack,
    pub settings: EngineSettings,
}

impl Project {
    /// An empty image with no layers.
    pub fn new(width: u32, height: u32, base: Format, precision: Precision, settings: EngineSettings) -> Self {
        let image = Image::new(width, height, base, precision);
        Self {
            id: image.id(),
            name: "Untitled".to_string(),
            path: None,
            undo: UndoStack::new(settings.levels_of_undo),
            image,
            settings,
        }
    }

    /// An image with one filled background layer. Construction is not
    /// recorded in the undo history.
    pub fn with_background(
        width: u32,
        height: u32,
        base: Format,
        precision: Precision,
        fill: FillType,
        settings: EngineSettings,
    ) -> Result<Self, ImageError> {
        let mut project = Self::new(width, height, base, precision, settings);
        let mut layer = project.new_layer("Background")?;
        layer.fill(fill)?;
        project.insert_untracked(layer);
        Ok(project)
    }

    /// An image whose single layer is `canvas`.
    pub fn from_canvas(name: impl Into<String>, canvas: Canvas, settings: EngineSettings) -> Self {
        let tag = canvas.tag();
        let mut project = Self::new(canvas.width(), canvas.height(), tag.format(), tag.precision(), settings);
        project.name = name.into();
        let layer = Drawable::new_layer("Background", canvas, 1.0, LayerMode::Normal);
        project.insert_untracked(layer);
        project
    }

    fn insert_untracked(&mut self, layer: Drawable) {
        let id = layer.id();
        self.image.insert_layer(layer, 0);
        self.image.set_active_layer(Some(id));
    }

    pub fn is_dirty(&self) -> bool {
        self.image.dirty != 0
    }

    pub fn mark_clean(&mut self) {
        self.image.dirty = 0;
    }

    pub fn display_title(&self) -> String {
        if self.is_dirty() { format!("{}*", self.name) } else { self.name.clone() }
    }

    // ---- undo plumbing ------------------------------------------------------

    /// Push a record. A disabled or zero-level history is not an error for
    /// the caller: the edit goes ahead unrecorded and `Ok(false)` is returned.
    fn push_undo(&mut self, action: Box<dyn UndoAction>) -> Result<bool, UndoError> {
        match self.undo.push(action) {
            Ok(()) => Ok(true),
            Err(UndoError::Disabled) | Err(UndoError::NoLevels) => {
                log::debug!("undo not recorded for '{}'", self.name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn group_start(&mut self, kind: UndoKind) -> Result<bool, UndoError> {
        match self.undo.push_group_start(kind) {
            Ok(()) => Ok(true),
            Err(UndoError::Disabled) | Err(UndoError::NoLevels) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn group_end(&mut self, opened: bool) -> Result<(), UndoError> {
        if opened { self.undo.push_group_end() } else { Ok(()) }
    }

    pub fn undo(&mut self) -> Result<bool, UndoError> {
        self.undo.undo(&mut self.image)
    }

    pub fn redo(&mut self) -> Result<bool, UndoError> {
        self.undo.redo(&mut self.image)
    }

    pub fn freeze_undo(&mut self) {
        self.undo.disable();
    }

    pub fn thaw_undo(&mut self) {
        self.undo.enable();
    }

    // ---- drawables ----------------------------------------------------------

    pub fn drawable(&self, id: DrawableId) -> Result<&Drawable, ImageError> {
        self.image.drawable(id).ok_or(ImageError::UnknownDrawable(id))
    }

    pub fn drawable_mut(&mut self, id: DrawableId) -> Result<&mut Drawable, ImageError> {
        self.image.drawable_mut(id).ok_or(ImageError::UnknownDrawable(id))
    }

    pub fn active_layer(&self) -> Option<&Drawable> {
        self.image.active_layer.and_then(|id| self.image.drawable(id))
    }

    /// A transparent layer sized to the image.
    pub fn new_layer(&self, name: &str) -> Result<Drawable, CanvasError> {
        let tiles = Canvas::with_tile_size(
            self.image.layer_tag(),
            self.image.width,
            self.image.height,
            Storage::Tiled,
            self.settings.tile_size,
        )?;
        let mut layer = Drawable::new_layer(name, tiles, 1.0, LayerMode::Normal);
        layer.image_id = Some(self.image.id);
        Ok(layer)
    }

    /// Add `layer` at `position` (top when `None`) and make it active.
    pub fn add_layer(&mut self, layer: Drawable, position: Option<usize>) -> Result<DrawableId, ImageError> {
        let tag = layer.tag();
        if tag.precision() != self.image.precision || tag.format() != self.image.base || !layer.is_layer() {
            return Err(ImageError::TagMismatch { got: tag, expected: self.image.layer_tag() });
        }
        let id = layer.id();
        let position = position.unwrap_or(0).min(self.image.layers.len());
        self.push_undo(Box::new(LayerUndo::added(&layer, position, self.image.active_layer)))?;
        self.image.insert_layer(layer, position);
        self.image.set_active_layer(Some(id));
        self.image.image_dirty();
        log::debug!("added layer {} at {}", id, position);
        Ok(id)
    }

    pub fn remove_layer(&mut self, id: DrawableId) -> Result<(), ImageError> {
        let prev_active = self.image.active_layer;
        let (layer, position) = self.image.remove_layer(id).ok_or(ImageError::UnknownDrawable(id))?;
        if prev_active == Some(id) {
            let next = self.image.layers.get(position).or(self.image.layers.last()).map(Drawable::id);
            self.image.set_active_layer(next);
        }
        self.push_undo(Box::new(LayerUndo::removed(layer, position, prev_active)))?;
        self.image.image_dirty();
        Ok(())
    }

    /// Move a layer to a new stack position. Recorded as a remove and an
    /// add in one group.
    pub fn raise_layer_to(&mut self, id: DrawableId, position: usize) -> Result<(), ImageError> {
        if self.image.layer_position(id).is_none() {
            return Err(ImageError::UnknownDrawable(id));
        }
        let opened = self.group_start(UndoKind::Misc)?;
        let result = self.reinsert_layer(id, position);
        self.group_end(opened)?;
        result
    }

    fn reinsert_layer(&mut self, id: DrawableId, position: usize) -> Result<(), ImageError> {
        let prev_active = self.image.active_layer;
        let (layer, old) = self.image.remove_layer(id).ok_or(ImageError::UnknownDrawable(id))?;
        self.push_undo(Box::new(LayerUndo::removed(layer.clone(), old, prev_active)))?;
        let position = position.min(self.image.layers.len());
        self.push_undo(Box::new(LayerUndo::added(&layer, position, prev_active)))?;
        self.image.insert_layer(layer, position);
        self.image.set_active_layer(prev_active);
        self.image.image_dirty();
        Ok(())
    }

    pub fn add_channel(&mut self, channel: Drawable, position: Option<usize>) -> Result<DrawableId, ImageError> {
        if !channel.is_channel() || channel.tag().precision() != self.image.precision {
            return Err(ImageError::TagMismatch {
                got: channel.tag(),
                expected: Tag::new(self.image.precision, Format::Gray, Alpha::No),
            });
        }
        let id = channel.id();
        let position = position.unwrap_or(0).min(self.image.channels.len());
        self.push_undo(Box::new(ChannelUndo::added(&channel, position, self.image.active_channel)))?;
        self.image.insert_channel(channel, position);
        self.image.set_active_channel(Some(id));
        self.image.image_dirty();
        Ok(id)
    }

    pub fn remove_channel(&mut self, id: DrawableId) -> Result<(), ImageError> {
        let prev_active = self.image.active_channel;
        let (channel, position) = self.image.remove_channel(id).ok_or(ImageError::UnknownDrawable(id))?;
        if prev_active == Some(id) {
            self.image.set_active_channel(None);
        }
        self.push_undo(Box::new(ChannelUndo::removed(channel, position, prev_active)))?;
        self.image.image_dirty();
        Ok(())
    }

    /// Create and attach a mask to a layer that has none.
    pub fn add_layer_mask(&mut self, layer: DrawableId, fill: FillType) -> Result<DrawableId, ImageError> {
        let d = self.drawable(layer)?;
        if !d.is_layer() {
            return Err(ImageError::NotALayer(layer));
        }
        if d.layer_mask().is_some() {
            return Err(ImageError::MaskExists(layer));
        }
        let mask = Drawable::new_mask(d, fill)?;
        let mask_id = mask.id();
        self.push_undo(Box::new(LayerMaskUndo::added(layer, &mask)))?;
        self.drawable_mut(layer)?.replace_layer_mask(Some(mask));
        self.image.image_dirty();
        Ok(mask_id)
    }

    /// Detach and drop a layer's mask. Returns whether there was one.
    pub fn remove_layer_mask(&mut self, layer: DrawableId) -> Result<bool, ImageError> {
        let d = self.drawable_mut(layer)?;
        if !d.is_layer() {
            return Err(ImageError::NotALayer(layer));
        }
        let Some(mask) = d.replace_layer_mask(None) else {
            return Ok(false);
        };
        self.push_undo(Box::new(LayerMaskUndo::removed(layer, mask)))?;
        self.image.image_dirty();
        Ok(true)
    }

    /// Shift a layer (and its mask) by `(dx, dy)`.
    pub fn move_layer(&mut self, id: DrawableId, dx: i32, dy: i32) -> Result<(), ImageError> {
        let d = self.drawable(id)?;
        if !d.is_layer() {
            return Err(ImageError::NotALayer(id));
        }
        let offset = d.offsets();
        self.push_undo(Box::new(LayerDisplaceUndo { layer: id, offset }))?;
        let d = self.drawable_mut(id)?;
        let (x, y) = (offset.0 + dx, offset.1 + dy);
        d.set_offsets(x, y);
        if let Some(mask) = d.layer_mask_mut() {
            mask.set_offsets(x, y);
        }
        self.image.image_dirty();
        Ok(())
    }

    /// Resize the image canvas. Layers keep their pixels and move by
    /// `(offset_x, offset_y)`; channels are cropped or padded to the new size.
    pub fn resize_image(
        &mut self,
        width: u32,
        height: u32,
        offset_x: i32,
        offset_y: i32,
    ) -> Result<(), ImageError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height }.into());
        }
        let opened = self.group_start(UndoKind::ImageResize)?;
        let result = self.resize_image_inner(width, height, offset_x, offset_y);
        self.group_end(opened)?;
        result
    }

    fn resize_image_inner(&mut self, width: u32, height: u32, offset_x: i32, offset_y: i32) -> Result<(), ImageError> {
        let (base, precision) = self.image.image_type();
        self.push_undo(Box::new(ImageModUndo {
            width: self.image.width,
            height: self.image.height,
            base,
            precision,
        }))?;

        let layer_ids: Vec<DrawableId> = self.image.layers.iter().map(Drawable::id).collect();
        for id in layer_ids {
            self.move_layer(id, offset_x, offset_y)?;
        }

        let channel_ids: Vec<DrawableId> = self.image.channels.iter().map(Drawable::id).collect();
        for id in channel_ids {
            let d = self.drawable(id)?;
            let resized = shifted_copy(d.data(), width, height, offset_x, offset_y, self.settings.tile_size)?;
            let tiles = d.data().clone();
            self.push_undo(Box::new(ChannelModUndo { channel: id, tiles }))?;
            self.drawable_mut(id)?.replace_data(resized);
        }

        if self.image.selection.is_some() {
            self.push_undo(Box::new(SelectionUndo { bounds: self.image.selection }))?;
            self.image.selection = None;
        }
        self.image.set_image_size(width, height);
        self.image.image_dirty();
        log::info!("image resized to {}x{}", width, height);
        Ok(())
    }

    /// Resize one layer's canvas, keeping its content at `(offset_x,
    /// offset_y)` inside the new bounds.
    pub fn resize_layer(
        &mut self,
        id: DrawableId,
        width: u32,
        height: u32,
        offset_x: i32,
        offset_y: i32,
    ) -> Result<(), ImageError> {
        let d = self.drawable(id)?;
        if !d.is_layer() {
            return Err(ImageError::NotALayer(id));
        }
        let resized = shifted_copy(d.data(), width, height, offset_x, offset_y, self.settings.tile_size)?;
        let offset = d.offsets();
        let tiles = d.data().clone();
        self.push_undo(Box::new(LayerModUndo { layer: id, tiles, offset }))?;
        let d = self.drawable_mut(id)?;
        d.replace_data(resized);
        d.set_offsets(offset.0 - offset_x, offset.1 - offset_y);
        self.image.image_dirty();
        Ok(())
    }

    /// Re-encode every drawable at `precision`, as one undo step.
    pub fn convert_precision(&mut self, precision: Precision) -> Result<(), ImageError> {
        if precision == self.image.precision {
            return Ok(());
        }
        let opened = self.group_start(UndoKind::Convert)?;
        let result = self.convert_precision_inner(precision);
        self.group_end(opened)?;
        result
    }

    fn convert_precision_inner(&mut self, precision: Precision) -> Result<(), ImageError> {
        let (base, old) = self.image.image_type();
        self.push_undo(Box::new(ImageModUndo {
            width: self.image.width,
            height: self.image.height,
            base,
            precision: old,
        }))?;

        let ids: Vec<(DrawableId, bool)> = self.image.drawables().map(|d| (d.id(), d.is_channel())).collect();
        for (id, is_channel) in ids {
            let d = self.drawable(id)?;
            let converted = d.data().convert_precision(precision)?;
            let record: Box<dyn UndoAction> = if is_channel {
                Box::new(ChannelModUndo { channel: id, tiles: d.data().clone() })
            } else {
                Box::new(LayerModUndo { layer: id, tiles: d.data().clone(), offset: d.offsets() })
            };
            self.push_undo(record)?;
            self.drawable_mut(id)?.replace_data(converted);
        }

        self.image.set_image_type(base, precision);
        self.image.image_dirty();
        log::info!("converted '{}' from {} to {}", self.name, old.name(), precision.name());
        Ok(())
    }

    // ---- pixel undo ---------------------------------------------------------

    /// Snapshot `(x1, y1)..(x2, y2)` of a drawable before the caller
    /// modifies it. Nothing is touched if the snapshot cannot be taken.
    /// Returns whether a record was pushed.
    pub fn apply_image(&mut self, id: DrawableId, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<bool, ImageError> {
        let d = self.drawable(id)?;
        let pushed = if self.undo.is_enabled() {
            let record = ImageUndo::capture(d, x1, y1, x2, y2)?;
            self.push_undo(Box::new(record))?
        } else {
            false
        };
        self.mark_drawable_dirty(id)?;
        Ok(pushed)
    }

    /// Like [`Project::apply_image`] but `tiles` already holds the original
    /// pixels of the region at its origin.
    pub fn apply_image_mod(
        &mut self,
        id: DrawableId,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        tiles: Canvas,
    ) -> Result<bool, ImageError> {
        let d = self.drawable(id)?;
        let record = ImageUndo::adopt(d, x1, y1, x2, y2, tiles)?;
        let pushed = self.push_undo(Box::new(record))?;
        self.mark_drawable_dirty(id)?;
        Ok(pushed)
    }

    fn mark_drawable_dirty(&mut self, id: DrawableId) -> Result<(), ImageError> {
        self.drawable_mut(id)?.dirty();
        self.image.image_dirty();
        Ok(())
    }

    /// Fill a rectangle of a drawable, recording undo first.
    pub fn fill_region(
        &mut self,
        id: DrawableId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        fill: FillType,
    ) -> Result<(), ImageError> {
        let coord = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        let (x2, y2) = (coord(x.saturating_add(width)), coord(y.saturating_add(height)));
        self.apply_image(id, coord(x), coord(y), x2, y2)?;
        let d = self.drawable_mut(id)?;
        let pixel = d.tag().encode_color(fill.rgba());
        let mut area = PixelAreaMut::new(d.data_mut(), x, y, width, height, true);
        pixelarea::color_area(&mut area, &pixel)?;
        Ok(())
    }

    // ---- selection ----------------------------------------------------------

    /// Restrict pixel operations to an image rectangle, or lift the
    /// restriction with `None`.
    pub fn set_selection(&mut self, bounds: Option<Bounds>) {
        self.image.selection = bounds.map(|(x1, y1, x2, y2)| {
            (x1.min(self.image.width), y1.min(self.image.height), x2.min(self.image.width), y2.min(self.image.height))
        });
    }

    pub fn mask_bounds(&self, id: DrawableId) -> Option<Bounds> {
        self.image.mask_bounds(id)
    }

    // ---- guides -------------------------------------------------------------

    pub fn add_guide(&mut self, position: i32, orientation: Orientation) -> Result<u32, ImageError> {
        let id = self.image.next_guide_id;
        self.image.next_guide_id += 1;
        self.image.guides.push(Guide { id, position: -1, orientation });
        self.push_undo(Box::new(GuideUndo { id, position: -1, orientation }))?;
        self.set_guide(id, position)?;
        Ok(id)
    }

    pub fn move_guide(&mut self, id: u32, position: i32) -> Result<(), ImageError> {
        let guide = self.guide(id)?;
        self.push_undo(Box::new(GuideUndo { id, position: guide.position, orientation: guide.orientation }))?;
        self.set_guide(id, position)
    }

    pub fn delete_guide(&mut self, id: u32) -> Result<(), ImageError> {
        self.move_guide(id, -1)
    }

    fn guide(&self, id: u32) -> Result<Guide, ImageError> {
        self.image.guides.iter().find(|g| g.id == id).copied().ok_or(ImageError::UnknownGuide(id))
    }

    fn set_guide(&mut self, id: u32, position: i32) -> Result<(), ImageError> {
        let guide = self
            .image
            .guides
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(ImageError::UnknownGuide(id))?;
        guide.position = position;
        Ok(())
    }

    // ---- tools --------------------------------------------------------------

    pub fn set_active_tool(&mut self, tool: Option<ActiveTool>) {
        self.image.tool = tool;
    }

    pub fn active_tool_mut(&mut self) -> Option<&mut ActiveTool> {
        self.image.tool.as_mut()
    }

    /// Record transform parameters as they were before the tool changed them.
    pub fn push_transform_undo(
        &mut self,
        tool_id: ToolId,
        trans_info: [f64; 8],
        original: Option<Canvas>,
    ) -> Result<bool, ImageError> {
        Ok(self.push_undo(Box::new(TransformUndo { tool_id, trans_info, original }))?)
    }

    pub fn push_paint_undo(&mut self, tool_id: ToolId, state: PaintState) -> Result<bool, ImageError> {
        Ok(self.push_undo(Box::new(PaintUndo {
            tool_id,
            last_x: state.last_x,
            last_y: state.last_y,
            pressure: state.pressure,
            xtilt: state.xtilt,
            ytilt: state.ytilt,
        }))?)
    }

    // ---- reporting ----------------------------------------------------------

    pub fn memory_report(&self) -> MemoryReport {
        MemoryReport {
            undo_bytes: self.undo.undo_bytes(),
            undo_levels: self.undo.undo_levels(),
            redo_levels: self.undo.redo_levels(),
            drawable_bytes: self.image.drawables().map(|d| d.data().memory_bytes()).sum(),
            layers: self.image.layers.len(),
            channels: self.image.channels.len(),
        }
    }
}

/// A `width x height` copy of `src` with its content placed at
/// `(offset_x, offset_y)`. Uncovered pixels are zero.
fn shifted_copy(
    src: &Canvas,
    width: u32,
    height: u32,
    offset_x: i32,
    offset_y: i32,
    tile_size: u32,
) -> Result<Canvas, CanvasError> {
    let mut out = Canvas::with_tile_size(src.tag(), width, height, Storage::Tiled, tile_size)?;
    let sx = (-offset_x).max(0) as u32;
    let sy = (-offset_y).max(0) as u32;
    let dx = offset_x.max(0) as u32;
    let dy = offset_y.max(0) as u32;
    if sx >= src.width() || sy >= src.height() || dx >= width || dy >= height {
        return Ok(out);
    }
    let w = (src.width() - sx).min(width - dx);
    let h = (src.height() - sy).min(height - dy);
    let from = PixelArea::new(src, sx, sy, w, h);
    let mut to = PixelAreaMut::new(&mut out, dx, dy, w, h, false);
    pixelarea::copy_area(&from, &mut to)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(levels: usize) -> EngineSettings {
        EngineSettings { levels_of_undo: levels, tile_size: 4, ..EngineSettings::default() }
    }

    fn rgb_project() -> Project {
        Project::with_background(8, 8, Format::Rgb, Precision::U8, FillType::White, settings(8)).unwrap()
    }

    #[test]
    fn construction_is_not_recorded() {
        let p = rgb_project();
        assert_eq!(p.undo.undo_levels(), 0);
        assert!(!p.is_dirty());
        assert_eq!(p.image.layers().len(), 1);
        assert!(p.active_layer().is_some());
    }

    #[test]
    fn add_and_remove_layer_undo() {
        let mut p = rgb_project();
        let layer = p.new_layer("Top").unwrap();
        let id = p.add_layer(layer, None).unwrap();
        assert_eq!(p.image.layers()[0].id(), id);
        assert_eq!(p.image.active_layer_id(), Some(id));

        p.remove_layer(id).unwrap();
        assert_eq!(p.image.layers().len(), 1);
        p.undo().unwrap();
        assert_eq!(p.image.layers()[0].id(), id);
        p.undo().unwrap();
        assert_eq!(p.image.layers().len(), 1);
        assert_ne!(p.image.layers()[0].id(), id);
        p.redo().unwrap();
        p.redo().unwrap();
        assert_eq!(p.image.layers().len(), 1);
    }

    #[test]
    fn layer_tag_must_match() {
        let mut p = rgb_project();
        let tag = Tag::new(Precision::U16, Format::Rgb, Alpha::Yes);
        let tiles = Canvas::new(tag, 8, 8, Storage::Tiled).unwrap();
        let layer = Drawable::new_layer("wrong", tiles, 1.0, LayerMode::Normal);
        assert!(matches!(p.add_layer(layer, None), Err(ImageError::TagMismatch { .. })));
    }

    #[test]
    fn move_layer_moves_mask() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        p.add_layer_mask(id, FillType::White).unwrap();
        p.move_layer(id, 3, -1).unwrap();
        let d = p.drawable(id).unwrap();
        assert_eq!(d.offsets(), (3, -1));
        assert_eq!(d.layer_mask().map(Drawable::offsets), Some((3, -1)));
        p.undo().unwrap();
        let d = p.drawable(id).unwrap();
        assert_eq!(d.offsets(), (0, 0));
        assert_eq!(d.layer_mask().map(Drawable::offsets), Some((0, 0)));
    }

    #[test]
    fn layer_mask_add_remove() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        let mask = p.add_layer_mask(id, FillType::Black).unwrap();
        assert!(p.drawable(mask).is_ok());
        assert!(matches!(p.add_layer_mask(id, FillType::Black), Err(ImageError::MaskExists(_))));
        assert!(p.remove_layer_mask(id).unwrap());
        assert!(p.drawable(mask).is_err());
        p.undo().unwrap();
        assert!(p.drawable(mask).is_ok());
        p.undo().unwrap();
        assert!(p.drawable(id).unwrap().layer_mask().is_none());
    }

    #[test]
    fn resize_is_one_step() {
        let mut p = rgb_project();
        let ch = Drawable::new_channel("alpha copy", Precision::U8, 8, 8, [0, 0, 0], 0.5).unwrap();
        p.add_channel(ch, None).unwrap();
        let levels = p.undo.undo_levels();
        p.resize_image(12, 6, 2, -1).unwrap();
        assert_eq!((p.image.width(), p.image.height()), (12, 6));
        assert_eq!(p.image.layers()[0].offsets(), (2, -1));
        assert_eq!(p.image.channels()[0].width(), 12);
        assert_eq!(p.undo.undo_levels(), levels + 1);

        p.undo().unwrap();
        assert_eq!((p.image.width(), p.image.height()), (8, 8));
        assert_eq!(p.image.layers()[0].offsets(), (0, 0));
        assert_eq!(p.image.channels()[0].width(), 8);
    }

    #[test]
    fn convert_precision_round_trip() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        p.convert_precision(Precision::U16).unwrap();
        assert_eq!(p.image.precision(), Precision::U16);
        assert_eq!(p.drawable(id).unwrap().data().get_pixel(0, 0), Some(&[255u8, 255, 255, 255, 255, 255, 255, 255][..]));
        p.undo().unwrap();
        assert_eq!(p.image.precision(), Precision::U8);
        assert_eq!(p.drawable(id).unwrap().tag().precision(), Precision::U8);
    }

    #[test]
    fn guides_undo() {
        let mut p = rgb_project();
        let g = p.add_guide(4, Orientation::Vertical).unwrap();
        p.move_guide(g, 6).unwrap();
        p.delete_guide(g).unwrap();
        assert_eq!(p.image.guides().count(), 0);
        p.undo().unwrap();
        assert_eq!(p.image.guides().next().map(|g| g.position), Some(6));
        p.undo().unwrap();
        assert_eq!(p.image.guides().next().map(|g| g.position), Some(4));
        p.undo().unwrap();
        assert_eq!(p.image.guides().count(), 0);
    }

    #[test]
    fn tool_mismatch_consumes_entry() {
        let mut p = rgb_project();
        p.set_active_tool(Some(ActiveTool { id: 1, state: ToolState::Transform(TransformState::default()) }));
        p.push_transform_undo(1, [1.0; 8], None).unwrap();
        p.set_active_tool(Some(ActiveTool { id: 2, state: ToolState::Transform(TransformState::default()) }));
        assert!(p.undo().unwrap());
        assert_eq!(p.undo.undo_levels(), 0);
        match &p.image.tool().unwrap().state {
            ToolState::Transform(t) => assert_eq!(t.trans_info, [0.0; 8]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn matching_tool_swaps_state() {
        let mut p = rgb_project();
        p.set_active_tool(Some(ActiveTool { id: 7, state: ToolState::Paint(PaintState::default()) }));
        p.push_paint_undo(7, PaintState { last_x: 3.0, last_y: 4.0, ..PaintState::default() }).unwrap();
        if let Some(ActiveTool { state: ToolState::Paint(s), .. }) = p.active_tool_mut() {
            s.last_x = 10.0;
        }
        p.undo().unwrap();
        match &p.image.tool().unwrap().state {
            ToolState::Paint(s) => assert_eq!((s.last_x, s.last_y), (3.0, 4.0)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn mask_bounds_follow_selection_and_offsets() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        assert_eq!(p.mask_bounds(id), Some((0, 0, 8, 8)));
        p.set_selection(Some((2, 2, 6, 5)));
        assert_eq!(p.mask_bounds(id), Some((2, 2, 6, 5)));
        p.drawable_mut(id).unwrap().set_offsets(4, 0);
        assert_eq!(p.mask_bounds(id), Some((0, 2, 2, 5)));
        p.drawable_mut(id).unwrap().set_offsets(6, 0);
        assert_eq!(p.mask_bounds(id), None);
    }

    #[test]
    fn resize_undo_restores_selection() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        p.set_selection(Some((2, 2, 4, 4)));
        p.resize_image(6, 6, 0, 0).unwrap();
        assert_eq!(p.image.selection(), None);
        assert_eq!(p.mask_bounds(id), Some((0, 0, 6, 6)));

        p.undo().unwrap();
        assert_eq!(p.image.selection(), Some((2, 2, 4, 4)));
        assert_eq!(p.mask_bounds(id), Some((2, 2, 4, 4)));
        p.redo().unwrap();
        assert_eq!(p.image.selection(), None);
    }

    /// Everything a structural operation may touch.
    #[derive(Debug, PartialEq)]
    struct ImageState {
        size: (u32, u32),
        precision: Precision,
        selection: Option<Bounds>,
        active_layer: Option<DrawableId>,
        guides: Vec<Guide>,
        layers: Vec<(DrawableId, (i32, i32), Tag, Vec<u8>)>,
        channels: Vec<(DrawableId, Tag, Vec<u8>)>,
    }

    fn image_state(p: &Project) -> ImageState {
        ImageState {
            size: (p.image.width(), p.image.height()),
            precision: p.image.precision(),
            selection: p.image.selection(),
            active_layer: p.image.active_layer_id(),
            guides: p.image.guides().copied().collect(),
            layers: p.image.layers().iter().map(|l| (l.id(), l.offsets(), l.tag(), l.data().to_raw())).collect(),
            channels: p.image.channels().iter().map(|c| (c.id(), c.tag(), c.data().to_raw())).collect(),
        }
    }

    #[test]
    fn structural_steps_undo_and_redo_whole_state() {
        let mut p = rgb_project();
        let bottom = p.image.layers()[0].id();
        p.fill_region(bottom, 1, 1, 3, 5, FillType::Color([0.2, 0.4, 0.6, 1.0])).unwrap();
        let top = p.new_layer("Top").unwrap();
        let top = p.add_layer(top, None).unwrap();
        p.move_layer(top, 1, -2).unwrap();
        let ch = Drawable::new_channel("keep", Precision::U8, 8, 8, [0, 0, 0], 0.5).unwrap();
        p.add_channel(ch, None).unwrap();
        p.add_guide(3, Orientation::Vertical).unwrap();
        p.set_selection(Some((1, 1, 7, 6)));

        let mut states = vec![image_state(&p)];
        p.resize_image(10, 5, 2, -1).unwrap();
        states.push(image_state(&p));
        p.convert_precision(Precision::Float).unwrap();
        states.push(image_state(&p));
        p.resize_image(4, 4, -1, 0).unwrap();
        states.push(image_state(&p));

        for expected in states.iter().rev().skip(1) {
            assert!(p.undo().unwrap());
            assert_eq!(&image_state(&p), expected);
        }
        for expected in states.iter().skip(1) {
            assert!(p.redo().unwrap());
            assert_eq!(&image_state(&p), expected);
        }
    }

    #[test]
    fn conversion_is_labelled_as_such() {
        let mut p = rgb_project();
        p.convert_precision(Precision::U16).unwrap();
        p.resize_image(4, 4, 0, 0).unwrap();
        assert_eq!(p.undo.undo_history(), vec!["Resize Image".to_string(), "Convert Image".to_string()]);
    }

    #[test]
    fn fill_region_clips_oversized_rects() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        p.fill_region(id, 6, 6, u32::MAX, u32::MAX, FillType::Black).unwrap();
        let d = p.drawable(id).unwrap().data();
        assert_eq!(d.get_pixel(7, 7), Some(&[0u8, 0, 0, 255][..]));
        assert_eq!(d.get_pixel(5, 5), Some(&[255u8, 255, 255, 255][..]));
        p.undo().unwrap();
        assert_eq!(p.drawable(id).unwrap().data().get_pixel(7, 7), Some(&[255u8, 255, 255, 255][..]));
    }

    #[test]
    fn disabled_undo_still_edits() {
        let mut p = rgb_project();
        let id = p.image.layers()[0].id();
        p.freeze_undo();
        assert!(!p.apply_image(id, 0, 0, 2, 2).unwrap());
        p.fill_region(id, 0, 0, 2, 2, FillType::Black).unwrap();
        assert_eq!(p.undo.undo_levels(), 0);
        assert!(p.is_dirty());
        p.thaw_undo();
        assert!(p.apply_image(id, 0, 0, 2, 2).unwrap());
        assert!(p.memory_report().undo_bytes > 0);
    }
}
