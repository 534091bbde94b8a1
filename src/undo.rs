use std::collections::VecDeque;

use crate::canvas::{Canvas, DEFAULT_TILE_SIZE, Storage};
use crate::drawable::{Drawable, DrawableId};
use crate::error::UndoError;
use crate::pixelarea::{self, PixelArea, PixelAreaMut};
use crate::project::{Bounds, Guide, Orientation, ToolId, ToolState};
use crate::tag::{Format, Precision};

// ============================================================================
// UNDO CONTEXT - the slice of an image that undo records act on
// ============================================================================

/// Which way a record is being replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoDirection {
    Undo,
    Redo,
}

/// Image state reachable from an undo record while it is popped.
pub trait UndoContext {
    fn drawable_mut(&mut self, id: DrawableId) -> Option<&mut Drawable>;

    /// Insert a layer at `position` in the stack (clamped).
    fn insert_layer(&mut self, layer: Drawable, position: usize);
    /// Detach a layer, returning it with the position it occupied.
    fn remove_layer(&mut self, id: DrawableId) -> Option<(Drawable, usize)>;
    fn insert_channel(&mut self, channel: Drawable, position: usize);
    fn remove_channel(&mut self, id: DrawableId) -> Option<(Drawable, usize)>;

    fn active_layer(&self) -> Option<DrawableId>;
    fn set_active_layer(&mut self, id: Option<DrawableId>);
    fn active_channel(&self) -> Option<DrawableId>;
    fn set_active_channel(&mut self, id: Option<DrawableId>);

    fn image_size(&self) -> (u32, u32);
    fn set_image_size(&mut self, width: u32, height: u32);
    fn image_type(&self) -> (Format, Precision);
    fn set_image_type(&mut self, base: Format, precision: Precision);

    fn guides_mut(&mut self) -> &mut Vec<Guide>;
    fn selection_mut(&mut self) -> &mut Option<Bounds>;
    /// Identity and state of the tool currently active on the image.
    fn active_tool(&mut self) -> Option<(ToolId, &mut ToolState)>;

    fn image_dirty(&mut self) -> i32;
    fn image_clean(&mut self) -> i32;
}

// ============================================================================
// UNDO ACTION TRAIT
// ============================================================================

/// Category of an undo record or group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoKind {
    Image,
    ImageMod,
    LayerDisplace,
    LayerMod,
    ChannelMod,
    LayerAdd,
    LayerRemove,
    ChannelAdd,
    ChannelRemove,
    LayerMaskAdd,
    LayerMaskRemove,
    ImageResize,
    Convert,
    Selection,
    Transform,
    Paint,
    Guide,
    Misc,
}

impl UndoKind {
    pub fn label(self) -> &'static str {
        match self {
            UndoKind::Image | UndoKind::ImageMod => "Modify Pixels",
            UndoKind::LayerDisplace => "Move Layer",
            UndoKind::LayerMod => "Modify Layer",
            UndoKind::ChannelMod => "Modify Channel",
            UndoKind::LayerAdd => "New Layer",
            UndoKind::LayerRemove => "Delete Layer",
            UndoKind::ChannelAdd => "New Channel",
            UndoKind::ChannelRemove => "Delete Channel",
            UndoKind::LayerMaskAdd => "Add Layer Mask",
            UndoKind::LayerMaskRemove => "Apply Layer Mask",
            UndoKind::ImageResize => "Resize Image",
            UndoKind::Convert => "Convert Image",
            UndoKind::Selection => "Selection",
            UndoKind::Transform => "Transform",
            UndoKind::Paint => "Paint",
            UndoKind::Guide => "Guide",
            UndoKind::Misc => "Misc",
        }
    }
}

/// A record on the undo or redo stack.
///
/// `pop` restores the state the record holds and stores the state it
/// replaced, so the same record serves for the opposite direction.
pub trait UndoAction: Send + Sync {
    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError>;
    fn kind(&self) -> UndoKind;
    fn description(&self) -> String {
        self.kind().label().to_string()
    }
    fn memory_size(&self) -> usize;
}

fn dirty_by(ctx: &mut dyn UndoContext, id: DrawableId, direction: UndoDirection) -> Result<(), UndoError> {
    let d = ctx.drawable_mut(id).ok_or(UndoError::UnknownDrawable(id))?;
    match direction {
        UndoDirection::Undo => {
            d.clean();
            ctx.image_clean();
        }
        UndoDirection::Redo => {
            d.dirty();
            ctx.image_dirty();
        }
    }
    Ok(())
}

// ============================================================================
// IMAGE UNDO - rectangular pixel snapshots
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Copied out of the drawable when the record was pushed.
    New,
    /// Adopted from a caller that had already saved the pixels.
    Mod,
}

/// Rectangular snapshot of drawable pixels.
///
/// The snapshot covers `(x1, y1)..(x2, y2)` of the drawable and is stored
/// with its origin at `(0, 0)`. Pops swap it with the drawable at
/// `(x3, y3)`.
pub struct ImageUndo {
    snapshot: Canvas,
    drawable: DrawableId,
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
    x3: u32,
    y3: u32,
    kind: SnapshotKind,
}

fn clamp_rect(d: &Drawable, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<(u32, u32, u32, u32), UndoError> {
    let (w, h) = (d.width() as i32, d.height() as i32);
    let x1 = x1.clamp(0, w);
    let y1 = y1.clamp(0, h);
    let x2 = x2.clamp(0, w);
    let y2 = y2.clamp(0, h);
    if x2 <= x1 || y2 <= y1 {
        return Err(UndoError::EmptyRegion);
    }
    Ok((x1 as u32, y1 as u32, x2 as u32, y2 as u32))
}

impl ImageUndo {
    /// Copy `(x1, y1)..(x2, y2)` out of `drawable` before it is modified.
    pub fn capture(drawable: &Drawable, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Self, UndoError> {
        let (x1, y1, x2, y2) = clamp_rect(drawable, x1, y1, x2, y2)?;
        let (w, h) = (x2 - x1, y2 - y1);
        let tile_size = match drawable.data().storage() {
            Storage::Tiled => drawable.data().tile_width(),
            Storage::Flat => DEFAULT_TILE_SIZE,
        };
        let mut snapshot = Canvas::with_tile_size(drawable.tag(), w, h, Storage::Tiled, tile_size)?;
        let src = PixelArea::new(drawable.data(), x1, y1, w, h);
        let mut dest = PixelAreaMut::new(&mut snapshot, 0, 0, w, h, false);
        pixelarea::copy_area(&src, &mut dest)?;
        Ok(Self {
            snapshot,
            drawable: drawable.id(),
            x1,
            y1,
            x2,
            y2,
            x3: x1,
            y3: y1,
            kind: SnapshotKind::New,
        })
    }

    /// Take ownership of `snapshot`, which already holds the original
    /// pixels of `(x1, y1)..(x2, y2)` at its origin.
    pub fn adopt(
        drawable: &Drawable,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        snapshot: Canvas,
    ) -> Result<Self, UndoError> {
        let (x1, y1, x2, y2) = clamp_rect(drawable, x1, y1, x2, y2)?;
        if snapshot.tag() != drawable.tag() {
            return Err(UndoError::Inconsistent(format!(
                "snapshot tag {} does not match drawable tag {}",
                snapshot.tag(),
                drawable.tag()
            )));
        }
        if snapshot.width() < x2 - x1 || snapshot.height() < y2 - y1 {
            return Err(UndoError::Inconsistent(format!(
                "snapshot {}x{} smaller than region {}x{}",
                snapshot.width(),
                snapshot.height(),
                x2 - x1,
                y2 - y1
            )));
        }
        Ok(Self {
            snapshot,
            drawable: drawable.id(),
            x1,
            y1,
            x2,
            y2,
            x3: x1,
            y3: y1,
            kind: SnapshotKind::Mod,
        })
    }

    /// Restore into a different position than the one captured.
    pub fn with_destination(mut self, x3: u32, y3: u32) -> Self {
        self.x3 = x3;
        self.y3 = y3;
        self
    }

    pub fn drawable(&self) -> DrawableId {
        self.drawable
    }

    pub fn rect(&self) -> (u32, u32, u32, u32) {
        (self.x1, self.y1, self.x2, self.y2)
    }

    pub fn snapshot_kind(&self) -> SnapshotKind {
        self.kind
    }
}

impl UndoAction for ImageUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError> {
        let (w, h) = (self.x2 - self.x1, self.y2 - self.y1);
        let d = ctx.drawable_mut(self.drawable).ok_or(UndoError::UnknownDrawable(self.drawable))?;
        let mut saved = PixelAreaMut::new(&mut self.snapshot, 0, 0, w, h, false);
        let mut live = PixelAreaMut::new(d.data_mut(), self.x3, self.y3, w, h, true);
        pixelarea::swap_area(&mut saved, &mut live)?;
        dirty_by(ctx, self.drawable, direction)
    }

    fn kind(&self) -> UndoKind {
        match self.kind {
            SnapshotKind::New => UndoKind::Image,
            SnapshotKind::Mod => UndoKind::ImageMod,
        }
    }

    fn memory_size(&self) -> usize {
        let (w, h) = ((self.x2 - self.x1) as usize, (self.y2 - self.y1) as usize);
        w * h * self.snapshot.bytes() + 2 * std::mem::size_of::<usize>()
    }
}

// ============================================================================
// STRUCTURAL RECORDS
// ============================================================================

/// Layer offset change. The layer's mask moves with it.
pub struct LayerDisplaceUndo {
    pub layer: DrawableId,
    pub offset: (i32, i32),
}

impl UndoAction for LayerDisplaceUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        let d = ctx.drawable_mut(self.layer).ok_or(UndoError::UnknownDrawable(self.layer))?;
        let current = d.offsets();
        d.set_offsets(self.offset.0, self.offset.1);
        if let Some(mask) = d.layer_mask_mut() {
            mask.set_offsets(self.offset.0, self.offset.1);
        }
        self.offset = current;
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::LayerDisplace
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Whole-canvas replacement of a layer, e.g. after a resize or a format
/// change.
pub struct LayerModUndo {
    pub layer: DrawableId,
    pub tiles: Canvas,
    pub offset: (i32, i32),
}

impl UndoAction for LayerModUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        let d = ctx.drawable_mut(self.layer).ok_or(UndoError::UnknownDrawable(self.layer))?;
        let tiles = self.tiles.clone();
        self.tiles = d.replace_data(tiles);
        let current = d.offsets();
        d.set_offsets(self.offset.0, self.offset.1);
        self.offset = current;
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::LayerMod
    }

    fn memory_size(&self) -> usize {
        self.tiles.width() as usize * self.tiles.height() as usize * self.tiles.bytes()
    }
}

pub struct ChannelModUndo {
    pub channel: DrawableId,
    pub tiles: Canvas,
}

impl UndoAction for ChannelModUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        let d = ctx.drawable_mut(self.channel).ok_or(UndoError::UnknownDrawable(self.channel))?;
        let tiles = self.tiles.clone();
        self.tiles = d.replace_data(tiles);
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::ChannelMod
    }

    fn memory_size(&self) -> usize {
        self.tiles.width() as usize * self.tiles.height() as usize * self.tiles.bytes()
    }
}

/// Direction of a structural add/remove record at push time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructOp {
    Add,
    Remove,
}

impl StructOp {
    /// Whether replaying in `direction` takes the object out of the image.
    fn removes(self, direction: UndoDirection) -> bool {
        matches!(
            (direction, self),
            (UndoDirection::Undo, StructOp::Add) | (UndoDirection::Redo, StructOp::Remove)
        )
    }
}

/// A layer entering or leaving the stack.
///
/// While the layer is out of the image the record owns it.
pub struct LayerUndo {
    op: StructOp,
    layer: DrawableId,
    position: usize,
    prev_active: Option<DrawableId>,
    stored: Option<Drawable>,
    size: usize,
}

impl LayerUndo {
    /// Record a layer that was just added. `prev_active` is the active
    /// layer before the add.
    pub fn added(layer: &Drawable, position: usize, prev_active: Option<DrawableId>) -> Self {
        Self {
            op: StructOp::Add,
            layer: layer.id(),
            position,
            prev_active,
            stored: None,
            size: layer.undo_size(),
        }
    }

    /// Record a layer that was just removed; the record keeps it.
    pub fn removed(layer: Drawable, position: usize, prev_active: Option<DrawableId>) -> Self {
        Self {
            op: StructOp::Remove,
            layer: layer.id(),
            position,
            prev_active,
            size: layer.undo_size(),
            stored: Some(layer),
        }
    }
}

impl UndoAction for LayerUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError> {
        if self.op.removes(direction) {
            let (layer, position) = ctx.remove_layer(self.layer).ok_or(UndoError::UnknownDrawable(self.layer))?;
            self.position = position;
            self.stored = Some(layer);
            if ctx.active_layer() == Some(self.layer) || ctx.active_layer().is_none() {
                ctx.set_active_layer(self.prev_active);
            }
        } else {
            let layer = self
                .stored
                .take()
                .ok_or_else(|| UndoError::Inconsistent("layer record holds no layer".into()))?;
            ctx.insert_layer(layer, self.position);
            ctx.set_active_layer(Some(self.layer));
        }
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        match self.op {
            StructOp::Add => UndoKind::LayerAdd,
            StructOp::Remove => UndoKind::LayerRemove,
        }
    }

    fn memory_size(&self) -> usize {
        self.size
    }
}

pub struct ChannelUndo {
    op: StructOp,
    channel: DrawableId,
    position: usize,
    prev_active: Option<DrawableId>,
    stored: Option<Drawable>,
    size: usize,
}

impl ChannelUndo {
    pub fn added(channel: &Drawable, position: usize, prev_active: Option<DrawableId>) -> Self {
        Self {
            op: StructOp::Add,
            channel: channel.id(),
            position,
            prev_active,
            stored: None,
            size: channel.undo_size(),
        }
    }

    pub fn removed(channel: Drawable, position: usize, prev_active: Option<DrawableId>) -> Self {
        Self {
            op: StructOp::Remove,
            channel: channel.id(),
            position,
            prev_active,
            size: channel.undo_size(),
            stored: Some(channel),
        }
    }
}

impl UndoAction for ChannelUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError> {
        if self.op.removes(direction) {
            let (channel, position) =
                ctx.remove_channel(self.channel).ok_or(UndoError::UnknownDrawable(self.channel))?;
            self.position = position;
            self.stored = Some(channel);
            if ctx.active_channel() == Some(self.channel) || ctx.active_channel().is_none() {
                ctx.set_active_channel(self.prev_active);
            }
        } else {
            let channel = self
                .stored
                .take()
                .ok_or_else(|| UndoError::Inconsistent("channel record holds no channel".into()))?;
            ctx.insert_channel(channel, self.position);
            ctx.set_active_channel(Some(self.channel));
        }
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        match self.op {
            StructOp::Add => UndoKind::ChannelAdd,
            StructOp::Remove => UndoKind::ChannelRemove,
        }
    }

    fn memory_size(&self) -> usize {
        self.size
    }
}

/// A mask being attached to or detached from its layer.
pub struct LayerMaskUndo {
    op: StructOp,
    layer: DrawableId,
    stored: Option<Drawable>,
    size: usize,
}

impl LayerMaskUndo {
    pub fn added(layer: DrawableId, mask: &Drawable) -> Self {
        Self { op: StructOp::Add, layer, stored: None, size: mask.undo_size() }
    }

    pub fn removed(layer: DrawableId, mask: Drawable) -> Self {
        Self { op: StructOp::Remove, layer, size: mask.undo_size(), stored: Some(mask) }
    }
}

impl UndoAction for LayerMaskUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError> {
        let d = ctx.drawable_mut(self.layer).ok_or(UndoError::UnknownDrawable(self.layer))?;
        if !d.is_layer() {
            return Err(UndoError::Inconsistent(format!("{} is not a layer", self.layer)));
        }
        if self.op.removes(direction) {
            self.stored = d.replace_layer_mask(None);
            if self.stored.is_none() {
                return Err(UndoError::Inconsistent("layer has no mask to remove".into()));
            }
        } else {
            let mask = self
                .stored
                .take()
                .ok_or_else(|| UndoError::Inconsistent("mask record holds no mask".into()))?;
            d.replace_layer_mask(Some(mask));
        }
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        match self.op {
            StructOp::Add => UndoKind::LayerMaskAdd,
            StructOp::Remove => UndoKind::LayerMaskRemove,
        }
    }

    fn memory_size(&self) -> usize {
        self.size
    }
}

/// Image size, base format and precision swap.
pub struct ImageModUndo {
    pub width: u32,
    pub height: u32,
    pub base: Format,
    pub precision: Precision,
}

impl UndoAction for ImageModUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        let (w, h) = ctx.image_size();
        let (base, precision) = ctx.image_type();
        ctx.set_image_size(self.width, self.height);
        ctx.set_image_type(self.base, self.precision);
        self.width = w;
        self.height = h;
        self.base = base;
        self.precision = precision;
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::ImageResize
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

// ============================================================================
// TOOL RECORDS
// ============================================================================

/// Transform tool parameters captured at push time.
///
/// Restored only while the same tool is still active; otherwise the pop
/// does nothing and the entry is consumed anyway.
pub struct TransformUndo {
    pub tool_id: ToolId,
    pub trans_info: [f64; 8],
    pub original: Option<Canvas>,
}

impl UndoAction for TransformUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        match ctx.active_tool() {
            Some((id, ToolState::Transform(state))) if id == self.tool_id => {
                std::mem::swap(&mut state.trans_info, &mut self.trans_info);
                std::mem::swap(&mut state.original, &mut self.original);
            }
            other => {
                log::warn!(
                    "transform undo for tool {} skipped, active tool is {:?}",
                    self.tool_id,
                    other.map(|(id, _)| id)
                );
            }
        }
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::Transform
    }

    fn memory_size(&self) -> usize {
        let original = self
            .original
            .as_ref()
            .map_or(0, |c| c.width() as usize * c.height() as usize * c.bytes());
        std::mem::size_of::<Self>() + original
    }
}

/// Paint tool stroke anchor.
pub struct PaintUndo {
    pub tool_id: ToolId,
    pub last_x: f64,
    pub last_y: f64,
    pub pressure: f64,
    pub xtilt: f64,
    pub ytilt: f64,
}

impl UndoAction for PaintUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        match ctx.active_tool() {
            Some((id, ToolState::Paint(state))) if id == self.tool_id => {
                std::mem::swap(&mut state.last_x, &mut self.last_x);
                std::mem::swap(&mut state.last_y, &mut self.last_y);
                std::mem::swap(&mut state.pressure, &mut self.pressure);
                std::mem::swap(&mut state.xtilt, &mut self.xtilt);
                std::mem::swap(&mut state.ytilt, &mut self.ytilt);
            }
            other => {
                log::warn!(
                    "paint undo for tool {} skipped, active tool is {:?}",
                    self.tool_id,
                    other.map(|(id, _)| id)
                );
            }
        }
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::Paint
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Guide position and orientation. A negative position marks a deleted
/// guide.
pub struct GuideUndo {
    pub id: u32,
    pub position: i32,
    pub orientation: Orientation,
}

impl UndoAction for GuideUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        let guide = ctx
            .guides_mut()
            .iter_mut()
            .find(|g| g.id == self.id)
            .ok_or_else(|| UndoError::Inconsistent(format!("no guide {}", self.id)))?;
        std::mem::swap(&mut guide.position, &mut self.position);
        std::mem::swap(&mut guide.orientation, &mut self.orientation);
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::Guide
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// The image selection rectangle, `None` for no selection.
pub struct SelectionUndo {
    pub bounds: Option<Bounds>,
}

impl UndoAction for SelectionUndo {
    fn pop(&mut self, ctx: &mut dyn UndoContext, _direction: UndoDirection) -> Result<(), UndoError> {
        std::mem::swap(ctx.selection_mut(), &mut self.bounds);
        Ok(())
    }

    fn kind(&self) -> UndoKind {
        UndoKind::Selection
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

// ============================================================================
// UNDO STACK - per-image undo/redo history with level-count eviction
// ============================================================================

/// One step of history: a single record or a bracketed group.
pub enum UndoEntry {
    Single(Box<dyn UndoAction>),
    Group { kind: UndoKind, actions: Vec<Box<dyn UndoAction>> },
}

impl UndoEntry {
    pub fn description(&self) -> String {
        match self {
            UndoEntry::Single(a) => a.description(),
            UndoEntry::Group { kind, .. } => kind.label().to_string(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UndoEntry::Single(_) => 1,
            UndoEntry::Group { actions, .. } => actions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged to the stack for this entry.
    pub fn memory_size(&self) -> usize {
        let records: usize = match self {
            UndoEntry::Single(a) => a.memory_size(),
            UndoEntry::Group { actions, .. } => actions.iter().map(|a| a.memory_size()).sum(),
        };
        records + std::mem::size_of::<UndoEntry>()
    }

    fn replay(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<(), UndoError> {
        match self {
            UndoEntry::Single(a) => a.pop(ctx, direction),
            UndoEntry::Group { actions, .. } => {
                let mut result = Ok(());
                let mut run = |a: &mut Box<dyn UndoAction>| {
                    if let Err(e) = a.pop(ctx, direction) {
                        log::warn!("undo record '{}' failed: {}", a.description(), e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                };
                match direction {
                    UndoDirection::Undo => actions.iter_mut().rev().for_each(&mut run),
                    UndoDirection::Redo => actions.iter_mut().for_each(&mut run),
                }
                result
            }
        }
    }
}

/// Per-image undo/redo history.
///
/// The newest entry sits at the back of each deque. Eviction is by entry
/// count (`levels_of_undo`); `undo_bytes` is informational.
pub struct UndoStack {
    undo: VecDeque<UndoEntry>,
    redo: VecDeque<UndoEntry>,
    undo_bytes: usize,
    levels_of_undo: usize,
    enabled: bool,
    group_depth: usize,
    open_group: Option<(UndoKind, Vec<Box<dyn UndoAction>>)>,
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new(1)
    }
}

impl UndoStack {
    pub fn new(levels_of_undo: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            undo_bytes: 0,
            levels_of_undo,
            enabled: true,
            group_depth: 0,
            open_group: None,
        }
    }

    // ---- configuration ------------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stop recording. Existing history is kept.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn levels_of_undo(&self) -> usize {
        self.levels_of_undo
    }

    /// Change the level cap, evicting old entries that no longer fit.
    pub fn set_levels_of_undo(&mut self, levels: usize) {
        self.levels_of_undo = levels;
        while self.undo.len() > levels {
            self.evict_oldest();
        }
    }

    // ---- pushing ------------------------------------------------------------

    /// Record an action that is about to be (or was just) applied.
    pub fn push(&mut self, action: Box<dyn UndoAction>) -> Result<(), UndoError> {
        if !self.enabled {
            return Err(UndoError::Disabled);
        }
        self.free_redo();

        if let Some((_, actions)) = self.open_group.as_mut() {
            self.undo_bytes += action.memory_size();
            actions.push(action);
            return Ok(());
        }

        self.free_up_space()?;
        let entry = UndoEntry::Single(action);
        self.undo_bytes += entry.memory_size();
        self.undo.push_back(entry);
        Ok(())
    }

    /// Open a group. Nested starts only bump a counter.
    pub fn push_group_start(&mut self, kind: UndoKind) -> Result<(), UndoError> {
        if !self.enabled {
            return Err(UndoError::Disabled);
        }
        if self.group_depth > 0 {
            self.group_depth += 1;
            return Ok(());
        }
        self.free_redo();
        self.free_up_space()?;
        self.group_depth = 1;
        self.open_group = Some((kind, Vec::new()));
        self.undo_bytes += std::mem::size_of::<UndoEntry>();
        Ok(())
    }

    /// Close a group. The outermost end commits it as one entry; a group
    /// with no records is dropped.
    pub fn push_group_end(&mut self) -> Result<(), UndoError> {
        if self.group_depth == 0 {
            return Err(UndoError::GroupNotOpen);
        }
        self.group_depth -= 1;
        if self.group_depth > 0 {
            return Ok(());
        }
        match self.open_group.take() {
            Some((kind, actions)) if !actions.is_empty() => {
                self.undo.push_back(UndoEntry::Group { kind, actions });
            }
            _ => {
                self.undo_bytes = self.undo_bytes.saturating_sub(std::mem::size_of::<UndoEntry>());
            }
        }
        Ok(())
    }

    pub fn group_depth(&self) -> usize {
        self.group_depth
    }

    // ---- popping ------------------------------------------------------------

    /// Undo the newest entry. `Ok(false)` when there is nothing to undo.
    pub fn undo(&mut self, ctx: &mut dyn UndoContext) -> Result<bool, UndoError> {
        self.pop(ctx, UndoDirection::Undo)
    }

    /// Redo the newest undone entry. `Ok(false)` when there is nothing to redo.
    pub fn redo(&mut self, ctx: &mut dyn UndoContext) -> Result<bool, UndoError> {
        self.pop(ctx, UndoDirection::Redo)
    }

    /// Undo the `count` newest entries, stopping early when history runs out.
    pub fn undo_to(&mut self, count: usize, ctx: &mut dyn UndoContext) -> Result<usize, UndoError> {
        let mut done = 0;
        while done < count && self.undo(ctx)? {
            done += 1;
        }
        Ok(done)
    }

    fn pop(&mut self, ctx: &mut dyn UndoContext, direction: UndoDirection) -> Result<bool, UndoError> {
        if self.group_depth > 0 {
            return Err(UndoError::GroupOpen);
        }
        let (from, to) = match direction {
            UndoDirection::Undo => (&mut self.undo, &mut self.redo),
            UndoDirection::Redo => (&mut self.redo, &mut self.undo),
        };
        let Some(mut entry) = from.pop_back() else {
            return Ok(false);
        };
        let before = entry.memory_size();
        let result = entry.replay(ctx, direction);
        let after = entry.memory_size();
        to.push_back(entry);
        self.undo_bytes = (self.undo_bytes + after).saturating_sub(before);
        result.map(|()| true)
    }

    // ---- freeing ------------------------------------------------------------

    /// Drop all history. An open group is discarded too.
    pub fn free(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.open_group = None;
        self.group_depth = 0;
        self.undo_bytes = 0;
    }

    fn free_redo(&mut self) {
        for entry in self.redo.drain(..) {
            self.undo_bytes = self.undo_bytes.saturating_sub(entry.memory_size());
        }
    }

    fn free_up_space(&mut self) -> Result<(), UndoError> {
        if self.levels_of_undo == 0 {
            return Err(UndoError::NoLevels);
        }
        while self.undo.len() >= self.levels_of_undo {
            self.evict_oldest();
        }
        Ok(())
    }

    fn evict_oldest(&mut self) {
        if let Some(entry) = self.undo.pop_front() {
            log::debug!("undo: evicting '{}' ({} bytes)", entry.description(), entry.memory_size());
            self.undo_bytes = self.undo_bytes.saturating_sub(entry.memory_size());
        }
    }

    // ---- introspection ------------------------------------------------------

    pub fn undo_bytes(&self) -> usize {
        self.undo_bytes
    }

    pub fn undo_levels(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_levels(&self) -> usize {
        self.redo.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo.back().map(UndoEntry::description)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo.back().map(UndoEntry::description)
    }

    /// Undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo.iter().rev().map(UndoEntry::description).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drawable::LayerMode;
    use crate::tag::{Alpha, Tag};

    /// Minimal context: a flat list of layers and an image size.
    #[derive(Default)]
    struct TestImage {
        layers: Vec<Drawable>,
        active: Option<DrawableId>,
        size: (u32, u32),
        base: Option<Format>,
        guides: Vec<Guide>,
        selection: Option<Bounds>,
        dirty: i32,
    }

    impl UndoContext for TestImage {
        fn drawable_mut(&mut self, id: DrawableId) -> Option<&mut Drawable> {
            self.layers.iter_mut().find(|l| l.id() == id)
        }
        fn insert_layer(&mut self, layer: Drawable, position: usize) {
            let pos = position.min(self.layers.len());
            self.layers.insert(pos, layer);
        }
        fn remove_layer(&mut self, id: DrawableId) -> Option<(Drawable, usize)> {
            let pos = self.layers.iter().position(|l| l.id() == id)?;
            Some((self.layers.remove(pos), pos))
        }
        fn insert_channel(&mut self, _: Drawable, _: usize) {}
        fn remove_channel(&mut self, _: DrawableId) -> Option<(Drawable, usize)> {
            None
        }
        fn active_layer(&self) -> Option<DrawableId> {
            self.active
        }
        fn set_active_layer(&mut self, id: Option<DrawableId>) {
            self.active = id;
        }
        fn active_channel(&self) -> Option<DrawableId> {
            None
        }
        fn set_active_channel(&mut self, _: Option<DrawableId>) {}
        fn image_size(&self) -> (u32, u32) {
            self.size
        }
        fn set_image_size(&mut self, width: u32, height: u32) {
            self.size = (width, height);
        }
        fn image_type(&self) -> (Format, Precision) {
            (self.base.unwrap_or(Format::Gray), Precision::U8)
        }
        fn set_image_type(&mut self, base: Format, _precision: Precision) {
            self.base = Some(base);
        }
        fn guides_mut(&mut self) -> &mut Vec<Guide> {
            &mut self.guides
        }
        fn selection_mut(&mut self) -> &mut Option<Bounds> {
            &mut self.selection
        }
        fn active_tool(&mut self) -> Option<(ToolId, &mut ToolState)> {
            None
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

    fn gray_layer(w: u32, h: u32) -> Drawable {
        let tag = Tag::new(Precision::U8, Format::Gray, Alpha::No);
        let tiles = Canvas::with_tile_size(tag, w, h, Storage::Tiled, 2).unwrap();
        Drawable::new_layer("gray", tiles, 1.0, LayerMode::Normal)
    }

    fn paint(img: &mut TestImage, value: u8) {
        let d = &mut img.layers[0];
        d.data_mut().fill(&[value]).unwrap();
    }

    #[test]
    fn push_clears_redo() {
        let mut img = TestImage { layers: vec![gray_layer(4, 4)], ..Default::default() };
        let mut stack = UndoStack::new(5);
        for v in 1..=3u8 {
            let rec = ImageUndo::capture(&img.layers[0], 0, 0, 4, 4).unwrap();
            stack.push(Box::new(rec)).unwrap();
            paint(&mut img, v);
        }
        assert!(stack.undo(&mut img).unwrap());
        assert_eq!(stack.redo_levels(), 1);
        let rec = ImageUndo::capture(&img.layers[0], 0, 0, 1, 1).unwrap();
        stack.push(Box::new(rec)).unwrap();
        assert_eq!(stack.redo_levels(), 0);
        assert!(!stack.redo(&mut img).unwrap());
    }

    #[test]
    fn eviction_keeps_level_count() {
        let img = TestImage { layers: vec![gray_layer(4, 4)], ..Default::default() };
        let mut stack = UndoStack::new(3);
        for _ in 0..10 {
            let rec = ImageUndo::capture(&img.layers[0], 0, 0, 4, 4).unwrap();
            stack.push(Box::new(rec)).unwrap();
            assert!(stack.undo_levels() <= 3);
        }
        let per_entry = 16 + 2 * std::mem::size_of::<usize>() + std::mem::size_of::<UndoEntry>();
        assert_eq!(stack.undo_bytes(), 3 * per_entry);
    }

    #[test]
    fn zero_levels_and_disabled_reject_pushes() {
        let img = TestImage { layers: vec![gray_layer(2, 2)], ..Default::default() };
        let mut stack = UndoStack::new(0);
        let rec = ImageUndo::capture(&img.layers[0], 0, 0, 2, 2).unwrap();
        assert!(matches!(stack.push(Box::new(rec)), Err(UndoError::NoLevels)));

        stack.set_levels_of_undo(2);
        stack.disable();
        let rec = ImageUndo::capture(&img.layers[0], 0, 0, 2, 2).unwrap();
        assert!(matches!(stack.push(Box::new(rec)), Err(UndoError::Disabled)));
        assert_eq!(stack.undo_levels(), 0);
    }

    #[test]
    fn empty_region_is_rejected() {
        let layer = gray_layer(4, 4);
        assert!(matches!(ImageUndo::capture(&layer, 2, 2, 2, 3), Err(UndoError::EmptyRegion)));
        assert!(matches!(ImageUndo::capture(&layer, 5, 5, 9, 9), Err(UndoError::EmptyRegion)));
        let clamped = ImageUndo::capture(&layer, -3, -3, 2, 9).unwrap();
        assert_eq!(clamped.rect(), (0, 0, 2, 4));
    }

    #[test]
    fn group_undoes_as_one_step() {
        let mut img = TestImage { layers: vec![gray_layer(4, 4)], ..Default::default() };
        let mut stack = UndoStack::new(4);
        stack.push_group_start(UndoKind::Misc).unwrap();
        stack.push_group_start(UndoKind::Misc).unwrap();
        for v in [10u8, 20, 30] {
            let rec = ImageUndo::capture(&img.layers[0], 0, 0, 4, 4).unwrap();
            stack.push(Box::new(rec)).unwrap();
            paint(&mut img, v);
        }
        assert!(matches!(stack.undo(&mut img), Err(UndoError::GroupOpen)));
        stack.push_group_end().unwrap();
        assert_eq!(stack.undo_levels(), 0);
        stack.push_group_end().unwrap();
        assert_eq!(stack.undo_levels(), 1);
        assert!(matches!(stack.push_group_end(), Err(UndoError::GroupNotOpen)));

        stack.undo(&mut img).unwrap();
        assert_eq!(img.layers[0].data().get_pixel(3, 3), Some(&[0u8][..]));
        stack.redo(&mut img).unwrap();
        assert_eq!(img.layers[0].data().get_pixel(3, 3), Some(&[30u8][..]));
    }

    #[test]
    fn empty_group_leaves_no_entry() {
        let mut stack = UndoStack::new(2);
        let bytes = stack.undo_bytes();
        stack.push_group_start(UndoKind::Misc).unwrap();
        stack.push_group_end().unwrap();
        assert_eq!(stack.undo_levels(), 0);
        assert_eq!(stack.undo_bytes(), bytes);
    }

    #[test]
    fn layer_add_round_trip() {
        let mut img = TestImage::default();
        let layer = gray_layer(2, 2);
        let id = layer.id();
        let rec = LayerUndo::added(&layer, 0, None);
        img.insert_layer(layer, 0);
        img.active = Some(id);
        let mut stack = UndoStack::new(3);
        stack.push(Box::new(rec)).unwrap();

        stack.undo(&mut img).unwrap();
        assert!(img.layers.is_empty());
        assert_eq!(img.active, None);
        stack.redo(&mut img).unwrap();
        assert_eq!(img.layers.len(), 1);
        assert_eq!(img.active, Some(id));
    }

    #[test]
    fn image_mod_swaps_size() {
        let mut img = TestImage { size: (10, 10), ..Default::default() };
        let mut stack = UndoStack::new(3);
        stack
            .push(Box::new(ImageModUndo { width: 10, height: 10, base: Format::Gray, precision: Precision::U8 }))
            .unwrap();
        img.size = (20, 5);
        img.base = Some(Format::Rgb);
        stack.undo(&mut img).unwrap();
        assert_eq!(img.size, (10, 10));
        assert_eq!(img.image_type().0, Format::Gray);
        stack.redo(&mut img).unwrap();
        assert_eq!(img.size, (20, 5));
        assert_eq!(img.image_type().0, Format::Rgb);
    }

    #[test]
    fn image_undo_tracks_dirty_counts() {
        let mut img = TestImage { layers: vec![gray_layer(2, 2)], ..Default::default() };
        let mut stack = UndoStack::new(3);
        let rec = ImageUndo::capture(&img.layers[0], 0, 0, 2, 2).unwrap();
        stack.push(Box::new(rec)).unwrap();
        img.layers[0].dirty();
        img.image_dirty();
        stack.undo(&mut img).unwrap();
        assert_eq!(img.layers[0].dirty_count(), 0);
        assert_eq!(img.dirty, 0);
        stack.redo(&mut img).unwrap();
        assert_eq!(img.layers[0].dirty_count(), 1);
        assert_eq!(img.dirty, 1);
    }
}
