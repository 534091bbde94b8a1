//! Error types for the engine, one enum per concern.

use uuid::Uuid;

use crate::tag::Tag;

/// Canvas allocation and access failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("invalid canvas size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("canvas size {width}x{height} exceeds the {limit} pixel limit")]
    TooLarge { width: u32, height: u32, limit: u64 },

    #[error("invalid tag {0}")]
    InvalidTag(Tag),

    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    #[error("tag mismatch: {left} vs {right}")]
    TagMismatch { left: Tag, right: Tag },

    #[error("region {x},{y} {width}x{height} is outside the canvas")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    #[error("area sizes differ: {0}x{1} vs {2}x{3}")]
    SizeMismatch(u32, u32, u32, u32),

    #[error("pixel has {got} bytes, expected {expected}")]
    PixelSize { got: usize, expected: usize },
}

/// Undo engine failures.
#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    /// Pushes are refused while undo is disabled for the image.
    #[error("undo is disabled for this image")]
    Disabled,

    #[error("levels of undo is zero")]
    NoLevels,

    #[error("snapshot allocation failed: {0}")]
    Allocation(#[from] CanvasError),

    #[error("empty undo region")]
    EmptyRegion,

    #[error("no drawable with id {0}")]
    UnknownDrawable(Uuid),

    #[error("an undo group is still open")]
    GroupOpen,

    #[error("no undo group is open")]
    GroupNotOpen,

    #[error("undo record is inconsistent with the image: {0}")]
    Inconsistent(String),
}

/// Failures of image-level operations and pixel operations on drawables.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("no drawable with id {0}")]
    UnknownDrawable(Uuid),

    #[error("{0} is not a layer")]
    NotALayer(Uuid),

    #[error("layer {0} already has a mask")]
    MaskExists(Uuid),

    #[error("drawable tag {got} does not fit image {expected}")]
    TagMismatch { got: Tag, expected: Tag },

    #[error("no guide with id {0}")]
    UnknownGuide(u32),

    #[error("no pixel kernel for {0}")]
    Unsupported(Tag),

    #[error("the selection does not intersect the drawable")]
    EmptySelection,

    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error(transparent)]
    Undo(#[from] UndoError),
}

/// Curves file parsing failures.
#[derive(Debug, thiserror::Error)]
pub enum CurvesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a curves file (bad header)")]
    BadHeader,

    #[error("curve {curve} point {point}: expected two integer fields")]
    BadField { curve: usize, point: usize },

    #[error("curve {curve} point {point}: value {value} out of range")]
    OutOfRange { curve: usize, point: usize, value: i32 },
}

/// Settings file failures.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Project file and raster import/export failures.
#[derive(Debug, thiserror::Error)]
pub enum ProjectFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

impl From<Box<bincode::ErrorKind>> for ProjectFileError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectFileError::Serialize(e.to_string())
    }
}
