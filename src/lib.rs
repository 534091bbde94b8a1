//! CineTile: a tiled, multi-precision raster engine.
//!
//! Pixel data lives in [`canvas::Canvas`] tile grids tagged with a
//! precision/format/alpha [`tag::Tag`]. Drawables wrap canvases, the
//! [`project::Project`] owns the layer stack and its [`undo::UndoStack`],
//! and [`pixelarea`] walks tile-aligned chunks for the operations in
//! [`ops`], whose kernels are dispatched per precision.

pub mod canvas;
pub mod cli;
pub mod drawable;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod pixelarea;
pub mod project;
pub mod settings;
pub mod tag;
pub mod undo;
