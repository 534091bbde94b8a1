use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, ImageOutputFormat, Luma, LumaA, Rgb, Rgba};
use serde::{Deserialize, Serialize};

use crate::canvas::{Canvas, Storage};
use crate::drawable::{ChannelProps, Drawable, DrawableKind, LayerMode, LayerProps, MaskProps};
use crate::error::ProjectFileError;
use crate::project::{Guide, Orientation, Project};
use crate::settings::EngineSettings;
use crate::tag::{Alpha, Format, Precision, Tag};
use crate::undo::UndoContext;

// ============================================================================
// CTL PROJECT FILE FORMAT
// ============================================================================

/// Magic header of the sparse tiled project format.
const CTL_MAGIC_V1: &str = "CTL1";

/// File extension of project files.
pub const PROJECT_EXTENSION: &str = "ctl";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers or channels in a project file.
const MAX_DRAWABLES: usize = 256;

#[derive(Serialize, Deserialize)]
struct ProjectFileV1 {
    magic: String,
    name: String,
    width: u32,
    height: u32,
    /// Image base format and precision, as tag bits without alpha.
    image_tag: u32,
    active_layer: Option<usize>,
    active_channel: Option<usize>,
    layers: Vec<DrawableData>,
    channels: Vec<DrawableData>,
    guides: Vec<GuideData>,
}

#[derive(Serialize, Deserialize)]
struct DrawableData {
    name: String,
    visible: bool,
    offset_x: i32,
    offset_y: i32,
    tag: u32,
    width: u32,
    height: u32,
    storage: Storage,
    tile_size: u32,
    kind: KindData,
    tiles: Vec<TileData>,
}

#[derive(Serialize, Deserialize)]
enum KindData {
    Layer { opacity: f32, mode: LayerMode, preserve_trans: bool, mask: Option<Box<DrawableData>> },
    Channel { color: [u8; 3], opacity: f32, show_masked: bool },
    LayerMask { apply: bool, edit: bool, show: bool },
}

/// One allocated tile. Unallocated tiles are left out and read as zeros.
#[derive(Serialize, Deserialize)]
struct TileData {
    tx: u32,
    ty: u32,
    pixels: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct GuideData {
    id: u32,
    position: i32,
    vertical: bool,
}

fn drawable_data(d: &Drawable) -> DrawableData {
    let canvas = d.data();
    let tiles = canvas
        .tile_keys()
        .filter_map(|(tx, ty)| canvas.tile(tx, ty).map(|t| TileData { tx, ty, pixels: t.to_vec() }))
        .collect();
    let kind = match &d.kind {
        DrawableKind::Layer(p) => KindData::Layer {
            opacity: p.opacity,
            mode: p.mode,
            preserve_trans: p.preserve_trans,
            mask: p.mask.as_deref().map(|m| Box::new(drawable_data(m))),
        },
        DrawableKind::Channel(p) => {
            KindData::Channel { color: p.color, opacity: p.opacity, show_masked: p.show_masked }
        }
        DrawableKind::LayerMask(p) => KindData::LayerMask { apply: p.apply, edit: p.edit, show: p.show },
    };
    DrawableData {
        name: d.name.clone(),
        visible: d.visible,
        offset_x: d.offset_x,
        offset_y: d.offset_y,
        tag: d.tag().to_bits(),
        width: d.width(),
        height: d.height(),
        storage: canvas.storage(),
        tile_size: canvas.tile_width(),
        kind,
        tiles,
    }
}

fn restore_drawable(data: DrawableData) -> Result<Drawable, ProjectFileError> {
    if data.width > MAX_CANVAS_DIM || data.height > MAX_CANVAS_DIM {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Drawable '{}' size {}x{} exceeds maximum allowed {}x{}",
            data.name, data.width, data.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    let tag = Tag::from_bits(data.tag);
    let mut canvas = Canvas::with_tile_size(tag, data.width, data.height, data.storage, data.tile_size)?;
    for t in data.tiles {
        canvas.set_tile(t.tx, t.ty, t.pixels).map_err(|e| {
            ProjectFileError::InvalidFormat(format!("Tile ({},{}) in '{}': {}", t.tx, t.ty, data.name, e))
        })?;
    }
    let kind = match data.kind {
        KindData::Layer { opacity, mode, preserve_trans, mask } => {
            let mask = match mask {
                Some(m) => Some(Box::new(restore_drawable(*m)?)),
                None => None,
            };
            DrawableKind::Layer(LayerProps { opacity, mode, preserve_trans, mask })
        }
        KindData::Channel { color, opacity, show_masked } => {
            DrawableKind::Channel(ChannelProps { color, opacity, show_masked })
        }
        KindData::LayerMask { apply, edit, show } => DrawableKind::LayerMask(MaskProps { apply, edit, show }),
    };
    let mut d = Drawable::new(data.name, canvas, kind);
    d.visible = data.visible;
    d.set_offsets(data.offset_x, data.offset_y);
    Ok(d)
}

/// Save a project as a `.ctl` file. History is not saved.
pub fn save_project(project: &Project, path: &Path) -> Result<(), ProjectFileError> {
    let image = &project.image;
    let file = ProjectFileV1 {
        magic: CTL_MAGIC_V1.to_string(),
        name: project.name.clone(),
        width: image.width(),
        height: image.height(),
        image_tag: Tag::new(image.precision(), image.base(), Alpha::No).to_bits(),
        active_layer: image.active_layer_id().and_then(|id| image.layer_position(id)),
        active_channel: image.active_channel_id().and_then(|id| image.channel_position(id)),
        layers: image.layers().iter().map(drawable_data).collect(),
        channels: image.channels().iter().map(drawable_data).collect(),
        guides: image
            .guides()
            .map(|g| GuideData { id: g.id, position: g.position, vertical: g.orientation == Orientation::Vertical })
            .collect(),
    };
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &file)?;
    log::info!("saved project '{}' to {}", project.name, path.display());
    Ok(())
}

/// Load a `.ctl` project file.
pub fn load_project(path: &Path, settings: EngineSettings) -> Result<Project, ProjectFileError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 {
        return Err(ProjectFileError::InvalidFormat("File too small".into()));
    }

    // bincode encodes a String as an 8-byte length prefix + UTF-8 data, so
    // bytes 8..12 hold the 4-char magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != CTL_MAGIC_V1 {
        return Err(ProjectFileError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }
    let file: ProjectFileV1 = bincode::deserialize(&raw)?;

    if file.width == 0 || file.height == 0 {
        return Err(ProjectFileError::InvalidFormat("Canvas dimensions cannot be zero".into()));
    }
    if file.width > MAX_CANVAS_DIM || file.height > MAX_CANVAS_DIM {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Canvas size {}x{} exceeds maximum allowed {}x{}",
            file.width, file.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if file.layers.len() > MAX_DRAWABLES || file.channels.len() > MAX_DRAWABLES {
        return Err(ProjectFileError::InvalidFormat(format!(
            "Project holds {} layers and {} channels, the maximum is {}",
            file.layers.len(),
            file.channels.len(),
            MAX_DRAWABLES
        )));
    }

    let image_tag = Tag::from_bits(file.image_tag);
    let mut project = Project::new(file.width, file.height, image_tag.format(), image_tag.precision(), settings);
    project.name = file.name;
    project.path = Some(path.to_path_buf());

    let mut layer_ids = Vec::with_capacity(file.layers.len());
    for data in file.layers {
        let layer = restore_drawable(data)?;
        layer_ids.push(layer.id());
        project.image.insert_layer(layer, usize::MAX);
    }
    let mut channel_ids = Vec::with_capacity(file.channels.len());
    for data in file.channels {
        let channel = restore_drawable(data)?;
        channel_ids.push(channel.id());
        project.image.insert_channel(channel, usize::MAX);
    }
    project.image.set_active_layer(file.active_layer.and_then(|i| layer_ids.get(i).copied()));
    project.image.set_active_channel(file.active_channel.and_then(|i| channel_ids.get(i).copied()));
    for g in file.guides {
        let orientation = if g.vertical { Orientation::Vertical } else { Orientation::Horizontal };
        project.image.restore_guide(Guide { id: g.id, position: g.position, orientation });
    }

    log::info!("loaded project '{}' from {}", project.name, path.display());
    Ok(project)
}

// ============================================================================
// RASTER IMPORT / EXPORT
// ============================================================================

/// Decode a raster file into a canvas, keeping 16-bit and float samples.
pub fn import_canvas(path: &Path) -> Result<Canvas, ProjectFileError> {
    let img = image::open(path)?;
    let (w, h) = (img.width(), img.height());
    let (tag, bytes): (Tag, Vec<u8>) = match img {
        DynamicImage::ImageLuma8(b) => (Tag::new(Precision::U8, Format::Gray, Alpha::No), b.into_raw()),
        DynamicImage::ImageLumaA8(b) => (Tag::new(Precision::U8, Format::Gray, Alpha::Yes), b.into_raw()),
        DynamicImage::ImageRgb8(b) => (Tag::new(Precision::U8, Format::Rgb, Alpha::No), b.into_raw()),
        DynamicImage::ImageRgba8(b) => (Tag::new(Precision::U8, Format::Rgb, Alpha::Yes), b.into_raw()),
        DynamicImage::ImageLuma16(b) => {
            (Tag::new(Precision::U16, Format::Gray, Alpha::No), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        DynamicImage::ImageLumaA16(b) => {
            (Tag::new(Precision::U16, Format::Gray, Alpha::Yes), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        DynamicImage::ImageRgb16(b) => {
            (Tag::new(Precision::U16, Format::Rgb, Alpha::No), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        DynamicImage::ImageRgba16(b) => {
            (Tag::new(Precision::U16, Format::Rgb, Alpha::Yes), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        DynamicImage::ImageRgb32F(b) => {
            (Tag::new(Precision::Float, Format::Rgb, Alpha::No), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        DynamicImage::ImageRgba32F(b) => {
            (Tag::new(Precision::Float, Format::Rgb, Alpha::Yes), bytemuck::cast_slice(b.as_raw()).to_vec())
        }
        other => (Tag::new(Precision::U8, Format::Rgb, Alpha::Yes), other.to_rgba8().into_raw()),
    };
    Ok(Canvas::from_raw(tag, w, h, Storage::Tiled, &bytes)?)
}

/// Open a raster file as a one-layer project.
pub fn import_image(path: &Path, settings: EngineSettings) -> Result<Project, ProjectFileError> {
    let canvas = import_canvas(path)?;
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "Untitled".into());
    log::info!("imported {} as {} ({}x{})", path.display(), canvas.tag(), canvas.width(), canvas.height());
    let mut project = Project::from_canvas(name, canvas, settings);
    project.path = Some(path.to_path_buf());
    Ok(project)
}

/// Open either a `.ctl` project or a raster image, by extension.
pub fn open_any(path: &Path, settings: EngineSettings) -> Result<Project, ProjectFileError> {
    let is_project = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PROJECT_EXTENSION));
    if is_project { load_project(path, settings) } else { import_image(path, settings) }
}

fn u16_samples(canvas: &Canvas) -> Vec<u16> {
    bytemuck::pod_collect_to_vec(&canvas.to_raw())
}

/// Build an `image` buffer from a canvas. 8-bit canvases stay 8-bit;
/// every other precision is written as 16-bit.
pub fn canvas_to_dynamic(canvas: &Canvas) -> Result<DynamicImage, ProjectFileError> {
    let tag = canvas.tag();
    let (w, h) = (canvas.width(), canvas.height());
    let bad = || ProjectFileError::InvalidFormat(format!("cannot export {}", tag));
    let rgb = tag.is_rgb();
    let alpha = tag.has_alpha();

    if tag.precision() == Precision::U8 {
        let raw = canvas.to_raw();
        let img = match (rgb, alpha) {
            (true, true) => DynamicImage::ImageRgba8(ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
            (true, false) => DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
            (false, true) => {
                DynamicImage::ImageLumaA8(ImageBuffer::<LumaA<u8>, _>::from_raw(w, h, raw).ok_or_else(bad)?)
            }
            (false, false) => {
                DynamicImage::ImageLuma8(ImageBuffer::<Luma<u8>, _>::from_raw(w, h, raw).ok_or_else(bad)?)
            }
        };
        return Ok(img);
    }

    let wide = if tag.precision() == Precision::U16 { canvas.clone() } else { canvas.convert_precision(Precision::U16)? };
    let raw = u16_samples(&wide);
    let img = match (rgb, alpha) {
        (true, true) => DynamicImage::ImageRgba16(ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
        (true, false) => DynamicImage::ImageRgb16(ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
        (false, true) => DynamicImage::ImageLumaA16(ImageBuffer::<LumaA<u16>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
        (false, false) => DynamicImage::ImageLuma16(ImageBuffer::<Luma<u16>, _>::from_raw(w, h, raw).ok_or_else(bad)?),
    };
    Ok(img)
}

/// Encode a drawable to `path`; the format follows the extension.
/// JPEG and BMP are 8-bit only and drop to 8-bit samples.
pub fn export_drawable(drawable: &Drawable, path: &Path, quality: u8) -> Result<(), ProjectFileError> {
    let img = canvas_to_dynamic(drawable.data())?;
    let format = ImageFormat::from_path(path)?;
    let mut writer = BufWriter::new(File::create(path)?);

    match format {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality);
            encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)?;
        }
        ImageFormat::Bmp => {
            let rgba = img.to_rgba8();
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(rgba.as_raw(), rgba.width(), rgba.height(), image::ColorType::Rgba8)?;
        }
        ImageFormat::Png => img.write_to(&mut writer, ImageOutputFormat::Png)?,
        ImageFormat::Tiff => img.write_to(&mut writer, ImageOutputFormat::Tiff)?,
        other => {
            return Err(ProjectFileError::InvalidFormat(format!("unsupported export format {:?}", other)));
        }
    }
    log::info!("exported '{}' to {}", drawable.name, path.display());
    Ok(())
}
