// ============================================================================
// CineTile CLI - headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   cinetile -i scan.tif --auto-levels -o scan_fixed.tif
//   cinetile -i plate.png --precision u16 --curves film.curves -o plate.ctl
//   cinetile -i "shots/*.png" --levels 0.05,0.95,1.2 --output-dir graded/ --format tiff
//   cinetile -i project.ctl --selection 0,0,512,256 --levels 0,1,0.8 --undo-check
//
// Every operation goes through the project's undo history, so --undo-check
// can unwind the whole pipeline and verify the original pixels come back.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::io;
use crate::ops::curves::{self, CurvesConfig};
use crate::ops::histogram::HistogramChannel;
use crate::ops::levels::{self, LevelsParams};
use crate::project::Project;
use crate::settings::EngineSettings;
use crate::tag::Precision;

// ============================================================================
// ARGUMENTS
// ============================================================================

/// CineTile headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "cinetile",
    about = "CineTile headless levels/curves processor",
    long_about = "Apply levels and curves to image files at 8-bit, 16-bit, float, half-float\n\
                  or fixed-point precision, with full undo history, without a GUI.\n\
                  Reads PNG, JPEG, TIFF, BMP and CTL project files.\n\n\
                  Example:\n  \
                  cinetile --input scan.tif --auto-levels --output fixed.tif\n  \
                  cinetile -i *.png --curves film.curves --output-dir out/ --format tiff"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.tif").
    /// CTL project files retain all layers; all other formats load as one layer.
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Convert the image to this precision first: u8, u16, float, float16, bfp.
    #[arg(long, value_name = "PRECISION")]
    pub precision: Option<String>,

    /// Restrict operations to the image rectangle X1,Y1,X2,Y2.
    #[arg(long, value_name = "X1,Y1,X2,Y2")]
    pub selection: Option<String>,

    /// Stretch channels so 0.6% of pixels clip at each end.
    #[arg(long)]
    pub auto_levels: bool,

    /// Levels as normalized LOW,HIGH[,GAMMA[,OUT_LOW,OUT_HIGH]].
    #[arg(long, value_name = "LOW,HIGH,GAMMA,OUT_LOW,OUT_HIGH")]
    pub levels: Option<String>,

    /// Channel --levels acts on: value, red, green, blue, alpha.
    #[arg(long, default_value = "value", value_name = "CHANNEL")]
    pub levels_channel: String,

    /// Curves file ("# GIMP Curves File" format) to apply.
    #[arg(long, value_name = "FILE")]
    pub curves: Option<PathBuf>,

    /// After processing, undo everything, check the original pixels came
    /// back, and redo.
    #[arg(long)]
    pub undo_check: bool,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, tiff, bmp, ctl.
    /// When omitted, the format is inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG quality (1-100, default 90).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Settings file to use instead of the per-user cinetilerc.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print per-file timing and memory information.
    #[arg(short, long)]
    pub verbose: bool,
}

/// History depth `--undo-check` needs to unwind the whole pipeline.
const UNDO_CHECK_LEVELS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Ctl,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Tiff => "tif",
            OutputFormat::Bmp => "bmp",
            OutputFormat::Ctl => io::PROJECT_EXTENSION,
        }
    }

    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => OutputFormat::Jpeg,
            "tiff" | "tif" => OutputFormat::Tiff,
            "bmp" => OutputFormat::Bmp,
            "ctl" => OutputFormat::Ctl,
            _ => OutputFormat::Png,
        }
    }
}

/// Everything `run_one` applies, parsed once up front.
struct Pipeline {
    precision: Option<Precision>,
    selection: Option<(u32, u32, u32, u32)>,
    auto_levels: bool,
    levels: Option<(HistogramChannel, [f32; 5])>,
    curves: Option<CurvesConfig>,
    undo_check: bool,
    format: OutputFormat,
    quality: u8,
    verbose: bool,
}

// ============================================================================
// BATCH RUN
// ============================================================================

/// Process every input; fails if any single file failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let mut settings = match &args.config {
        Some(path) => match EngineSettings::load_from(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: could not read settings '{}': {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineSettings::load(),
    };

    // Precision conversion, auto levels, levels and curves each take one step.
    if args.undo_check {
        settings.levels_of_undo = settings.levels_of_undo.max(UNDO_CHECK_LEVELS);
    }

    let pipeline = match build_pipeline(&args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) =
            build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref(), pipeline.format)
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        match run_one(input_path, &output_path, &pipeline, settings.clone()) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                log::error!("{}: {}", input_path.display(), e);
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn build_pipeline(args: &CliArgs) -> Result<Pipeline, String> {
    let precision = match &args.precision {
        Some(p) => Some(
            Precision::parse(p).ok_or_else(|| format!("unknown precision '{}'", p))?,
        ),
        None => None,
    };
    let selection = match &args.selection {
        Some(s) => {
            let v = parse_numbers::<u32>(s).ok_or_else(|| format!("bad selection '{}'", s))?;
            match v.as_slice() {
                [x1, y1, x2, y2] => Some((*x1, *y1, *x2, *y2)),
                _ => return Err(format!("selection needs four numbers, got '{}'", s)),
            }
        }
        None => None,
    };
    let levels = match &args.levels {
        Some(s) => Some((parse_channel(&args.levels_channel)?, parse_levels(s)?)),
        None => None,
    };
    let curves = match &args.curves {
        Some(path) => Some(
            CurvesConfig::load(path).map_err(|e| format!("could not read curves '{}': {}", path.display(), e))?,
        ),
        None => None,
    };
    let format = match (&args.format, &args.output) {
        (Some(f), _) => OutputFormat::parse(f),
        (None, Some(out)) => OutputFormat::parse(out.extension().and_then(|e| e.to_str()).unwrap_or("")),
        (None, None) => OutputFormat::Png,
    };
    Ok(Pipeline {
        precision,
        selection,
        auto_levels: args.auto_levels,
        levels,
        curves,
        undo_check: args.undo_check,
        format,
        quality: args.quality.clamp(1, 100),
        verbose: args.verbose,
    })
}

// ============================================================================
// ONE FILE: load, adjust, verify, save
// ============================================================================

fn run_one(input: &Path, output: &Path, pipeline: &Pipeline, settings: EngineSettings) -> Result<(), String> {
    // -- Step 1: Load ----------------------------------------------------
    let mut project = io::open_any(input, settings).map_err(|e| format!("load failed: {}", e))?;
    let id = project.active_layer().map(|l| l.id()).ok_or_else(|| "image has no active layer".to_string())?;
    let before = project.drawable(id).map_err(|e| e.to_string())?.data().to_raw();
    let before_precision = project.image.precision();

    // -- Step 2: Operations ----------------------------------------------
    if let Some(p) = pipeline.precision
        && p != project.image.precision()
    {
        project.convert_precision(p).map_err(|e| format!("precision conversion failed: {}", e))?;
    }
    project.set_selection(pipeline.selection);

    if pipeline.auto_levels {
        let params = levels::auto_levels(&mut project, id).map_err(|e| format!("auto levels failed: {}", e))?;
        if pipeline.verbose {
            describe_levels(&params);
        }
    }
    if let Some((channel, [lo, hi, gamma, out_lo, out_hi])) = pipeline.levels {
        let mut params = LevelsParams::new(project.image.precision());
        params.set_channel(channel, lo, hi, gamma, out_lo, out_hi);
        levels::apply_levels(&mut project, id, &params).map_err(|e| format!("levels failed: {}", e))?;
    }
    if let Some(cfg) = &pipeline.curves {
        curves::apply_curves(&mut project, id, cfg).map_err(|e| format!("curves failed: {}", e))?;
    }

    if pipeline.verbose {
        println!("  {}", project.memory_report());
    }

    // -- Step 3: Optional undo round trip ----------------------------------
    if pipeline.undo_check {
        undo_check(&mut project, id, &before, before_precision)?;
    }

    // -- Step 4: Save ----------------------------------------------------
    match pipeline.format {
        OutputFormat::Ctl => io::save_project(&project, output).map_err(|e| format!("CTL save failed: {}", e))?,
        _ => {
            let layer = project.drawable(id).map_err(|e| e.to_string())?;
            io::export_drawable(layer, output, pipeline.quality).map_err(|e| format!("save failed: {}", e))?;
        }
    }
    Ok(())
}

/// Undo every recorded step, compare with the pixels loaded from disk, then
/// redo back to the processed state.
fn undo_check(project: &mut Project, id: crate::drawable::DrawableId, before: &[u8], precision: Precision) -> Result<(), String> {
    let after = project.drawable(id).map_err(|e| e.to_string())?.data().to_raw();
    let mut steps = 0;
    while project.undo().map_err(|e| format!("undo failed: {}", e))? {
        steps += 1;
    }
    let restored = project.drawable(id).map_err(|e| e.to_string())?.data().to_raw();
    if project.image.precision() != precision || restored != before {
        return Err(format!("undo check failed after {} step(s): original pixels not restored", steps));
    }
    for _ in 0..steps {
        project.redo().map_err(|e| format!("redo failed: {}", e))?;
    }
    let redone = project.drawable(id).map_err(|e| e.to_string())?.data().to_raw();
    if redone != after {
        return Err(format!("undo check failed: redo of {} step(s) did not reproduce the result", steps));
    }
    log::info!("undo check passed ({} steps)", steps);
    Ok(())
}

fn describe_levels(params: &LevelsParams) {
    for ch in HistogramChannel::ALL {
        let i = ch.index();
        println!(
            "  auto levels {:<5} in {:.4}..{:.4}",
            ch.name(),
            params.low_input[i],
            params.high_input[i]
        );
    }
}

// ---- argument parsing and paths ----

fn parse_numbers<T: std::str::FromStr>(s: &str) -> Option<Vec<T>> {
    s.split(',').map(|v| v.trim().parse().ok()).collect()
}

fn parse_channel(s: &str) -> Result<HistogramChannel, String> {
    HistogramChannel::ALL
        .into_iter()
        .find(|c| c.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown channel '{}'", s))
}

/// `LOW,HIGH[,GAMMA[,OUT_LOW,OUT_HIGH]]` into the five levels values.
fn parse_levels(s: &str) -> Result<[f32; 5], String> {
    let v = parse_numbers::<f32>(s).ok_or_else(|| format!("bad levels '{}'", s))?;
    let out = match v.as_slice() {
        [lo, hi] => [*lo, *hi, 1.0, 0.0, 1.0],
        [lo, hi, gamma] => [*lo, *hi, *gamma, 0.0, 1.0],
        [lo, hi, gamma, out_lo, out_hi] => [*lo, *hi, *gamma, *out_lo, *out_hi],
        _ => return Err(format!("levels needs 2, 3 or 5 numbers, got '{}'", s)),
    };
    if out[2] <= 0.0 {
        return Err(format!("levels gamma must be positive, got {}", out[2]));
    }
    Ok(out)
}

/// Input files in command-line order, each listed once. A pattern naming an
/// existing file is taken literally; anything else is globbed.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        for path in expand_pattern(pattern) {
            if path.is_file() && !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    let literal = PathBuf::from(pattern);
    if literal.exists() {
        return vec![literal];
    }
    let matches: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.flatten().collect(),
        Err(e) => {
            eprintln!("warning: invalid glob '{}': {}", pattern, e);
            return Vec::new();
        }
    };
    if matches.is_empty() {
        eprintln!("warning: pattern '{}' matched no files.", pattern);
    }
    matches
}

/// Where the processed image for `input` is written. `--output` wins, then
/// `<output-dir>/<stem>.<ext>`, then `<stem>.<ext>` beside the input. A
/// result that would overwrite the input gets a `_graded` suffix.
fn build_output_path(
    input: &Path,
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: OutputFormat,
) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }
    let stem = input.file_stem()?.to_string_lossy();
    let dir = match output_dir {
        Some(dir) => dir,
        None => input.parent().unwrap_or(Path::new(".")),
    };
    let path = dir.join(format!("{}.{}", stem, format.extension()));
    if path == input {
        return Some(dir.join(format!("{}_graded.{}", stem, format.extension())));
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_argument_forms() {
        assert_eq!(parse_levels("0.1,0.9").unwrap(), [0.1, 0.9, 1.0, 0.0, 1.0]);
        assert_eq!(parse_levels("0,1,2.2").unwrap(), [0.0, 1.0, 2.2, 0.0, 1.0]);
        assert_eq!(parse_levels("0,1,1,0.2,0.8").unwrap(), [0.0, 1.0, 1.0, 0.2, 0.8]);
        assert!(parse_levels("0,1,1,0").is_err());
        assert!(parse_levels("0,1,0").is_err());
        assert!(parse_levels("a,b").is_err());
    }

    #[test]
    fn output_paths() {
        let p = build_output_path(Path::new("dir/a.png"), None, None, OutputFormat::Png).unwrap();
        assert_eq!(p, PathBuf::from("dir/a_graded.png"));
        let p = build_output_path(Path::new("dir/a.png"), None, Some(Path::new("out")), OutputFormat::Ctl).unwrap();
        assert_eq!(p, PathBuf::from("out/a.ctl"));
        assert_eq!(OutputFormat::parse("TIF"), OutputFormat::Tiff);
        assert_eq!(parse_channel("Red").unwrap(), HistogramChannel::Red);
    }

    #[test]
    fn inputs_are_deduplicated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();
        let literal = dir.path().join("b.png").to_string_lossy().into_owned();
        let pattern = dir.path().join("*.png").to_string_lossy().into_owned();
        let files = resolve_inputs(&[literal, pattern, "no/such/*.tif".to_string()]);
        assert_eq!(files, vec![dir.path().join("b.png"), dir.path().join("a.png")]);
    }

    #[test]
    fn end_to_end_with_undo_check() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.png");
        let img = image::RgbImage::from_fn(16, 8, |x, y| image::Rgb([(x * 16) as u8, (y * 30) as u8, 128]));
        img.save(&input).unwrap();

        let output = dir.path().join("out.ctl");
        let args = CliArgs::parse_from([
            "cinetile",
            "-i",
            input.to_str().unwrap(),
            "--precision",
            "u16",
            "--levels",
            "0.1,0.9,1.5",
            "--auto-levels",
            "--undo-check",
            "-o",
            output.to_str().unwrap(),
        ]);
        let pipeline = build_pipeline(&args).unwrap();
        let settings = EngineSettings { levels_of_undo: 16, tile_size: 8, ..Default::default() };
        run_one(&input, &output, &pipeline, settings).unwrap();
        assert!(output.exists());
    }
}
