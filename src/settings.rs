//! Engine settings persisted in a gimprc-style file.
//!
//! One `(key value)` form per line, `#` starts a comment:
//!
//! ```text
//! # cinetilerc
//! (undo-levels 5)
//! (tile-cache-size 32m)
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::canvas::DEFAULT_TILE_SIZE;
use crate::error::SettingsError;

/// Settings that parameterize the engine core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Undo entries kept per image. Zero disables recording.
    pub levels_of_undo: usize,
    /// Tile memory budget in bytes. Reported, not enforced.
    pub tile_cache_size: usize,
    /// Edge length of new tiled canvases.
    pub tile_size: u32,
    pub histogram_bins: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            levels_of_undo: 1,
            tile_cache_size: 4 * 1024 * 1024,
            tile_size: DEFAULT_TILE_SIZE,
            histogram_bins: 256,
        }
    }
}

/// Parse a memory size: a bare number is KiB, `b`/`k`/`m`/`g` suffixes in
/// either case.
pub fn parse_memsize(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    };
    let n: usize = digits.parse().ok()?;
    let mult = match unit {
        "" | "k" | "K" => 1024,
        "b" | "B" => 1,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return None,
    };
    n.checked_mul(mult)
}

/// Render a byte count with the largest exact suffix.
pub fn format_memsize(bytes: usize) -> String {
    const M: usize = 1024 * 1024;
    if bytes != 0 && bytes % M == 0 {
        format!("{}m", bytes / M)
    } else if bytes % 1024 == 0 {
        format!("{}k", bytes / 1024)
    } else {
        format!("{}b", bytes)
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/cinetile/cinetilerc  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\CineTile\cinetilerc
    /// On macOS:   ~/Library/Application Support/CineTile/cinetilerc
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("cinetile");
            return Some(config_dir.join("cinetilerc"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("CineTile").join("cinetilerc"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("CineTile")
                    .join("cinetilerc"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("cinetilerc")))
        }
    }

    /// Load from the platform path (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("settings: ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, SettingsError> {
        let mut s = Self::default();
        for (i, raw) in content.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let parse_err = |message: &str| SettingsError::Parse { line: i + 1, message: message.to_string() };
            let inner = line
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .ok_or_else(|| parse_err("expected (key value)"))?;
            let Some((key, val)) = inner.trim().split_once(char::is_whitespace) else {
                return Err(parse_err("missing value"));
            };
            let val = val.trim().trim_matches('"');
            match key {
                "undo-levels" => {
                    s.levels_of_undo = val.parse().map_err(|_| parse_err("undo-levels must be an integer"))?;
                }
                "tile-cache-size" => {
                    s.tile_cache_size = parse_memsize(val).ok_or_else(|| parse_err("bad memory size"))?;
                }
                "tile-size" => {
                    let size: u32 = val.parse().map_err(|_| parse_err("tile-size must be an integer"))?;
                    if size == 0 {
                        return Err(parse_err("tile-size must be positive"));
                    }
                    s.tile_size = size;
                }
                "histogram-bins" => {
                    let bins: usize = val.parse().map_err(|_| parse_err("histogram-bins must be an integer"))?;
                    if bins == 0 {
                        return Err(parse_err("histogram-bins must be positive"));
                    }
                    s.histogram_bins = bins;
                }
                other => log::debug!("settings: unknown key '{}' on line {}", other, i + 1),
            }
        }
        Ok(s)
    }

    pub fn to_config(&self) -> String {
        let mut out = String::from("# cinetilerc\n");
        let _ = writeln!(out, "(undo-levels {})", self.levels_of_undo);
        let _ = writeln!(out, "(tile-cache-size {})", format_memsize(self.tile_cache_size));
        let _ = writeln!(out, "(tile-size {})", self.tile_size);
        let _ = writeln!(out, "(histogram-bins {})", self.histogram_bins);
        out
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_config())?;
        Ok(())
    }

    /// Save to the platform path.
    pub fn save(&self) -> Result<(), SettingsError> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memsize_suffixes() {
        assert_eq!(parse_memsize("4m"), Some(4 * 1024 * 1024));
        assert_eq!(parse_memsize("4M"), Some(4 * 1024 * 1024));
        assert_eq!(parse_memsize("300"), Some(300 * 1024));
        assert_eq!(parse_memsize("512b"), Some(512));
        assert_eq!(parse_memsize("1g"), Some(1 << 30));
        assert_eq!(parse_memsize("12q"), None);
        assert_eq!(parse_memsize("m"), None);
        assert_eq!(format_memsize(4 * 1024 * 1024), "4m");
        assert_eq!(format_memsize(3072), "3k");
        assert_eq!(format_memsize(100), "100b");
    }

    #[test]
    fn parses_gimprc_forms() {
        let s = EngineSettings::parse(
            "# comment\n\n(undo-levels 7)\n(tile-cache-size 16m) # trailing\n(swap-path \"/tmp\")\n(tile-size 32)\n",
        )
        .unwrap();
        assert_eq!(s.levels_of_undo, 7);
        assert_eq!(s.tile_cache_size, 16 * 1024 * 1024);
        assert_eq!(s.tile_size, 32);
        assert_eq!(s.histogram_bins, 256);
    }

    #[test]
    fn reports_bad_lines() {
        let err = EngineSettings::parse("(undo-levels 2)\nundo-levels 3\n").unwrap_err();
        assert!(matches!(err, SettingsError::Parse { line: 2, .. }));
        let err = EngineSettings::parse("(tile-size 0)").unwrap_err();
        assert!(matches!(err, SettingsError::Parse { line: 1, .. }));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("cinetilerc");
        let s = EngineSettings { levels_of_undo: 12, tile_cache_size: 3 * 1024, tile_size: 16, histogram_bins: 64 };
        s.save_to(&path).unwrap();
        assert_eq!(EngineSettings::load_from(&path).unwrap(), s);
    }
}
