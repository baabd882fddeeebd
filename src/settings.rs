use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::{ColorSpace, FitMode};

pub const CURRENT_VERSION: u32 = 1;
const CONFIG_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagetex";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Size of the texture slot pool
    #[serde(default = "default_texture_count")]
    pub texture_count: usize,

    /// Rows per tile slice
    #[serde(default = "default_slice_height")]
    pub slice_height: usize,

    #[serde(default)]
    pub colorspace: ColorSpace,

    #[serde(default)]
    pub fit_mode: FitMode,

    /// Degrees; snapped to quarter turns
    #[serde(default)]
    pub rotation: i32,

    #[serde(default = "default_true")]
    pub use_staging_buffers: bool,

    /// Decoded pages kept by the image decoder
    #[serde(default = "default_decode_cache_pages")]
    pub decode_cache_pages: usize,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_texture_count() -> usize {
    32
}

fn default_slice_height() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_decode_cache_pages() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            texture_count: default_texture_count(),
            slice_height: default_slice_height(),
            colorspace: ColorSpace::default(),
            fit_mode: FitMode::default(),
            rotation: 0,
            use_staging_buffers: true,
            decode_cache_pages: default_decode_cache_pages(),
        }
    }
}

impl EngineConfig {
    /// Pulls out-of-range values back into range.
    pub fn clamp(&mut self) {
        if self.texture_count == 0 {
            warn!("texture_count 0 is invalid, using 1");
            self.texture_count = 1;
        }
        if self.slice_height == 0 {
            warn!("slice_height 0 is invalid, using 1");
            self.slice_height = 1;
        }
        if self.decode_cache_pages == 0 {
            warn!("decode_cache_pages 0 is invalid, using 1");
            self.decode_cache_pages = 1;
        }
    }
}

pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(CONFIG_FILENAME))
}

/// Loads the configuration: `explicit` if given, else the per-user file.
/// A missing file means defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, SettingsError> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => preferred_config_path().filter(|p| p.exists()),
    };

    match path {
        Some(path) => load_config_from_path(&path),
        None => {
            info!("No config file found, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, SettingsError> {
    let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: EngineConfig =
        serde_yaml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Loaded config from {path:?}");

    if config.version < CURRENT_VERSION {
        migrate_config(&mut config);
        if let Err(e) = save_config_to_file(&config, path) {
            warn!("Could not rewrite migrated config: {e}");
        }
    }
    config.clamp();
    Ok(config)
}

fn migrate_config(config: &mut EngineConfig) {
    info!(
        "Migrating config from v{} to v{}",
        config.version, CURRENT_VERSION
    );
    config.version = CURRENT_VERSION;
}

pub fn save_config_to_file(config: &EngineConfig, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(path, generate_config_yaml(config)).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Saved config to {path:?}");
    Ok(())
}

fn generate_config_yaml(config: &EngineConfig) -> String {
    let colorspace = match config.colorspace {
        ColorSpace::Rgb => "rgb",
        ColorSpace::Bgr => "bgr",
        ColorSpace::Grey => "grey",
    };
    let fit_mode = match config.fit_mode {
        FitMode::Width => "width",
        FitMode::Proportional => "proportional",
        FitMode::Page => "page",
    };

    let mut content = String::new();
    content.push_str(&format!("version: {}\n", config.version));
    content.push_str("# Texture objects kept for tile slices\n");
    content.push_str(&format!("texture_count: {}\n", config.texture_count));
    content.push_str(&format!("slice_height: {}\n", config.slice_height));
    content.push_str("# rgb | bgr | grey\n");
    content.push_str(&format!("colorspace: {colorspace}\n"));
    content.push_str("# width | proportional | page\n");
    content.push_str(&format!("fit_mode: {fit_mode}\n"));
    content.push_str(&format!("rotation: {}\n", config.rotation));
    content.push_str(&format!(
        "use_staging_buffers: {}\n",
        config.use_staging_buffers
    ));
    content.push_str(&format!(
        "decode_cache_pages: {}\n",
        config.decode_cache_pages
    ));
    content
}
