//! Pipeline configuration.

use crate::{container::DEFAULT_COMPRESSION_LEVEL, enums::ContainerFormat, vti::VisualizationBounds};

use serde::Deserialize;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory artifacts are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Prefix of the artifact URLs in the analysis result
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,

    /// `cvol` or `hdf5`
    #[serde(default)]
    pub canonical_format: ContainerFormat,

    /// Gzip level of the canonical container (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Resolution the reconstruction network was trained on
    #[serde(default = "default_shape")]
    pub network_input_shape: [usize; 3],

    /// Resolution of the enhanced volume
    #[serde(default = "default_shape")]
    pub reconstruction_shape: [usize; 3],

    /// Enhanced voxels below this are zeroed
    #[serde(default = "default_background_threshold")]
    pub background_threshold: f32,

    #[serde(default = "default_true")]
    pub resample_visualization: bool,

    #[serde(default = "default_visualization_extent")]
    pub visualization_max_depth: usize,

    #[serde(default = "default_visualization_extent")]
    pub visualization_in_plane: usize,

    /// Fixed visualization file name instead of `<series_uid>.vti`
    #[serde(default)]
    pub visualization_file_name: Option<String>,

    /// Heatmap PNG size in pixels
    #[serde(default = "default_heatmap_size")]
    pub heatmap_size: u32,

    /// ONNX reconstruction model
    #[serde(default)]
    pub reconstruction_model: Option<PathBuf>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            url_prefix: default_url_prefix(),
            canonical_format: ContainerFormat::default(),
            compression_level: default_compression_level(),
            network_input_shape: default_shape(),
            reconstruction_shape: default_shape(),
            background_threshold: default_background_threshold(),
            resample_visualization: true,
            visualization_max_depth: default_visualization_extent(),
            visualization_in_plane: default_visualization_extent(),
            visualization_file_name: None,
            heatmap_size: default_heatmap_size(),
            reconstruction_model: None,
            log_level: default_log_level(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compression_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if !self.canonical_format.is_available() {
            return Err(ConfigError::Invalid(format!(
                "canonical_format {:?} needs a build with the `hdf5` feature",
                self.canonical_format
            )));
        }
        for (name, shape) in [
            ("network_input_shape", self.network_input_shape),
            ("reconstruction_shape", self.reconstruction_shape),
        ] {
            if shape.contains(&0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {shape:?}")));
            }
        }
        if self.visualization_max_depth == 0 || self.visualization_in_plane == 0 {
            return Err(ConfigError::Invalid("visualization bounds must be positive".to_string()));
        }
        if let Some(name) = &self.visualization_file_name {
            let plain = Path::new(name).file_name().is_some_and(|f| f == name.as_str());
            if !plain {
                return Err(ConfigError::Invalid(format!(
                    "visualization_file_name must be a bare file name, got {name:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn network_input_shape(&self) -> (usize, usize, usize) {
        let [d, h, w] = self.network_input_shape;
        (d, h, w)
    }

    pub fn reconstruction_shape(&self) -> (usize, usize, usize) {
        let [d, h, w] = self.reconstruction_shape;
        (d, h, w)
    }

    pub fn visualization_bounds(&self) -> Option<VisualizationBounds> {
        self.resample_visualization.then_some(VisualizationBounds {
            max_depth: self.visualization_max_depth,
            in_plane: self.visualization_in_plane,
        })
    }

    /// `<url_prefix>/<file_name>`
    pub fn artifact_url(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.url_prefix.trim_end_matches('/'))
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("backend/static/reconstructions")
}

fn default_url_prefix() -> String {
    "/static/reconstructions".to_string()
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_shape() -> [usize; 3] {
    [128, 128, 128]
}

fn default_background_threshold() -> f32 {
    0.15
}

fn default_true() -> bool {
    true
}

fn default_visualization_extent() -> usize {
    128
}

fn default_heatmap_size() -> u32 {
    512
}

fn default_log_level() -> String {
    "info".to_string()
}
