//! The JSON-serializable result returned by the volume pipeline.

use crate::volume::{Spacing, Volume};

use serde::Serialize;

pub const VOLUME_DISCLAIMER: &str = "AI-generated reconstruction for research support only.";
pub const STATISTICS_DECIMALS: i32 = 4;
/// Reported as the engine when no reconstruction model is configured.
pub const NO_RECONSTRUCTION_ENGINE: &str = "none";
pub const HEATMAP_TYPE: &str = "network-output-slice";

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct VolumeShape {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
}

impl From<(usize, usize, usize)> for VolumeShape {
    fn from((depth, height, width): (usize, usize, usize)) -> Self {
        Self { depth, height, width }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Statistics {
    pub mean_intensity: f64,
    pub max_intensity: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalysisResult {
    pub modality: &'static str,
    pub input_type: &'static str,
    pub reconstruction_engine: String,
    pub heatmap_type: Option<&'static str>,
    pub series_uid: String,
    pub series_detected: usize,
    pub volume_shape: VolumeShape,
    pub voxel_spacing: [f64; 3],
    pub canonical_volume_file: String,
    pub reconstruction_file: String,
    pub heatmap_slice: Option<String>,
    pub statistics: Statistics,
    pub disclaimer: &'static str,
}

/// Artifact references, already turned into caller-facing URLs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactUrls {
    pub canonical_volume: String,
    pub reconstruction: String,
    pub heatmap: Option<String>,
}

impl AnalysisResult {
    /// Describe `visualized`, the volume as written to the visualization
    /// container.
    pub fn new(
        visualized: &Volume,
        series_detected: usize,
        engine: Option<&str>,
        artifacts: ArtifactUrls,
    ) -> Self {
        let stats = visualized.statistics();
        let (sd, sh, sw): Spacing = visualized.spacing;

        Self {
            modality: "medical_volume",
            input_type: "dicom_zip",
            reconstruction_engine: engine.unwrap_or(NO_RECONSTRUCTION_ENGINE).to_string(),
            heatmap_type: artifacts.heatmap.as_ref().map(|_| HEATMAP_TYPE),
            series_uid: visualized.series_uid.clone(),
            series_detected,
            volume_shape: visualized.dim().into(),
            voxel_spacing: [sd, sh, sw],
            canonical_volume_file: artifacts.canonical_volume,
            reconstruction_file: artifacts.reconstruction,
            heatmap_slice: artifacts.heatmap,
            statistics: Statistics {
                mean_intensity: round_to(stats.mean, STATISTICS_DECIMALS),
                max_intensity: round_to(stats.max as f64, STATISTICS_DECIMALS),
            },
            disclaimer: VOLUME_DISCLAIMER,
        }
    }
}
