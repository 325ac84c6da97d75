//! End-to-end processing of one uploaded DICOM archive.

use crate::{
    archive::{ArchiveError, extract_zip},
    config::{ConfigError, PipelineConfig},
    container::{CodecError, ContainerWriter},
    heatmap::{heatmap_path, save_heatmap},
    imaging::ImagingError,
    inference::{InferenceError, Model, Reconstruction, ReconstructionAdapter},
    ingest::{DicomIngestor, IngestError},
    onnx::load_model,
    report::{AnalysisResult, ArtifactUrls},
    volume_loader::{VolumeLoader, VolumeLoaderError},
    vti::VtiWriter,
};

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Assembly(#[from] VolumeLoaderError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Imaging(#[from] ImagingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// `true` when the upload itself is at fault and retrying with the same
    /// input cannot succeed; `false` for infrastructure failures.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Archive(err) => !matches!(err, ArchiveError::Io(_)),
            Self::Ingest(err) => !matches!(err, IngestError::Io(_)),
            Self::Assembly(_) => true,
            Self::Inference(err) => matches!(err, InferenceError::InvalidInput(_)),
            Self::Imaging(err) => match err {
                ImagingError::NotFound(_) | ImagingError::Image(_) => true,
                ImagingError::Inference(err) => matches!(err, InferenceError::InvalidInput(_)),
            },
            Self::Codec(_) | Self::Config(_) | Self::Worker(_) | Self::Serialization(_) => false,
        }
    }
}

/// Ingests archives, writes the canonical and visualization volumes and
/// assembles the analysis result.
pub struct Pipeline {
    config: PipelineConfig,
    container_writer: ContainerWriter,
    reconstruction: Option<ReconstructionAdapter<Box<dyn Model>>>,
}

impl Pipeline {
    /// Build a pipeline, loading `reconstruction_model` if one is configured.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let model = config
            .reconstruction_model
            .as_deref()
            .map(load_model)
            .transpose()?;
        Self::build(config, model)
    }

    /// Build a pipeline around an already constructed reconstruction model.
    pub fn with_model(config: PipelineConfig, model: impl Model + 'static) -> Result<Self, PipelineError> {
        Self::build(config, Some(Box::new(model)))
    }

    fn build(config: PipelineConfig, model: Option<Box<dyn Model>>) -> Result<Self, PipelineError> {
        config.validate()?;
        let container_writer =
            ContainerWriter::new(config.compression_level)?.with_format(config.canonical_format)?;
        let reconstruction = model.map(|model| {
            ReconstructionAdapter::new(model)
                .with_input_shape(config.network_input_shape())
                .with_output_shape(Some(config.reconstruction_shape()))
                .with_background_threshold(config.background_threshold)
        });
        Ok(Self {
            config,
            container_writer,
            reconstruction,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extract `zip_path` into a scratch directory and analyze it. The
    /// scratch directory is removed whether or not analysis succeeds.
    pub fn analyze_dicom_zip(&self, zip_path: &Path) -> Result<AnalysisResult, PipelineError> {
        let scratch = extract_zip(zip_path)?;
        self.analyze_directory(scratch.path())
    }

    /// [`Pipeline::analyze_dicom_zip`] on tokio's blocking pool.
    pub async fn analyze_dicom_zip_async(
        self: Arc<Self>,
        zip_path: PathBuf,
    ) -> Result<AnalysisResult, PipelineError> {
        tokio::task::spawn_blocking(move || self.analyze_dicom_zip(&zip_path)).await?
    }

    /// Run every stage on an already extracted directory tree.
    pub fn analyze_directory(&self, root: &Path) -> Result<AnalysisResult, PipelineError> {
        let output_dir = &self.config.output_dir;

        let selection = DicomIngestor::ingest_directory(root)?;
        let volume = VolumeLoader::load_series(&selection)?;
        let canonical_path = self.container_writer.write_to_dir(&volume, output_dir)?;

        let series_uid = volume.series_uid.clone();
        let (to_visualize, heatmap, engine) = match &self.reconstruction {
            Some(adapter) => {
                let Reconstruction {
                    volume: enhanced,
                    heatmap_slice,
                } = adapter.enhance(&volume)?;
                let path = heatmap_path(output_dir, &series_uid);
                save_heatmap(&heatmap_slice.view(), self.config.heatmap_size, &path)?;
                (enhanced, Some(path), Some(adapter.model().name()))
            }
            None => (volume, None, None),
        };

        let vti_path = match &self.config.visualization_file_name {
            Some(name) => output_dir.join(name),
            None => VtiWriter::path_for(output_dir, &series_uid),
        };
        let visualized =
            VtiWriter::new(self.config.visualization_bounds()).write(&to_visualize, &vti_path)?;

        let artifacts = ArtifactUrls {
            canonical_volume: self.artifact_url(&canonical_path),
            reconstruction: self.artifact_url(&vti_path),
            heatmap: heatmap.as_deref().map(|path| self.artifact_url(path)),
        };
        Ok(AnalysisResult::new(
            &visualized,
            selection.series_count,
            engine,
            artifacts,
        ))
    }

    fn artifact_url(&self, path: &Path) -> String {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        self.config.artifact_url(&file_name)
    }
}
