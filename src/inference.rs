//! Adapters between assembled volumes and pretrained networks.
//!
//! Networks are opaque [`Model`]s taking and returning dense float tensors.
//! The adapters here own everything around them: resizing to the fixed input
//! resolution a network was trained on, adding and removing batch/channel
//! axes, and mapping the output back into volume space with consistent
//! spacing.

use crate::{
    enums::{Interpolation, Orientation},
    interpolator::Interpolator,
    volume::{Volume, slice_from_axis},
};

use ndarray::{Array2, Array3, ArrayD, ArrayViewD, Axis, Ix3};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

pub const DEFAULT_NETWORK_INPUT_SHAPE: (usize, usize, usize) = (128, 128, 128);
pub const DEFAULT_RECONSTRUCTION_SHAPE: (usize, usize, usize) = (128, 128, 128);
/// Enhanced voxels below this value are treated as background.
pub const DEFAULT_BACKGROUND_THRESHOLD: f32 = 0.15;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model unavailable at {}: {reason}", .path.display())]
    ModelUnavailable { path: PathBuf, reason: String },

    #[error("model '{model}' returned shape {actual:?}, expected {expected}")]
    UnexpectedOutputShape {
        model: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("model '{model}' failed: {message}")]
    Runtime { model: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl InferenceError {
    pub fn unexpected_shape(model: &str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::UnexpectedOutputShape {
            model: model.to_string(),
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}

/// A pretrained network evaluated on the CPU, one input at a time.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError>;
}

impl<M: Model + ?Sized> Model for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
        (**self).run(input)
    }
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
        (**self).run(input)
    }
}

/// Drop leading unit axes until a 3D array remains.
pub(crate) fn squeeze_to_3d(model: &str, output: ArrayD<f32>) -> Result<Array3<f32>, InferenceError> {
    let mut output = output;
    while output.ndim() > 3 && output.len_of(Axis(0)) == 1 {
        output = output.index_axis_move(Axis(0), 0);
    }
    let shape = output.shape().to_vec();
    output
        .into_dimensionality::<Ix3>()
        .map_err(|_| InferenceError::unexpected_shape(model, "[1, 1, D, H, W]", &shape))
}

/// Output of [`ReconstructionAdapter::enhance`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Enhanced volume at the reconstruction resolution.
    pub volume: Volume,
    /// Middle axial slice of the raw network output.
    pub heatmap_slice: Array2<f32>,
}

/// Runs a volume-to-volume enhancement network on an assembled volume.
pub struct ReconstructionAdapter<M> {
    model: M,
    input_shape: (usize, usize, usize),
    output_shape: Option<(usize, usize, usize)>,
    background_threshold: f32,
}

impl<M: Model> ReconstructionAdapter<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            input_shape: DEFAULT_NETWORK_INPUT_SHAPE,
            output_shape: Some(DEFAULT_RECONSTRUCTION_SHAPE),
            background_threshold: DEFAULT_BACKGROUND_THRESHOLD,
        }
    }

    /// Fixed resolution the network was trained on.
    pub fn with_input_shape(mut self, shape: (usize, usize, usize)) -> Self {
        self.input_shape = shape;
        self
    }

    /// Resolution of the enhanced volume; `None` restores the source shape.
    pub fn with_output_shape(mut self, shape: Option<(usize, usize, usize)>) -> Self {
        self.output_shape = shape;
        self
    }

    pub fn with_background_threshold(mut self, threshold: f32) -> Self {
        self.background_threshold = threshold;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Downsample to the network resolution (order 1), run the network and
    /// upsample its output (order 3) to the reconstruction resolution.
    ///
    /// Spacing of the result is the source spacing scaled by
    /// `source_shape / output_shape`, so the physical extent is kept.
    pub fn enhance(&self, volume: &Volume) -> Result<Reconstruction, InferenceError> {
        let source_shape = volume.dim();
        let (d, h, w) = self.input_shape;
        if volume.data.is_empty() || d * h * w == 0 {
            return Err(InferenceError::InvalidInput(format!(
                "cannot resample {source_shape:?} to {:?}",
                self.input_shape
            )));
        }

        let network_input = Interpolator::resize(&volume.data, self.input_shape, Interpolation::Linear);
        let tensor = network_input
            .view()
            .insert_axis(Axis(0))
            .insert_axis(Axis(0))
            .into_dyn();

        log::debug!(
            "running {} on {:?} (source {source_shape:?})",
            self.model.name(),
            tensor.shape()
        );
        let output = squeeze_to_3d(self.model.name(), self.model.run(tensor)?)?;

        let heatmap_slice = slice_from_axis(&output, output.dim().0 / 2, Orientation::Axial)
            .map(|slice| slice.to_owned())
            .ok_or_else(|| {
                InferenceError::unexpected_shape(self.model.name(), "non-empty volume", output.shape())
            })?;

        let output_shape = self.output_shape.unwrap_or(source_shape);
        let mut enhanced = Interpolator::resize(&output, output_shape, Interpolation::Cubic);
        let threshold = self.background_threshold;
        enhanced.mapv_inplace(|v| if v < threshold { 0.0 } else { v });

        let spacing = Interpolator::rescale_spacing(volume.spacing, source_shape, output_shape);
        Ok(Reconstruction {
            volume: Volume::new(enhanced, spacing, volume.series_uid.clone()),
            heatmap_slice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};
    use std::sync::Mutex;

    /// Records input shapes and returns `input * scale` in the same shape.
    struct ScaleModel {
        scale: f32,
        seen: Mutex<Vec<Vec<usize>>>,
    }

    impl ScaleModel {
        fn new(scale: f32) -> Self {
            Self {
                scale,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Model for ScaleModel {
        fn name(&self) -> &str {
            "scale"
        }

        fn run(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
            self.seen.lock().unwrap().push(input.shape().to_vec());
            Ok(input.mapv(|v| v * self.scale))
        }
    }

    struct FlatModel;

    impl Model for FlatModel {
        fn name(&self) -> &str {
            "flat"
        }

        fn run(&self, _input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
            Ok(ArrayD::zeros(IxDyn(&[1, 10])))
        }
    }

    fn gradient_volume() -> Volume {
        let data = Array::from_shape_fn((20, 12, 10), |(z, _, _)| z as f32 / 19.0);
        Volume::new(data, (2.0, 0.5, 0.5), "1.2.3")
    }

    #[test]
    fn network_sees_fixed_input_shape() {
        let adapter = ReconstructionAdapter::new(ScaleModel::new(1.0))
            .with_input_shape((8, 8, 8))
            .with_output_shape(Some((16, 16, 16)));
        let result = adapter.enhance(&gradient_volume()).unwrap();

        assert_eq!(adapter.model().seen.lock().unwrap()[0], vec![1, 1, 8, 8, 8]);
        assert_eq!(result.volume.dim(), (16, 16, 16));
        assert_eq!(result.heatmap_slice.dim(), (8, 8));
    }

    #[test]
    fn spacing_follows_resize_ratios() {
        let volume = gradient_volume();
        let adapter = ReconstructionAdapter::new(ScaleModel::new(1.0))
            .with_input_shape((8, 8, 8))
            .with_output_shape(Some((10, 24, 5)));
        let result = adapter.enhance(&volume).unwrap();

        assert_eq!(result.volume.spacing, (4.0, 0.25, 1.0));
        let before = volume.physical_extent();
        let after = result.volume.physical_extent();
        assert!((before.0 - after.0).abs() < 1e-9);
        assert!((before.1 - after.1).abs() < 1e-9);
        assert!((before.2 - after.2).abs() < 1e-9);
    }

    #[test]
    fn missing_output_shape_restores_source_extent() {
        let volume = gradient_volume();
        let adapter = ReconstructionAdapter::new(ScaleModel::new(1.0))
            .with_input_shape((8, 8, 8))
            .with_output_shape(None);
        let result = adapter.enhance(&volume).unwrap();
        assert_eq!(result.volume.dim(), volume.dim());
        assert_eq!(result.volume.spacing, volume.spacing);
    }

    #[test]
    fn background_is_suppressed() {
        let adapter = ReconstructionAdapter::new(ScaleModel::new(1.0))
            .with_input_shape((8, 8, 8))
            .with_output_shape(Some((12, 8, 8)))
            .with_background_threshold(0.4);
        let result = adapter.enhance(&gradient_volume()).unwrap();

        assert!(result.volume.data.iter().all(|&v| v == 0.0 || v >= 0.4));
        assert!(result.volume.data.iter().any(|&v| v == 0.0));
        assert!(result.volume.data.iter().any(|&v| v > 0.9));
    }

    #[test]
    fn malformed_output_is_reported() {
        let adapter = ReconstructionAdapter::new(FlatModel).with_input_shape((4, 4, 4));
        let err = adapter.enhance(&gradient_volume()).unwrap_err();
        assert!(matches!(err, InferenceError::UnexpectedOutputShape { .. }));
    }

    #[test]
    fn squeeze_drops_batch_and_channel() {
        let output = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 2, 3, 4]));
        assert_eq!(squeeze_to_3d("m", output).unwrap().dim(), (2, 3, 4));
        let output = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 2, 3, 4]));
        assert!(squeeze_to_3d("m", output).is_err());
    }
}
