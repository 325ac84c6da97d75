//! Pretrained networks served by ONNX Runtime.
//!
//! The runtime is only linked with the `onnx` feature. Without it,
//! [`load_model`] still validates the path but always reports the model as
//! unavailable.

use crate::inference::{InferenceError, Model};

use std::path::Path;

/// Check that `path` names a non-empty file.
fn check_model_file(path: &Path) -> Result<(), InferenceError> {
    let unavailable = |reason: &str| InferenceError::ModelUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let metadata = std::fs::metadata(path).map_err(|err| unavailable(&err.to_string()))?;
    if !metadata.is_file() {
        return Err(unavailable("not a file"));
    }
    if metadata.len() == 0 {
        return Err(unavailable("model file is empty"));
    }
    Ok(())
}

/// Load the network at `path` as a boxed [`Model`].
pub fn load_model(path: &Path) -> Result<Box<dyn Model>, InferenceError> {
    check_model_file(path)?;

    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(OnnxModel::load(path)?))
    }

    #[cfg(not(feature = "onnx"))]
    {
        Err(InferenceError::ModelUnavailable {
            path: path.to_path_buf(),
            reason: "built without ONNX Runtime support (enable the `onnx` feature)".to_string(),
        })
    }
}

#[cfg(feature = "onnx")]
pub use runtime::OnnxModel;

#[cfg(feature = "onnx")]
mod runtime {
    use super::check_model_file;
    use crate::inference::{InferenceError, Model};

    use ndarray::{ArrayD, ArrayViewD, IxDyn};
    use ort::{session::Session, value::TensorRef};
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    /// A single-input, single-output ONNX network.
    pub struct OnnxModel {
        session: Mutex<Session>,
        name: String,
        path: PathBuf,
    }

    impl OnnxModel {
        pub fn load(path: &Path) -> Result<Self, InferenceError> {
            check_model_file(path)?;
            let unavailable = |err: ort::Error| InferenceError::ModelUnavailable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            };
            let session = Session::builder()
                .map_err(unavailable)?
                .commit_from_file(path)
                .map_err(unavailable)?;

            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "onnx".to_string());
            log::info!("loaded ONNX model {name} from {}", path.display());

            Ok(Self {
                session: Mutex::new(session),
                name,
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn runtime_error(&self, message: impl ToString) -> InferenceError {
            InferenceError::Runtime {
                model: self.name.clone(),
                message: message.to_string(),
            }
        }
    }

    impl Model for OnnxModel {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
            let input = input.as_standard_layout();
            let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
            let data = input
                .as_slice()
                .ok_or_else(|| InferenceError::InvalidInput("input tensor is not contiguous".to_string()))?;
            let tensor = TensorRef::from_array_view((dims, data)).map_err(|e| self.runtime_error(e))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| self.runtime_error("session lock poisoned"))?;
            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| self.runtime_error(e))?;

            let (shape, values) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| self.runtime_error(e))?;
            let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            ArrayD::from_shape_vec(IxDyn(&shape), values.to_vec()).map_err(|e| self.runtime_error(e))
        }
    }
}
