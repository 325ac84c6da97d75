//! # DICOM reconstruction library
//!
//! This crate turns uploaded DICOM series into 3D volumes and the files a
//! research front end needs to display them.
//!
//! A zipped upload is extracted into a scratch directory, every `.dcm` file
//! is assigned to a series by reading its header only, and the series with
//! the most files is decoded into a (depth, height, width) volume:
//!  - slices are ordered by ImagePositionPatient (or InstanceNumber)
//!  - slices sharing a position are averaged
//!  - intensities are min-max normalized to [0, 1]
//!  - voxel spacing comes from the slice positions and PixelSpacing
//!
//! The volume is then written twice. The canonical container (`.cvol`)
//! stores it losslessly with per-slice gzip chunks so single slices can be
//! read back without decompressing the rest. The visualization file
//! (`.vti`, VTK ImageData) holds a resampled copy for GPU volume
//! renderers, with spacing rescaled so the physical extent is unchanged.
//!
//! With the `hdf5` feature and `canonical_format = "hdf5"` the canonical
//! volume is written as an HDF5 file (`.h5`) with the same layout instead.
//!
//! Optionally a pretrained reconstruction network (any [`Model`]) enhances
//! the volume before it is visualized. With the `onnx` feature networks are
//! loaded through ONNX Runtime.
//!
//! DICOM files are assumed to have the following attributes:
//!  - No multiframe (always the first frame is used)
//!  - Single-sample (grayscale) pixel data
//!
//! # Examples
//!
//! ## Analyzing an uploaded archive
//!
//! ```no_run
//! # use dicom_recon::{Pipeline, PipelineConfig};
//! # use std::path::Path;
//! let pipeline = Pipeline::new(PipelineConfig::default())
//!     .expect("should have built the pipeline");
//! let result = pipeline
//!     .analyze_dicom_zip(Path::new("upload.zip"))
//!     .expect("should have analyzed the archive");
//! println!("{}", serde_json::to_string_pretty(&result).unwrap());
//! ```
//!
//! ## Reading a single slice back from the canonical container
//!
//! ```no_run
//! # use dicom_recon::container::ContainerReader;
//! let mut reader = ContainerReader::open("1.2.840.10008.cvol")
//!     .expect("should have opened the container");
//! let middle = reader.dim().0 / 2;
//! let slice = reader.read_slice(middle).expect("should have read the slice");
//! ```

pub mod archive;
pub mod config;
pub mod container;
pub mod enums;
#[cfg(feature = "hdf5")]
pub mod hdf5_container;
pub mod heatmap;
pub mod imaging;
pub mod inference;
pub mod ingest;
pub mod interpolator;
pub mod onnx;
mod persist;
pub mod pipeline;
pub mod report;
pub mod volume;
pub mod volume_loader;
pub mod vti;

pub use config::PipelineConfig;
pub use enums::{ContainerFormat, Interpolation, Orientation, PositionSource};
pub use inference::{InferenceError, Model};
pub use persist::artifact_stem;
pub use pipeline::{Pipeline, PipelineError};
pub use report::AnalysisResult;
pub use volume::{Spacing, Volume};
pub use vti::convert_container_to_vti;
