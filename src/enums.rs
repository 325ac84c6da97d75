use serde::Deserialize;

/// Axis used to cut a 2D slice out of a (depth, height, width) volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

/// Spline order used when resampling a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    /// Order 1, separable linear (trilinear in 3D).
    #[default]
    Linear,
    /// Order 3, separable cubic convolution.
    Cubic,
}

/// Header field a slice's ordering key was taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionSource {
    /// Third coordinate of ImagePositionPatient.
    ImagePositionPatient,
    /// Ordinal InstanceNumber, used when no position is present.
    InstanceNumber,
}

/// On-disk form of the canonical volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// Chunked gzip container, always available.
    #[default]
    Cvol,
    /// HDF5 file with a chunked, deflated dataset. Needs the `hdf5` feature.
    Hdf5,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Cvol => "cvol",
            Self::Hdf5 => "h5",
        }
    }

    pub fn from_path(path: &std::path::Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("h5") || ext.eq_ignore_ascii_case("hdf5") => {
                Self::Hdf5
            }
            _ => Self::Cvol,
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Self::Cvol => true,
            Self::Hdf5 => cfg!(feature = "hdf5"),
        }
    }
}
