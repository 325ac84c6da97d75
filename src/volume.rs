use crate::enums::Orientation;

use ndarray::{Array3, ArrayBase, ArrayView2, Data, Ix3, s};

/// Physical distance between samples along (depth, height, width).
pub type Spacing = (f64, f64, f64);

/// Added to the intensity range so constant volumes normalize to zero
/// instead of dividing by zero.
pub const NORMALIZATION_EPSILON: f64 = 1e-8;

/// An assembled scan: a (depth, height, width) array, its voxel spacing
/// and the series it was built from.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: Spacing,
    pub series_uid: String,
}

/// Summary of the voxel values of a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IntensityStatistics {
    pub mean: f64,
    pub min: f32,
    pub max: f32,
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: Spacing, series_uid: impl Into<String>) -> Self {
        Self {
            data,
            spacing,
            series_uid: series_uid.into(),
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Physical size of the volume along (depth, height, width).
    pub fn physical_extent(&self) -> (f64, f64, f64) {
        let (depth, height, width) = self.dim();
        (
            depth as f64 * self.spacing.0,
            height as f64 * self.spacing.1,
            width as f64 * self.spacing.2,
        )
    }

    pub fn statistics(&self) -> IntensityStatistics {
        intensity_statistics(&self.data)
    }

    /// Returns `None` when `index` lies outside the chosen axis.
    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        slice_from_axis(&self.data, index, orientation)
    }
}

pub(crate) fn slice_from_axis<S>(
    data: &ArrayBase<S, Ix3>,
    index: usize,
    orientation: Orientation,
) -> Option<ArrayView2<'_, f32>>
where
    S: Data<Elem = f32>,
{
    let (depth, height, width) = data.dim();
    let slice = match orientation {
        Orientation::Axial if index < depth => data.slice(s![index, .., ..]),
        Orientation::Coronal if index < height => data.slice(s![.., index, ..]),
        Orientation::Sagittal if index < width => data.slice(s![.., .., index]),
        _ => return None,
    };
    Some(slice)
}

/// Global min-max map of every voxel into [0, 1].
pub fn normalize_intensity(data: &mut Array3<f32>) {
    let stats = intensity_statistics(data);
    let min = stats.min as f64;
    let denominator = (stats.max as f64 - min) + NORMALIZATION_EPSILON;
    data.mapv_inplace(|v| ((v as f64 - min) / denominator) as f32);
}

pub fn intensity_statistics<S>(data: &ArrayBase<S, Ix3>) -> IntensityStatistics
where
    S: Data<Elem = f32>,
{
    if data.is_empty() {
        return IntensityStatistics::default();
    }
    let mut sum = 0.0_f64;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in data.iter() {
        sum += v as f64;
        min = min.min(v);
        max = max.max(v);
    }
    IntensityStatistics {
        mean: sum / data.len() as f64,
        min,
        max,
    }
}
