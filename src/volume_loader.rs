use crate::{
    enums::PositionSource,
    ingest::SeriesSelection,
    volume::{Spacing, Volume, normalize_intensity},
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, OpenFileOptions, file::ReadPreamble},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Spacing used for any axis whose header information is missing.
pub const DEFAULT_SPACING: f64 = 1.0;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No readable DICOM slices in series {series_uid}")]
    NoValidImages { series_uid: String },

    #[error("Inconsistent image dimensions: expected {expected:?}, found {found:?}")]
    InconsistentDimensions {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// One decoded slice together with the header fields assembly needs.
#[derive(Debug, Clone)]
pub struct Slice {
    pub position: f64,
    pub position_source: PositionSource,
    pub pixels: Array2<f32>,
    /// (row spacing, column spacing) from PixelSpacing.
    pub pixel_spacing: Option<(f64, f64)>,
    pub slice_thickness: Option<f64>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Decode the selected series and assemble it into a normalized volume.
    pub fn load_series(selection: &SeriesSelection) -> Result<Volume, VolumeLoaderError> {
        Self::load_from_file_paths(&selection.files, &selection.series_uid)
    }

    /// Load a volume from file paths
    ///
    /// Files are visited in sorted order. Files that fail to open or carry
    /// no decodable pixel data are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if no slice could be read or slice dimensions differ
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
        series_uid: &str,
    ) -> Result<Volume, VolumeLoaderError> {
        let mut paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        paths.sort();

        let slices: Vec<Slice> = paths
            .iter()
            .filter_map(|path| {
                let object = OpenFileOptions::new()
                    .read_preamble(ReadPreamble::Auto)
                    .open_file(path)
                    .inspect_err(|err| log::debug!("skipping {}: {err}", path.display()))
                    .ok()?;
                let slice = Self::extract_slice(&object);
                if slice.is_none() {
                    log::debug!("no usable pixel data in {}", path.display());
                }
                slice
            })
            .collect();

        Self::load_from_slices(slices, series_uid)
    }

    /// Order, merge, stack and normalize decoded slices.
    ///
    /// The first slice supplies the in-plane spacing and slice thickness.
    pub fn load_from_slices(
        slices: Vec<Slice>,
        series_uid: &str,
    ) -> Result<Volume, VolumeLoaderError> {
        let Some(first) = slices.first() else {
            return Err(VolumeLoaderError::NoValidImages {
                series_uid: series_uid.to_string(),
            });
        };
        let pixel_spacing = first.pixel_spacing;
        let slice_thickness = first.slice_thickness;

        Self::validate_dimensions(&slices)?;
        match Self::ordering_source(&slices) {
            Some(PositionSource::ImagePositionPatient) => {}
            Some(PositionSource::InstanceNumber) => log::warn!(
                "series {series_uid} has no ImagePositionPatient, ordering by InstanceNumber"
            ),
            None => log::warn!(
                "series {series_uid} mixes ImagePositionPatient and InstanceNumber ordering keys"
            ),
        }

        let merged = Self::merge_duplicate_positions(slices);
        let positions: Vec<f64> = merged.iter().map(|(position, _)| *position).collect();
        let images: Vec<Array2<f32>> = merged.into_iter().map(|(_, image)| image).collect();

        let mut volume_array = Self::build_volume_array(&images);
        normalize_intensity(&mut volume_array);

        let spacing = Self::get_spacing(&positions, pixel_spacing, slice_thickness);
        log::info!(
            "assembled series {series_uid}: shape {:?}, spacing {spacing:?}",
            volume_array.dim()
        );

        Ok(Volume::new(volume_array, spacing, series_uid))
    }

    /// The header field every slice was ordered by, or `None` when the
    /// series mixes fields and the keys are not on one scale.
    pub fn ordering_source(slices: &[Slice]) -> Option<PositionSource> {
        let first = slices.first()?.position_source;
        slices
            .iter()
            .all(|slice| slice.position_source == first)
            .then_some(first)
    }

    /// Pull position, pixels and spacing fields out of one object.
    pub fn extract_slice(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Slice> {
        let (position, position_source) = Self::get_position(dicom_object)?;
        let pixels = Self::decode_image(dicom_object)?;

        let pixel_spacing = dicom_object
            .element(tags::PIXEL_SPACING)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .filter(|values| values.len() >= 2)
            .map(|values| (values[0], values[1]));
        let slice_thickness = dicom_object
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|e| e.to_float64().ok());

        Some(Slice {
            position,
            position_source,
            pixels,
            pixel_spacing,
            slice_thickness,
        })
    }

    /// Third ImagePositionPatient coordinate, else InstanceNumber.
    fn get_position(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Option<(f64, PositionSource)> {
        let patient_position = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()
            .and_then(|e| e.to_multi_float64().ok())
            .and_then(|values| values.get(2).copied());
        if let Some(z) = patient_position {
            return Some((z, PositionSource::ImagePositionPatient));
        }

        dicom_object
            .element(tags::INSTANCE_NUMBER)
            .ok()?
            .to_int::<i64>()
            .ok()
            .map(|n| (n as f64, PositionSource::InstanceNumber))
    }

    /// Stored pixel values of the first frame and sample, without modality
    /// rescale or windowing.
    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let expected = slices[0].pixels.dim();
        match slices.iter().find(|slice| slice.pixels.dim() != expected) {
            Some(slice) => Err(VolumeLoaderError::InconsistentDimensions {
                expected,
                found: slice.pixels.dim(),
            }),
            None => Ok(()),
        }
    }

    /// Sort slices by position and average those sharing a position.
    ///
    /// Returns one image per distinct position, in ascending order.
    pub fn merge_duplicate_positions(mut slices: Vec<Slice>) -> Vec<(f64, Array2<f32>)> {
        slices.sort_by(|a, b| a.position.total_cmp(&b.position));

        let mut merged: Vec<(f64, Array2<f64>, usize)> = Vec::new();
        for slice in slices {
            let pixels = slice.pixels.mapv(f64::from);
            if let Some((_, sum, count)) = merged
                .last_mut()
                .filter(|(position, _, _)| *position == slice.position)
            {
                *sum += &pixels;
                *count += 1;
                continue;
            }
            merged.push((slice.position, pixels, 1));
        }

        merged
            .into_iter()
            .map(|(position, sum, count)| {
                if count > 1 {
                    log::debug!("averaged {count} slices at position {position}");
                }
                (position, sum.mapv(|v| (v / count as f64) as f32))
            })
            .collect()
    }

    fn build_volume_array(images: &[Array2<f32>]) -> Array3<f32> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// Spacing along (depth, height, width).
    ///
    /// Depth spacing is the mean gap between sorted positions, or the slice
    /// thickness when fewer than two positions exist.
    pub fn get_spacing(
        positions: &[f64],
        pixel_spacing: Option<(f64, f64)>,
        slice_thickness: Option<f64>,
    ) -> Spacing {
        let depth = if positions.len() > 1 {
            let total: f64 = positions.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
            total / (positions.len() - 1) as f64
        } else {
            slice_thickness.unwrap_or(DEFAULT_SPACING)
        };
        let (row, column) = pixel_spacing.unwrap_or((DEFAULT_SPACING, DEFAULT_SPACING));

        (positive_or_default(depth), positive_or_default(row), positive_or_default(column))
    }
}

fn positive_or_default(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        DEFAULT_SPACING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn slice(position: f64, fill: f32) -> Slice {
        Slice {
            position,
            position_source: PositionSource::ImagePositionPatient,
            pixels: Array2::from_elem((2, 3), fill),
            pixel_spacing: Some((0.5, 0.75)),
            slice_thickness: Some(3.0),
        }
    }

    #[test]
    fn ordering_source_requires_agreement() {
        let mut slices = vec![slice(0.0, 1.0), slice(1.0, 1.0)];
        assert_eq!(
            VolumeLoader::ordering_source(&slices),
            Some(PositionSource::ImagePositionPatient)
        );

        slices[1].position_source = PositionSource::InstanceNumber;
        assert_eq!(VolumeLoader::ordering_source(&slices), None);

        slices[0].position_source = PositionSource::InstanceNumber;
        assert_eq!(
            VolumeLoader::ordering_source(&slices),
            Some(PositionSource::InstanceNumber)
        );
        assert_eq!(VolumeLoader::ordering_source(&[]), None);
    }

    #[test]
    fn depth_spacing_is_mean_position_gap() {
        assert_eq!(VolumeLoader::get_spacing(&[0.0, 2.5], None, None).0, 2.5);
        assert_eq!(VolumeLoader::get_spacing(&[0.0, 2.5, 5.0], None, None).0, 2.5);
        assert_eq!(VolumeLoader::get_spacing(&[0.0, 1.0, 4.0], None, None).0, 2.0);
    }

    #[test]
    fn single_slice_uses_thickness_then_default() {
        assert_eq!(VolumeLoader::get_spacing(&[7.0], Some((0.4, 0.6)), Some(3.0)), (3.0, 0.4, 0.6));
        assert_eq!(VolumeLoader::get_spacing(&[7.0], None, None), (1.0, 1.0, 1.0));
        assert_eq!(VolumeLoader::get_spacing(&[7.0], None, Some(0.0)).0, 1.0);
    }

    #[test]
    fn slices_are_stacked_in_position_order() {
        let slices = vec![slice(5.0, 30.0), slice(-5.0, 10.0), slice(0.0, 20.0)];
        let volume = VolumeLoader::load_from_slices(slices, "1.2.3").unwrap();

        assert_eq!(volume.dim(), (3, 2, 3));
        assert_eq!(volume.data[[0, 0, 0]], 0.0);
        assert!((volume.data[[1, 1, 1]] - 0.5).abs() < 1e-6);
        assert!((volume.data[[2, 1, 2]] - 1.0).abs() < 1e-6);
        assert_eq!(volume.spacing, (5.0, 0.5, 0.75));
        assert_eq!(volume.series_uid, "1.2.3");
    }

    #[test]
    fn duplicate_positions_are_averaged() {
        let slices = vec![slice(0.0, 0.0), slice(1.0, 10.0), slice(1.0, 30.0), slice(2.0, 40.0)];
        let merged = VolumeLoader::merge_duplicate_positions(slices);

        let positions: Vec<f64> = merged.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![0.0, 1.0, 2.0]);
        assert!(merged[1].1.iter().all(|&v| v == 20.0));
    }

    #[test]
    fn depth_counts_distinct_positions() {
        let slices = vec![slice(0.0, 1.0), slice(0.0, 3.0), slice(2.5, 5.0), slice(2.5, 5.0)];
        let volume = VolumeLoader::load_from_slices(slices, "1.2.3").unwrap();
        assert_eq!(volume.dim().0, 2);
        assert_eq!(volume.spacing.0, 2.5);
    }

    #[test]
    fn empty_series_is_fatal() {
        let err = VolumeLoader::load_from_slices(Vec::new(), "1.2.3").unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NoValidImages { .. }));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut odd = slice(1.0, 0.0);
        odd.pixels = Array::zeros((4, 4));
        let err = VolumeLoader::load_from_slices(vec![slice(0.0, 0.0), odd], "1.2.3").unwrap_err();
        assert!(matches!(
            err,
            VolumeLoaderError::InconsistentDimensions {
                expected: (2, 3),
                found: (4, 4)
            }
        ));
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.dcm");
        std::fs::write(&path, b"garbage").unwrap();
        let err = VolumeLoader::load_from_file_paths(&[path], "1.2.3").unwrap_err();
        assert!(matches!(err, VolumeLoaderError::NoValidImages { .. }));
    }
}
