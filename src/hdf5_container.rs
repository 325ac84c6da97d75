//! HDF5 form of the canonical volume.
//!
//! One float32 dataset named `volume` with shape (depth, height, width),
//! chunked per axial slice and deflated, with `spacing` (three floats) and
//! `series_uid` (UTF-8 string) attributes on the root group. Object
//! modification times are not recorded, so equal volumes give equal files.

use crate::{
    container::{CodecError, DATASET_KEY, SERIES_UID_ATTRIBUTE, SPACING_ATTRIBUTE, checked_spacing},
    persist::write_atomically_at,
    volume::Volume,
};

use hdf5::{Dataset, File, types::VarLenUnicode};
use ndarray::{Array2, Ix3, s};
use std::path::Path;

/// Write `volume` to `path` through a temporary sibling file.
pub fn write_volume(volume: &Volume, path: &Path, level: u32) -> Result<(), CodecError> {
    let spacing = checked_spacing(volume.spacing)?;
    let level = u8::try_from(level)
        .ok()
        .filter(|level| *level <= 9)
        .ok_or(CodecError::InvalidLevel(level))?;
    let series_uid: VarLenUnicode = volume
        .series_uid
        .parse()
        .map_err(|err| CodecError::Corrupt(format!("series identifier: {err}")))?;
    let (depth, height, width) = volume.dim();

    write_atomically_at(path, |staged| {
        let file = File::with_options()
            .with_fcpl(|p| p.obj_track_times(false))
            .create(staged)?;
        let dataset = file
            .new_dataset::<f32>()
            .shape((depth, height, width))
            .chunk((1, height.max(1), width.max(1)))
            .deflate(level)
            .with_dcpl(|p| p.obj_track_times(false))
            .create(DATASET_KEY)?;
        dataset.write(volume.data.view())?;

        file.new_attr::<f64>()
            .shape(3)
            .create(SPACING_ATTRIBUTE)?
            .write_raw(&[spacing.0, spacing.1, spacing.2][..])?;
        file.new_attr::<VarLenUnicode>()
            .shape(())
            .create(SERIES_UID_ATTRIBUTE)?
            .write_scalar(&series_uid)?;
        file.close()?;
        Ok::<_, CodecError>(())
    })?;

    log::info!("wrote canonical volume {}", path.display());
    Ok(())
}

/// Random-access reader over an HDF5 canonical volume.
pub struct Hdf5VolumeReader {
    file: File,
    dataset: Dataset,
    shape: (usize, usize, usize),
}

impl Hdf5VolumeReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        let file = File::open(path)?;
        let dataset = file
            .dataset(DATASET_KEY)
            .map_err(|_| CodecError::MissingDataset(DATASET_KEY.to_string()))?;
        let shape = match dataset.shape()[..] {
            [depth, height, width] => (depth, height, width),
            ref other => {
                return Err(CodecError::Corrupt(format!(
                    "dataset has {} dimensions",
                    other.len()
                )));
            }
        };
        Ok(Self {
            file,
            dataset,
            shape,
        })
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.shape
    }

    /// Read one axial slice; only its chunk is inflated.
    pub fn read_slice(&self, index: usize) -> Result<Array2<f32>, CodecError> {
        let depth = self.shape.0;
        if index >= depth {
            return Err(CodecError::SliceOutOfRange { index, depth });
        }
        Ok(self.dataset.read_slice_2d::<f32, _>(s![index, .., ..])?)
    }

    pub fn read_volume(&self) -> Result<Volume, CodecError> {
        let spacing: Vec<f64> = self
            .file
            .attr(SPACING_ATTRIBUTE)
            .and_then(|attr| attr.read_raw::<f64>())
            .map_err(|_| CodecError::MissingAttribute(SPACING_ATTRIBUTE))?;
        let [sz, sy, sx] = spacing[..] else {
            return Err(CodecError::MissingAttribute(SPACING_ATTRIBUTE));
        };
        let series_uid: VarLenUnicode = self
            .file
            .attr(SERIES_UID_ATTRIBUTE)
            .and_then(|attr| attr.read_scalar())
            .map_err(|_| CodecError::MissingAttribute(SERIES_UID_ATTRIBUTE))?;
        let data = self.dataset.read::<f32, Ix3>()?;
        Ok(Volume::new(data, (sz, sy, sx), series_uid.as_str()))
    }
}

pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume, CodecError> {
    Hdf5VolumeReader::open(path)?.read_volume()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{container::ContainerWriter, enums::ContainerFormat};
    use ndarray::Array;

    fn sample_volume() -> Volume {
        let data = Array::from_shape_fn((4, 3, 5), |(z, y, x)| {
            ((z * 31 + y * 7 + x * 3) % 17) as f32 / 16.0 + 1e-7 * x as f32
        });
        Volume::new(data, (2.5, 0.625, 0.7), "1.2.826.0.1.3680043.2.1125")
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let volume = sample_volume();
        let writer = ContainerWriter::default()
            .with_format(ContainerFormat::Hdf5)
            .unwrap();
        let path = writer.write_to_dir(&volume, dir.path()).unwrap();

        assert_eq!(path.file_name().unwrap(), "1.2.826.0.1.3680043.2.1125.h5");
        let restored = crate::container::read_container(&path).unwrap();
        assert_eq!(restored.series_uid, volume.series_uid);
        assert_eq!(restored.spacing, volume.spacing);
        assert!(
            restored
                .data
                .iter()
                .zip(volume.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
        );
    }

    #[test]
    fn slices_can_be_read_individually() {
        let dir = tempfile::tempdir().unwrap();
        let volume = sample_volume();
        let path = dir.path().join("volume.h5");
        write_volume(&volume, &path, 9).unwrap();

        let reader = Hdf5VolumeReader::open(&path).unwrap();
        assert_eq!(reader.dim(), (4, 3, 5));
        assert_eq!(reader.read_slice(2).unwrap(), volume.data.slice(s![2, .., ..]));
        assert!(matches!(
            reader.read_slice(4),
            Err(CodecError::SliceOutOfRange { index: 4, depth: 4 })
        ));
    }

    #[test]
    fn rewriting_produces_identical_files() {
        let dir = tempfile::tempdir().unwrap();
        let volume = sample_volume();
        let first = dir.path().join("a.h5");
        let second = dir.path().join("b.h5");
        write_volume(&volume, &first, 4).unwrap();
        write_volume(&volume, &second, 4).unwrap();
        assert_eq!(std::fs::read(first).unwrap(), std::fs::read(second).unwrap());
    }

    #[test]
    fn non_hdf5_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.h5");
        std::fs::write(&path, b"not hdf5").unwrap();
        assert!(read_volume(&path).is_err());
    }
}
