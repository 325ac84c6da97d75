//! VTK XML ImageData (`.vti`) export for GPU volume renderers.
//!
//! VTK addresses point `(x, y, z)` at index `x + y * W + z * W * H`, i.e. it
//! expects a (width, height, depth) array with x varying fastest. Volumes in
//! this crate are (depth, height, width) arrays, so both the samples and the
//! extent/spacing triples are reordered before writing.

use crate::{
    container::{CodecError, read_container},
    enums::Interpolation,
    interpolator::Interpolator,
    persist::{artifact_stem, write_atomically},
    volume::{Spacing, Volume},
};

use ndarray::{Array3, ArrayBase, Data, Ix3, ShapeBuilder};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

pub const VTI_EXTENSION: &str = "vti";
pub const SCALARS_NAME: &str = "Scalars";

const APPENDED_DATA_TAG: &str = "<AppendedData";

#[cfg(target_endian = "little")]
const NATIVE_BYTE_ORDER: &str = "LittleEndian";
#[cfg(target_endian = "big")]
const NATIVE_BYTE_ORDER: &str = "BigEndian";

/// Upper bounds applied to a volume before export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualizationBounds {
    pub max_depth: usize,
    /// Both height and width are resampled to this size.
    pub in_plane: usize,
}

/// Extent and spacing in VTK's (x, y, z) = (width, height, depth) order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageGeometry {
    pub dimensions: (usize, usize, usize),
    pub spacing: (f64, f64, f64),
}

impl ImageGeometry {
    pub fn from_volume_dim(dim: (usize, usize, usize), spacing: Spacing) -> Self {
        let (depth, height, width) = dim;
        Self {
            dimensions: (width, height, depth),
            spacing: (spacing.2, spacing.1, spacing.0),
        }
    }

    fn extent(&self) -> String {
        let (w, h, d) = self.dimensions;
        format!("0 {} 0 {} 0 {}", w - 1, h - 1, d - 1)
    }
}

/// Decoded contents of a `.vti` file written by [`VtiWriter`].
#[derive(Debug, Clone, PartialEq)]
pub struct VtiImage {
    pub geometry: ImageGeometry,
    /// Point scalars in VTK order (x fastest).
    pub scalars: Vec<f32>,
}

impl VtiImage {
    /// Convert back to a (depth, height, width) volume.
    pub fn into_volume(self, series_uid: impl Into<String>) -> Result<Volume, CodecError> {
        let (w, h, d) = self.geometry.dimensions;
        let (sx, sy, sz) = self.geometry.spacing;
        let data = Array3::from_shape_vec((d, h, w), self.scalars)
            .map_err(|err| CodecError::Corrupt(err.to_string()))?;
        Ok(Volume::new(data, (sz, sy, sx), series_uid))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VtiWriter {
    bounds: Option<VisualizationBounds>,
}

impl VtiWriter {
    /// `bounds` of `None` exports the volume at its own resolution.
    pub fn new(bounds: Option<VisualizationBounds>) -> Self {
        Self { bounds }
    }

    /// `<dir>/<series_uid>.vti`
    pub fn path_for(dir: &Path, series_uid: &str) -> PathBuf {
        dir.join(format!("{}.{VTI_EXTENSION}", artifact_stem(series_uid)))
    }

    /// Resample to the configured bounds (order 1) and rescale spacing so
    /// the physical extent is unchanged.
    pub fn prepare(&self, volume: &Volume) -> Volume {
        let Some(bounds) = self.bounds else {
            return volume.clone();
        };
        let source_shape = volume.dim();
        let target_shape =
            Interpolator::bounded_shape(source_shape, bounds.max_depth, bounds.in_plane);
        if target_shape == source_shape {
            return volume.clone();
        }

        let data = Interpolator::resize(&volume.data, target_shape, Interpolation::Linear);
        let spacing = Interpolator::rescale_spacing(volume.spacing, source_shape, target_shape);
        log::debug!(
            "resampled {source_shape:?} -> {target_shape:?} for visualization, spacing {spacing:?}"
        );
        Volume::new(data, spacing, volume.series_uid.clone())
    }

    /// Prepare and write `volume`, returning the volume as written.
    pub fn write(&self, volume: &Volume, path: &Path) -> Result<Volume, CodecError> {
        let prepared = self.prepare(volume);
        write_image_data(&prepared.data, prepared.spacing, path)?;
        Ok(prepared)
    }
}

/// Reorder (depth, height, width) samples into VTK point order.
pub fn to_vtk_point_order<S>(data: &ArrayBase<S, Ix3>) -> Array3<f32>
where
    S: Data<Elem = f32>,
{
    let xyz = data.view().permuted_axes([2, 1, 0]);
    let mut reordered = Array3::<f32>::zeros(xyz.raw_dim().f());
    reordered.assign(&xyz);
    reordered
}

/// Serialize `data` with (depth, height, width) `spacing` as VTK ImageData.
pub fn encode_image_data<S>(data: &ArrayBase<S, Ix3>, spacing: Spacing) -> Result<Vec<u8>, CodecError>
where
    S: Data<Elem = f32>,
{
    if data.is_empty() {
        return Err(CodecError::DimensionMismatch {
            array: data.dim(),
            declared: (1, 1, 1),
        });
    }
    if ![spacing.0, spacing.1, spacing.2]
        .iter()
        .all(|v| v.is_finite() && *v > 0.0)
    {
        return Err(CodecError::InvalidSpacing(spacing));
    }

    let geometry = ImageGeometry::from_volume_dim(data.dim(), spacing);
    let reordered = to_vtk_point_order(data);
    let samples = reordered
        .as_slice_memory_order()
        .ok_or_else(|| CodecError::Corrupt("reordered volume is not contiguous".into()))?;
    let payload: &[u8] = bytemuck::cast_slice(samples);

    let extent = geometry.extent();
    let (sx, sy, sz) = geometry.spacing;
    let header = format!(
        r#"<?xml version="1.0"?>
<VTKFile type="ImageData" version="1.0" byte_order="{NATIVE_BYTE_ORDER}" header_type="UInt64">
  <ImageData WholeExtent="{extent}" Origin="0 0 0" Spacing="{sx} {sy} {sz}">
    <Piece Extent="{extent}">
      <PointData Scalars="{SCALARS_NAME}">
        <DataArray type="Float32" Name="{SCALARS_NAME}" NumberOfComponents="1" format="appended" offset="0"/>
      </PointData>
      <CellData>
      </CellData>
    </Piece>
  </ImageData>
  <AppendedData encoding="raw">
   _"#
    );

    let mut out = Vec::with_capacity(header.len() + payload.len() + 64);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_ne_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n  </AppendedData>\n</VTKFile>\n");
    Ok(out)
}

/// Write `data` as a `.vti` file, creating the parent directory if needed.
pub fn write_image_data<S>(data: &ArrayBase<S, Ix3>, spacing: Spacing, path: &Path) -> Result<(), CodecError>
where
    S: Data<Elem = f32>,
{
    let bytes = encode_image_data(data, spacing)?;
    write_atomically(path, |writer| writer.write_all(&bytes))?;
    log::info!(
        "wrote visualization volume {} ({:.1} KB)",
        path.display(),
        bytes.len() as f64 / 1024.0
    );
    Ok(())
}

/// Parse a `.vti` file with raw appended Float32 point scalars.
pub fn read_vti(path: impl AsRef<Path>) -> Result<VtiImage, CodecError> {
    decode_image_data(&fs::read(path)?)
}

pub fn decode_image_data(bytes: &[u8]) -> Result<VtiImage, CodecError> {
    let tag_start = find(bytes, APPENDED_DATA_TAG.as_bytes())
        .ok_or_else(|| CodecError::Corrupt("no appended data section".into()))?;
    let xml = std::str::from_utf8(&bytes[..tag_start])
        .map_err(|err| CodecError::Corrupt(err.to_string()))?;
    let marker = bytes[tag_start..]
        .iter()
        .position(|&b| b == b'_')
        .map(|p| tag_start + p + 1)
        .ok_or_else(|| CodecError::Corrupt("no appended data marker".into()))?;

    let little_endian = match xml_attribute(xml, "VTKFile", "byte_order")? {
        "LittleEndian" => true,
        "BigEndian" => false,
        other => return Err(CodecError::Corrupt(format!("byte order {other}"))),
    };
    if xml_attribute(xml, "VTKFile", "header_type")? != "UInt64" {
        return Err(CodecError::Corrupt("expected UInt64 headers".into()));
    }
    if xml_attribute(xml, "DataArray", "type")? != "Float32" {
        return Err(CodecError::Corrupt("expected Float32 scalars".into()));
    }

    let extent = parse_numbers::<usize>(xml_attribute(xml, "ImageData", "WholeExtent")?)?;
    let spacing = parse_numbers::<f64>(xml_attribute(xml, "ImageData", "Spacing")?)?;
    if extent.len() != 6 || spacing.len() != 3 || extent.chunks(2).any(|pair| pair[1] < pair[0]) {
        return Err(CodecError::Corrupt("malformed extent or spacing".into()));
    }
    let axis = |lo: usize, hi: usize| {
        hi.checked_sub(lo)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| CodecError::Corrupt(format!("extent {lo} {hi} overflows")))
    };
    let dimensions = (
        axis(extent[0], extent[1])?,
        axis(extent[2], extent[3])?,
        axis(extent[4], extent[5])?,
    );

    let word = |b: &[u8]| -> [u8; 4] { [b[0], b[1], b[2], b[3]] };
    let payload_start = marker + 8;
    let length_bytes = bytes
        .get(marker..payload_start)
        .ok_or_else(|| CodecError::Corrupt("truncated appended data".into()))?;
    let mut length = [0u8; 8];
    length.copy_from_slice(length_bytes);
    let length = if little_endian {
        u64::from_le_bytes(length)
    } else {
        u64::from_be_bytes(length)
    } as usize;

    let expected = dimensions
        .0
        .checked_mul(dimensions.1)
        .and_then(|n| n.checked_mul(dimensions.2))
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| CodecError::Corrupt(format!("extent {dimensions:?} overflows")))?;
    if length != expected {
        return Err(CodecError::DimensionMismatch {
            array: (length / 4, 1, 1),
            declared: dimensions,
        });
    }
    let payload = payload_start
        .checked_add(length)
        .and_then(|end| bytes.get(payload_start..end))
        .ok_or_else(|| CodecError::Corrupt("truncated appended data".into()))?;
    let scalars = payload
        .chunks_exact(4)
        .map(|b| {
            if little_endian {
                f32::from_le_bytes(word(b))
            } else {
                f32::from_be_bytes(word(b))
            }
        })
        .collect();

    Ok(VtiImage {
        geometry: ImageGeometry {
            dimensions,
            spacing: (spacing[0], spacing[1], spacing[2]),
        },
        scalars,
    })
}

/// Re-export a canonical container as a `.vti` file at full resolution.
pub fn convert_container_to_vti(
    container: impl AsRef<Path>,
    vti: impl AsRef<Path>,
) -> Result<Volume, CodecError> {
    let volume = read_container(container)?;
    VtiWriter::new(None).write(&volume, vti.as_ref())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn xml_attribute<'a>(xml: &'a str, element: &str, name: &str) -> Result<&'a str, CodecError> {
    let missing = || CodecError::Corrupt(format!("missing {element}@{name}"));
    let start = xml.find(&format!("<{element} ")).ok_or_else(missing)?;
    let tag = &xml[start..];
    let tag = &tag[..tag.find('>').ok_or_else(missing)?];
    let key = format!(" {name}=\"");
    let value_start = tag.find(&key).ok_or_else(missing)? + key.len();
    let value_len = tag[value_start..].find('"').ok_or_else(missing)?;
    Ok(&tag[value_start..value_start + value_len])
}

fn parse_numbers<T: std::str::FromStr>(value: &str) -> Result<Vec<T>, CodecError> {
    value
        .split_whitespace()
        .map(|v| {
            v.parse()
                .map_err(|_| CodecError::Corrupt(format!("bad number '{v}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn asymmetric() -> Array3<f32> {
        Array::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn points_are_written_x_fastest() {
        let data = asymmetric();
        let bytes = encode_image_data(&data, (3.0, 2.0, 0.5)).unwrap();
        let image = decode_image_data(&bytes).unwrap();

        assert_eq!(image.geometry.dimensions, (4, 3, 2));
        assert_eq!(image.geometry.spacing, (0.5, 2.0, 3.0));
        let (w, h, _) = image.geometry.dimensions;
        for ((z, y, x), value) in data.indexed_iter() {
            assert_eq!(image.scalars[x + y * w + z * w * h], *value);
        }
    }

    #[test]
    fn header_declares_matching_extent_and_spacing() {
        let bytes = encode_image_data(&asymmetric(), (3.0, 2.0, 0.5)).unwrap();
        let end = find(&bytes, APPENDED_DATA_TAG.as_bytes()).unwrap();
        let xml = std::str::from_utf8(&bytes[..end]).unwrap();

        assert_eq!(xml_attribute(xml, "ImageData", "WholeExtent").unwrap(), "0 3 0 2 0 1");
        assert_eq!(xml_attribute(xml, "ImageData", "Spacing").unwrap(), "0.5 2 3");
        assert_eq!(xml_attribute(xml, "DataArray", "Name").unwrap(), SCALARS_NAME);
    }

    #[test]
    fn vtk_point_order_is_fortran_layout_of_xyz() {
        let data = asymmetric();
        let reordered = to_vtk_point_order(&data);
        assert_eq!(reordered.dim(), (4, 3, 2));
        assert_eq!(reordered[[3, 1, 0]], data[[0, 1, 3]]);
        let flat = reordered.as_slice_memory_order().unwrap();
        assert_eq!(flat[..4], [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(flat[4], 10.0);
    }

    #[test]
    fn bounded_export_preserves_physical_extent() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::new(Array3::from_elem((40, 30, 20), 0.5), (2.5, 0.8, 1.2), "1.2.3");
        let writer = VtiWriter::new(Some(VisualizationBounds {
            max_depth: 16,
            in_plane: 10,
        }));
        let path = VtiWriter::path_for(dir.path(), &volume.series_uid);
        let written = writer.write(&volume, &path).unwrap();

        assert_eq!(written.dim(), (16, 10, 10));
        let before = volume.physical_extent();
        let after = written.physical_extent();
        assert!((before.0 - after.0).abs() < 1e-9);
        assert!((before.1 - after.1).abs() < 1e-9);
        assert!((before.2 - after.2).abs() < 1e-9);

        let restored = read_vti(&path).unwrap().into_volume("1.2.3").unwrap();
        assert_eq!(restored.dim(), written.dim());
        assert_eq!(restored.spacing, written.spacing);
        assert_eq!(restored.data, written.data);
    }

    #[test]
    fn small_volumes_keep_their_depth() {
        let volume = Volume::new(Array3::zeros((5, 64, 64)), (1.0, 1.0, 1.0), "1.2.3");
        let prepared = VtiWriter::new(Some(VisualizationBounds {
            max_depth: 128,
            in_plane: 64,
        }))
        .prepare(&volume);
        assert_eq!(prepared.dim(), (5, 64, 64));
        assert_eq!(prepared.spacing, volume.spacing);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(
            encode_image_data(&Array3::<f32>::zeros((0, 2, 2)), (1.0, 1.0, 1.0)),
            Err(CodecError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            encode_image_data(&asymmetric(), (1.0, -1.0, 1.0)),
            Err(CodecError::InvalidSpacing(_))
        ));
        assert!(decode_image_data(b"<VTKFile></VTKFile>").is_err());
    }

    fn with_extent(bytes: &[u8], extent: &str) -> Vec<u8> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let end = find(bytes, APPENDED_DATA_TAG.as_bytes()).unwrap();
        let xml = text[..end].replace("0 3 0 2 0 1", extent);
        let mut out = xml.into_bytes();
        out.extend_from_slice(&bytes[end..]);
        out
    }

    #[test]
    fn hostile_headers_are_errors() {
        let bytes = encode_image_data(&asymmetric(), (1.0, 1.0, 1.0)).unwrap();

        let unbounded = with_extent(&bytes, "0 18446744073709551615 0 0 0 0");
        assert!(matches!(decode_image_data(&unbounded), Err(CodecError::Corrupt(_))));

        // A declared length that matches the extent but runs past the end
        // of addressable memory.
        let huge = (usize::MAX / 4 - 1).to_string();
        let mut past_end = with_extent(&bytes, &format!("0 {huge} 0 0 0 0"));
        let tag = find(&past_end, APPENDED_DATA_TAG.as_bytes()).unwrap();
        let marker = tag + past_end[tag..].iter().position(|&b| b == b'_').unwrap() + 1;
        let length = (usize::MAX / 4 * 4) as u64;
        let encoded = if NATIVE_BYTE_ORDER == "LittleEndian" {
            length.to_le_bytes()
        } else {
            length.to_be_bytes()
        };
        past_end[marker..marker + 8].copy_from_slice(&encoded);
        assert!(matches!(decode_image_data(&past_end), Err(CodecError::Corrupt(_))));
    }
}
