//! Lossless on-disk form of an assembled [`Volume`].
//!
//! The container stores the float32 array under a fixed dataset key, split
//! into one gzip member per axial slice so single slices can be read without
//! inflating the whole volume, and keeps spacing and series identifier as
//! named attributes next to it.
//!
//! All integers are little-endian:
//!
//! ```text
//! magic "CVOL" | version u16 | key (u16 len + utf8) | dtype u8
//! shape 3 x u64 | gzip level u8
//! attribute count u16, each: name (u16 len + utf8) | kind u8 | payload
//! chunk count u64, each: offset u64 | length u64
//! chunk bytes
//! ```
//!
//! With the `hdf5` feature the same dataset key, chunking and attributes can
//! be written as an HDF5 file instead (see the `hdf5_container` module).

use crate::{
    enums::ContainerFormat,
    persist::{artifact_stem, write_atomically},
    volume::{Spacing, Volume},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use ndarray::{Array2, Array3, s};
use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const CONTAINER_MAGIC: &[u8; 4] = b"CVOL";
pub const CONTAINER_VERSION: u16 = 1;
pub const DATASET_KEY: &str = "volume";
pub const SPACING_ATTRIBUTE: &str = "spacing";
pub const SERIES_UID_ATTRIBUTE: &str = "series_uid";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 4;

const DTYPE_F32: u8 = 1;
const ATTRIBUTE_FLOATS: u8 = 1;
const ATTRIBUTE_TEXT: u8 = 2;
const MAX_ATTRIBUTE_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("not a volume container")]
    BadMagic,

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),

    #[error("dataset '{0}' not found")]
    MissingDataset(String),

    #[error("unsupported element type {0}")]
    UnsupportedDtype(u8),

    #[error("missing or malformed attribute '{0}'")]
    MissingAttribute(&'static str),

    #[error("corrupt container: {0}")]
    Corrupt(String),

    #[error("invalid compression level {0}: must be in range [0, 9]")]
    InvalidLevel(u32),

    #[error("dimension mismatch: array has shape {array:?}, expected {declared:?}")]
    DimensionMismatch {
        array: (usize, usize, usize),
        declared: (usize, usize, usize),
    },

    #[error("invalid spacing {0:?}: every axis must be positive and finite")]
    InvalidSpacing(Spacing),

    #[error("slice {index} out of range for depth {depth}")]
    SliceOutOfRange { index: usize, depth: usize },

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0:?} containers are not supported by this build")]
    FormatUnavailable(ContainerFormat),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

/// A named value stored next to the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Floats(Vec<f64>),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    offset: u64,
    length: u64,
}

/// Everything in a container except the compressed slices.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHeader {
    pub dataset_key: String,
    pub shape: (usize, usize, usize),
    pub compression_level: u32,
    pub attributes: Vec<(String, Attribute)>,
    chunks: Vec<Chunk>,
}

impl ContainerHeader {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn spacing(&self) -> Result<Spacing, CodecError> {
        match self.attribute(SPACING_ATTRIBUTE) {
            Some(Attribute::Floats(values)) if values.len() == 3 => {
                Ok((values[0], values[1], values[2]))
            }
            _ => Err(CodecError::MissingAttribute(SPACING_ATTRIBUTE)),
        }
    }

    pub fn series_uid(&self) -> Result<&str, CodecError> {
        match self.attribute(SERIES_UID_ATTRIBUTE) {
            Some(Attribute::Text(uid)) => Ok(uid),
            _ => Err(CodecError::MissingAttribute(SERIES_UID_ATTRIBUTE)),
        }
    }
}

/// Serializes volumes into the canonical container.
#[derive(Debug, Clone, Copy)]
pub struct ContainerWriter {
    level: u32,
    format: ContainerFormat,
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            format: ContainerFormat::Cvol,
        }
    }
}

impl ContainerWriter {
    pub fn new(level: u32) -> Result<Self, CodecError> {
        if level > 9 {
            return Err(CodecError::InvalidLevel(level));
        }
        Ok(Self {
            level,
            format: ContainerFormat::Cvol,
        })
    }

    pub fn with_format(mut self, format: ContainerFormat) -> Result<Self, CodecError> {
        if !format.is_available() {
            return Err(CodecError::FormatUnavailable(format));
        }
        self.format = format;
        Ok(self)
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// `<dir>/<series_uid>.<cvol|h5>`
    pub fn path_for(&self, dir: &Path, series_uid: &str) -> PathBuf {
        dir.join(format!(
            "{}.{}",
            artifact_stem(series_uid),
            self.format.extension()
        ))
    }

    /// Write `volume` into `dir`, named after its series, creating `dir` if
    /// needed and replacing any previous container of the same series.
    pub fn write_to_dir(&self, volume: &Volume, dir: &Path) -> Result<PathBuf, CodecError> {
        let path = self.path_for(dir, &volume.series_uid);
        self.write(volume, &path)?;
        Ok(path)
    }

    pub fn write(&self, volume: &Volume, path: &Path) -> Result<(), CodecError> {
        match self.format {
            ContainerFormat::Cvol => {
                let bytes = self.encode(volume)?;
                write_atomically(path, |writer| writer.write_all(&bytes))?;
                log::info!(
                    "wrote canonical volume {} ({:.1} KB)",
                    path.display(),
                    bytes.len() as f64 / 1024.0
                );
                Ok(())
            }
            #[cfg(feature = "hdf5")]
            ContainerFormat::Hdf5 => crate::hdf5_container::write_volume(volume, path, self.level),
            #[cfg(not(feature = "hdf5"))]
            ContainerFormat::Hdf5 => Err(CodecError::FormatUnavailable(ContainerFormat::Hdf5)),
        }
    }

    /// Encode `volume` into container bytes. The output depends only on
    /// the volume and the compression level.
    pub fn encode(&self, volume: &Volume) -> Result<Vec<u8>, CodecError> {
        let spacing = checked_spacing(volume.spacing)?;

        let (depth, height, width) = volume.dim();
        let mut compressed = Vec::with_capacity(depth);
        for z in 0..depth {
            let raw: Vec<u8> = volume
                .data
                .slice(s![z, .., ..])
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
            encoder.write_all(&raw)?;
            compressed.push(encoder.finish()?);
        }

        let mut out = Vec::new();
        out.extend_from_slice(CONTAINER_MAGIC);
        out.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
        put_str(&mut out, DATASET_KEY);
        out.push(DTYPE_F32);
        for extent in [depth, height, width] {
            out.extend_from_slice(&(extent as u64).to_le_bytes());
        }
        out.push(self.level as u8);

        let attributes = [
            (
                SPACING_ATTRIBUTE,
                Attribute::Floats(vec![spacing.0, spacing.1, spacing.2]),
            ),
            (
                SERIES_UID_ATTRIBUTE,
                Attribute::Text(volume.series_uid.clone()),
            ),
        ];
        out.extend_from_slice(&(attributes.len() as u16).to_le_bytes());
        for (name, value) in &attributes {
            put_str(&mut out, name);
            match value {
                Attribute::Floats(values) => {
                    out.push(ATTRIBUTE_FLOATS);
                    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                Attribute::Text(text) => {
                    out.push(ATTRIBUTE_TEXT);
                    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
                    out.extend_from_slice(text.as_bytes());
                }
            }
        }

        out.extend_from_slice(&(depth as u64).to_le_bytes());
        let mut offset = (out.len() + depth * 16) as u64;
        for chunk in &compressed {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
            offset += chunk.len() as u64;
        }
        for chunk in &compressed {
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }
}

/// Random-access reader over a canonical container.
pub struct ContainerReader<R> {
    reader: R,
    header: ContainerHeader,
}

impl ContainerReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CodecError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Parse and validate the header; slices are read on demand.
    pub fn new(mut reader: R) -> Result<Self, CodecError> {
        let header = read_header(&mut reader)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.header.shape
    }

    /// Inflate a single axial slice.
    pub fn read_slice(&mut self, index: usize) -> Result<Array2<f32>, CodecError> {
        let (depth, height, width) = self.header.shape;
        let chunk = *self
            .header
            .chunks
            .get(index)
            .ok_or(CodecError::SliceOutOfRange { index, depth })?;

        let expected = height * width * 4;
        self.reader.seek(SeekFrom::Start(chunk.offset))?;
        // The declared shape is untrusted: grow with the inflated data and
        // stop one byte past the expected size.
        let mut raw = Vec::new();
        GzDecoder::new((&mut self.reader).take(chunk.length))
            .take(expected as u64 + 1)
            .read_to_end(&mut raw)?;
        if raw.len() != expected {
            return Err(CodecError::Corrupt(format!(
                "slice {index} holds {} bytes, expected {expected}",
                raw.len(),
            )));
        }

        let values: Vec<f32> = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Array2::from_shape_vec((height, width), values)
            .map_err(|err| CodecError::Corrupt(err.to_string()))
    }

    pub fn read_array(&mut self) -> Result<Array3<f32>, CodecError> {
        let mut values = Vec::new();
        for z in 0..self.header.shape.0 {
            values.extend(self.read_slice(z)?.iter().copied());
        }
        Array3::from_shape_vec(self.header.shape, values)
            .map_err(|err| CodecError::Corrupt(err.to_string()))
    }

    pub fn read_volume(&mut self) -> Result<Volume, CodecError> {
        let spacing = self.header.spacing()?;
        let series_uid = self.header.series_uid()?.to_string();
        let data = self.read_array()?;
        Ok(Volume::new(data, spacing, series_uid))
    }
}

/// Read a whole container back into a [`Volume`]. The format follows the
/// file extension: `.h5`/`.hdf5` is HDF5, anything else the chunked format.
pub fn read_container(path: impl AsRef<Path>) -> Result<Volume, CodecError> {
    let path = path.as_ref();
    match ContainerFormat::from_path(path) {
        ContainerFormat::Cvol => ContainerReader::open(path)?.read_volume(),
        #[cfg(feature = "hdf5")]
        ContainerFormat::Hdf5 => crate::hdf5_container::read_volume(path),
        #[cfg(not(feature = "hdf5"))]
        ContainerFormat::Hdf5 => Err(CodecError::FormatUnavailable(ContainerFormat::Hdf5)),
    }
}

pub(crate) fn checked_spacing(spacing: Spacing) -> Result<Spacing, CodecError> {
    if [spacing.0, spacing.1, spacing.2]
        .iter()
        .all(|v| v.is_finite() && *v > 0.0)
    {
        Ok(spacing)
    } else {
        Err(CodecError::InvalidSpacing(spacing))
    }
}

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<ContainerHeader, CodecError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != CONTAINER_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = read_u16(reader)?;
    if version != CONTAINER_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let key_len = read_u16(reader)? as u32;
    let dataset_key = read_str(reader, key_len)?;
    if dataset_key != DATASET_KEY {
        return Err(CodecError::MissingDataset(DATASET_KEY.to_string()));
    }
    let dtype = read_u8(reader)?;
    if dtype != DTYPE_F32 {
        return Err(CodecError::UnsupportedDtype(dtype));
    }

    let shape = (
        read_extent(reader)?,
        read_extent(reader)?,
        read_extent(reader)?,
    );
    shape
        .0
        .checked_mul(shape.1)
        .and_then(|n| n.checked_mul(shape.2))
        .and_then(|n| n.checked_mul(4))
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or_else(|| CodecError::Corrupt(format!("shape {shape:?} overflows")))?;
    let compression_level = read_u8(reader)? as u32;

    let attribute_count = read_u16(reader)?;
    let mut attributes = Vec::with_capacity(attribute_count as usize);
    for _ in 0..attribute_count {
        let name_len = read_u16(reader)? as u32;
        let name = read_str(reader, name_len)?;
        let kind = read_u8(reader)?;
        let len = read_u32(reader)?;
        if len > MAX_ATTRIBUTE_LEN {
            return Err(CodecError::Corrupt(format!("attribute '{name}' too large")));
        }
        let value = match kind {
            ATTRIBUTE_FLOATS => Attribute::Floats(
                (0..len)
                    .map(|_| read_f64(reader))
                    .collect::<Result<_, _>>()?,
            ),
            ATTRIBUTE_TEXT => Attribute::Text(read_str(reader, len)?),
            other => {
                return Err(CodecError::Corrupt(format!(
                    "attribute '{name}' has unknown kind {other}"
                )));
            }
        };
        attributes.push((name, value));
    }

    let chunk_count = read_u64(reader)?;
    if chunk_count != shape.0 as u64 {
        return Err(CodecError::Corrupt(format!(
            "{chunk_count} chunks for depth {}",
            shape.0
        )));
    }
    let chunks = (0..chunk_count)
        .map(|_| {
            Ok(Chunk {
                offset: read_u64(reader)?,
                length: read_u64(reader)?,
            })
        })
        .collect::<Result<Vec<_>, CodecError>>()?;

    Ok(ContainerHeader {
        dataset_key,
        shape,
        compression_level,
        attributes,
        chunks,
    })
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_extent<R: Read>(reader: &mut R) -> Result<usize, CodecError> {
    let value = read_u64(reader)?;
    usize::try_from(value).map_err(|_| CodecError::Corrupt(format!("extent {value} too large")))
}

fn read_str<R: Read>(reader: &mut R, len: u32) -> Result<String, CodecError> {
    if len > MAX_ATTRIBUTE_LEN {
        return Err(CodecError::Corrupt(format!("string of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|err| CodecError::Corrupt(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use std::io::Cursor;

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
        let path = ContainerWriter::default()
            .write_to_dir(&volume, dir.path())
            .unwrap();

        assert_eq!(
            path.file_name().unwrap(),
            "1.2.826.0.1.3680043.2.1125.cvol"
        );
        let restored = read_container(&path).unwrap();
        assert_eq!(restored.series_uid, volume.series_uid);
        assert_eq!(restored.spacing, volume.spacing);
        assert_eq!(restored.data.dim(), volume.data.dim());
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
        let volume = sample_volume();
        let bytes = ContainerWriter::new(9).unwrap().encode(&volume).unwrap();
        let mut reader = ContainerReader::new(Cursor::new(bytes)).unwrap();

        assert_eq!(reader.dim(), (4, 3, 5));
        assert_eq!(reader.header().compression_level, 9);
        assert_eq!(reader.read_slice(2).unwrap(), volume.data.slice(s![2, .., ..]));
        assert_eq!(reader.read_slice(0).unwrap(), volume.data.slice(s![0, .., ..]));
        assert!(matches!(
            reader.read_slice(4),
            Err(CodecError::SliceOutOfRange { index: 4, depth: 4 })
        ));
    }

    #[test]
    fn encoding_is_deterministic() {
        let writer = ContainerWriter::default();
        let volume = sample_volume();
        assert_eq!(writer.encode(&volume).unwrap(), writer.encode(&volume).unwrap());
    }

    #[test]
    fn rewriting_the_same_series_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ContainerWriter::default();
        let mut volume = sample_volume();
        writer.write_to_dir(&volume, dir.path()).unwrap();
        volume.data.fill(0.25);
        let path = writer.write_to_dir(&volume, dir.path()).unwrap();

        assert!(read_container(&path).unwrap().data.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn corrupt_input_is_rejected() {
        let bytes = ContainerWriter::default().encode(&sample_volume()).unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            ContainerReader::new(Cursor::new(bad_magic)),
            Err(CodecError::BadMagic)
        ));

        let truncated = bytes[..bytes.len() - 10].to_vec();
        let mut reader = ContainerReader::new(Cursor::new(truncated)).unwrap();
        assert!(reader.read_array().is_err());

        assert!(ContainerReader::new(Cursor::new(&bytes[..20])).is_err());
    }

    fn with_shape(mut bytes: Vec<u8>, shape: [u64; 3]) -> Vec<u8> {
        // magic, version, key length and "volume", dtype
        let start = 4 + 2 + 2 + DATASET_KEY.len() + 1;
        for (i, extent) in shape.iter().enumerate() {
            let at = start + i * 8;
            bytes[at..at + 8].copy_from_slice(&extent.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn oversized_shapes_are_rejected_without_allocating() {
        let single = Volume::new(Array3::from_elem((1, 3, 5), 0.5), (1.0, 1.0, 1.0), "1.2.3");
        let bytes = ContainerWriter::default().encode(&single).unwrap();

        let unaddressable = with_shape(bytes.clone(), [1, 1 << 30, 1 << 31]);
        assert!(matches!(
            ContainerReader::new(Cursor::new(unaddressable)),
            Err(CodecError::Corrupt(_))
        ));

        let lying = with_shape(bytes, [1, 1 << 20, 1 << 20]);
        let mut reader = ContainerReader::new(Cursor::new(lying)).unwrap();
        assert!(matches!(reader.read_slice(0), Err(CodecError::Corrupt(_))));
        assert!(matches!(reader.read_array(), Err(CodecError::Corrupt(_))));
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn hdf5_needs_the_feature() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ContainerWriter::default().with_format(ContainerFormat::Hdf5),
            Err(CodecError::FormatUnavailable(ContainerFormat::Hdf5))
        ));
        assert!(matches!(
            read_container(dir.path().join("1.2.3.h5")),
            Err(CodecError::FormatUnavailable(ContainerFormat::Hdf5))
        ));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            ContainerWriter::new(12),
            Err(CodecError::InvalidLevel(12))
        ));
        let mut volume = sample_volume();
        volume.spacing.1 = 0.0;
        assert!(matches!(
            ContainerWriter::default().encode(&volume),
            Err(CodecError::InvalidSpacing(_))
        ));
    }
}
