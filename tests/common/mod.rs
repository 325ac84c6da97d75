#![allow(dead_code)]

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use dicom_dictionary_std::{tags, uids};
use dicom_recon::PipelineConfig;
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;
use zip::{ZipWriter, write::SimpleFileOptions};

pub const ROWS: usize = 8;
pub const COLUMNS: usize = 6;

fn strs(values: &[String]) -> PrimitiveValue {
    PrimitiveValue::Strs(values.iter().cloned().collect())
}

/// One synthetic CT slice.
pub struct SliceFixture {
    pub series_uid: String,
    pub instance_number: u32,
    /// Third ImagePositionPatient coordinate; omitted when `None`.
    pub position: Option<f64>,
    pub pixel: fn(usize, usize) -> u16,
    pub fill: u16,
    /// Header-only file when `false`.
    pub with_pixels: bool,
}

impl SliceFixture {
    pub fn new(series_uid: &str, instance_number: u32, position: Option<f64>, fill: u16) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            instance_number,
            position,
            pixel: |_, _| 0,
            fill,
            with_pixels: true,
        }
    }

    pub fn write(&self, path: &Path) {
        let instance_uid = format!("{}.{}", self.series_uid, self.instance_number);
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(instance_uid.as_str())));
        obj.put(DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")));
        obj.put(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(self.series_uid.as_str()),
        ));
        obj.put(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(self.instance_number.to_string()),
        ));
        if let Some(z) = self.position {
            obj.put(DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                strs(&["0".to_string(), "0".to_string(), z.to_string()]),
            ));
        }
        obj.put(DataElement::new(
            tags::PIXEL_SPACING,
            VR::DS,
            strs(&["0.5".to_string(), "0.75".to_string()]),
        ));
        obj.put(DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2.5")));
        obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)));
        obj.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ));
        obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(ROWS as u16)));
        obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(COLUMNS as u16)));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)));
        obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)));
        obj.put(DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)));

        if self.with_pixels {
            let pixels: Vec<u16> = (0..ROWS * COLUMNS)
                .map(|i| self.fill.saturating_add((self.pixel)(i / COLUMNS, i % COLUMNS)))
                .collect();
            obj.put(DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                PrimitiveValue::U16(pixels.into_iter().collect()),
            ));
        }

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(instance_uid.as_str()),
            )
            .unwrap();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        file.write_to_file(path).unwrap();
    }
}

/// `count` slices spaced 2.5 apart whose fill value rises with position.
pub fn write_series(dir: &Path, series_uid: &str, count: u32) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("{series_uid}/IM{i:04}.dcm"));
            let mut slice = SliceFixture::new(series_uid, i + 1, Some(i as f64 * 2.5), (i * 10) as u16);
            slice.pixel = |row, column| (row + column) as u16;
            slice.write(&path);
            path
        })
        .collect()
}

/// Zip every file below `dir`, storing paths relative to it.
pub fn zip_directory(dir: &Path, zip_path: &Path) {
    let files = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path());

    let mut zip = ZipWriter::new(File::create(zip_path).unwrap());
    for path in files {
        let name = path.strip_prefix(dir).unwrap().to_string_lossy().replace('\\', "/");
        zip.start_file(name, SimpleFileOptions::default()).unwrap();
        zip.write_all(&fs::read(&path).unwrap()).unwrap();
    }
    zip.finish().unwrap();
}

/// Defaults with output below `out` and no visualization resampling.
pub fn test_config(out: &Path) -> PipelineConfig {
    PipelineConfig {
        output_dir: out.to_path_buf(),
        resample_visualization: false,
        ..PipelineConfig::default()
    }
}
