use crate::{
    container::CodecError,
    persist::{artifact_stem, write_atomically},
};

use image::{ImageBuffer, ImageFormat, Rgb, RgbImage, imageops::FilterType};
use ndarray::ArrayView2;
use std::{
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

pub const HEATMAP_SUFFIX: &str = "_heatmap.png";

/// `<dir>/<series_uid>_heatmap.png`
pub fn heatmap_path(dir: &Path, series_uid: &str) -> PathBuf {
    dir.join(format!("{}{HEATMAP_SUFFIX}", artifact_stem(series_uid)))
}

/// Black-red-yellow-white ramp, matching matplotlib's "hot" table.
#[inline]
pub fn hot_colormap(value: f32) -> [u8; 3] {
    let v = value.clamp(0.0, 1.0);
    let ramp = |start: f32, end: f32, floor: f32| {
        let t = ((v - start) / (end - start)).clamp(0.0, 1.0);
        floor + (1.0 - floor) * t
    };
    let to_u8 = |c: f32| (c * 255.0).round() as u8;
    [
        to_u8(ramp(0.0, 0.365079, 0.0416)),
        to_u8(ramp(0.365079, 0.746032, 0.0)),
        to_u8(ramp(0.746032, 1.0, 0.0)),
    ]
}

/// Colour a 2D slice after shifting it to zero and scaling its maximum to 1.
pub fn render_heatmap(slice: &ArrayView2<'_, f32>) -> Option<RgbImage> {
    let (height, width) = slice.dim();
    let min = slice.iter().copied().fold(f32::INFINITY, f32::min);
    let max = slice.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let scale = (max - min) as f64 + 1e-8;

    let pixel_data: Vec<u8> = slice
        .iter()
        .flat_map(|&v| hot_colormap(((v - min) as f64 / scale) as f32))
        .collect();
    ImageBuffer::<Rgb<u8>, _>::from_raw(width as u32, height as u32, pixel_data)
}

/// Render `slice`, scale its longer side to `size` pixels and save it as PNG.
pub fn save_heatmap(slice: &ArrayView2<'_, f32>, size: u32, path: &Path) -> Result<(), CodecError> {
    let (height, width) = slice.dim();
    let image = render_heatmap(slice).ok_or(CodecError::DimensionMismatch {
        array: (1, height, width),
        declared: (1, height.max(1), width.max(1)),
    })?;

    let longest = width.max(height).max(1) as f64;
    let scale = size.max(1) as f64 / longest;
    let out_width = ((width as f64 * scale).round() as u32).max(1);
    let out_height = ((height as f64 * scale).round() as u32).max(1);
    let image = image::imageops::resize(&image, out_width, out_height, FilterType::Nearest);

    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    write_atomically(path, |writer| writer.write_all(&png))?;
    log::info!("wrote heatmap {}", path.display());
    Ok(())
}
