//! Single-image pipelines: chest X-ray classification and MRI slice
//! classification with tumour segmentation.

use crate::{
    inference::{InferenceError, Model},
    report::round_to,
};

use image::{GrayImage, imageops::FilterType};
use ndarray::{Array2, Array4, ArrayD, Axis};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const CLASSIFIER_INPUT_SIZE: u32 = 224;
pub const SEGMENTER_INPUT_SIZE: u32 = 256;
/// Smallest tumour-labelled area, in pixels, reported as a detection.
pub const MIN_TUMOR_PIXELS: usize = 100;
pub const NO_TUMOR_CLASS: &str = "notumor";
pub const XRAY_DISCLAIMER: &str = "This AI system is for research and decision support only.";

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("input image not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// How a grayscale image is turned into an NCHW tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorLayout {
    pub size: u32,
    /// 1, or 3 to replicate the gray channel.
    pub channels: usize,
    /// Per-channel (mean, std) applied after scaling to [0, 1].
    pub normalization: Option<([f32; 3], [f32; 3])>,
}

impl TensorLayout {
    pub const XRAY: Self = Self {
        size: CLASSIFIER_INPUT_SIZE,
        channels: 3,
        normalization: None,
    };
    pub const MRI_CLASSIFIER: Self = Self {
        size: CLASSIFIER_INPUT_SIZE,
        channels: 3,
        normalization: Some((IMAGENET_MEAN, IMAGENET_STD)),
    };
    pub const MRI_SEGMENTER: Self = Self {
        size: SEGMENTER_INPUT_SIZE,
        channels: 1,
        normalization: None,
    };
}

pub fn load_grayscale(path: &Path) -> Result<GrayImage, ImagingError> {
    if !path.is_file() {
        return Err(ImagingError::NotFound(path.to_path_buf()));
    }
    Ok(image::open(path)?.to_luma8())
}

/// Resize (bilinear) and convert to a `(1, channels, size, size)` tensor.
pub fn image_to_tensor(image: &GrayImage, layout: &TensorLayout) -> Array4<f32> {
    let resized = image::imageops::resize(image, layout.size, layout.size, FilterType::Triangle);
    let size = layout.size as usize;
    Array4::from_shape_fn((1, layout.channels, size, size), |(_, c, y, x)| {
        let value = resized.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0;
        match layout.normalization {
            Some((mean, std)) => (value - mean[c % 3]) / std[c % 3],
            None => value,
        }
    })
}

fn run_tensor<M: Model>(model: &M, tensor: &Array4<f32>) -> Result<ArrayD<f32>, InferenceError> {
    model.run(tensor.view().into_dyn())
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / total).collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct XrayReport {
    pub modality: &'static str,
    pub prediction_type: &'static str,
    pub prediction: XrayPrediction,
    pub model_info: ModelInfo,
    pub disclaimer: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct XrayPrediction {
    pub label: &'static str,
    pub confidence: f64,
    pub probabilities: XrayProbabilities,
    pub risk_level: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct XrayProbabilities {
    #[serde(rename = "NORMAL")]
    pub normal: f64,
    #[serde(rename = "PNEUMONIA")]
    pub pneumonia: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelInfo {
    pub architecture: String,
    pub version: String,
}

/// Binary pneumonia classifier over a single logit.
pub struct XrayClassifier<M> {
    model: M,
    info: ModelInfo,
}

impl<M: Model> XrayClassifier<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            info: ModelInfo {
                architecture: "CNN (ResNet-based)".to_string(),
                version: "xray-v1".to_string(),
            },
        }
    }

    pub fn analyze_path(&self, path: &Path) -> Result<XrayReport, ImagingError> {
        self.analyze(&load_grayscale(path)?)
    }

    pub fn analyze(&self, image: &GrayImage) -> Result<XrayReport, ImagingError> {
        let tensor = image_to_tensor(image, &TensorLayout::XRAY);
        let output = run_tensor(&self.model, &tensor)?;
        if output.len() != 1 {
            return Err(InferenceError::unexpected_shape(self.model.name(), "[1, 1]", output.shape()).into());
        }
        let logit = output.iter().copied().next().unwrap_or_default();
        Ok(self.report(sigmoid(logit) as f64))
    }

    fn report(&self, p_pneumonia: f64) -> XrayReport {
        let pneumonia = p_pneumonia >= 0.5;
        let confidence = if pneumonia { p_pneumonia } else { 1.0 - p_pneumonia };
        let risk_level = match (pneumonia, confidence) {
            (true, c) if c >= 0.9 => "high",
            (true, c) if c >= 0.7 => "medium",
            _ => "low",
        };

        XrayReport {
            modality: "xray",
            prediction_type: "classification",
            prediction: XrayPrediction {
                label: if pneumonia { "PNEUMONIA" } else { "NORMAL" },
                confidence: round_to(confidence, 3),
                probabilities: XrayProbabilities {
                    normal: round_to(1.0 - p_pneumonia, 3),
                    pneumonia: round_to(p_pneumonia, 3),
                },
                risk_level,
            },
            model_info: self.info.clone(),
            disclaimer: XRAY_DISCLAIMER,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MriReport {
    pub segmentation: SegmentationSummary,
    pub classification: ClassificationSummary,
    pub risk_analysis: RiskInfo,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SegmentationSummary {
    pub tumor_detected: bool,
    pub tumor_size_pixels: usize,
    pub tumor_location: Option<Location>,
}

impl SegmentationSummary {
    fn none() -> Self {
        Self {
            tumor_detected: false,
            tumor_size_pixels: 0,
            tumor_location: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClassificationSummary {
    pub tumor_type: String,
    pub confidence: f64,
    pub probabilities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RiskInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    pub risks: Vec<String>,
}

/// Known risks per tumour class.
pub fn tumor_risk(tumor_type: &str) -> RiskInfo {
    let risks: &[&str] = match tumor_type.to_lowercase().as_str() {
        "glioma" => &[
            "Rapid growth (especially high-grade gliomas)",
            "Seizures",
            "Speech and cognitive impairment",
            "Motor weakness or paralysis",
            "Infiltrates surrounding brain tissue, making surgery difficult",
            "High recurrence rate",
        ],
        "meningioma" => &[
            "Increased intracranial pressure",
            "Vision problems (if near optic nerve)",
            "Speech or memory issues",
            "Seizures (less common than glioma)",
            "Can compress nearby brain structures",
            "Possible recurrence after surgery",
        ],
        "pituitary" => &[
            "Vision loss (optic chiasm compression)",
            "Hormonal imbalance",
            "Fatigue and metabolic disorders",
            "Headaches",
            "Endocrine dysfunction (thyroid, cortisol, growth hormone)",
        ],
        NO_TUMOR_CLASS => &[
            "No tumor detected",
            "Normal brain MRI appearance",
            "Continue routine monitoring if symptoms persist",
        ],
        _ => {
            return RiskInfo {
                risk_score: Some(0.0),
                risks: vec!["Unknown tumor type - risk assessment unavailable".to_string()],
            };
        }
    };
    RiskInfo {
        risk_score: None,
        risks: risks.iter().map(|r| r.to_string()).collect(),
    }
}

/// Per-pixel argmax over the class axis of `(1, C, H, W)` logits.
pub fn argmax_mask(model: &str, logits: ArrayD<f32>) -> Result<Array2<usize>, InferenceError> {
    let shape = logits.shape().to_vec();
    let logits = logits
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|_| InferenceError::unexpected_shape(model, "[1, C, H, W]", &shape))?;
    if logits.len_of(Axis(0)) != 1 || logits.len_of(Axis(1)) == 0 {
        return Err(InferenceError::unexpected_shape(model, "[1, C, H, W]", &shape));
    }
    let classes = logits.index_axis_move(Axis(0), 0);
    let (_, height, width) = classes.dim();
    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        classes
            .slice(ndarray::s![.., y, x])
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (class, &v)| {
                if v > best.1 { (class, v) } else { best }
            })
            .0
    }))
}

/// Size and centroid of the pixels labelled as tumour (class 1).
pub fn analyze_mask(mask: &Array2<usize>) -> SegmentationSummary {
    let mut count = 0usize;
    let (mut sum_x, mut sum_y) = (0.0_f64, 0.0_f64);
    for ((y, x), &label) in mask.indexed_iter() {
        if label == 1 {
            count += 1;
            sum_x += x as f64;
            sum_y += y as f64;
        }
    }
    if count < MIN_TUMOR_PIXELS {
        return SegmentationSummary::none();
    }
    SegmentationSummary {
        tumor_detected: true,
        tumor_size_pixels: count,
        tumor_location: Some(Location {
            x: sum_x / count as f64,
            y: sum_y / count as f64,
        }),
    }
}

/// Classifies an MRI slice and, unless it is tumour-free, segments it.
pub struct MriSliceAnalyzer<C, S> {
    classifier: C,
    segmenter: S,
    class_names: Vec<String>,
}

impl<C: Model, S: Model> MriSliceAnalyzer<C, S> {
    pub fn new(classifier: C, segmenter: S, class_names: Vec<String>) -> Self {
        Self {
            classifier,
            segmenter,
            class_names,
        }
    }

    pub fn analyze_path(&self, path: &Path) -> Result<MriReport, ImagingError> {
        self.analyze(&load_grayscale(path)?)
    }

    pub fn analyze(&self, image: &GrayImage) -> Result<MriReport, ImagingError> {
        let classification = self.classify(image)?;
        let risk_analysis = tumor_risk(&classification.tumor_type);

        let segmentation = if classification.tumor_type.eq_ignore_ascii_case(NO_TUMOR_CLASS) {
            SegmentationSummary::none()
        } else {
            let tensor = image_to_tensor(image, &TensorLayout::MRI_SEGMENTER);
            let logits = run_tensor(&self.segmenter, &tensor)?;
            analyze_mask(&argmax_mask(self.segmenter.name(), logits)?)
        };

        Ok(MriReport {
            segmentation,
            classification,
            risk_analysis,
        })
    }

    fn classify(&self, image: &GrayImage) -> Result<ClassificationSummary, ImagingError> {
        let tensor = image_to_tensor(image, &TensorLayout::MRI_CLASSIFIER);
        let logits = run_tensor(&self.classifier, &tensor)?;
        if logits.len() != self.class_names.len() || logits.is_empty() {
            return Err(InferenceError::unexpected_shape(
                self.classifier.name(),
                format!("[1, {}]", self.class_names.len()),
                logits.shape(),
            )
            .into());
        }

        let logits: Vec<f32> = logits.iter().copied().collect();
        let probabilities = softmax(&logits);
        let (best, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        Ok(ClassificationSummary {
            tumor_type: self.class_names[best].clone(),
            confidence: round_to(confidence as f64, 4),
            probabilities: self
                .class_names
                .iter()
                .cloned()
                .zip(probabilities.iter().map(|&p| round_to(p as f64, 4)))
                .collect(),
        })
    }
}
