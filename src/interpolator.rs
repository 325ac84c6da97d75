use crate::{enums::Interpolation, volume::Spacing};

use ndarray::{Array3, ArrayBase, Axis, Data, Ix3, Zip};

/// Keys cubic convolution parameter.
const CUBIC_A: f64 = -0.5;

pub struct Interpolator;

impl Interpolator {
    /// Resample `input` by per-axis `factors` (depth, height, width).
    ///
    /// Each output extent is `round(extent * factor)`, never less than one.
    pub fn zoom<S>(
        input: &ArrayBase<S, Ix3>,
        factors: (f64, f64, f64),
        interpolation: Interpolation,
    ) -> Array3<f32>
    where
        S: Data<Elem = f32>,
    {
        let (depth, height, width) = input.dim();
        let shape = (
            Self::zoomed_extent(depth, factors.0),
            Self::zoomed_extent(height, factors.1),
            Self::zoomed_extent(width, factors.2),
        );
        Self::resize(input, shape, interpolation)
    }

    /// Resample `input` to exactly `shape`.
    ///
    /// Output index `i` samples input coordinate `i * (n - 1) / (m - 1)`, so
    /// the first and last samples of every axis line up with the input's.
    pub fn resize<S>(
        input: &ArrayBase<S, Ix3>,
        shape: (usize, usize, usize),
        interpolation: Interpolation,
    ) -> Array3<f32>
    where
        S: Data<Elem = f32>,
    {
        let target = [shape.0, shape.1, shape.2];
        let mut current = input.to_owned();
        for (axis, &extent) in target.iter().enumerate() {
            if current.len_of(Axis(axis)) != extent {
                current = Self::resample_axis(&current, Axis(axis), extent, interpolation);
            }
        }
        current
    }

    pub fn zoomed_extent(extent: usize, factor: f64) -> usize {
        ((extent as f64 * factor).round() as usize).max(1)
    }

    /// Spacing that keeps the physical size unchanged when a volume of
    /// `from` samples is resampled to `to` samples.
    pub fn rescale_spacing(
        spacing: Spacing,
        from: (usize, usize, usize),
        to: (usize, usize, usize),
    ) -> Spacing {
        (
            spacing.0 * from.0 as f64 / to.0 as f64,
            spacing.1 * from.1 as f64 / to.1 as f64,
            spacing.2 * from.2 as f64 / to.2 as f64,
        )
    }

    /// Shape a volume is reduced to before it is handed to a renderer.
    pub fn bounded_shape(
        shape: (usize, usize, usize),
        max_depth: usize,
        in_plane: usize,
    ) -> (usize, usize, usize) {
        (shape.0.min(max_depth).max(1), in_plane.max(1), in_plane.max(1))
    }

    fn resample_axis(
        input: &Array3<f32>,
        axis: Axis,
        extent: usize,
        interpolation: Interpolation,
    ) -> Array3<f32> {
        let source_len = input.len_of(axis);
        let taps: Vec<Vec<(usize, f64)>> = (0..extent)
            .map(|i| {
                let coordinate = Self::source_coordinate(i, source_len, extent);
                match interpolation {
                    Interpolation::Linear => Self::linear_taps(coordinate, source_len),
                    Interpolation::Cubic => Self::cubic_taps(coordinate, source_len),
                }
            })
            .collect();

        let mut shape = input.raw_dim();
        shape[axis.index()] = extent;
        let mut output = Array3::<f32>::zeros(shape);

        Zip::from(output.lanes_mut(axis))
            .and(input.lanes(axis))
            .for_each(|mut out_lane, in_lane| {
                for (out, taps) in out_lane.iter_mut().zip(&taps) {
                    let value: f64 = taps
                        .iter()
                        .map(|&(index, weight)| in_lane[index] as f64 * weight)
                        .sum();
                    *out = value as f32;
                }
            });

        output
    }

    #[inline]
    fn source_coordinate(index: usize, source_len: usize, target_len: usize) -> f64 {
        if target_len <= 1 || source_len <= 1 {
            return 0.0;
        }
        index as f64 * (source_len - 1) as f64 / (target_len - 1) as f64
    }

    fn linear_taps(coordinate: f64, source_len: usize) -> Vec<(usize, f64)> {
        let i0 = (coordinate.floor() as usize).min(source_len - 1);
        let i1 = (i0 + 1).min(source_len - 1);
        let t = coordinate - i0 as f64;
        if t == 0.0 || i0 == i1 {
            return vec![(i0, 1.0)];
        }
        vec![(i0, 1.0 - t), (i1, t)]
    }

    fn cubic_taps(coordinate: f64, source_len: usize) -> Vec<(usize, f64)> {
        let base = coordinate.floor();
        if coordinate == base {
            return vec![((base as usize).min(source_len - 1), 1.0)];
        }
        let last = (source_len - 1) as i64;
        (-1..=2)
            .map(|offset| {
                let position = base as i64 + offset;
                let weight = Self::cubic_kernel(coordinate - position as f64);
                (position.clamp(0, last) as usize, weight)
            })
            .collect()
    }

    #[inline]
    fn cubic_kernel(x: f64) -> f64 {
        let x = x.abs();
        if x <= 1.0 {
            ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
        } else if x < 2.0 {
            ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
        } else {
            0.0
        }
    }
}
