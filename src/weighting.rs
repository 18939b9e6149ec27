use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::config::{WeightingConfig, WeightingKind};
use crate::segment::Segment;

/// Operating points $(\eta[k+1], u_2[k], T[k], F[k])$ of the selected delay pairs
///
/// `idx` indexes delay pairs, so every entry must be below `segment.len() - 1`.
pub fn operating_points(segment: &Segment, idx: &[usize]) -> Array2<f64> {
    let mut points = Array2::zeros((idx.len(), 4));
    for (mut row, &k) in points.rows_mut().into_iter().zip(idx) {
        row[0] = segment.eta()[k + 1];
        row[1] = segment.u2()[k];
        row[2] = segment.temperature()[k];
        row[3] = segment.flow()[k];
    }
    points
}

/// Diagonal of the weight matrix $W$ for the selected operating points
pub fn weights(points: ArrayView2<f64>, config: &WeightingConfig) -> Array1<f64> {
    match config.kind {
        WeightingKind::Uniform => Array1::ones(points.nrows()),
        WeightingKind::Density => density_weights(points, config.bandwidth_scale),
    }
}

/// Weights inversely proportional to a Gaussian product-kernel density estimate
///
/// Each dimension is standardised before the estimate, and the bandwidth follows Scott's rule
/// $h = n^{-1/(d+4)}$ multiplied by `bandwidth_scale`. Heavily visited operating regions such as
/// steady idle receive small weights. The weights are normalised to unit mean so the overall
/// scale of the fit objective is unchanged.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]
pub fn density_weights(points: ArrayView2<f64>, bandwidth_scale: f64) -> Array1<f64> {
    let (n, d) = points.dim();
    if n == 0 {
        return Array1::zeros(0);
    }

    let mean = points.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(d));
    let std = points.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
    let standardised = (&points - &mean) / &std;

    let h = (n as f64).powf(-1.0 / (d as f64 + 4.0)) * bandwidth_scale;
    let normalisation = (2.0 * PI).sqrt().powi(d as i32) * h.powi(d as i32);

    let density = standardised
        .rows()
        .into_iter()
        .map(|zi| {
            let kernel_sum: f64 = standardised
                .rows()
                .into_iter()
                .map(|zj| {
                    let squared_distance: f64 =
                        zi.iter().zip(zj).map(|(a, b)| ((a - b) / h).powi(2)).sum();
                    (-0.5 * squared_distance).exp()
                })
                .sum();
            kernel_sum / (n as f64 * normalisation)
        })
        .collect::<Array1<f64>>();

    let inverse = density.mapv(f64::recip);
    let mean_weight = inverse.mean().unwrap_or(1.0);
    inverse / mean_weight
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Array1, Array2, Axis};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_isaac::isaac64::Isaac64Rng;

    use super::{density_weights, weights};
    use crate::config::{WeightingConfig, WeightingKind};

    #[test]
    fn weights_have_unit_mean_and_are_positive() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let points = Array::random_using((60, 4), Uniform::new(0., 10.), &mut rng);

        let w = density_weights(points.view(), 1.0);

        assert_eq!(w.len(), 60);
        assert!(w.iter().all(|&wi| wi > 0.0));
        approx::assert_relative_eq!(w.mean().unwrap(), 1.0, max_relative = 1e-12);
    }

    #[test]
    fn oversampled_operating_point_is_down_weighted() {
        // Forty samples sit at idle, four are spread across the envelope
        let mut points = Array2::from_elem((44, 4), 1.0);
        for (ii, mut row) in points.axis_iter_mut(Axis(0)).skip(40).enumerate() {
            row.fill(5.0 + 3.0 * ii as f64);
        }

        let w = density_weights(points.view(), 1.0);

        let idle = w[0];
        for &spread in w.iter().skip(40) {
            assert!(spread > 5.0 * idle);
        }
    }

    #[test]
    fn constant_dimensions_do_not_break_the_estimate() {
        let points = Array2::from_elem((10, 4), 3.0);
        let w = density_weights(points.view(), 1.0);
        for &wi in &w {
            approx::assert_relative_eq!(wi, 1.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn uniform_weighting_ignores_the_data() {
        let points = Array2::from_elem((7, 4), 3.0);
        let config = WeightingConfig {
            kind: WeightingKind::Uniform,
            bandwidth_scale: 1.0,
        };
        assert_eq!(weights(points.view(), &config), Array1::<f64>::ones(7));
    }
}
