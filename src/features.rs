use ndarray::{Array1, Array2};

use crate::config::BasisConfig;
use crate::math::condition_number;
use crate::segment::Segment;
use crate::{Error, Result};

/// Number of regression coefficients
pub const NUM_COEFFS: usize = 3;

/// Position of each coefficient in $\theta$
pub const CURVATURE: usize = 0;
pub const LINEAR: usize = 1;
pub const CONSTANT: usize = 2;

/// Temperature basis spanning the saturated efficiency curve
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Basis {
    /// $[T^2, T, 1]$
    #[default]
    Raw,
    /// $[2x^2 - 1, x, 1]$ with $x = (T - T_0) / T_r$
    Centred { t0: f64, tr: f64 },
}

impl From<Option<BasisConfig>> for Basis {
    fn from(config: Option<BasisConfig>) -> Self {
        config.map_or(Self::Raw, |BasisConfig { t0, tr }| Self::Centred { t0, tr })
    }
}

impl Basis {
    pub fn evaluate(&self, temperature: f64) -> [f64; NUM_COEFFS] {
        match *self {
            Self::Raw => [temperature * temperature, temperature, 1.0],
            Self::Centred { t0, tr } => {
                let x = (temperature - t0) / tr;
                [2.0f64.mul_add(x * x, -1.0), x, 1.0]
            }
        }
    }
}

/// Build the $N \times 3$ regression matrix relating operating point to one-step-ahead
/// efficiency
///
/// $$
///     \hat\eta[k + 1] = \Phi[k] \theta, \quad \Phi[k] = \frac{u_1[k]}{F[k]} \mathrm{basis}(T[k])
/// $$
///
/// # Errors
/// - [`Error::LengthMismatch`] if the series differ in length
/// - [`Error::DegenerateFeatureMatrix`] at the first flow sample that is not strictly positive
pub fn build_features(
    temperature: &Array1<f64>,
    flow: &Array1<f64>,
    u1: &Array1<f64>,
    basis: Basis,
) -> Result<Array2<f64>> {
    let n = temperature.len();
    for (name, series) in [("F", flow), ("u1", u1)] {
        if series.len() != n {
            return Err(Error::LengthMismatch {
                name,
                expected: n,
                found: series.len(),
            });
        }
    }
    if let Some((index, &flow)) = flow.iter().enumerate().find(|(_, f)| !(**f > 0.0)) {
        return Err(Error::DegenerateFeatureMatrix { index, flow });
    }

    let mut phi = Array2::zeros((n, NUM_COEFFS));
    for (mut row, ((&t, &f), &u)) in phi
        .rows_mut()
        .into_iter()
        .zip(temperature.iter().zip(flow).zip(u1))
    {
        let scale = u / f;
        for (element, b) in row.iter_mut().zip(basis.evaluate(t)) {
            *element = scale * b;
        }
    }

    // Diagnostic only, ill-conditioning is reported and never acted upon
    if n >= NUM_COEFFS {
        if let Ok(condition) = condition_number(&phi) {
            tracing::debug!(samples = n, condition, "built regression features");
        }
    }

    Ok(phi)
}

/// Regression matrix for every sample of `segment`
///
/// # Errors
/// See [`build_features`].
pub fn segment_features(segment: &Segment, basis: Basis) -> Result<Array2<f64>> {
    build_features(segment.temperature(), segment.flow(), segment.u1(), basis)
}
