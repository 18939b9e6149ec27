use ndarray::{s, Array1, ArrayView1, ArrayView2};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::features::NUM_COEFFS;
use crate::math::{align_one_step, quadratic_form};
use crate::uncertainty::predictive_sigma;
use crate::{Error, Result};

/// Saturated efficiency and its one-sigma band on the time axis of a segment
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub eta: Array1<f64>,
    pub sigma: Array1<f64>,
}

impl Prediction {
    pub fn len(&self) -> usize {
        self.eta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eta.is_empty()
    }

    /// Lower edge of the band $\hat\eta - z \sigma$
    pub fn lower(&self, z: f64) -> Array1<f64> {
        &self.eta - &(&self.sigma * z)
    }

    /// Upper edge of the band $\hat\eta + z \sigma$
    pub fn upper(&self, z: f64) -> Array1<f64> {
        &self.eta + &(&self.sigma * z)
    }
}

/// Predict the saturated efficiency of every sample from the feature rows of a segment
///
/// Row $k$ predicts sample $k + 1$, so the final row is unused and the first sample mirrors the
/// second.
///
/// # Errors
/// - [`Error::InsufficientSamples`] with fewer than two feature rows
/// - [`Error::LengthMismatch`] if `theta`, `covariance` and `phi` are not three-coefficient
///   shaped
pub fn predict(
    theta: ArrayView1<f64>,
    covariance: ArrayView2<f64>,
    phi: ArrayView2<f64>,
) -> Result<Prediction> {
    check_coefficients(theta)?;
    if covariance.dim() != (NUM_COEFFS, NUM_COEFFS) {
        return Err(Error::LengthMismatch {
            name: "covariance",
            expected: NUM_COEFFS,
            found: covariance.nrows(),
        });
    }
    if phi.ncols() != NUM_COEFFS {
        return Err(Error::LengthMismatch {
            name: "features",
            expected: NUM_COEFFS,
            found: phi.ncols(),
        });
    }
    if phi.nrows() < 2 {
        return Err(Error::InsufficientSamples {
            required: 2,
            found: phi.nrows(),
        });
    }

    let ahead = phi.slice(s![..-1, ..]);
    let eta = align_one_step(&ahead.dot(&theta));
    let sigma = align_one_step(&predictive_sigma(ahead, covariance));

    Ok(Prediction { eta, sigma })
}

/// $(\theta - \theta_{ref})^T I_\theta (\theta - \theta_{ref})$
///
/// # Panics
/// If the arguments are not three-coefficient shaped.
pub fn wald_statistic(
    theta: ArrayView1<f64>,
    theta_ref: ArrayView1<f64>,
    information: ArrayView2<f64>,
) -> f64 {
    let difference = &theta - &theta_ref;
    quadratic_form(difference.view(), information, difference.view())
}

/// Outcome of a Wald test for equal coefficients
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WaldTest {
    pub statistic: f64,
    /// Upper tail of $\chi^2$ with one degree of freedom per coefficient
    pub p_value: f64,
}

impl WaldTest {
    /// # Errors
    /// [`Error::LengthMismatch`] if either coefficient vector does not hold three coefficients.
    pub fn new(
        theta: ArrayView1<f64>,
        theta_ref: ArrayView1<f64>,
        information: ArrayView2<f64>,
    ) -> Result<Self> {
        check_coefficients(theta)?;
        check_coefficients(theta_ref)?;
        let statistic = wald_statistic(theta, theta_ref, information);
        #[allow(clippy::cast_precision_loss)]
        let chi = ChiSquared::new(NUM_COEFFS as f64)
            .map_err(|e| Error::DistributionFitFailure(e.to_string()))?;
        Ok(Self {
            statistic,
            p_value: chi.sf(statistic.max(0.0)),
        })
    }

    /// Whether equal coefficients are rejected at significance `alpha`
    pub fn rejects(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

fn check_coefficients(theta: ArrayView1<f64>) -> Result<()> {
    if theta.len() == NUM_COEFFS {
        Ok(())
    } else {
        Err(Error::LengthMismatch {
            name: "theta",
            expected: NUM_COEFFS,
            found: theta.len(),
        })
    }
}
