use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Cholesky, Inverse, UPLO};

use crate::config::{FitConfig, MIN_SATURATED_SAMPLES};
use crate::distributions::{fit, HalfNormalFit};
use crate::math::{condition_number, gram, quadratic_form};
use crate::{Error, Result};

/// Smallest admissible squared pivot of the Cholesky factor of the equilibrated information
const RANK_TOLERANCE: f64 = 1e3 * f64::EPSILON;

/// Equilibrated condition numbers above this are reported as a warning
const WARN_CONDITION: f64 = 1e12;

/// Residual distribution and coefficient covariance of a refined fit
#[derive(Clone, Debug, PartialEq)]
pub struct Uncertainty {
    pub fit: HalfNormalFit,
    /// Rate $\lambda = \sqrt{\pi/2} / s$ of the fitted half-normal
    pub lambda: f64,
    /// $I_\theta$
    pub information: Array2<f64>,
    /// $C_\theta = I_\theta^{-1}$
    pub covariance: Array2<f64>,
}

/// Fisher information of the coefficients under half-normal residuals with rate `lambda`
///
/// $$
///     I_\theta = \frac{2 \lambda^2}{\pi} \Phi^T \Phi
/// $$
pub fn fisher_information(phi: ArrayView2<f64>, lambda: f64) -> Array2<f64> {
    gram(phi, None) * (2.0 * lambda * lambda / PI)
}

/// Fit the residual distribution and propagate it into a coefficient covariance
///
/// `eps_subset` holds the residuals of the classified samples and `phi_idx` their feature rows.
///
/// # Errors
/// - [`Error::InsufficientSamples`] with fewer than `min_samples` (and never fewer than four)
///   residuals
/// - [`Error::DistributionFitFailure`] if the half-normal fit fails
/// - [`Error::SingularInformation`] if the information matrix cannot be inverted to a
///   positive definite covariance
///
/// # Panics
/// If `eps_subset` and `phi_idx` disagree in length.
pub fn estimate_uncertainty(
    eps_subset: ArrayView1<f64>,
    phi_idx: ArrayView2<f64>,
    fit_config: &FitConfig,
    min_samples: usize,
) -> Result<Uncertainty> {
    assert_eq!(eps_subset.len(), phi_idx.nrows(), "one residual per feature row");
    let required = min_samples.max(MIN_SATURATED_SAMPLES);
    if eps_subset.len() < required {
        return Err(Error::InsufficientSamples {
            required,
            found: eps_subset.len(),
        });
    }

    let fit = fit(&eps_subset.to_vec(), fit_config)?;
    let lambda = fit.distribution.rate();

    let information = fisher_information(phi_idx, lambda);
    let covariance = invert_information(&information)?;

    tracing::debug!(
        lambda,
        scale = fit.distribution.scale(),
        "calibrated coefficient covariance"
    );

    Ok(Uncertainty {
        fit,
        lambda,
        information,
        covariance,
    })
}

/// Invert a symmetric information matrix through its unit-diagonal equilibration
///
/// With $D = \operatorname{diag}(I)^{1/2}$ the inverse is $D^{-1} (D^{-1} I D^{-1})^{-1} D^{-1}$.
/// Raw temperature features differ by orders of magnitude between columns, which leaves $I$
/// badly conditioned while the equilibrated matrix is not. Rank is decided on the pivots of the
/// equilibrated Cholesky factor, the condition number is only logged.
///
/// # Errors
/// [`Error::SingularInformation`] if a diagonal entry is not positive or the equilibrated matrix
/// is not numerically positive definite.
pub fn invert_information(information: &Array2<f64>) -> Result<Array2<f64>> {
    let scales = information.diag().mapv(f64::sqrt);
    if scales.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
        return Err(Error::SingularInformation);
    }
    let outer = scales
        .view()
        .insert_axis(Axis(1))
        .dot(&scales.view().insert_axis(Axis(0)));
    let equilibrated = information / &outer;

    let factor = equilibrated
        .cholesky(UPLO::Lower)
        .map_err(|_| Error::SingularInformation)?;
    let smallest_pivot = factor
        .diag()
        .iter()
        .map(|l| l * l)
        .fold(f64::INFINITY, f64::min);
    if smallest_pivot < RANK_TOLERANCE {
        tracing::warn!(smallest_pivot, "information matrix is rank deficient");
        return Err(Error::SingularInformation);
    }

    if let Ok(condition) = condition_number(&equilibrated) {
        if condition > WARN_CONDITION {
            tracing::warn!(condition, "information matrix is poorly conditioned");
        } else {
            tracing::debug!(condition, "information matrix conditioning");
        }
    }

    let inverse = equilibrated
        .inv()
        .map_err(|_| Error::SingularInformation)?;
    let covariance = inverse / &outer;
    // Symmetrise away the round-off of the inversion
    let covariance = (&covariance + &covariance.t()) * 0.5;
    if covariance.iter().any(|c| !c.is_finite()) {
        return Err(Error::SingularInformation);
    }
    Ok(covariance)
}

/// Predictive standard deviation $\sqrt{\phi C_\theta \phi^T}$ of every feature row
///
/// Round-off can push the quadratic form of a near-null row fractionally below zero; such values
/// are clamped so the result is never negative.
pub fn predictive_sigma(phi: ArrayView2<f64>, covariance: ArrayView2<f64>) -> Array1<f64> {
    phi.rows()
        .into_iter()
        .map(|row| quadratic_form(row, covariance, row).max(0.0).sqrt())
        .collect()
}
