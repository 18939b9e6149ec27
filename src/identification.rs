//! Saturated system identification of a single segment
//!
//! The pipeline runs as a sequence of typed states
//!
//! ```text
//! Raw -> Bounded -> Classified -> Refined -> Calibrated -> SaturationModel
//! ```
//!
//! Every transition consumes the previous state, so no stage can be skipped and a
//! [`SaturationModel`] only exists once its covariance is known.
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::classify::{classify_with_tolerance, Classification};
use crate::config::Config;
use crate::distributions::HalfNormalFit;
use crate::features::{segment_features, Basis};
use crate::math::align_one_step;
use crate::predict::{predict, Prediction, WaldTest};
use crate::segment::Segment;
use crate::solver::{
    InteriorPoint, LinearProgram, LinearProgramSolver, QuadraticProgram,
    QuadraticProgramSolver, SignConstraints, Simplex, SIGN_TOLERANCE,
};
use crate::uncertainty::{estimate_uncertainty, Uncertainty};
use crate::weighting::{operating_points, weights};
use crate::{Error, Result};

/// Features are built, nothing is fitted
pub struct Raw;

/// The upper envelope $\theta_{LP}$ is known
pub struct Bounded {
    theta_lp: Array1<f64>,
}

/// The near-saturated samples are known
pub struct Classified {
    theta_lp: Array1<f64>,
    classification: Classification,
}

/// The weighted refit $\theta$ is known
pub struct Refined {
    theta_lp: Array1<f64>,
    classification: Classification,
    weights: Array1<f64>,
    theta: Array1<f64>,
}

/// The residual distribution and coefficient covariance are known
pub struct Calibrated {
    theta_lp: Array1<f64>,
    classification: Classification,
    weights: Array1<f64>,
    theta: Array1<f64>,
    uncertainty: Uncertainty,
}

/// Identification of one segment, parameterised by how far the pipeline has progressed
pub struct Identification<'a, S> {
    segment: &'a Segment,
    config: Config,
    basis: Basis,
    /// One feature row per sample of the segment
    phi: Array2<f64>,
    state: S,
}

impl<'a, S> Identification<'a, S> {
    pub const fn segment(&self) -> &Segment {
        self.segment
    }

    pub const fn features(&self) -> &Array2<f64> {
        &self.phi
    }

    /// Feature rows that have a one-step-ahead efficiency to predict
    fn phi_ahead(&self) -> ArrayView2<'_, f64> {
        self.phi.slice(s![..-1, ..])
    }

    /// Efficiency one step ahead of each row of [`Self::phi_ahead`]
    fn targets(&self) -> ArrayView1<'_, f64> {
        self.segment.eta().slice(s![1..])
    }

    fn advance<T>(self, next: impl FnOnce(S) -> T) -> Identification<'a, T> {
        Identification {
            segment: self.segment,
            config: self.config,
            basis: self.basis,
            phi: self.phi,
            state: next(self.state),
        }
    }
}

impl<'a> Identification<'a, Raw> {
    /// # Errors
    /// - [`Error::InvalidConfig`] if `config` fails validation
    /// - [`Error::DegenerateFeatureMatrix`] if the segment contains non-positive flow
    pub fn new(segment: &'a Segment, config: &Config) -> Result<Self> {
        config.validate()?;
        let basis = Basis::from(config.basis);
        let phi = segment_features(segment, basis)?;
        Ok(Self {
            segment,
            config: *config,
            basis,
            phi,
            state: Raw,
        })
    }

    /// Fit the tightest envelope lying on or above every observed efficiency
    ///
    /// # Errors
    /// Propagates the failure of `solver`.
    pub fn bound(self, solver: &impl LinearProgramSolver) -> Result<Identification<'a, Bounded>> {
        let problem = LinearProgram::upper_bound(
            self.phi_ahead(),
            self.targets(),
            SignConstraints::default(),
        );
        let theta_lp = solver.solve_lp(&problem)?;
        tracing::debug!(
            segment = self.segment.name(),
            theta = ?theta_lp.to_vec(),
            objective = problem.objective_value(theta_lp.view()),
            "bounded saturated efficiency"
        );
        Ok(self.advance(|Raw| Bounded { theta_lp }))
    }
}

impl<'a> Identification<'a, Bounded> {
    pub const fn theta_lp(&self) -> &Array1<f64> {
        &self.state.theta_lp
    }

    /// Select the samples lying within `eps_max` below the envelope
    ///
    /// Samples on the envelope come back from the bounding program with residuals of either sign
    /// at round-off level, and are all classified with zero residual.
    pub fn classify(self) -> Identification<'a, Classified> {
        let eta_hat = self.phi_ahead().dot(&self.state.theta_lp);
        let targets = self.targets();
        let magnitude = targets.iter().fold(1.0, |acc: f64, h| acc.max(h.abs()));
        let classification = classify_with_tolerance(
            eta_hat.view(),
            targets,
            self.config.eps_max,
            SIGN_TOLERANCE * magnitude,
        );
        tracing::debug!(
            segment = self.segment.name(),
            saturated = classification.len(),
            of = eta_hat.len(),
            "classified near-saturated samples"
        );
        self.advance(|Bounded { theta_lp }| Classified {
            theta_lp,
            classification,
        })
    }
}

impl<'a> Identification<'a, Classified> {
    pub const fn classification(&self) -> &Classification {
        &self.state.classification
    }

    /// Weighted least squares refit of the envelope through the near-saturated samples
    ///
    /// # Errors
    /// - [`Error::InsufficientSamples`] if fewer than `min_samples` samples were classified
    /// - the failure of `solver`
    pub fn refine(
        self,
        solver: &impl QuadraticProgramSolver,
    ) -> Result<Identification<'a, Refined>> {
        let idx = &self.state.classification.idx;
        if idx.len() < self.config.min_samples {
            return Err(Error::InsufficientSamples {
                required: self.config.min_samples,
                found: idx.len(),
            });
        }

        let phi_idx = self.phi_ahead().select(Axis(0), idx);
        let h_idx = self.targets().select(Axis(0), idx);
        let points = operating_points(self.segment, idx);
        let weights = weights(points.view(), &self.config.weighting);

        let problem = QuadraticProgram::weighted_least_squares(
            phi_idx.view(),
            h_idx.view(),
            Some(weights.view()),
            SignConstraints::default(),
        );
        let theta = solver.solve_qp(&problem)?;
        tracing::debug!(
            segment = self.segment.name(),
            theta = ?theta.to_vec(),
            objective = problem.objective_value(theta.view()),
            "refined saturated efficiency"
        );

        Ok(self.advance(
            |Classified {
                 theta_lp,
                 classification,
             }| Refined {
                theta_lp,
                classification,
                weights,
                theta,
            },
        ))
    }
}

impl<'a> Identification<'a, Refined> {
    pub const fn theta(&self) -> &Array1<f64> {
        &self.state.theta
    }

    /// Fit the residual distribution of the refit and derive the coefficient covariance
    ///
    /// # Errors
    /// See [`estimate_uncertainty`].
    pub fn calibrate(self) -> Result<Identification<'a, Calibrated>> {
        let idx = &self.state.classification.idx;
        let phi_idx = self.phi_ahead().select(Axis(0), idx);
        let h_idx = self.targets().select(Axis(0), idx);
        let residuals = phi_idx.dot(&self.state.theta) - &h_idx;

        let uncertainty = estimate_uncertainty(
            residuals.view(),
            phi_idx.view(),
            &self.config.fit,
            self.config.min_samples,
        )?;

        Ok(self.advance(
            |Refined {
                 theta_lp,
                 classification,
                 weights,
                 theta,
             }| Calibrated {
                theta_lp,
                classification,
                weights,
                theta,
                uncertainty,
            },
        ))
    }
}

impl Identification<'_, Calibrated> {
    pub fn finish(self) -> SaturationModel {
        let fitted = align_one_step(&self.phi_ahead().dot(&self.state.theta));
        let Calibrated {
            theta_lp,
            classification,
            weights,
            theta,
            uncertainty,
        } = self.state;
        SaturationModel {
            name: self.segment.name().to_owned(),
            basis: self.basis,
            theta,
            theta_lp,
            classification,
            weights,
            uncertainty,
            fitted,
        }
    }
}

/// The identified saturation behaviour of one segment
///
/// Immutable once built. Predictions on other segments reuse its basis.
#[derive(Clone, Debug, PartialEq)]
pub struct SaturationModel {
    name: String,
    basis: Basis,
    theta: Array1<f64>,
    theta_lp: Array1<f64>,
    classification: Classification,
    weights: Array1<f64>,
    uncertainty: Uncertainty,
    fitted: Array1<f64>,
}

impl SaturationModel {
    /// Name of the segment the model was identified on
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn basis(&self) -> Basis {
        self.basis
    }

    /// Refined coefficients
    pub const fn theta(&self) -> &Array1<f64> {
        &self.theta
    }

    /// Coefficients of the upper envelope
    pub const fn theta_lp(&self) -> &Array1<f64> {
        &self.theta_lp
    }

    pub const fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Diagonal of $W$, one entry per classified sample
    pub const fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub const fn fit(&self) -> &HalfNormalFit {
        &self.uncertainty.fit
    }

    pub const fn lambda(&self) -> f64 {
        self.uncertainty.lambda
    }

    pub const fn information(&self) -> &Array2<f64> {
        &self.uncertainty.information
    }

    pub const fn covariance(&self) -> &Array2<f64> {
        &self.uncertainty.covariance
    }

    /// In-sample saturated efficiency on the time axis of the identified segment
    pub const fn fitted(&self) -> &Array1<f64> {
        &self.fitted
    }

    /// # Errors
    /// See [`predict`].
    pub fn predict_features(&self, phi: ArrayView2<f64>) -> Result<Prediction> {
        predict(self.theta.view(), self.covariance().view(), phi)
    }

    /// Predict the saturated efficiency of any segment
    ///
    /// # Errors
    /// Fails if the features of `segment` cannot be built.
    pub fn predict_segment(&self, segment: &Segment) -> Result<Prediction> {
        let phi = segment_features(segment, self.basis)?;
        self.predict_features(phi.view())
    }

    /// Test the refined coefficients against `theta_ref` under this model's information
    ///
    /// # Errors
    /// [`Error::LengthMismatch`] if `theta_ref` does not hold three coefficients.
    pub fn wald(&self, theta_ref: ArrayView1<f64>) -> Result<WaldTest> {
        WaldTest::new(self.theta.view(), theta_ref, self.information().view())
    }
}

/// Run the full pipeline on `segment` with the default solvers
///
/// # Errors
/// Returns the error of the first stage that fails.
pub fn identify(segment: &Segment, config: &Config) -> Result<SaturationModel> {
    let model = Identification::new(segment, config)?
        .bound(&Simplex)?
        .classify()
        .refine(&InteriorPoint::from(config.solver))?
        .calibrate()?
        .finish();
    tracing::info!(
        segment = model.name(),
        theta = ?model.theta().to_vec(),
        scale = model.fit().distribution.scale(),
        saturated = model.classification().len(),
        "identified saturation model"
    );
    Ok(model)
}

/// Identify every segment independently
///
/// Failures are reported per segment and do not affect the others. With the `parallel` feature
/// the segments are identified on the rayon thread pool.
pub fn identify_all(segments: &[Segment], config: &Config) -> Vec<Result<SaturationModel>> {
    let run = |segment: &Segment| {
        identify(segment, config).map_err(|e| {
            tracing::warn!(segment = segment.name(), error = %e, "identification failed");
            e
        })
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        segments.par_iter().map(run).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        segments.iter().map(run).collect()
    }
}
