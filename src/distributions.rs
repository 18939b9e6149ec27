use std::f64::consts::{PI, SQRT_2};

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::BrentOpt;
use statrs::function::erf::erf;
use statrs::function::gamma::gamma;

use crate::config::{FitConfig, FitMethod};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
/// A half-normal distribution with location fixed at zero
///
/// Residuals against a saturation envelope are one-sided by construction, so their magnitudes
/// are modelled as
///
/// $$
///     f(x) = \frac{\sqrt{2}}{s \sqrt{\pi}} \exp\left[-\frac{x^2}{2 s^2}\right], \quad x \geq 0
/// $$
pub struct HalfNormal {
    scale: f64,
}

pub trait Moment {
    fn moment(&self, n: usize) -> f64;
}

impl HalfNormal {
    /// # Errors
    /// [`Error::DistributionFitFailure`] unless `scale` is finite and strictly positive.
    pub fn new(scale: f64) -> Result<Self> {
        if scale.is_finite() && scale > 0.0 {
            Ok(Self { scale })
        } else {
            Err(Error::DistributionFitFailure(format!(
                "half-normal scale must be finite and positive, got {scale}"
            )))
        }
    }

    pub const fn scale(&self) -> f64 {
        self.scale
    }

    /// Rate parameter $\lambda = \sqrt{\pi / 2} / s$, the reciprocal of the mean
    pub fn rate(&self) -> f64 {
        (PI / 2.0).sqrt() / self.scale
    }

    pub fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            0.0
        } else {
            erf(x / (self.scale * SQRT_2))
        }
    }

    pub fn mean(&self) -> f64 {
        self.moment(1)
    }

    pub fn variance(&self) -> f64 {
        self.moment(2) - self.mean().powi(2)
    }
}

impl Moment for HalfNormal {
    /// The raw moments of a half-normal distribution are
    ///
    /// $$
    ///     E[x^n] = s^n 2^{n/2} \frac{\Gamma\left(\frac{n + 1}{2}\right)}{\sqrt{\pi}}
    /// $$
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn moment(&self, n: usize) -> f64 {
        let n_f = n as f64;
        self.scale.powi(n as i32) * 2.0f64.powf(n_f / 2.0) * gamma((n_f + 1.0) / 2.0) / PI.sqrt()
    }
}

/// Kolmogorov-Smirnov distance between the empirical distribution of `sorted` and a half-normal
/// of the given `scale`
///
/// `sorted` must be in ascending order.
#[allow(clippy::cast_precision_loss)]
pub fn ks_statistic(sorted: &[f64], scale: f64) -> f64 {
    let n = sorted.len() as f64;
    let distribution = HalfNormal { scale };
    sorted
        .iter()
        .enumerate()
        .map(|(ii, &x)| {
            let cdf = distribution.cdf(x);
            let above = (ii + 1) as f64 / n - cdf;
            let below = cdf - ii as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}

/// The fitted distribution together with its goodness of fit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HalfNormalFit {
    pub distribution: HalfNormal,
    /// Kolmogorov-Smirnov distance of the fitted distribution to the data
    pub ks_statistic: f64,
    pub samples: usize,
}

/// Closed form maximum likelihood scale $s = \sqrt{\frac{1}{n}\sum_k x_k^2}$
#[allow(clippy::cast_precision_loss)]
pub fn mle_scale(magnitudes: &[f64]) -> f64 {
    (magnitudes.iter().map(|x| x * x).sum::<f64>() / magnitudes.len() as f64).sqrt()
}

struct KsDistance<'a> {
    sorted: &'a [f64],
}

impl CostFunction for KsDistance<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, scale: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(ks_statistic(self.sorted, *scale))
    }
}

/// Search the scale minimising the Kolmogorov-Smirnov distance in a bracket around `seed`
///
/// TODO: the bracket spans one decade either side of the seed; heavy-tailed residual sets may
/// want it exposed through [`FitConfig`].
fn ks_scale(sorted: &[f64], seed: f64, config: &FitConfig) -> Result<f64> {
    let solver = BrentOpt::new(seed / 10.0, seed * 10.0);
    let mut executor = Executor::new(KsDistance { sorted }, solver)
        .configure(|state| state.max_iters(config.max_iters));
    if config.log_iterations {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }

    let res = executor
        .run()
        .map_err(|err| Error::DistributionFitFailure(err.to_string()))?;
    let state = res.state();
    if state.get_iter() >= config.max_iters {
        return Err(Error::DistributionFitFailure(format!(
            "scale search did not converge within {} iterations",
            config.max_iters
        )));
    }
    let best = state.get_best_param().copied().ok_or_else(|| {
        Error::DistributionFitFailure("scale search produced no estimate".into())
    })?;

    // The distance is not unimodal in general, never return something worse than the seed
    if ks_statistic(sorted, best) <= ks_statistic(sorted, seed) {
        Ok(best)
    } else {
        Ok(seed)
    }
}

/// Fit a zero-location half-normal distribution to residual magnitudes
///
/// Negative inputs are folded onto their magnitude. The likelihood estimate always seeds the
/// fit; with [`FitMethod::KolmogorovSmirnov`] it is then refined by minimising the KS distance.
///
/// # Errors
/// [`Error::DistributionFitFailure`] if there are no samples, any sample is not finite, every
/// sample is zero, or the scale search does not converge. No default scale is substituted.
pub fn fit(residuals: &[f64], config: &FitConfig) -> Result<HalfNormalFit> {
    if residuals.is_empty() {
        return Err(Error::DistributionFitFailure("no residuals to fit".into()));
    }
    if let Some(bad) = residuals.iter().find(|r| !r.is_finite()) {
        return Err(Error::DistributionFitFailure(format!(
            "residuals contain the non-finite value {bad}"
        )));
    }

    let mut sorted = residuals.iter().map(|r| r.abs()).collect::<Vec<_>>();
    sorted.sort_by(f64::total_cmp);

    let mle = mle_scale(&sorted);
    if !(mle > 0.0) {
        return Err(Error::DistributionFitFailure(
            "all residuals are zero, the scale is not identifiable".into(),
        ));
    }

    let scale = match config.method {
        FitMethod::MaximumLikelihood => mle,
        FitMethod::KolmogorovSmirnov => ks_scale(&sorted, mle, config)?,
    };
    let distribution = HalfNormal::new(scale)?;
    let ks_statistic = ks_statistic(&sorted, scale);
    tracing::debug!(
        method = ?config.method,
        scale,
        mle,
        ks_statistic,
        samples = sorted.len(),
        "fitted half-normal residual distribution"
    );

    Ok(HalfNormalFit {
        distribution,
        ks_statistic,
        samples: sorted.len(),
    })
}
