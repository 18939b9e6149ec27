use ndarray::{Array1, ArrayView1};

/// Residuals against the saturation envelope and the samples lying close to it
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// $\epsilon[k] = \hat\eta[k] - \eta[k]$
    pub eps: Array1<f64>,
    /// Indices with $0 \leq \epsilon[k] \leq \epsilon_{max}$, ascending
    pub idx: Vec<usize>,
    pub eps_max: f64,
}

impl Classification {
    /// Number of near-saturated samples
    pub fn len(&self) -> usize {
        self.idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }

    /// Residuals of the near-saturated samples only
    pub fn saturated_eps(&self) -> Array1<f64> {
        self.idx.iter().map(|&k| self.eps[k]).collect()
    }
}

/// Label samples as near-saturated when the envelope prediction exceeds the observation by no
/// more than `eps_max`
///
/// Samples above the envelope (negative residual) and samples far below it are both left out.
/// Classification is a pure function of its inputs.
///
/// # Panics
/// If `eta_hat` and `eta_actual` differ in length.
pub fn classify(
    eta_hat: ArrayView1<f64>,
    eta_actual: ArrayView1<f64>,
    eps_max: f64,
) -> Classification {
    classify_with_tolerance(eta_hat, eta_actual, eps_max, 0.0)
}

/// [`classify`] for an envelope that is only known up to `tolerance`
///
/// Residuals in $[-\text{tolerance}, 0)$ are round-off of samples on the envelope. They are
/// snapped to zero and classified as saturated.
///
/// # Panics
/// If `eta_hat` and `eta_actual` differ in length.
pub fn classify_with_tolerance(
    eta_hat: ArrayView1<f64>,
    eta_actual: ArrayView1<f64>,
    eps_max: f64,
    tolerance: f64,
) -> Classification {
    assert_eq!(
        eta_hat.len(),
        eta_actual.len(),
        "predictions and observations must be aligned"
    );
    let eps = (&eta_hat - &eta_actual).mapv_into(|e| {
        if (-tolerance..0.0).contains(&e) {
            0.0
        } else {
            e
        }
    });
    let idx = eps
        .iter()
        .enumerate()
        .filter(|(_, e)| (0.0..=eps_max).contains(*e))
        .map(|(k, _)| k)
        .collect();

    Classification { eps, idx, eps_max }
}
