use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::SVD;

use crate::Result;

/// Fill the first element of a one-step-delayed series from its successor
///
/// Every quantity defined through the one-step delay model has no valid value at index `0`;
/// by convention it mirrors index `1`. Series shorter than two elements are left untouched.
///
/// # Examples
///
/// ```
/// use scr_saturation::math::mirror_first;
///
/// let mut values = vec![f64::NAN, 2., 3.];
/// mirror_first(&mut values);
/// assert_eq!(values, vec![2., 2., 3.]);
/// ```
pub fn mirror_first(values: &mut [f64]) {
    if values.len() >= 2 {
        values[0] = values[1];
    }
}

/// Place one-step-ahead values on the time axis they predict
///
/// `ahead[k]` is the value at sample `k + 1`. The returned series has one more element than
/// `ahead`, with the leading element filled by [`mirror_first`].
pub fn align_one_step(ahead: &Array1<f64>) -> Array1<f64> {
    let mut aligned = Vec::with_capacity(ahead.len() + 1);
    aligned.push(f64::NAN);
    aligned.extend(ahead.iter().copied());
    mirror_first(&mut aligned);
    Array1::from(aligned)
}

/// Compute the weighted Gram matrix $\Phi^T W^T W \Phi$ for a diagonal weight matrix
///
/// `weights` holds the diagonal of $W$. Passing `None` is equivalent to $W = I$.
pub fn gram(phi: ArrayView2<f64>, weights: Option<ArrayView1<f64>>) -> Array2<f64> {
    weights.map_or_else(
        || phi.t().dot(&phi),
        |w| {
            let squared = w.mapv(|wi| wi * wi);
            let weighted = &phi * &squared.insert_axis(Axis(1));
            phi.t().dot(&weighted)
        },
    )
}

/// Evaluate $x^T M y$
pub fn quadratic_form(x: ArrayView1<f64>, m: ArrayView2<f64>, y: ArrayView1<f64>) -> f64 {
    x.dot(&m.dot(&y))
}

/// Ratio of the largest to the smallest singular value of `m`
///
/// # Errors
/// Returns an error if the singular value decomposition fails.
pub fn condition_number(m: &Array2<f64>) -> Result<f64> {
    let (_, singular_values, _) = m.svd(false, false)?;
    let largest = singular_values.iter().copied().fold(0.0, f64::max);
    let smallest = singular_values
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    Ok(largest / smallest)
}
