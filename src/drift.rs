use crate::features::{CONSTANT, CURVATURE, LINEAR};
use crate::identification::SaturationModel;
use crate::predict::WaldTest;
use crate::Result;

/// Whether `model` has a strictly concave, increasing and positive saturated efficiency
pub fn is_physical(model: &SaturationModel) -> bool {
    let theta = model.theta();
    theta[CURVATURE] < 0.0 && theta[LINEAR] > 0.0 && theta[CONSTANT] > 0.0
}

/// The first model with strictly physical coefficients, used as the baseline for drift tests
///
/// Models on the boundary of the sign constraints are skipped, as a coefficient pinned at zero
/// usually means the segment did not excite that part of the curve.
pub fn select_reference(models: &[SaturationModel]) -> Option<&SaturationModel> {
    let reference = models.iter().find(|model| is_physical(model));
    match reference {
        Some(model) => tracing::info!(segment = model.name(), "selected reference model"),
        None => tracing::warn!(candidates = models.len(), "no physical reference model"),
    }
    reference
}

/// Wald test of every model's coefficients against the reference coefficients
///
/// Each test uses the information matrix of the tested model, so the statistics of segments with
/// little saturated data are correspondingly small.
///
/// # Errors
/// Propagates the failure of [`SaturationModel::wald`].
pub fn drift_statistics(
    models: &[SaturationModel],
    reference: &SaturationModel,
) -> Result<Vec<WaldTest>> {
    models
        .iter()
        .map(|model| {
            let test = model.wald(reference.theta().view())?;
            tracing::debug!(
                segment = model.name(),
                reference = reference.name(),
                statistic = test.statistic,
                p_value = test.p_value,
                "drift test"
            );
            Ok(test)
        })
        .collect()
}
