use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use microlp::{ComparisonOp, LinearExpr, OptimizationDirection, Variable};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::config::SolverConfig;
use crate::features::NUM_COEFFS;
use crate::math::gram;
use crate::{Error, Result, Stage};

/// Violations of a sign constraint below this magnitude are solver round-off
pub const SIGN_TOLERANCE: f64 = 1e-6;

/// Admissible sign of one coefficient
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sign {
    NonPositive,
    NonNegative,
    Free,
}

impl Sign {
    const fn bounds(self) -> (f64, f64) {
        match self {
            Self::NonPositive => (f64::NEG_INFINITY, 0.0),
            Self::NonNegative => (0.0, f64::INFINITY),
            Self::Free => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }
}

/// Sign constraints on $\theta$ encoding the shape of the saturated efficiency curve
///
/// The default is concave in temperature (curvature $\leq 0$), rising (linear $\geq 0$) and with a
/// non-negative constant term. Both the bounding and the refining programs use the same set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignConstraints(pub [Sign; NUM_COEFFS]);

impl Default for SignConstraints {
    fn default() -> Self {
        Self([Sign::NonPositive, Sign::NonNegative, Sign::NonNegative])
    }
}

impl SignConstraints {
    /// Whether every coefficient of `theta` has its admissible sign, up to `tolerance`
    pub fn satisfied_by(&self, theta: ArrayView1<f64>, tolerance: f64) -> bool {
        theta.iter().zip(self.0).all(|(&value, sign)| {
            let (lower, upper) = sign.bounds();
            value >= lower - tolerance && value <= upper + tolerance
        })
    }

    /// Rows $G$ and right hand side $h$ of the equivalent inequality system $G\theta \leq h$
    fn inequalities(&self) -> (Vec<[f64; NUM_COEFFS]>, Vec<f64>) {
        let rows = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(ii, sign)| {
                let coefficient = match sign {
                    Sign::NonPositive => 1.0,
                    Sign::NonNegative => -1.0,
                    Sign::Free => return None,
                };
                let mut row = [0.0; NUM_COEFFS];
                row[ii] = coefficient;
                Some(row)
            })
            .collect::<Vec<_>>();
        let rhs = vec![0.0; rows.len()];
        (rows, rhs)
    }

    /// Snap round-off violations back onto the feasible set
    fn project(&self, mut theta: Array1<f64>, stage: Stage) -> Result<Array1<f64>> {
        if !self.satisfied_by(theta.view(), SIGN_TOLERANCE) {
            return Err(Error::InfeasibleProgram {
                stage,
                reason: format!("solver returned {theta} violating sign constraints {self:?}"),
            });
        }
        for (value, sign) in theta.iter_mut().zip(self.0) {
            let (lower, upper) = sign.bounds();
            *value = value.clamp(lower, upper);
        }
        Ok(theta)
    }
}

/// A linear program for the tightest elementwise upper bound
///
/// $$
///     \min_\theta \sum_k \Phi[k] \theta \quad \text{s.t.} \quad \Phi \theta \geq H
/// $$
///
/// plus the sign constraints. Rows of $\Phi$ are fixed data, only $\theta$ is optimised.
#[derive(Clone, Debug)]
pub struct LinearProgram {
    objective: Array1<f64>,
    matrix: Array2<f64>,
    lower: Array1<f64>,
    signs: SignConstraints,
}

impl LinearProgram {
    /// # Panics
    /// If `phi` and `h` do not have the same number of rows.
    pub fn upper_bound(phi: ArrayView2<f64>, h: ArrayView1<f64>, signs: SignConstraints) -> Self {
        assert_eq!(phi.nrows(), h.len(), "one target per feature row");
        Self {
            objective: phi.sum_axis(Axis(0)),
            matrix: phi.to_owned(),
            lower: h.to_owned(),
            signs,
        }
    }

    pub fn objective_value(&self, theta: ArrayView1<f64>) -> f64 {
        self.objective.dot(&theta)
    }

    pub const fn signs(&self) -> &SignConstraints {
        &self.signs
    }
}

/// A convex quadratic program
///
/// $$
///     \min_\theta \frac{1}{2} \theta^T P \theta + q^T \theta
/// $$
///
/// subject to the sign constraints.
#[derive(Clone, Debug)]
pub struct QuadraticProgram {
    hessian: Array2<f64>,
    linear: Array1<f64>,
    signs: SignConstraints,
}

impl QuadraticProgram {
    /// The weighted least squares problem between $\Phi\theta$ and $H$
    ///
    /// With $W$ diagonal (`weights` holds its diagonal) the objective is
    /// $$
    ///     \frac{1}{2}\theta^T \Phi^T W^T W \Phi \theta - H^T W^T W \Phi \theta
    /// $$
    ///
    /// # Panics
    /// If `phi`, `h` and `weights` do not agree in length.
    pub fn weighted_least_squares(
        phi: ArrayView2<f64>,
        h: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
        signs: SignConstraints,
    ) -> Self {
        assert_eq!(phi.nrows(), h.len(), "one target per feature row");
        let hessian = gram(phi, weights);
        let weighted_targets = weights.map_or_else(|| h.to_owned(), |w| &h * &w * &w);
        let linear = -phi.t().dot(&weighted_targets);
        Self {
            hessian,
            linear,
            signs,
        }
    }

    pub fn objective_value(&self, theta: ArrayView1<f64>) -> f64 {
        0.5 * theta.dot(&self.hessian.dot(&theta)) + self.linear.dot(&theta)
    }

    pub const fn signs(&self) -> &SignConstraints {
        &self.signs
    }
}

pub trait LinearProgramSolver {
    /// # Errors
    /// [`Error::InfeasibleProgram`] if the constraints are contradictory, otherwise a solver
    /// specific failure.
    fn solve_lp(&self, problem: &LinearProgram) -> Result<Array1<f64>>;
}

pub trait QuadraticProgramSolver {
    /// # Errors
    /// [`Error::InfeasibleProgram`] if the constraints are contradictory,
    /// [`Error::IterationLimit`] if the solver gives up, otherwise a solver specific failure.
    fn solve_qp(&self, problem: &QuadraticProgram) -> Result<Array1<f64>>;
}

/// Dense simplex method
///
/// Returns a vertex of the optimal face, so coefficients are exact where the optimum is not
/// unique. Columns are scaled to unit magnitude before solving.
///
/// The simplex terminates after finitely many pivots and `microlp` exposes no iteration cap, so
/// [`SolverConfig::max_iter`] does not apply. Use [`InteriorPoint`], which also implements
/// [`LinearProgramSolver`], when the bounding program needs a bounded number of iterations.
#[derive(Clone, Copy, Debug, Default)]
pub struct Simplex;

impl LinearProgramSolver for Simplex {
    fn solve_lp(&self, problem: &LinearProgram) -> Result<Array1<f64>> {
        let scales = column_scales(problem.matrix.view());
        let objective = &problem.objective / &scales;
        let matrix = &problem.matrix / &scales;

        let mut lp = microlp::Problem::new(OptimizationDirection::Minimize);
        let vars: Vec<Variable> = objective
            .iter()
            .zip(problem.signs.0)
            .map(|(&cost, sign)| lp.add_var(cost, sign.bounds()))
            .collect();

        for (k, (row, &rhs)) in matrix
            .rows()
            .into_iter()
            .zip(&problem.lower)
            .enumerate()
        {
            if row.iter().all(|&coeff| coeff == 0.0) {
                if rhs > 0.0 {
                    return Err(Error::InfeasibleProgram {
                        stage: Stage::Bound,
                        reason: format!("sample {k} has an all-zero feature row but target {rhs}"),
                    });
                }
                continue;
            }
            let mut expr = LinearExpr::empty();
            for (&var, &coeff) in vars.iter().zip(row) {
                expr.add(var, coeff);
            }
            lp.add_constraint(expr, ComparisonOp::Ge, rhs);
        }

        let solution = lp.solve().map_err(|err| match err {
            microlp::Error::Infeasible => Error::InfeasibleProgram {
                stage: Stage::Bound,
                reason: "no coefficients bound every sample under the sign constraints".into(),
            },
            other => Error::Solver(other.to_string()),
        })?;
        tracing::debug!(objective = solution.objective(), "solved bounding program");

        let y = vars.iter().map(|&var| solution[var]).collect::<Array1<f64>>();
        problem.signs.project(y / &scales, Stage::Bound)
    }
}

/// Primal-dual interior point method for programs with linear inequality constraints
#[derive(Clone, Copy, Debug)]
pub struct InteriorPoint {
    max_iter: u32,
    tolerance: f64,
}

impl Default for InteriorPoint {
    fn default() -> Self {
        Self::from(SolverConfig::default())
    }
}

impl From<SolverConfig> for InteriorPoint {
    fn from(config: SolverConfig) -> Self {
        Self {
            max_iter: config.max_iter,
            tolerance: config.tolerance,
        }
    }
}

/// Convert a dense matrix to compressed sparse column form
///
/// Clarabel reads only the upper triangle of the quadratic cost, so `upper_triangle` drops the
/// strictly lower entries.
fn to_csc(m: ArrayView2<f64>, upper_triangle: bool) -> CscMatrix<f64> {
    let (rows, cols) = m.dim();
    let mut colptr = Vec::with_capacity(cols + 1);
    let mut rowval = vec![];
    let mut nzval = vec![];
    colptr.push(0);
    for jj in 0..cols {
        let last_row = if upper_triangle { (jj + 1).min(rows) } else { rows };
        for ii in 0..last_row {
            let value = m[[ii, jj]];
            if value != 0.0 {
                rowval.push(ii);
                nzval.push(value);
            }
        }
        colptr.push(rowval.len());
    }
    CscMatrix::new(rows, cols, colptr, rowval, nzval)
}

impl InteriorPoint {
    /// Solve $\min \frac{1}{2}\theta^T P \theta + q^T\theta$ subject to $A\theta \leq b$
    fn solve(
        &self,
        hessian: ArrayView2<f64>,
        linear: ArrayView1<f64>,
        inequalities: ArrayView2<f64>,
        rhs: &[f64],
        stage: Stage,
    ) -> Result<Array1<f64>> {
        let p = to_csc(hessian, true);
        let a = to_csc(inequalities, false);
        let q = linear.to_vec();
        let cones = if rhs.is_empty() {
            vec![]
        } else {
            vec![SupportedConeT::NonnegativeConeT(rhs.len())]
        };

        let settings = DefaultSettingsBuilder::default()
            .verbose(false)
            .max_iter(self.max_iter)
            .tol_feas(self.tolerance)
            .tol_gap_abs(self.tolerance)
            .tol_gap_rel(self.tolerance)
            .build()
            .map_err(|err| Error::Solver(err.to_string()))?;

        let mut solver = DefaultSolver::new(&p, &q, &a, rhs, &cones, settings);
        solver.solve();

        match solver.solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {
                tracing::debug!(
                    %stage,
                    objective = solver.solution.obj_val,
                    "solved interior point program"
                );
                Ok(Array1::from(solver.solution.x.clone()))
            }
            SolverStatus::PrimalInfeasible => Err(Error::InfeasibleProgram {
                stage,
                reason: "interior point method certified primal infeasibility".into(),
            }),
            SolverStatus::DualInfeasible => Err(Error::Solver(format!(
                "{stage} is unbounded below"
            ))),
            SolverStatus::MaxIterations | SolverStatus::MaxTime => {
                Err(Error::IterationLimit { stage })
            }
            other => Err(Error::Solver(format!("{stage} terminated with {other:?}"))),
        }
    }
}

fn stack(upper: ArrayView2<f64>, rows: &[[f64; NUM_COEFFS]]) -> Array2<f64> {
    let mut stacked = Array2::zeros((upper.nrows() + rows.len(), NUM_COEFFS));
    stacked
        .slice_mut(ndarray::s![..upper.nrows(), ..])
        .assign(&upper);
    for (ii, row) in rows.iter().enumerate() {
        for (jj, &value) in row.iter().enumerate() {
            stacked[[upper.nrows() + ii, jj]] = value;
        }
    }
    stacked
}

/// Per-column scale bringing the largest magnitude of every column of `m` to one
///
/// Solving for $y = D\theta$ leaves the sign constraints unchanged since $D > 0$.
fn column_scales(m: ArrayView2<f64>) -> Array1<f64> {
    m.map_axis(Axis(0), |column| {
        let largest = column.iter().fold(0.0, |acc: f64, value| acc.max(value.abs()));
        if largest > 0.0 && largest.is_finite() {
            largest
        } else {
            1.0
        }
    })
}

/// $D = \operatorname{diag}(P)^{1/2}$, with unit scale for empty columns
fn hessian_scales(hessian: ArrayView2<f64>) -> Array1<f64> {
    hessian.diag().mapv(|value| {
        let scale = value.sqrt();
        if scale > 0.0 && scale.is_finite() {
            scale
        } else {
            1.0
        }
    })
}

impl QuadraticProgramSolver for InteriorPoint {
    fn solve_qp(&self, problem: &QuadraticProgram) -> Result<Array1<f64>> {
        let (rows, rhs) = problem.signs.inequalities();
        let inequalities = stack(Array2::zeros((0, NUM_COEFFS)).view(), &rows);
        let scales = hessian_scales(problem.hessian.view());
        let outer = scales
            .view()
            .insert_axis(Axis(1))
            .dot(&scales.view().insert_axis(Axis(0)));
        let y = self.solve(
            (&problem.hessian / &outer).view(),
            (&problem.linear / &scales).view(),
            inequalities.view(),
            &rhs,
            Stage::Refine,
        )?;
        problem.signs.project(y / &scales, Stage::Refine)
    }
}

impl LinearProgramSolver for InteriorPoint {
    fn solve_lp(&self, problem: &LinearProgram) -> Result<Array1<f64>> {
        let (rows, sign_rhs) = problem.signs.inequalities();
        let scales = column_scales(problem.matrix.view());
        // Phi theta >= H  <=>  -Phi theta <= -H
        let negated = problem.matrix.mapv(|value| -value) / &scales;
        let inequalities = stack(negated.view(), &rows);
        let mut rhs = problem.lower.mapv(|value| -value).to_vec();
        rhs.extend(sign_rhs);

        let y = self.solve(
            Array2::zeros((NUM_COEFFS, NUM_COEFFS)).view(),
            (&problem.objective / &scales).view(),
            inequalities.view(),
            &rhs,
            Stage::Bound,
        )?;
        problem.signs.project(y / &scales, Stage::Bound)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array, Array1};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_isaac::Isaac64Rng;

    use super::{
        InteriorPoint, LinearProgram, LinearProgramSolver, QuadraticProgram,
        QuadraticProgramSolver, Sign, SignConstraints, Simplex,
    };
    use crate::config::SolverConfig;
    use crate::{Error, Stage};

    #[test]
    fn upper_bound_of_a_line_is_the_line_itself() {
        let phi = arr2(&[[1., 0., 1.], [1., 1., 1.], [1., 2., 1.]]);
        let h = arr1(&[1., 2., 3.]);
        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());

        let theta = Simplex.solve_lp(&problem).unwrap();

        for (computed, expected) in theta.iter().zip([0., 1., 1.]) {
            approx::assert_abs_diff_eq!(*computed, expected, epsilon = 1e-9);
        }
        let bound = phi.dot(&theta);
        for (b, target) in bound.iter().zip(h.iter()) {
            assert!(b >= &(target - 1e-9));
        }
    }

    #[test]
    fn contradictory_bounds_are_reported_as_infeasible() {
        // A zero row with a positive target can never be bounded
        let phi = arr2(&[[0., 0., 0.], [1., 1., 1.]]);
        let h = arr1(&[1., 0.]);
        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());
        assert!(matches!(
            Simplex.solve_lp(&problem),
            Err(Error::InfeasibleProgram {
                stage: Stage::Bound,
                ..
            })
        ));

        // Only the curvature term is non-zero, and it must be non-positive
        let phi = arr2(&[[1., 0., 0.], [2., 0., 0.]]);
        let h = arr1(&[1., 1.]);
        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());
        assert!(matches!(
            Simplex.solve_lp(&problem),
            Err(Error::InfeasibleProgram { .. })
        ));
    }

    #[test]
    fn simplex_and_interior_point_agree_on_the_optimal_bound() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let n = 40;
        let x = Array::random_using(n, Uniform::new(-1., 1.), &mut rng);
        let scale = Array::random_using(n, Uniform::new(0.5, 1.5), &mut rng);
        let noise = Array::random_using(n, Uniform::new(0., 0.3), &mut rng);
        let phi = Array::from_shape_fn((n, 3), |(k, j)| match j {
            0 => scale[k] * 2.0f64.mul_add(x[k] * x[k], -1.),
            1 => scale[k] * x[k],
            _ => scale[k],
        });
        let truth = arr1(&[-0.2, 0.3, 1.0]);
        let h: Array1<f64> = phi.dot(&truth) - noise;

        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());
        let vertex = Simplex.solve_lp(&problem).unwrap();
        let interior = InteriorPoint::default().solve_lp(&problem).unwrap();

        approx::assert_relative_eq!(
            problem.objective_value(vertex.view()),
            problem.objective_value(interior.view()),
            max_relative = 1e-5
        );
        for theta in [&vertex, &interior] {
            assert!(problem.signs().satisfied_by(theta.view(), 0.));
            let bound: Array1<f64> = phi.dot(theta);
            for (b, target) in bound.iter().zip(h.iter()) {
                assert!(*b >= target - 1e-6);
            }
        }
    }

    #[test]
    fn bounding_with_an_iteration_cap_reports_the_limit() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let phi = Array::random_using((40, 3), Uniform::new(0.5, 1.5), &mut rng);
        let h = Array::random_using(40, Uniform::new(0., 1.), &mut rng);
        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());

        let capped = InteriorPoint::from(SolverConfig {
            max_iter: 1,
            tolerance: 1e-8,
        });
        assert!(matches!(
            capped.solve_lp(&problem),
            Err(Error::IterationLimit {
                stage: Stage::Bound
            })
        ));
        assert!(InteriorPoint::default().solve_lp(&problem).is_ok());
    }

    #[test]
    fn raw_temperature_columns_are_bounded_like_centred_ones() {
        // The same envelope in raw [T^2, T, 1] coordinates
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let temperature: Array1<f64> = Array::random_using(60, Uniform::new(450., 700.), &mut rng);
        let noise = Array::random_using(60, Uniform::new(0., 0.02), &mut rng);
        let phi = Array::from_shape_fn((60, 3), |(k, j)| temperature[k].powi(2 - j as i32));
        let truth = arr1(&[-1.527e-6, 2.443e-3, 0.1]);
        let h: Array1<f64> = phi.dot(&truth) - noise;

        let problem = LinearProgram::upper_bound(phi.view(), h.view(), SignConstraints::default());
        let vertex = Simplex.solve_lp(&problem).unwrap();
        let interior = InteriorPoint::default().solve_lp(&problem).unwrap();

        for theta in [&vertex, &interior] {
            assert!(problem.signs().satisfied_by(theta.view(), 0.));
            let bound = phi.dot(theta);
            for (b, target) in bound.iter().zip(h.iter()) {
                assert!(*b >= target - 1e-6, "bound {b} below {target}");
            }
        }
        approx::assert_relative_eq!(
            problem.objective_value(vertex.view()),
            problem.objective_value(interior.view()),
            max_relative = 1e-5
        );
    }

    #[test]
    fn unconstrained_least_squares_recovers_exact_coefficients() {
        let phi = arr2(&[[1., 0., 1.], [1., 1., 1.], [4., 2., 1.], [9., 3., 1.]]);
        let truth = arr1(&[-0.5, 2., 1.]);
        let h = phi.dot(&truth);
        let problem = QuadraticProgram::weighted_least_squares(
            phi.view(),
            h.view(),
            None,
            SignConstraints::default(),
        );

        let theta = InteriorPoint::default().solve_qp(&problem).unwrap();
        for (computed, expected) in theta.iter().zip(truth.iter()) {
            approx::assert_abs_diff_eq!(computed, expected, epsilon = 1e-5);
        }
    }

    #[test]
    fn active_sign_constraint_pins_coefficient_at_zero() {
        // Data generated with positive curvature must be fitted with curvature at the bound
        let phi = arr2(&[[1., 0., 1.], [1., 1., 1.], [4., 2., 1.], [9., 3., 1.]]);
        let h = phi.dot(&arr1(&[1., 0., 1.]));
        let weights = arr1(&[1., 2., 1., 0.5]);
        let problem = QuadraticProgram::weighted_least_squares(
            phi.view(),
            h.view(),
            Some(weights.view()),
            SignConstraints::default(),
        );

        let theta = InteriorPoint::default().solve_qp(&problem).unwrap();
        assert!(problem.signs().satisfied_by(theta.view(), 0.));
        approx::assert_abs_diff_eq!(theta[0], 0., epsilon = 1e-6);
    }

    #[test]
    fn free_coefficients_impose_no_inequality() {
        let signs = SignConstraints([Sign::Free, Sign::Free, Sign::Free]);
        assert!(signs.satisfied_by(arr1(&[5., -5., -5.]).view(), 0.));
        assert!(!SignConstraints::default().satisfied_by(arr1(&[5., -5., -5.]).view(), 0.));
    }
}
