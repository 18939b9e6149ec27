use std::fmt;

/// The constrained program in which a solver failure occurred
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// The linear program producing the upper envelope of observed efficiency
    Bound,
    /// The weighted quadratic program refitting the saturated subset
    Refine,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bound => write!(f, "saturation bound (LP)"),
            Self::Refine => write!(f, "weighted refinement (QP)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{stage} is infeasible: {reason}")]
    InfeasibleProgram { stage: Stage, reason: String },

    #[error("insufficient saturated samples: {found} classified, at least {required} required")]
    InsufficientSamples { required: usize, found: usize },

    #[error("non-positive exhaust flow {flow} at sample {index}")]
    DegenerateFeatureMatrix { index: usize, flow: f64 },

    #[error("half-normal fit failed: {0}")]
    DistributionFitFailure(String),

    #[error("Fisher information matrix is singular or not positive definite")]
    SingularInformation,

    #[error("{stage} stopped at its iteration limit without converging")]
    IterationLimit { stage: Stage },

    #[error("series `{name}` has length {found}, expected {expected}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("solver error: {0}")]
    Solver(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("column `{0}` missing from time series")]
    MissingColumn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}
