use thiserror::Error;

/// Custom error type for polysol
///
/// This error type wraps all possible errors that can occur when using polysol
#[derive(Error, Debug)]
pub enum PolysolError {
    #[error("Linear solver error: {0}")]
    LinearSolverError(#[from] LinearSolverError),
    #[error("ODE solver error: {0}")]
    OdeSolverError(#[from] OdeSolverError),
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors from the dense LU kernel
#[derive(Error, Debug)]
pub enum LinearSolverError {
    #[error("LU factorization has not been computed")]
    LuNotFactorized,
    #[error("Matrix is singular: zero pivot in column {column}")]
    SingularMatrix { column: usize },
    #[error("Matrix is not square: {nrows} x {ncols}")]
    MatrixNotSquare { nrows: usize, ncols: usize },
    #[error("Matrix of dimension {expected} is not compatible with vector of length {found}")]
    MatrixVectorNotCompatible { expected: usize, found: usize },
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors when advancing an ODE solution
#[derive(Debug, Error)]
pub enum OdeSolverError {
    #[error("Continuation call but the solver was never initialized with a first call")]
    UninitializedContinuation,
    #[error("Problem dimension increased on a continuation call: was {was}, now {now}")]
    DimensionIncreaseOnContinuation { was: usize, now: usize },
    #[error("Problem dimension must be greater than zero")]
    ZeroDimension,
    #[error("State vector has wrong length: expected {expected}, got {found}")]
    StateLengthMismatch { expected: usize, found: usize },
    #[error("Per-component tolerance has wrong length: expected {expected}, got {found}")]
    ToleranceSizeMismatch { expected: usize, found: usize },
    #[error("Negative tolerance for component {index}")]
    NegativeTolerance { index: usize },
    #[error("Target time {tout} is not ahead of the current time {t}")]
    TargetTimeBeforeCurrentTime { tout: f64, t: f64 },
    #[error("Target time {tout} is too close to the current time {t} to start the integration")]
    TargetTimeTooClose { tout: f64, t: f64 },
    #[error("Target time {tout} is behind the span already integrated past (t = {tp})")]
    TargetTimeBehindIntegratedSpan { tout: f64, tp: f64 },
    #[error("Critical time {tcrit} is behind the target or current time")]
    InvalidCriticalTimeOrdering { tcrit: f64 },
    #[error("Supplied initial step size points away from the target time")]
    NonPositiveStepDirection,
    #[error("{max_steps} steps taken on this call before reaching the target time (t = {t})")]
    TooManySteps { max_steps: usize, t: f64 },
    #[error("Error weight for component {index} became non-positive at t = {t}")]
    ZeroWeight { index: usize, t: f64 },
    #[error(
        "Requested accuracy is below machine precision at t = {t}: scale tolerances up by a factor of at least {factor}"
    )]
    ExcessPrecisionRequested { t: f64, factor: f64 },
    #[error("Internal time t = {t} with step size h = {h} makes t + h == t; step size underflow")]
    RepeatedTinyStep { t: f64, h: f64 },
    #[error(
        "Error test failed repeatedly or with the step size at its minimum (t = {t}, worst component {worst_component})"
    )]
    ErrorTestFailureAtMinStep { t: f64, worst_component: usize },
    #[error(
        "Corrector convergence failed repeatedly or with the step size at its minimum (t = {t}, worst component {worst_component})"
    )]
    CorrectorFailureAtMinStep { t: f64, worst_component: usize },
    #[error("Interpolation requested for derivative order {k}, but the current method order is {order}")]
    DenseOutputInvalidDerivative { k: usize, order: usize },
    #[error("Interpolation time {t} is outside the span of the last step [{t_lower}, {t_upper}]")]
    DenseOutputOutOfRange { t: f64, t_lower: f64, t_upper: f64 },
    #[error("Interpolation vector is not the correct length, expected {expected}, got {found}")]
    InterpolationVectorWrongSize { expected: usize, found: usize },
    #[error("Repeated occurrence of illegal inputs: apparent infinite loop, instance disabled")]
    RepeatedIllegalInput,
    #[error("Error: {0}")]
    Other(String),
}

#[macro_export]
macro_rules! linear_solver_error {
    ($variant:ident) => {
        $crate::error::PolysolError::from($crate::error::LinearSolverError::$variant)
    };
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::PolysolError::from($crate::error::LinearSolverError::$variant($($arg)*))
    };
}
