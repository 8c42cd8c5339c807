//! # polysol
//!
//! polysol is a library for solving initial value problems for systems of
//! ordinary differential equations `dy/dt = f(t, y)`, aimed at problems whose
//! character is unknown or changes over the integration: it starts with a
//! non-stiff implicit Adams method and switches automatically to a stiff BDF
//! method (and back) as its internal stiffness estimates demand.
//!
//! ## Solving ODEs
//!
//! Supply the right-hand side as anything implementing [OdeRhs] (a [Closure]
//! wraps a plain Rust closure), choose relative and absolute tolerances
//! (scalar or per-component via [Tolerance]), and drive the integration with
//! [Lsoda::advance]. The task selector [Task] controls the stop condition:
//! integrate-and-interpolate to a target time, single internal steps, or
//! variants honouring a hard critical time the solver must not step past.
//! Repeated calls with [CallState::Continuation] advance the same integration
//! across a sequence of output times.
//!
//! ## Dense output
//!
//! Within the span of the last internal step the solution and its derivatives
//! up to the current method order are available from [Lsoda::interpolate] and
//! [Lsoda::interpolate_inplace] without re-integrating.
//!
//! ## Options and diagnostics
//!
//! [LsodaConfig] bundles the step bounds, order caps and per-call step budget.
//! [Lsoda::statistics] exposes the work counters accumulated so far, and the
//! solver reports its warnings (tiny steps, excess precision, method-switch
//! notices) through the [log] facade.

pub mod error;
pub mod jacobian;
pub mod linear_solver;
pub mod norm;
pub mod ode_solver;
pub mod op;
pub mod scalar;

pub use error::{LinearSolverError, OdeSolverError, PolysolError};
pub use linear_solver::DenseLu;
pub use ode_solver::{
    coefficients::{CorrectorKind, MethodFamily},
    config::LsodaConfig,
    lsoda::{CallState, Lsoda, Task},
    stepper::LsodaStatistics,
    tolerance::Tolerance,
};
pub use op::{closure::Closure, OdeRhs};
pub use scalar::{IndexType, Scalar};
