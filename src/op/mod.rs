pub mod closure;

use nalgebra::DVector;

use crate::scalar::Scalar;

/// The right-hand side `f(t, y)` of the system `dy/dt = f(t, y)`.
///
/// The integrator calls this synchronously; any external context travels as
/// part of the implementing value (for closures, the captured environment).
/// Implementations must not mutate the integrator that is driving them.
pub trait OdeRhs<T: Scalar> {
    /// Number of states in the system.
    fn nstates(&self) -> usize;

    /// Compute `dydt = f(t, y)`.
    fn call_inplace(&mut self, t: T, y: &DVector<T>, dydt: &mut DVector<T>);
}
