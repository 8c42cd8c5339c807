use crate::scalar::Scalar;

/// Options bundle for [crate::Lsoda].
///
/// Every field has a conservative default; construct with
/// `LsodaConfig::default()` and override what you need.
#[derive(Debug, Clone)]
pub struct LsodaConfig<T> {
    /// Budget of internal steps per `advance` call before giving up.
    pub max_steps_per_call: usize,
    /// How many `t + h == t` warnings to emit before the condition becomes a
    /// fatal error.
    pub max_tiny_step_warnings: usize,
    /// Upper bound on the step size magnitude. `None` leaves it unbounded.
    pub max_step_size: Option<T>,
    /// Lower bound on the step size magnitude.
    pub min_step_size: T,
    /// First step size to attempt. `None` derives one from the problem.
    pub initial_step_size: Option<T>,
    /// Maximum order for the non-stiff (Adams) family, clamped to 12.
    pub max_order_nonstiff: usize,
    /// Maximum order for the stiff (BDF) family, clamped to 5.
    pub max_order_stiff: usize,
    /// Log a notice whenever the solver switches method family.
    pub verbose_method_switch: bool,
}

impl<T: Scalar> Default for LsodaConfig<T> {
    fn default() -> Self {
        Self {
            max_steps_per_call: 5000,
            max_tiny_step_warnings: 10,
            max_step_size: None,
            min_step_size: T::zero(),
            initial_step_size: None,
            max_order_nonstiff: 12,
            max_order_stiff: 5,
            verbose_method_switch: false,
        }
    }
}
