use nalgebra::DVector;

use crate::error::{OdeSolverError, PolysolError};
use crate::norm::{column_norm, vector_norm};
use crate::ode_solver::coefficients::MethodFamily;
use crate::ode_solver::config::LsodaConfig;
use crate::ode_solver::stepper::{LsodaStatistics, StepFailure, Stepper};
use crate::ode_solver::tolerance::{error_weights_inplace, Tolerance};
use crate::op::OdeRhs;
use crate::scalar::Scalar;

/// What condition ends an [Lsoda::advance] call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Task<T: Scalar> {
    /// Integrate past the target time, then interpolate back to it.
    Normal,
    /// Take exactly one internal step and return.
    OneStep,
    /// Stop at the first internal point at or past the target time, without
    /// interpolating.
    StopAtOrPast,
    /// As [Task::Normal], but never step past the given critical time.
    NormalWithCritical(T),
    /// As [Task::OneStep], but never step past the given critical time.
    OneStepWithCritical(T),
}

/// How this [Lsoda::advance] call relates to the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Start a fresh integration from `(t, y)`; any previous state is
    /// discarded.
    FirstCall,
    /// Continue the previous integration towards a new target time.
    Continuation,
    /// Continue, but tolerances, bounds or the problem dimension changed
    /// since the last call.
    ContinuationWithChanges,
}

/// A variable-order, variable-step integrator for `dy/dt = f(t, y)` that
/// switches automatically between a non-stiff (implicit Adams) and a stiff
/// (BDF) method family as the problem character changes.
///
/// The algorithm follows the classic polyalgorithm of Hindmarsh and Petzold:
/// a Nordsieck-form predictor-corrector with a functional corrector for the
/// Adams family and a chord/Newton corrector with an internally approximated
/// dense Jacobian for the BDF family, step and order chosen after every
/// accepted step from weighted local-error estimates.
///
/// # References
///
/// \[1\] Hindmarsh, A. C. (1983). ODEPACK, a systematized collection of ODE solvers. Scientific Computing, 55-64.
/// \[2\] Petzold, L. R. (1983). Automatic selection of methods for solving stiff and nonstiff systems of ordinary differential equations. SIAM J. Sci. Stat. Comput. 4(1), 136-148.
///
/// # Example
///
/// ```
/// use nalgebra::dvector;
/// use polysol::{CallState, Closure, Lsoda, Task, Tolerance};
///
/// let mut rhs = Closure::new(1, |_t, y: &nalgebra::DVector<f64>, dydt: &mut nalgebra::DVector<f64>| {
///     dydt[0] = -y[0];
/// });
/// let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
/// let mut y = dvector![1.0];
/// let mut t = 0.0;
/// solver
///     .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
///     .unwrap();
/// assert!((y[0] - (-1.0f64).exp()).abs() < 1e-5);
/// ```
pub struct Lsoda<T: Scalar> {
    config: LsodaConfig<T>,
    rtol: Tolerance<T>,
    atol: Tolerance<T>,
    stepper: Option<Stepper<T>>,
    illegal_input_count: usize,
    poisoned: bool,
    tiny_step_warnings: usize,
    switch_time: Option<T>,
}

const MAX_ILLEGAL_INPUTS: usize = 5;

fn illegal_input(
    count: &mut usize,
    poisoned: &mut bool,
    err: OdeSolverError,
) -> PolysolError {
    if *count == MAX_ILLEGAL_INPUTS {
        *poisoned = true;
        log::error!("repeated occurrence of illegal input, apparent infinite loop; instance disabled");
        return PolysolError::from(OdeSolverError::RepeatedIllegalInput);
    }
    *count += 1;
    PolysolError::from(err)
}

fn restore_caller_state<T: Scalar>(stepper: &Stepper<T>, y: &mut DVector<T>, t: &mut T) {
    for i in 0..stepper.nstates {
        y[i] = stepper.yh.data[(i, 0)];
    }
    *t = stepper.t;
}

/// Dense-output evaluation against a stepper's history; shared between the
/// public interpolation methods and the driver loop.
fn interpolate_from<T: Scalar>(
    stepper: &Stepper<T>,
    t: T,
    k: usize,
    dky: &mut DVector<T>,
) -> Result<(), OdeSolverError> {
    if dky.len() != stepper.nstates {
        return Err(OdeSolverError::InterpolationVectorWrongSize {
            expected: stepper.nstates,
            found: dky.len(),
        });
    }
    if k > stepper.order {
        return Err(OdeSolverError::DenseOutputInvalidDerivative {
            k,
            order: stepper.order,
        });
    }
    let hundred_eps = <T as Scalar>::from_f64(100.0) * T::EPSILON;
    let mut tfuzz = hundred_eps * (stepper.t.abs() + stepper.h_last.abs());
    if stepper.h_last < T::zero() {
        tfuzz = -tfuzz;
    }
    let tp = stepper.t - stepper.h_last - tfuzz;
    let tn1 = stepper.t + tfuzz;
    if (t - tp) * (t - tn1) > T::zero() {
        let a = tp.to_f64().unwrap();
        let b = stepper.t.to_f64().unwrap();
        return Err(OdeSolverError::DenseOutputOutOfRange {
            t: t.to_f64().unwrap(),
            t_lower: a.min(b),
            t_upper: a.max(b),
        });
    }
    let s = (t - stepper.t) / stepper.h;
    stepper
        .yh
        .interpolate_unchecked(s, k, stepper.order, stepper.h, dky);
    Ok(())
}

impl<T: Scalar> Lsoda<T> {
    pub fn new(rtol: Tolerance<T>, atol: Tolerance<T>) -> Self {
        Self::with_config(rtol, atol, LsodaConfig::default())
    }

    pub fn with_config(rtol: Tolerance<T>, atol: Tolerance<T>, config: LsodaConfig<T>) -> Self {
        Self {
            config,
            rtol,
            atol,
            stepper: None,
            illegal_input_count: 0,
            poisoned: false,
            tiny_step_warnings: 0,
            switch_time: None,
        }
    }

    pub fn config(&self) -> &LsodaConfig<T> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut LsodaConfig<T> {
        &mut self.config
    }

    /// Replace the tolerances. Pair with [CallState::ContinuationWithChanges]
    /// on the next call so they are revalidated.
    pub fn set_tolerances(&mut self, rtol: Tolerance<T>, atol: Tolerance<T>) {
        self.rtol = rtol;
        self.atol = atol;
    }

    pub fn statistics(&self) -> LsodaStatistics {
        self.stepper
            .as_ref()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Current method order.
    pub fn order(&self) -> usize {
        self.stepper.as_ref().map(|s| s.order).unwrap_or(0)
    }

    /// Active method family.
    pub fn method(&self) -> Option<MethodFamily> {
        self.stepper.as_ref().map(|s| s.method)
    }

    /// Step size of the last successful internal step.
    pub fn last_step_size(&self) -> Option<T> {
        self.stepper.as_ref().map(|s| s.h_last)
    }

    /// Internal time actually reached, which for some tasks lies past the
    /// returned time.
    pub fn internal_time(&self) -> Option<T> {
        self.stepper.as_ref().map(|s| s.t)
    }

    /// Time of the most recent method-family switch, if one has occurred.
    pub fn switch_time(&self) -> Option<T> {
        self.switch_time
    }

    fn illegal(&mut self, err: OdeSolverError) -> PolysolError {
        illegal_input(&mut self.illegal_input_count, &mut self.poisoned, err)
    }

    /// Evaluate the solution at a time within the span of the last internal
    /// step.
    pub fn interpolate(&self, t: T) -> Result<DVector<T>, PolysolError> {
        let stepper = self
            .stepper
            .as_ref()
            .ok_or(OdeSolverError::UninitializedContinuation)?;
        let mut dky = DVector::zeros(stepper.nstates);
        interpolate_from(stepper, t, 0, &mut dky)?;
        Ok(dky)
    }

    /// Evaluate the `k`-th derivative of the solution at a time within the
    /// span of the last internal step, `k` up to the current method order.
    pub fn interpolate_inplace(
        &self,
        t: T,
        k: usize,
        dky: &mut DVector<T>,
    ) -> Result<(), PolysolError> {
        let stepper = self
            .stepper
            .as_ref()
            .ok_or(OdeSolverError::UninitializedContinuation)?;
        interpolate_from(stepper, t, k, dky)?;
        Ok(())
    }

    /// Advance the solution towards `tout` according to `task`.
    ///
    /// On success the reached time is written to `t` and the solution at that
    /// time to `y`. On a fatal integration failure, `t` and `y` receive the
    /// last consistent internal state before the error is returned; the
    /// instance stays usable for a continuation call with adjusted options.
    pub fn advance<F: OdeRhs<T>>(
        &mut self,
        rhs: &mut F,
        y: &mut DVector<T>,
        t: &mut T,
        tout: T,
        task: Task<T>,
        call: CallState,
    ) -> Result<(), PolysolError> {
        let zero = T::zero();
        let one = T::one();

        if self.poisoned {
            return Err(PolysolError::from(OdeSolverError::RepeatedIllegalInput));
        }
        let n = rhs.nstates();

        if call != CallState::FirstCall && self.stepper.is_none() {
            return Err(self.illegal(OdeSolverError::UninitializedContinuation));
        }
        if n == 0 {
            return Err(self.illegal(OdeSolverError::ZeroDimension));
        }
        if y.len() != n {
            return Err(self.illegal(OdeSolverError::StateLengthMismatch {
                expected: n,
                found: y.len(),
            }));
        }
        if tout <= *t {
            return Err(self.illegal(OdeSolverError::TargetTimeBeforeCurrentTime {
                tout: tout.to_f64().unwrap(),
                t: t.to_f64().unwrap(),
            }));
        }
        if call != CallState::Continuation {
            if let Err(e) = self.rtol.validate(n).and_then(|_| self.atol.validate(n)) {
                return Err(self.illegal(e));
            }
        }
        let hmxi = match self.config.max_step_size {
            Some(hmax) if hmax > zero => one / hmax,
            Some(_) => {
                return Err(self.illegal(OdeSolverError::Other(
                    "max_step_size must be positive".to_string(),
                )))
            }
            None => zero,
        };
        if self.config.min_step_size < zero {
            return Err(self.illegal(OdeSolverError::Other(
                "min_step_size must be non-negative".to_string(),
            )));
        }

        if call == CallState::ContinuationWithChanges {
            let old_n = self.stepper.as_ref().unwrap().nstates;
            if n > old_n {
                return Err(self.illegal(OdeSolverError::DimensionIncreaseOnContinuation {
                    was: old_n,
                    now: n,
                }));
            }
            let stepper = self.stepper.as_mut().unwrap();
            if n < old_n {
                stepper.truncate(n);
            }
            stepper.flag_params_changed();
        }

        if call == CallState::FirstCall {
            self.start_fresh(rhs, y, t, tout, task, hmxi)?;
        }

        {
            let stepper = self.stepper.as_mut().unwrap();
            stepper.hmin = self.config.min_step_size;
            stepper.hmxi = hmxi;
        }
        let nslast = self
            .stepper
            .as_ref()
            .unwrap()
            .stats
            .number_of_steps;

        // check the task's stop condition before taking any step on a
        // continuation call
        if call != CallState::FirstCall {
            let stepper = self.stepper.as_mut().unwrap();
            match task {
                Task::Normal => {
                    if (stepper.t - tout) * stepper.h >= zero {
                        return match interpolate_from(stepper, tout, 0, y) {
                            Ok(()) => {
                                *t = tout;
                                self.illegal_input_count = 0;
                                Ok(())
                            }
                            Err(e) => Err(illegal_input(
                                &mut self.illegal_input_count,
                                &mut self.poisoned,
                                e,
                            )),
                        };
                    }
                }
                Task::OneStep => {}
                Task::StopAtOrPast => {
                    let tp = stepper.t
                        - stepper.h_last * (one + <T as Scalar>::from_f64(100.0) * T::EPSILON);
                    if (tp - tout) * stepper.h > zero {
                        let err = OdeSolverError::TargetTimeBehindIntegratedSpan {
                            tout: tout.to_f64().unwrap(),
                            tp: tp.to_f64().unwrap(),
                        };
                        return Err(illegal_input(
                            &mut self.illegal_input_count,
                            &mut self.poisoned,
                            err,
                        ));
                    }
                    if (stepper.t - tout) * stepper.h >= zero {
                        restore_caller_state(stepper, y, t);
                        self.illegal_input_count = 0;
                        return Ok(());
                    }
                }
                Task::NormalWithCritical(tcrit) => {
                    if (stepper.t - tcrit) * stepper.h > zero
                        || (tcrit - tout) * stepper.h < zero
                    {
                        let err = OdeSolverError::InvalidCriticalTimeOrdering {
                            tcrit: tcrit.to_f64().unwrap(),
                        };
                        return Err(illegal_input(
                            &mut self.illegal_input_count,
                            &mut self.poisoned,
                            err,
                        ));
                    }
                    if (stepper.t - tout) * stepper.h >= zero {
                        return match interpolate_from(stepper, tout, 0, y) {
                            Ok(()) => {
                                *t = tout;
                                self.illegal_input_count = 0;
                                Ok(())
                            }
                            Err(e) => Err(illegal_input(
                                &mut self.illegal_input_count,
                                &mut self.poisoned,
                                e,
                            )),
                        };
                    }
                }
                Task::OneStepWithCritical(tcrit) => {
                    if (stepper.t - tcrit) * stepper.h > zero {
                        let err = OdeSolverError::InvalidCriticalTimeOrdering {
                            tcrit: tcrit.to_f64().unwrap(),
                        };
                        return Err(illegal_input(
                            &mut self.illegal_input_count,
                            &mut self.poisoned,
                            err,
                        ));
                    }
                    let hmx = stepper.t.abs() + stepper.h.abs();
                    if (stepper.t - tcrit).abs() <= <T as Scalar>::from_f64(100.0) * T::EPSILON * hmx {
                        restore_caller_state(stepper, y, t);
                        *t = tcrit;
                        self.illegal_input_count = 0;
                        return Ok(());
                    }
                    let tnext = stepper.t + stepper.h * (one + <T as Scalar>::from_f64(4.0) * T::EPSILON);
                    if (tnext - tcrit) * stepper.h > zero {
                        stepper
                            .request_step_size((tcrit - stepper.t) * (one - <T as Scalar>::from_f64(4.0) * T::EPSILON));
                    }
                }
            }
        }

        // the integration loop: preamble checks, one internal step, then the
        // task's stop condition
        loop {
            let stepper = self.stepper.as_mut().unwrap();

            let before_first_step =
                call == CallState::FirstCall && stepper.stats.number_of_steps == 0;
            if !before_first_step {
                if stepper.stats.number_of_steps - nslast >= self.config.max_steps_per_call {
                    let err = OdeSolverError::TooManySteps {
                        max_steps: self.config.max_steps_per_call,
                        t: stepper.t.to_f64().unwrap(),
                    };
                    restore_caller_state(stepper, y, t);
                    self.illegal_input_count = 0;
                    return Err(PolysolError::from(err));
                }
                error_weights_inplace(
                    &self.rtol,
                    &self.atol,
                    |i| stepper.yh.data[(i, 0)],
                    &mut stepper.ewt,
                );
                for i in 0..n {
                    if stepper.ewt[i] <= zero {
                        let err = OdeSolverError::ZeroWeight {
                            index: i,
                            t: stepper.t.to_f64().unwrap(),
                        };
                        restore_caller_state(stepper, y, t);
                        self.illegal_input_count = 0;
                        return Err(PolysolError::from(err));
                    }
                    stepper.ewt[i] = one / stepper.ewt[i];
                }
            }

            // is the requested accuracy representable at the current scale?
            let tolsf = T::EPSILON * column_norm(&stepper.yh.data, 0, &stepper.ewt);
            if tolsf > one {
                let factor = (tolsf * <T as Scalar>::from_f64(2.0)).to_f64().unwrap();
                let err = OdeSolverError::ExcessPrecisionRequested {
                    t: stepper.t.to_f64().unwrap(),
                    factor,
                };
                if stepper.stats.number_of_steps == 0 {
                    log::warn!(
                        "at the start of the problem, too much accuracy requested for the machine precision; suggested tolerance scaling factor {factor}"
                    );
                    return Err(illegal_input(
                        &mut self.illegal_input_count,
                        &mut self.poisoned,
                        err,
                    ));
                }
                log::warn!(
                    "too much accuracy requested for the machine precision at t = {}; suggested tolerance scaling factor {factor}",
                    stepper.t
                );
                restore_caller_state(stepper, y, t);
                self.illegal_input_count = 0;
                return Err(PolysolError::from(err));
            }

            // h too small to make measurable progress?
            if stepper.t + stepper.h == stepper.t {
                self.tiny_step_warnings += 1;
                if self.tiny_step_warnings <= self.config.max_tiny_step_warnings {
                    log::warn!(
                        "internal t = {} and h = {} are such that t + h = t on the next step; the solver will continue anyway",
                        stepper.t,
                        stepper.h
                    );
                } else {
                    let err = OdeSolverError::RepeatedTinyStep {
                        t: stepper.t.to_f64().unwrap(),
                        h: stepper.h.to_f64().unwrap(),
                    };
                    restore_caller_state(stepper, y, t);
                    self.illegal_input_count = 0;
                    return Err(PolysolError::from(err));
                }
            }

            if let Err(failure) = stepper.step(rhs) {
                // diagnose the worst-offending component before unwinding
                let mut big = zero;
                let mut worst = 0;
                for i in 0..n {
                    let size = stepper.acor[i].abs() * stepper.ewt[i];
                    if size > big {
                        big = size;
                        worst = i;
                    }
                }
                let t_reached = stepper.t.to_f64().unwrap();
                restore_caller_state(stepper, y, t);
                self.illegal_input_count = 0;
                let err = match failure {
                    StepFailure::ErrorTest => OdeSolverError::ErrorTestFailureAtMinStep {
                        t: t_reached,
                        worst_component: worst,
                    },
                    StepFailure::Convergence => OdeSolverError::CorrectorFailureAtMinStep {
                        t: t_reached,
                        worst_component: worst,
                    },
                };
                return Err(PolysolError::from(err));
            }

            // a method switch happened inside the step: record it, apply the
            // new family's order cap and have the next step complete the
            // switch
            if stepper.method_last != Some(stepper.method) {
                self.switch_time = Some(stepper.t);
                stepper.stats.number_of_method_switches += 1;
                stepper.max_order = match stepper.method {
                    MethodFamily::Adams => stepper.max_order_nonstiff,
                    MethodFamily::Bdf => stepper.max_order_stiff,
                };
                stepper.flag_params_changed();
                if self.config.verbose_method_switch {
                    match stepper.method {
                        MethodFamily::Bdf => log::info!(
                            "a switch to the stiff method family has occurred at t = {}",
                            stepper.t
                        ),
                        MethodFamily::Adams => log::info!(
                            "a switch to the non-stiff method family has occurred at t = {}",
                            stepper.t
                        ),
                    }
                }
            }

            match task {
                Task::Normal => {
                    if (stepper.t - tout) * stepper.h < zero {
                        continue;
                    }
                    interpolate_from(stepper, tout, 0, y).map_err(PolysolError::from)?;
                    *t = tout;
                    self.illegal_input_count = 0;
                    return Ok(());
                }
                Task::OneStep => {
                    restore_caller_state(stepper, y, t);
                    self.illegal_input_count = 0;
                    return Ok(());
                }
                Task::StopAtOrPast => {
                    if (stepper.t - tout) * stepper.h >= zero {
                        restore_caller_state(stepper, y, t);
                        self.illegal_input_count = 0;
                        return Ok(());
                    }
                }
                Task::NormalWithCritical(tcrit) => {
                    if (stepper.t - tout) * stepper.h >= zero {
                        interpolate_from(stepper, tout, 0, y).map_err(PolysolError::from)?;
                        *t = tout;
                        self.illegal_input_count = 0;
                        return Ok(());
                    }
                    let hmx = stepper.t.abs() + stepper.h.abs();
                    if (stepper.t - tcrit).abs() <= <T as Scalar>::from_f64(100.0) * T::EPSILON * hmx {
                        restore_caller_state(stepper, y, t);
                        *t = tcrit;
                        self.illegal_input_count = 0;
                        return Ok(());
                    }
                    let tnext = stepper.t + stepper.h * (one + <T as Scalar>::from_f64(4.0) * T::EPSILON);
                    if (tnext - tcrit) * stepper.h > zero {
                        stepper.request_step_size(
                            (tcrit - stepper.t) * (one - <T as Scalar>::from_f64(4.0) * T::EPSILON),
                        );
                    }
                }
                Task::OneStepWithCritical(tcrit) => {
                    let hmx = stepper.t.abs() + stepper.h.abs();
                    let hit = (stepper.t - tcrit).abs() <= <T as Scalar>::from_f64(100.0) * T::EPSILON * hmx;
                    restore_caller_state(stepper, y, t);
                    if hit {
                        *t = tcrit;
                    }
                    self.illegal_input_count = 0;
                    return Ok(());
                }
            }
        }
    }

    /// Initializations for a fresh integration: allocate the session, make
    /// the first rhs evaluation, load the history and derive the initial step
    /// size.
    fn start_fresh<F: OdeRhs<T>>(
        &mut self,
        rhs: &mut F,
        y: &DVector<T>,
        t: &T,
        tout: T,
        task: Task<T>,
        hmxi: T,
    ) -> Result<(), PolysolError> {
        let zero = T::zero();
        let one = T::one();
        let n = rhs.nstates();

        let mxordn = self.config.max_order_nonstiff.clamp(1, 12);
        let mxords = self.config.max_order_stiff.clamp(1, 5);

        let mut h0 = self.config.initial_step_size.unwrap_or(zero);
        if h0 != zero && (tout - *t) * h0 < zero {
            return Err(self.illegal(OdeSolverError::NonPositiveStepDirection));
        }
        if let Task::NormalWithCritical(tcrit) | Task::OneStepWithCritical(tcrit) = task {
            if (tcrit - tout) * (tout - *t) < zero {
                return Err(self.illegal(OdeSolverError::InvalidCriticalTimeOrdering {
                    tcrit: tcrit.to_f64().unwrap(),
                }));
            }
            if h0 != zero && (*t + h0 - tcrit) * h0 > zero {
                h0 = tcrit - *t;
            }
        }

        let mut stepper = Stepper::new(n, mxordn, mxords);
        stepper.t = *t;
        stepper.order = 1;
        stepper.h = one;

        rhs.call_inplace(*t, y, &mut stepper.savf);
        stepper.stats.number_of_rhs_evaluations = 1;
        for i in 0..n {
            stepper.yh.data[(i, 0)] = y[i];
            stepper.yh.data[(i, 1)] = stepper.savf[i];
        }

        error_weights_inplace(&self.rtol, &self.atol, |i| y[i], &mut stepper.ewt);
        for i in 0..n {
            if stepper.ewt[i] <= zero {
                return Err(PolysolError::from(OdeSolverError::ZeroWeight {
                    index: i,
                    t: t.to_f64().unwrap(),
                }));
            }
            stepper.ewt[i] = one / stepper.ewt[i];
        }

        if h0 == zero {
            // h0^-2 = 1/(tol * w0^2) + tol * |f0|_w^2, bounded by the target
            // distance
            let tdist = (tout - *t).abs();
            let w0 = t.abs().max(tout.abs());
            if tdist < <T as Scalar>::from_f64(2.0) * T::EPSILON * w0 {
                return Err(self.illegal(OdeSolverError::TargetTimeTooClose {
                    tout: tout.to_f64().unwrap(),
                    t: t.to_f64().unwrap(),
                }));
            }
            let mut tol = self.rtol.max_value(n);
            if tol <= zero {
                for i in 0..n {
                    let ayi = y[i].abs();
                    if ayi != zero {
                        tol = tol.max(self.atol.get(i) / ayi);
                    }
                }
            }
            tol = tol.max(<T as Scalar>::from_f64(100.0) * T::EPSILON).min(<T as Scalar>::from_f64(1.0e-3));
            let fnorm = vector_norm(&stepper.savf, &stepper.ewt);
            let sum = one / (tol * w0 * w0) + tol * fnorm * fnorm;
            h0 = one / sum.sqrt();
            h0 = h0.min(tdist);
            if tout < *t {
                h0 = -h0;
            }
        }
        let rh = h0.abs() * hmxi;
        if rh > one {
            h0 /= rh;
        }
        stepper.h = h0;
        for i in 0..n {
            stepper.yh.data[(i, 1)] *= h0;
        }

        self.tiny_step_warnings = 0;
        self.switch_time = None;
        self.stepper = Some(stepper);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{OdeSolverError, PolysolError};
    use crate::ode_solver::coefficients::MethodFamily;
    use crate::ode_solver::config::LsodaConfig;
    use crate::op::closure::Closure;
    use nalgebra::{dvector, DVector};

    fn decay_closure() -> Closure<f64, impl FnMut(f64, &DVector<f64>, &mut DVector<f64>)> {
        Closure::new(1, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -y[0];
        })
    }

    #[test]
    fn exponential_decay_meets_tolerance() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;

        solver
            .advance(&mut rhs, &mut y, &mut t, 0.5, Task::Normal, CallState::FirstCall)
            .unwrap();
        assert_eq!(t, 0.5);
        assert!((y[0] - (-0.5f64).exp()).abs() < 2e-5, "y(0.5) = {}", y[0]);

        // dense-output first derivative at the output time must match -y
        let mut dky = dvector![0.0];
        solver.interpolate_inplace(0.5, 1, &mut dky).unwrap();
        assert!((dky[0] + y[0]).abs() < 1e-4, "y'(0.5) = {}", dky[0]);

        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::Continuation)
            .unwrap();
        assert_eq!(t, 1.0);
        assert!((y[0] - (-1.0f64).exp()).abs() < 2e-5, "y(1) = {}", y[0]);
    }

    #[test]
    fn interpolation_is_idempotent() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 0.7, Task::Normal, CallState::FirstCall)
            .unwrap();
        let first = solver.interpolate(0.7).unwrap();
        let second = solver.interpolate(0.7).unwrap();
        assert_eq!(first, second);
        let mut d1 = dvector![0.0];
        let mut d2 = dvector![0.0];
        solver.interpolate_inplace(0.7, 1, &mut d1).unwrap();
        solver.interpolate_inplace(0.7, 1, &mut d2).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn stop_at_or_past_makes_monotonic_progress() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 0.3, Task::StopAtOrPast, CallState::FirstCall)
            .unwrap();
        assert!(t >= 0.3);
        assert_eq!(t, solver.internal_time().unwrap());
        let t_prev = t;
        solver
            .advance(&mut rhs, &mut y, &mut t, 0.6, Task::StopAtOrPast, CallState::Continuation)
            .unwrap();
        assert!(t >= 0.6);
        assert!(t > t_prev);
        assert_eq!(t, solver.internal_time().unwrap());
    }

    #[test]
    fn order_and_step_bounds_hold_after_every_decision() {
        let mut rhs = decay_closure();
        let config = LsodaConfig {
            max_step_size: Some(0.05),
            ..LsodaConfig::default()
        };
        let mut solver = Lsoda::with_config(Tolerance::from(1e-8), Tolerance::from(1e-8), config);
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let mut call = CallState::FirstCall;
        while t < 2.0 {
            let tout = t + 5.0;
            solver
                .advance(&mut rhs, &mut y, &mut t, tout, Task::OneStep, call)
                .unwrap();
            call = CallState::Continuation;
            let order = solver.order();
            assert!((1..=12).contains(&order), "order = {order}");
            let h = solver.last_step_size().unwrap().abs();
            assert!(h <= 0.05 * (1.0 + 1e-9), "h = {h}");
        }
    }

    #[test]
    fn harmonic_oscillator_conserves_energy() {
        let mut rhs = Closure::new(2, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        });
        let mut solver = Lsoda::new(Tolerance::from(1e-8), Tolerance::from(1e-8));
        let mut y = dvector![1.0, 0.0];
        let mut t = 0.0;
        let mut call = CallState::FirstCall;
        for k in 1..=10 {
            let tout = 2.0 * k as f64;
            solver
                .advance(&mut rhs, &mut y, &mut t, tout, Task::Normal, call)
                .unwrap();
            call = CallState::Continuation;
            let energy = y[0] * y[0] + y[1] * y[1];
            assert!((energy - 1.0).abs() < 1e-4, "energy drift {} at t = {t}", energy - 1.0);
        }
        assert!((y[0] - 20.0f64.cos()).abs() < 1e-4);
        assert!((y[1] + 20.0f64.sin()).abs() < 1e-4);
    }

    #[test]
    fn min_step_forces_error_test_failure_not_a_retry_loop() {
        // a step pinned at the minimum that the corrector accepts but the
        // error test rejects must surface as an error-test failure
        let mut rhs = decay_closure();
        let config = LsodaConfig {
            min_step_size: 0.3,
            initial_step_size: Some(0.3),
            ..LsodaConfig::default()
        };
        let mut solver = Lsoda::with_config(Tolerance::from(1e-2), Tolerance::from(1e-2), config);
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap_err();
        assert!(
            matches!(
                err,
                PolysolError::OdeSolverError(OdeSolverError::ErrorTestFailureAtMinStep { .. })
            ),
            "unexpected error: {err}"
        );
        // the last consistent state is handed back
        assert_eq!(t, 0.0);
        assert_eq!(y[0], 1.0);
    }

    #[test]
    fn min_step_with_diverging_corrector_reports_corrector_failure() {
        let mut rhs = Closure::new(1, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -30.0 * y[0];
        });
        let config = LsodaConfig {
            min_step_size: 0.3,
            initial_step_size: Some(0.3),
            ..LsodaConfig::default()
        };
        let mut solver = Lsoda::with_config(Tolerance::from(1e-2), Tolerance::from(1e-2), config);
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap_err();
        assert!(
            matches!(
                err,
                PolysolError::OdeSolverError(OdeSolverError::CorrectorFailureAtMinStep { .. })
            ),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn stiff_problem_switches_to_bdf_and_meets_tolerance() {
        // y' = -1000 (y - 1), y(0) = 0: a mildly stiff linear problem that
        // the non-stiff family can only track with stability-capped steps
        let mut rhs = Closure::new(1, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -1000.0 * (y[0] - 1.0);
        });
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![0.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        assert_eq!(t, 1.0);
        assert!((y[0] - 1.0).abs() < 1e-3, "y(1) = {}", y[0]);
        assert!(solver.statistics().number_of_method_switches >= 1);
        assert_eq!(solver.method(), Some(MethodFamily::Bdf));
        assert!(solver.switch_time().is_some());
        assert!(solver.statistics().number_of_jacobian_evaluations > 0);
    }

    #[test]
    fn nonstiff_problem_never_switches() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-8), Tolerance::from(1e-8));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 10.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        assert_eq!(solver.statistics().number_of_method_switches, 0);
        assert_eq!(solver.method(), Some(MethodFamily::Adams));
        assert_eq!(solver.statistics().number_of_jacobian_evaluations, 0);
    }

    #[test]
    fn step_budget_is_enforced_and_the_instance_stays_usable() {
        let mut rhs = decay_closure();
        let config = LsodaConfig {
            max_steps_per_call: 3,
            ..LsodaConfig::default()
        };
        let mut solver = Lsoda::with_config(Tolerance::from(1e-8), Tolerance::from(1e-8), config);
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(&mut rhs, &mut y, &mut t, 10.0, Task::Normal, CallState::FirstCall)
            .unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::TooManySteps { .. })
        ));
        // the caller got the last consistent point, strictly inside the span
        assert!(t > 0.0 && t < 10.0);
        assert!((y[0] - (-t).exp()).abs() < 1e-5);

        solver.config_mut().max_steps_per_call = 5000;
        solver
            .advance(&mut rhs, &mut y, &mut t, 10.0, Task::Normal, CallState::Continuation)
            .unwrap();
        assert_eq!(t, 10.0);
        assert!((y[0] - (-10.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn repeated_illegal_inputs_disable_the_instance() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 1.0;
        for _ in 0..5 {
            let err = solver
                .advance(&mut rhs, &mut y, &mut t, 0.5, Task::Normal, CallState::FirstCall)
                .unwrap_err();
            assert!(matches!(
                err,
                PolysolError::OdeSolverError(OdeSolverError::TargetTimeBeforeCurrentTime { .. })
            ));
        }
        for _ in 0..2 {
            let err = solver
                .advance(&mut rhs, &mut y, &mut t, 0.5, Task::Normal, CallState::FirstCall)
                .unwrap_err();
            assert!(matches!(
                err,
                PolysolError::OdeSolverError(OdeSolverError::RepeatedIllegalInput)
            ));
        }
    }

    #[test]
    fn continuation_before_any_first_call_is_rejected() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::Continuation)
            .unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::UninitializedContinuation)
        ));
    }

    #[test]
    fn critical_time_is_never_overstepped() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(
                &mut rhs,
                &mut y,
                &mut t,
                0.5,
                Task::NormalWithCritical(0.5),
                CallState::FirstCall,
            )
            .unwrap();
        assert!((t - 0.5).abs() < 1e-12);
        assert!(solver.internal_time().unwrap() <= 0.5 * (1.0 + 1e-9));
        assert!((y[0] - (-0.5f64).exp()).abs() < 2e-5);
    }

    #[test]
    fn critical_time_behind_target_is_rejected() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(
                &mut rhs,
                &mut y,
                &mut t,
                0.5,
                Task::NormalWithCritical(0.4),
                CallState::FirstCall,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::InvalidCriticalTimeOrdering { .. })
        ));
    }

    #[test]
    fn dimension_increase_on_continuation_is_rejected() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 0.5, Task::Normal, CallState::FirstCall)
            .unwrap();

        let mut rhs2 = Closure::new(2, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -y[0];
            dydt[1] = -y[1];
        });
        let mut y2 = dvector![1.0, 1.0];
        let err = solver
            .advance(
                &mut rhs2,
                &mut y2,
                &mut t,
                1.0,
                Task::Normal,
                CallState::ContinuationWithChanges,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::DimensionIncreaseOnContinuation { .. })
        ));
    }

    #[test]
    fn zero_tolerances_yield_zero_weight_error() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(0.0), Tolerance::from(0.0));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        let err = solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::ZeroWeight { .. })
        ));
    }

    #[test]
    fn dense_output_outside_the_last_step_is_rejected() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        let tn = solver.internal_time().unwrap();
        let hu = solver.last_step_size().unwrap();
        let err = solver.interpolate(tn - hu - 0.5).unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::DenseOutputOutOfRange { .. })
        ));
        // a derivative order above the current method order is also invalid
        let err = solver.interpolate_inplace(tn, 13, &mut dvector![0.0]).unwrap_err();
        assert!(matches!(
            err,
            PolysolError::OdeSolverError(OdeSolverError::DenseOutputInvalidDerivative { .. })
        ));
    }

    #[test]
    fn statistics_count_the_work() {
        let mut rhs = decay_closure();
        let mut solver = Lsoda::new(Tolerance::from(1e-6), Tolerance::from(1e-6));
        let mut y = dvector![1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        let stats = solver.statistics();
        assert!(stats.number_of_steps > 0);
        assert!(stats.number_of_rhs_evaluations > stats.number_of_steps);
    }

    #[test]
    fn per_component_tolerances_are_honoured() {
        let mut rhs = Closure::new(2, |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -y[0];
            dydt[1] = -2.0 * y[1];
        });
        let mut solver = Lsoda::new(
            Tolerance::from(dvector![1e-6, 1e-8]),
            Tolerance::from(dvector![1e-6, 1e-8]),
        );
        let mut y = dvector![1.0, 1.0];
        let mut t = 0.0;
        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        assert!((y[0] - (-1.0f64).exp()).abs() < 1e-4);
        assert!((y[1] - (-2.0f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn single_precision_decay() {
        let mut rhs = Closure::new(1, |_t, y: &DVector<f32>, dydt: &mut DVector<f32>| {
            dydt[0] = -y[0];
        });
        let mut solver = Lsoda::<f32>::new(Tolerance::from(1e-4), Tolerance::from(1e-4));
        let mut y = dvector![1.0f32];
        let mut t = 0.0f32;
        solver
            .advance(&mut rhs, &mut y, &mut t, 1.0, Task::Normal, CallState::FirstCall)
            .unwrap();
        assert!((y[0] - (-1.0f32).exp()).abs() < 1e-2);
    }
}
