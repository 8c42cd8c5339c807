use nalgebra::DVector;
use serde::Serialize;

use crate::linear_solver::DenseLu;
use crate::norm::{column_norm, vector_norm};
use crate::ode_solver::coefficients::{CoeffTables, CorrectorKind, MethodFamily};
use crate::ode_solver::history::Nordsieck;
use crate::op::OdeRhs;
use crate::scalar::Scalar;

use super::corrector::CorrectorOutcome;
use super::controller::OrderChange;

/// Iteration cap for the corrector.
pub(crate) const MAX_CORRECTOR_ITERS: usize = 3;
/// Corrector convergence failures tolerated within one step attempt.
pub(crate) const MAX_CONVERGENCE_FAILURES: usize = 10;
/// The Jacobian is refreshed at least every this many steps.
pub(crate) const MAX_STEPS_BETWEEN_JACOBIANS: usize = 20;
/// Relative drift of `h * el0` since the last Jacobian beyond which the
/// iteration matrix must be rebuilt.
pub(crate) const MAX_COEFF_DRIFT: f64 = 0.3;
/// Step advantage the other family must offer before a switch is made.
pub(crate) const METHOD_SWITCH_RATIO: f64 = 5.0;
/// Accepted steps between method-switch evaluations.
pub(crate) const METHOD_SWITCH_COUNTDOWN: i32 = 20;

/// How the next call to [Stepper::step] should begin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// Very first step of the problem: initialize all control state.
    FirstStep,
    /// Continue from the previous step.
    Continue,
    /// Method, order cap or other parameters were changed externally:
    /// reload coefficients and force a Jacobian refresh.
    ParamsChanged,
}

/// Fatal outcome of a step attempt once the retry ladder is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StepFailure {
    /// The error test failed repeatedly or with the step size at its minimum.
    ErrorTest,
    /// The corrector failed repeatedly or with the step size at its minimum.
    Convergence,
}

/// Counters accumulated over the lifetime of the integration.
#[derive(Clone, Debug, Serialize, Default)]
pub struct LsodaStatistics {
    pub number_of_steps: usize,
    pub number_of_rhs_evaluations: usize,
    pub number_of_jacobian_evaluations: usize,
    pub number_of_error_test_failures: usize,
    pub number_of_convergence_failures: usize,
    pub number_of_method_switches: usize,
}

/// The integrator session aggregate: the Nordsieck history, work vectors,
/// coefficient tables and every piece of step-control state, owned by one
/// instance and mutated only through its own methods.
pub(crate) struct Stepper<T: Scalar> {
    pub(crate) nstates: usize,

    // solution history and work storage, sized once per (re)initialization
    pub(crate) yh: Nordsieck<T>,
    pub(crate) lu: DenseLu<T>,
    pub(crate) ewt: DVector<T>,
    pub(crate) savf: DVector<T>,
    pub(crate) acor: DVector<T>,
    pub(crate) ycur: DVector<T>,
    pub(crate) ftmp: DVector<T>,

    // integration state
    pub(crate) t: T,
    pub(crate) h: T,
    /// Step size of the last successful step.
    pub(crate) h_last: T,
    pub(crate) order: usize,
    /// Order used on the last successful step.
    pub(crate) order_last: usize,
    /// Order cap for the active family.
    pub(crate) max_order: usize,
    /// One past the largest usable order; `yh` column count.
    pub(crate) lmax: usize,
    pub(crate) method: MethodFamily,
    /// Family used on the last successful step; `None` before the first.
    pub(crate) method_last: Option<MethodFamily>,
    pub(crate) corrector: CorrectorKind,
    pub(crate) start: StartMode,
    step_size_request: Option<T>,

    // active coefficients
    pub(crate) tables: CoeffTables<T>,
    pub(crate) el: [T; 13],
    pub(crate) el0: T,
    pub(crate) conit: T,
    pub(crate) cm_adams: [T; 12],
    pub(crate) cm_bdf: [T; 5],

    // step-control state
    /// Ratio of the current `h * el0` to its value at the last Jacobian.
    pub(crate) rc: T,
    /// Cap on the step growth ratio; large on the first step, modest after a
    /// change, tight after a failure.
    pub(crate) rmax: T,
    /// Running corrector convergence-rate estimate.
    pub(crate) conv_rate: T,
    /// Steps to take before the next step/order reconsideration.
    pub(crate) control_countdown: usize,
    /// Accepted steps before the next method-switch evaluation.
    pub(crate) switch_countdown: i32,
    pub(crate) refresh_jacobian: bool,
    pub(crate) jac_current: bool,
    pub(crate) nst_last_jacobian: usize,
    /// Whether the last rescale was restricted by the stability region.
    pub(crate) stability_limited: bool,
    // problem stiffness estimates derived from the corrector rate and the
    // Jacobian norm
    pub(crate) pdest: T,
    pub(crate) pdlast: T,
    pub(crate) pdnorm: T,

    // per-call bounds, synced from the configuration by the outer driver
    pub(crate) hmin: T,
    pub(crate) hmxi: T,
    pub(crate) max_order_nonstiff: usize,
    pub(crate) max_order_stiff: usize,

    pub(crate) sqrt_eta: T,
    pub(crate) stats: LsodaStatistics,
}

impl<T: Scalar> Stepper<T> {
    pub(crate) fn new(nstates: usize, max_order_nonstiff: usize, max_order_stiff: usize) -> Self {
        let ncols = 1 + max_order_nonstiff.max(max_order_stiff);
        Self {
            nstates,
            yh: Nordsieck::new(nstates, ncols),
            lu: DenseLu::new(nstates),
            ewt: DVector::zeros(nstates),
            savf: DVector::zeros(nstates),
            acor: DVector::zeros(nstates),
            ycur: DVector::zeros(nstates),
            ftmp: DVector::zeros(nstates),
            t: T::zero(),
            h: T::one(),
            h_last: T::zero(),
            order: 1,
            order_last: 0,
            max_order: max_order_nonstiff,
            lmax: max_order_nonstiff + 1,
            method: MethodFamily::Adams,
            method_last: None,
            corrector: CorrectorKind::Functional,
            start: StartMode::FirstStep,
            step_size_request: None,
            tables: CoeffTables::new(MethodFamily::Adams),
            el: [T::zero(); 13],
            el0: T::one(),
            conit: T::one(),
            cm_adams: [T::zero(); 12],
            cm_bdf: [T::zero(); 5],
            rc: T::zero(),
            rmax: <T as Scalar>::from_f64(1.0e4),
            conv_rate: <T as Scalar>::from_f64(0.7),
            control_countdown: 2,
            switch_countdown: METHOD_SWITCH_COUNTDOWN,
            refresh_jacobian: false,
            jac_current: false,
            nst_last_jacobian: 0,
            stability_limited: false,
            pdest: T::zero(),
            pdlast: T::zero(),
            pdnorm: T::zero(),
            hmin: T::zero(),
            hmxi: T::zero(),
            max_order_nonstiff,
            max_order_stiff,
            sqrt_eta: T::EPSILON.sqrt(),
            stats: LsodaStatistics::default(),
        }
    }

    /// Shrink every buffer to a smaller problem dimension, keeping the
    /// history of the surviving components.
    pub(crate) fn truncate(&mut self, nstates: usize) {
        self.nstates = nstates;
        self.yh.truncate(nstates);
        self.lu.resize(nstates);
        self.ewt = self.ewt.rows(0, nstates).into_owned();
        self.savf = self.savf.rows(0, nstates).into_owned();
        self.acor = self.acor.rows(0, nstates).into_owned();
        self.ycur = self.ycur.rows(0, nstates).into_owned();
        self.ftmp = self.ftmp.rows(0, nstates).into_owned();
    }

    /// Ask the next step to run with this step size (applied by rescaling the
    /// history before prediction).
    pub(crate) fn request_step_size(&mut self, h: T) {
        self.step_size_request = Some(h);
    }

    /// Signal that method, order cap or other parameters changed since the
    /// last step.
    pub(crate) fn flag_params_changed(&mut self) {
        self.start = StartMode::ParamsChanged;
    }

    pub(crate) fn tesco(&self, order: usize, which: usize) -> T {
        self.tables.tesco[order - 1][which]
    }

    fn begin_step(&mut self) {
        match self.start {
            StartMode::FirstStep => {
                self.lmax = self.max_order + 1;
                self.order = 1;
                self.control_countdown = 2;
                self.rmax = <T as Scalar>::from_f64(1.0e4);
                self.rc = T::zero();
                self.el0 = T::one();
                self.conv_rate = <T as Scalar>::from_f64(0.7);
                self.nst_last_jacobian = 0;
                self.refresh_jacobian = self.corrector == CorrectorKind::Chord;
                self.switch_countdown = METHOD_SWITCH_COUNTDOWN;
                self.stability_limited = false;
                self.pdest = T::zero();
                self.pdlast = T::zero();
                // both families' tables are needed once, to form the
                // constants comparing their leading error terms in the
                // stiffness test
                let bdf = CoeffTables::new(MethodFamily::Bdf);
                for q in 1..=MethodFamily::Bdf.max_order() {
                    self.cm_bdf[q - 1] = bdf.stiffness_constant(q);
                }
                let adams = CoeffTables::new(MethodFamily::Adams);
                for q in 1..=MethodFamily::Adams.max_order() {
                    self.cm_adams[q - 1] = adams.stiffness_constant(q);
                }
                self.tables = match self.method {
                    MethodFamily::Adams => adams,
                    MethodFamily::Bdf => bdf,
                };
                self.reset_coeffs();
            }
            StartMode::ParamsChanged => {
                self.refresh_jacobian = self.corrector == CorrectorKind::Chord;
                self.lmax = self.max_order + 1;
                if self.control_countdown == 1 {
                    self.control_countdown = 2;
                }
                if self.method_last != Some(self.method) {
                    self.tables = CoeffTables::new(self.method);
                    self.control_countdown = self.order + 1;
                    self.reset_coeffs();
                }
                if let Some(h_new) = self.step_size_request.take() {
                    let rh = h_new / self.h;
                    self.rescale_step(rh);
                }
            }
            StartMode::Continue => {
                if let Some(h_new) = self.step_size_request.take() {
                    let rh = h_new / self.h;
                    self.rescale_step(rh);
                }
            }
        }
        self.start = StartMode::Continue;
    }

    /// Perform one internal integration step: predict, correct, error-test,
    /// and apply the control decision, retrying with adjusted step size and
    /// order on failures until success or a fatal outcome.
    pub(crate) fn step<F: OdeRhs<T>>(&mut self, rhs: &mut F) -> Result<(), StepFailure> {
        let one = T::one();
        let told = self.t;
        let mut ncf: usize = 0;
        let mut error_failures: i32 = 0;
        self.jac_current = false;

        self.begin_step();

        loop {
            // prediction: extrapolate the history to t + h, then correct.
            // The corrector may ask for a smaller step (rescale and
            // repredict) or give up entirely.
            let (pnorm, m, del) = loop {
                if (self.rc - one).abs() > <T as Scalar>::from_f64(MAX_COEFF_DRIFT)
                    || self.stats.number_of_steps
                        >= self.nst_last_jacobian + MAX_STEPS_BETWEEN_JACOBIANS
                {
                    self.refresh_jacobian = self.corrector == CorrectorKind::Chord;
                }
                self.t += self.h;
                self.yh.predict(self.order);
                let pnorm = column_norm(&self.yh.data, 0, &self.ewt);
                match self.correct(rhs, pnorm, &mut ncf, told) {
                    CorrectorOutcome::Converged { m, del } => break (pnorm, m, del),
                    CorrectorOutcome::Retry { rh } => {
                        let rh = rh.max(self.hmin / self.h.abs());
                        self.rescale_step(rh);
                    }
                    CorrectorOutcome::Fail => {
                        self.finish_failed();
                        return Err(StepFailure::Convergence);
                    }
                }
            };

            // local error test
            self.jac_current = false;
            let dsm = if m == 0 {
                del / self.tesco(self.order, 1)
            } else {
                vector_norm(&self.acor, &self.ewt) / self.tesco(self.order, 1)
            };

            if dsm <= one {
                self.accept_step(pnorm, dsm);
                return Ok(());
            }

            // the error test failed: restore the pre-step state and shrink,
            // more aggressively after repeated failures
            error_failures -= 1;
            self.stats.number_of_error_test_failures += 1;
            self.t = told;
            self.yh.retract(self.order);
            self.rmax = <T as Scalar>::from_f64(2.0);
            if self.h.abs() <= self.hmin * <T as Scalar>::from_f64(1.00001) {
                self.finish_failed();
                return Err(StepFailure::ErrorTest);
            }
            if error_failures > -3 {
                let (change, rh) = self.order_switch(T::zero(), dsm, error_failures);
                match change {
                    OrderChange::None | OrderChange::StepOnly => {
                        let mut rh = rh;
                        if change == OrderChange::None {
                            rh = rh.min(<T as Scalar>::from_f64(0.2));
                        }
                        let rh = rh.max(self.hmin / self.h.abs());
                        self.rescale_step(rh);
                    }
                    OrderChange::OrderAndStep => {
                        self.reset_coeffs();
                        let rh = rh.max(self.hmin / self.h.abs());
                        self.rescale_step(rh);
                    }
                }
                continue;
            }
            if error_failures == -10 {
                self.finish_failed();
                return Err(StepFailure::ErrorTest);
            }
            // three or more consecutive failures: the accumulated derivatives
            // are assumed unreliable. Recompute the first derivative, force
            // the order to one and cut h by ten.
            let rh = <T as Scalar>::from_f64(0.1).max(self.hmin / self.h.abs());
            self.h *= rh;
            for i in 0..self.nstates {
                self.ycur[i] = self.yh.data[(i, 0)];
            }
            rhs.call_inplace(self.t, &self.ycur, &mut self.savf);
            self.stats.number_of_rhs_evaluations += 1;
            for i in 0..self.nstates {
                self.yh.data[(i, 1)] = self.h * self.savf[i];
            }
            self.refresh_jacobian = self.corrector == CorrectorKind::Chord;
            self.control_countdown = 5;
            if self.order == 1 {
                continue;
            }
            self.order = 1;
            self.reset_coeffs();
        }
    }

    /// The step passed the error test: commit the correction to the history
    /// and run the step/order/method control decisions.
    fn accept_step(&mut self, pnorm: T, dsm: T) {
        let one = T::one();
        self.stats.number_of_steps += 1;
        self.h_last = self.h;
        self.order_last = self.order;
        self.method_last = Some(self.method);
        for j in 0..=self.order {
            let elj = self.el[j];
            for i in 0..self.nstates {
                let a = self.acor[i];
                self.yh.data[(i, j)] += elj * a;
            }
        }

        self.switch_countdown = self.switch_countdown.saturating_sub(1);
        if self.switch_countdown < 0 {
            if let Some(rh) = self.consider_method_switch(dsm, pnorm) {
                let rh = rh.max(self.hmin / self.h.abs());
                self.rescale_step(rh);
                self.rmax = <T as Scalar>::from_f64(10.0);
                self.finish_step();
                return;
            }
        }

        // no method switch: the usual step/order selection, once the
        // countdown since the last change expires
        self.control_countdown -= 1;
        if self.control_countdown == 0 {
            let mut rhup = T::zero();
            if self.order + 1 != self.lmax {
                // estimate the step usable at order + 1 from the difference
                // between this step's correction and the saved one
                for i in 0..self.nstates {
                    self.savf[i] = self.acor[i] - self.yh.data[(i, self.lmax - 1)];
                }
                let dup = vector_norm(&self.savf, &self.ewt) / self.tesco(self.order, 2);
                let exup = one / <T as Scalar>::from_usize(self.order + 2);
                rhup = one / (<T as Scalar>::from_f64(1.4) * dup.powf(exup) + <T as Scalar>::from_f64(1.4e-6));
            }
            let (change, rh) = self.order_switch(rhup, dsm, 0);
            match change {
                OrderChange::None => {}
                OrderChange::StepOnly => {
                    let rh = rh.max(self.hmin / self.h.abs());
                    self.rescale_step(rh);
                    self.rmax = <T as Scalar>::from_f64(10.0);
                }
                OrderChange::OrderAndStep => {
                    self.reset_coeffs();
                    let rh = rh.max(self.hmin / self.h.abs());
                    self.rescale_step(rh);
                    self.rmax = <T as Scalar>::from_f64(10.0);
                }
            }
            self.finish_step();
            return;
        }

        if self.control_countdown > 1 || self.order + 1 == self.lmax {
            self.finish_step();
            return;
        }
        // an order increase will be considered next step: save the correction
        // so its difference can estimate the order + 1 error
        for i in 0..self.nstates {
            self.yh.data[(i, self.lmax - 1)] = self.acor[i];
        }
        self.finish_step();
    }

    /// Scale the correction accumulator into a local-error estimate and mark
    /// the step complete.
    pub(crate) fn finish_step(&mut self) {
        let r = T::one() / self.tesco(self.order_last.max(1), 1);
        for i in 0..self.nstates {
            self.acor[i] *= r;
        }
        self.start = StartMode::Continue;
    }

    fn finish_failed(&mut self) {
        self.start = StartMode::Continue;
    }

    /// Select the active coefficient row for the current order and correct
    /// the ratio-tracking constant for the new leading coefficient.
    pub(crate) fn reset_coeffs(&mut self) {
        let q = self.order;
        for i in 0..=q {
            self.el[i] = self.tables.elco[q - 1][i];
        }
        self.rc = self.rc * self.el[0] / self.el0;
        self.el0 = self.el[0];
        self.conit = <T as Scalar>::from_f64(0.5) / <T as Scalar>::from_usize(q + 2);
    }
}
