use crate::norm::column_norm;
use crate::ode_solver::coefficients::{stability_limit, CorrectorKind, MethodFamily};
use crate::scalar::Scalar;

use super::stepper::{Stepper, METHOD_SWITCH_COUNTDOWN, METHOD_SWITCH_RATIO};

/// Decision of the step/order selection after an attempted step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OrderChange {
    /// Keep both the step size and the order.
    None,
    /// Change the step size, keep the order.
    StepOnly,
    /// Change both; the order field has already been updated.
    OrderAndStep,
}

impl<T: Scalar> Stepper<T> {
    /// Apply a step-size ratio `rh`: clamp it against the growth cap, the
    /// maximum-step bound and (for the Adams family) the stability region,
    /// then rescale the history in place. Holds off further step changes for
    /// `order + 1` steps.
    pub(crate) fn rescale_step(&mut self, rh: T) {
        let one = T::one();
        let mut rh = rh.min(self.rmax);
        rh /= one.max(self.h.abs() * self.hmxi * rh);
        if self.method == MethodFamily::Adams {
            // restrict by the stability region; remember when this bites so
            // later roundoff trouble can be attributed to it
            self.stability_limited = false;
            let pdh = (self.h.abs() * self.pdlast).max(<T as Scalar>::from_f64(1.0e-6));
            if rh * pdh * <T as Scalar>::from_f64(1.00001) >= stability_limit(self.order) {
                rh = stability_limit::<T>(self.order) / pdh;
                self.stability_limited = true;
            }
        }
        self.yh.rescale(self.order, rh);
        self.h *= rh;
        self.rc *= rh;
        self.control_countdown = self.order + 1;
    }

    /// Estimate the step multipliers achievable at one order lower (`rhdn`),
    /// the current order (`rhsm`) and one order higher (`rhup`, supplied by
    /// the caller), and pick the order maximizing the multiplier. Changes
    /// below ten percent are suppressed to avoid thrashing, and after an
    /// error-test failure (`error_failures < 0`) the order is never raised.
    pub(crate) fn order_switch(
        &mut self,
        rhup_in: T,
        dsm: T,
        error_failures: i32,
    ) -> (OrderChange, T) {
        let one = T::one();
        let l = self.order + 1;
        let mut rhup = rhup_in;

        let exsm = one / <T as Scalar>::from_usize(l);
        let mut rhsm = one / (<T as Scalar>::from_f64(1.2) * dsm.powf(exsm) + <T as Scalar>::from_f64(1.2e-6));

        let mut rhdn = T::zero();
        if self.order != 1 {
            let ddn =
                column_norm(&self.yh.data, self.order, &self.ewt) / self.tesco(self.order, 0);
            let exdn = one / <T as Scalar>::from_usize(self.order);
            rhdn = one / (<T as Scalar>::from_f64(1.3) * ddn.powf(exdn) + <T as Scalar>::from_f64(1.3e-6));
        }

        // for the Adams family all three candidates are also limited by the
        // stability region
        let pdh = (self.h.abs() * self.pdlast).max(<T as Scalar>::from_f64(1.0e-6));
        if self.method == MethodFamily::Adams {
            if l < self.lmax {
                rhup = rhup.min(stability_limit::<T>(l) / pdh);
            }
            rhsm = rhsm.min(stability_limit::<T>(self.order) / pdh);
            if self.order > 1 {
                rhdn = rhdn.min(stability_limit::<T>(self.order - 1) / pdh);
            }
            self.pdest = T::zero();
        }

        let newq;
        let mut rh;
        if rhsm >= rhup {
            if rhsm >= rhdn {
                newq = self.order;
                rh = rhsm;
            } else {
                newq = self.order - 1;
                rh = rhdn;
                if error_failures < 0 && rh > one {
                    rh = one;
                }
            }
        } else if rhup <= rhdn {
            newq = self.order - 1;
            rh = rhdn;
            if error_failures < 0 && rh > one {
                rh = one;
            }
        } else {
            rh = rhup;
            if rh >= <T as Scalar>::from_f64(1.1) {
                // raising the order costs one extra scaled derivative,
                // seeded from the correction just accepted
                let r = self.el[l - 1] / <T as Scalar>::from_usize(l);
                self.order = l;
                for i in 0..self.nstates {
                    self.yh.data[(i, self.order)] = self.acor[i] * r;
                }
                return (OrderChange::OrderAndStep, rh);
            }
            self.control_countdown = 3;
            return (OrderChange::None, rh);
        }

        // suppress sub-ten-percent changes, unless the Adams step is pinned
        // by stability in which case the test is bypassed
        if self.method == MethodFamily::Adams {
            if rh * pdh * <T as Scalar>::from_f64(1.00001) < stability_limit(newq)
                && error_failures == 0
                && rh < <T as Scalar>::from_f64(1.1)
            {
                self.control_countdown = 3;
                return (OrderChange::None, rh);
            }
        } else if error_failures == 0 && rh < <T as Scalar>::from_f64(1.1) {
            self.control_countdown = 3;
            return (OrderChange::None, rh);
        }

        if error_failures <= -2 {
            rh = rh.min(<T as Scalar>::from_f64(0.2));
        }
        if newq == self.order {
            return (OrderChange::StepOnly, rh);
        }
        self.order = newq;
        (OrderChange::OrderAndStep, rh)
    }

    /// Evaluate a switch between the method families, comparing the step size
    /// each could ideally have used on this step. The step advantage must be
    /// at least [METHOD_SWITCH_RATIO] to leave the Adams family, and the
    /// symmetric condition holds for the way back. Returns the step ratio to
    /// apply when a switch is made.
    pub(crate) fn consider_method_switch(&mut self, dsm: T, pnorm: T) -> Option<T> {
        let one = T::one();

        if self.method == MethodFamily::Adams {
            // a problem that is happy above order 5 is not stiff
            if self.order > 5 {
                return None;
            }
            let rh2;
            let nq2;
            if dsm <= <T as Scalar>::from_f64(100.0) * pnorm * T::EPSILON || self.pdest == T::zero() {
                // error estimate and Lipschitz estimate are polluted by
                // roundoff. Switch only if the last step was restricted to
                // keep stability, and double the step for lack of better
                // information.
                if !self.stability_limited {
                    return None;
                }
                rh2 = <T as Scalar>::from_f64(2.0);
                nq2 = self.order.min(self.max_order_stiff);
            } else {
                let exsm = one / <T as Scalar>::from_usize(self.order + 1);
                let mut rh1 = one / (<T as Scalar>::from_f64(1.2) * dsm.powf(exsm) + <T as Scalar>::from_f64(1.2e-6));
                let mut rh1it = <T as Scalar>::from_f64(2.0) * rh1;
                let pdh = self.pdlast * self.h.abs();
                if pdh * rh1 > <T as Scalar>::from_f64(1.0e-5) {
                    rh1it = stability_limit::<T>(self.order) / pdh;
                }
                rh1 = rh1.min(rh1it);
                if self.order > self.max_order_stiff {
                    nq2 = self.max_order_stiff;
                    let lm2 = nq2 + 1;
                    let exm2 = one / <T as Scalar>::from_usize(lm2);
                    let dm2 = column_norm(&self.yh.data, lm2, &self.ewt) / self.cm_bdf[nq2 - 1];
                    rh2 = one / (<T as Scalar>::from_f64(1.2) * dm2.powf(exm2) + <T as Scalar>::from_f64(1.2e-6));
                } else {
                    let dm2 = dsm * (self.cm_adams[self.order - 1] / self.cm_bdf[self.order - 1]);
                    rh2 = one / (<T as Scalar>::from_f64(1.2) * dm2.powf(exsm) + <T as Scalar>::from_f64(1.2e-6));
                    nq2 = self.order;
                }
                if rh2 < <T as Scalar>::from_f64(METHOD_SWITCH_RATIO) * rh1 {
                    return None;
                }
            }
            self.method = MethodFamily::Bdf;
            self.corrector = CorrectorKind::Chord;
            self.pdlast = T::zero();
            self.order = nq2;
            self.switch_countdown = METHOD_SWITCH_COUNTDOWN;
            return Some(rh2);
        }

        // currently stiff: consider switching back to Adams
        let exsm = one / <T as Scalar>::from_usize(self.order + 1);
        let mut rh1;
        let nq1;
        let exm1;
        let mut dm1;
        if self.max_order_nonstiff < self.order {
            nq1 = self.max_order_nonstiff;
            let lm1 = nq1 + 1;
            exm1 = one / <T as Scalar>::from_usize(lm1);
            dm1 = column_norm(&self.yh.data, lm1, &self.ewt) / self.cm_adams[nq1 - 1];
            rh1 = one / (<T as Scalar>::from_f64(1.2) * dm1.powf(exm1) + <T as Scalar>::from_f64(1.2e-6));
        } else {
            dm1 = dsm * (self.cm_bdf[self.order - 1] / self.cm_adams[self.order - 1]);
            rh1 = one / (<T as Scalar>::from_f64(1.2) * dm1.powf(exsm) + <T as Scalar>::from_f64(1.2e-6));
            nq1 = self.order;
            exm1 = exsm;
        }
        let mut rh1it = <T as Scalar>::from_f64(2.0) * rh1;
        let pdh = self.pdnorm * self.h.abs();
        if pdh * rh1 > <T as Scalar>::from_f64(1.0e-5) {
            rh1it = stability_limit::<T>(nq1) / pdh;
        }
        rh1 = rh1.min(rh1it);
        let rh2 = one / (<T as Scalar>::from_f64(1.2) * dsm.powf(exsm) + <T as Scalar>::from_f64(1.2e-6));
        if rh1 * <T as Scalar>::from_f64(METHOD_SWITCH_RATIO) < <T as Scalar>::from_f64(5.0) * rh2 {
            return None;
        }
        // an Adams step that small would drown in roundoff: stay stiff
        let alpha = rh1.max(<T as Scalar>::from_f64(0.001));
        dm1 *= alpha.powf(exm1);
        if dm1 <= <T as Scalar>::from_f64(1000.0) * T::EPSILON * pnorm {
            return None;
        }
        self.method = MethodFamily::Adams;
        self.corrector = CorrectorKind::Functional;
        self.pdlast = T::zero();
        self.order = nq1;
        self.switch_countdown = METHOD_SWITCH_COUNTDOWN;
        Some(rh1)
    }
}
