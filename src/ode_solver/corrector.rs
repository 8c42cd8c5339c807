use crate::jacobian::forward_difference_jacobian;
use crate::norm::{matrix_norm, vector_norm};
use crate::ode_solver::coefficients::{CorrectorKind, MethodFamily};
use crate::op::OdeRhs;
use crate::scalar::Scalar;

use super::stepper::{Stepper, MAX_CONVERGENCE_FAILURES, MAX_CORRECTOR_ITERS};

/// Result of one invocation of the corrector.
pub(crate) enum CorrectorOutcome<T> {
    /// Converged after `m + 1` iterations with final increment norm `del`.
    Converged { m: usize, del: T },
    /// The iteration could not converge; the step was retracted and should be
    /// retried with the step size multiplied by `rh`.
    Retry { rh: T },
    /// Retries exhausted, or the step size is already at its minimum.
    Fail,
}

impl<T: Scalar> Stepper<T> {
    /// Refine the predicted solution to within the corrector tolerance.
    ///
    /// Up to [MAX_CORRECTOR_ITERS] iterations are taken, functional or chord
    /// depending on the active corrector. The convergence test is made on the
    /// weighted max-norm of each correction increment; the sum of the
    /// corrections accumulates in `acor`, and the history array is not
    /// touched here.
    pub(crate) fn correct<F: OdeRhs<T>>(
        &mut self,
        rhs: &mut F,
        pnorm: T,
        ncf: &mut usize,
        told: T,
    ) -> CorrectorOutcome<T> {
        let one = T::one();
        let n = self.nstates;
        let mut m: usize = 0;
        let mut del = T::zero();
        let mut delp = T::zero();
        let mut rate = T::zero();

        for i in 0..n {
            self.ycur[i] = self.yh.data[(i, 0)];
        }
        rhs.call_inplace(self.t, &self.ycur, &mut self.savf);
        self.stats.number_of_rhs_evaluations += 1;

        loop {
            if m == 0 {
                // refresh and refactor the iteration matrix if anything
                // invalidated it since the last build
                if self.refresh_jacobian && self.corrector == CorrectorKind::Chord {
                    let ok = self.update_iteration_matrix(rhs);
                    self.refresh_jacobian = false;
                    self.rc = one;
                    self.nst_last_jacobian = self.stats.number_of_steps;
                    self.conv_rate = <T as Scalar>::from_f64(0.7);
                    if !ok {
                        return self.corrector_failure(ncf, told);
                    }
                }
                self.acor.fill(T::zero());
            }
            match self.corrector {
                CorrectorKind::Functional => {
                    // fixed-point update directly from the last rhs value
                    for i in 0..n {
                        let sv = self.h * self.savf[i] - self.yh.data[(i, 1)];
                        self.ftmp[i] = sv - self.acor[i];
                        self.savf[i] = sv;
                    }
                    del = vector_norm(&self.ftmp, &self.ewt);
                    for i in 0..n {
                        self.ycur[i] = self.yh.data[(i, 0)] + self.el[0] * self.savf[i];
                        self.acor[i] = self.savf[i];
                    }
                }
                CorrectorKind::Chord => {
                    // corrector residual as right-hand side, one linear solve
                    // against the factored iteration matrix
                    for i in 0..n {
                        self.ftmp[i] =
                            self.h * self.savf[i] - (self.yh.data[(i, 1)] + self.acor[i]);
                    }
                    if self.lu.solve_in_place(&mut self.ftmp).is_err() {
                        return self.corrector_failure(ncf, told);
                    }
                    del = vector_norm(&self.ftmp, &self.ewt);
                    for i in 0..n {
                        self.acor[i] += self.ftmp[i];
                        self.ycur[i] = self.yh.data[(i, 0)] + self.el[0] * self.acor[i];
                    }
                }
            }

            // an increment at roundoff scale relative to the predicted
            // solution counts as converged without updating the rate
            if del <= <T as Scalar>::from_f64(100.0) * pnorm * T::EPSILON {
                return CorrectorOutcome::Converged { m, del };
            }
            // otherwise force at least two iterations for the Adams family so
            // a local Lipschitz estimate can be formed
            if m != 0 || self.method == MethodFamily::Bdf {
                if m != 0 {
                    let rm = if del <= <T as Scalar>::from_f64(1024.0) * delp {
                        del / delp
                    } else {
                        <T as Scalar>::from_f64(1024.0)
                    };
                    rate = rate.max(rm);
                    self.conv_rate = (<T as Scalar>::from_f64(0.2) * self.conv_rate).max(rm);
                }
                let dcon = del * one.min(<T as Scalar>::from_f64(1.5) * self.conv_rate)
                    / (self.tesco(self.order, 1) * self.conit);
                if dcon <= one {
                    self.pdest = self.pdest.max(rate / (self.h * self.el[0]).abs());
                    if self.pdest != T::zero() {
                        self.pdlast = self.pdest;
                    }
                    return CorrectorOutcome::Converged { m, del };
                }
            }

            m += 1;
            if m == MAX_CORRECTOR_ITERS || (m >= 2 && del > <T as Scalar>::from_f64(2.0) * delp) {
                // diverging, or out of iterations. A stale Jacobian earns one
                // refresh-and-restart; a fresh one means the step must shrink.
                if self.corrector == CorrectorKind::Functional || self.jac_current {
                    return self.corrector_failure(ncf, told);
                }
                self.refresh_jacobian = true;
                m = 0;
                rate = T::zero();
                del = T::zero();
                for i in 0..n {
                    self.ycur[i] = self.yh.data[(i, 0)];
                }
                rhs.call_inplace(self.t, &self.ycur, &mut self.savf);
                self.stats.number_of_rhs_evaluations += 1;
                continue;
            }
            delp = del;
            rhs.call_inplace(self.t, &self.ycur, &mut self.savf);
            self.stats.number_of_rhs_evaluations += 1;
        }
    }

    /// The corrector could not converge: retract the prediction and decide
    /// between a shrink-and-retry and giving up.
    fn corrector_failure(&mut self, ncf: &mut usize, told: T) -> CorrectorOutcome<T> {
        *ncf += 1;
        self.stats.number_of_convergence_failures += 1;
        self.rmax = <T as Scalar>::from_f64(2.0);
        self.t = told;
        self.yh.retract(self.order);
        if self.h.abs() <= self.hmin * <T as Scalar>::from_f64(1.00001) || *ncf == MAX_CONVERGENCE_FAILURES {
            return CorrectorOutcome::Fail;
        }
        self.refresh_jacobian = self.corrector == CorrectorKind::Chord;
        CorrectorOutcome::Retry {
            rh: <T as Scalar>::from_f64(0.25),
        }
    }

    /// Build `I - h * el0 * J` with a forward-difference Jacobian, track the
    /// matrix norm for the stiffness estimate, and factor it. Returns false
    /// if the factorization hit a zero pivot.
    fn update_iteration_matrix<F: OdeRhs<T>>(&mut self, rhs: &mut F) -> bool {
        let n = self.nstates;
        self.stats.number_of_jacobian_evaluations += 1;
        self.jac_current = true;
        let hl0 = self.h * self.el0;

        let fac = vector_norm(&self.savf, &self.ewt);
        let mut r0 = <T as Scalar>::from_f64(1000.0) * self.h.abs() * T::EPSILON * <T as Scalar>::from_usize(n) * fac;
        if r0 == T::zero() {
            r0 = T::one();
        }
        let nevals = forward_difference_jacobian(
            rhs,
            self.t,
            &mut self.ycur,
            &self.savf,
            &self.ewt,
            r0,
            self.sqrt_eta,
            &mut self.ftmp,
            self.lu.matrix_mut(),
        );
        self.stats.number_of_rhs_evaluations += nevals;

        self.pdnorm = matrix_norm(self.lu.matrix(), &self.ewt);

        let wm = self.lu.matrix_mut();
        for j in 0..n {
            for i in 0..n {
                wm[(i, j)] *= -hl0;
            }
        }
        for i in 0..n {
            wm[(i, i)] += T::one();
        }
        if self.lu.factorize().is_err() {
            return false;
        }
        self.lu.singular().is_none()
    }
}
