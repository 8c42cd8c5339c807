use nalgebra::DMatrix;

use crate::scalar::Scalar;

/// The Nordsieck history array.
///
/// Column `j` holds `h^j * y^(j)(tn) / j!`, so column 0 is always the current
/// solution and the first `order + 1` columns represent the solution history
/// as scaled Taylor coefficients consistent with the current step size and
/// order. The array is rescaled in place whenever either changes; it is the
/// sole persistent representation of the solution history.
#[derive(Clone, Debug)]
pub struct Nordsieck<T: Scalar> {
    pub(crate) data: DMatrix<T>,
}

impl<T: Scalar> Nordsieck<T> {
    pub fn new(nstates: usize, ncols: usize) -> Self {
        Self {
            data: DMatrix::zeros(nstates, ncols),
        }
    }

    pub fn nstates(&self) -> usize {
        self.data.nrows()
    }

    /// Drop trailing state components on a continuation call with a smaller
    /// problem dimension.
    pub fn truncate(&mut self, nstates: usize) {
        self.data = self.data.rows(0, nstates).into_owned();
    }

    /// Advance the represented time by one step: apply the Pascal-triangle
    /// update, accumulating each active column into the one before it, which
    /// extrapolates the solution and its derivatives to `tn + h`.
    pub fn predict(&mut self, order: usize) {
        let n = self.data.nrows();
        for j in (0..order).rev() {
            for c in j..order {
                for i in 0..n {
                    let upper = self.data[(i, c + 1)];
                    self.data[(i, c)] += upper;
                }
            }
        }
    }

    /// Undo [Self::predict] exactly, restoring the pre-step history after a
    /// rejected step.
    pub fn retract(&mut self, order: usize) {
        let n = self.data.nrows();
        for j in (0..order).rev() {
            for c in j..order {
                for i in 0..n {
                    let upper = self.data[(i, c + 1)];
                    self.data[(i, c)] -= upper;
                }
            }
        }
    }

    /// Rescale the active columns for a step-size ratio `rh = h_new / h_old`,
    /// keeping the scaled-Taylor-coefficient representation consistent.
    pub fn rescale(&mut self, order: usize, rh: T) {
        let n = self.data.nrows();
        let mut r = T::one();
        for j in 1..=order {
            r *= rh;
            for i in 0..n {
                self.data[(i, j)] *= r;
            }
        }
    }

    /// Evaluate the `k`-th derivative of the interpolating polynomial at
    /// `s = (t - tn) / h` by Horner evaluation over the history columns,
    /// scaled by `h^-k`. Bounds on `k` and `t` are the caller's concern.
    pub fn interpolate_unchecked(
        &self,
        s: T,
        k: usize,
        order: usize,
        h: T,
        dky: &mut nalgebra::DVector<T>,
    ) {
        let n = self.data.nrows();
        let mut c = T::one();
        for jj in (order + 1 - k)..=order {
            c *= <T as Scalar>::from_usize(jj);
        }
        for i in 0..n {
            dky[i] = c * self.data[(i, order)];
        }
        for j in (k..order).rev() {
            let mut c = T::one();
            for jj in (j + 1 - k)..=j {
                c *= <T as Scalar>::from_usize(jj);
            }
            for i in 0..n {
                dky[i] = c * self.data[(i, j)] + s * dky[i];
            }
        }
        if k > 0 {
            let r = h.powi(-(k as i32));
            for i in 0..n {
                dky[i] *= r;
            }
        }
    }
}
