use nalgebra::{DMatrix, DVector};

use crate::op::OdeRhs;
use crate::scalar::Scalar;

/// Approximate the system Jacobian `J[(i, j)] = d f_i / d y_j` by forward
/// differences, one extra rhs evaluation per column.
///
/// `fy` must hold `f(t, y)`. Component `j` is perturbed by
/// `max(srur * |y[j]|, r0 / ewt[j])`, where `srur` is the square root of the
/// machine epsilon and `ewt` holds the reciprocal error weights; `y` is
/// restored exactly afterwards. Returns the number of rhs evaluations made.
pub fn forward_difference_jacobian<T: Scalar, F: OdeRhs<T>>(
    rhs: &mut F,
    t: T,
    y: &mut DVector<T>,
    fy: &DVector<T>,
    ewt: &DVector<T>,
    r0: T,
    srur: T,
    ftmp: &mut DVector<T>,
    jac: &mut DMatrix<T>,
) -> usize {
    let n = y.len();
    for j in 0..n {
        let yj = y[j];
        let r = (srur * yj.abs()).max(r0 / ewt[j]);
        y[j] = yj + r;
        rhs.call_inplace(t, y, ftmp);
        let inv_r = T::one() / r;
        for i in 0..n {
            jac[(i, j)] = (ftmp[i] - fy[i]) * inv_r;
        }
        y[j] = yj;
    }
    n
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::op::closure::Closure;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn linear_system_recovers_its_matrix() {
        let a = dmatrix![-2.0, 1.0; 3.0, -4.0];
        let a_for_rhs = a.clone();
        let mut rhs = Closure::new(2, move |_t, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt.copy_from(&(&a_for_rhs * y));
        });
        let mut y = dvector![1.0, 2.0];
        let mut fy = dvector![0.0, 0.0];
        rhs.call_inplace(0.0, &y, &mut fy);
        let y_before = y.clone();

        let ewt = dvector![1e6, 1e6];
        let mut ftmp = dvector![0.0, 0.0];
        let mut jac = DMatrix::zeros(2, 2);
        let nevals = forward_difference_jacobian(
            &mut rhs,
            0.0,
            &mut y,
            &fy,
            &ewt,
            1e-10,
            f64::EPSILON.sqrt(),
            &mut ftmp,
            &mut jac,
        );
        assert_eq!(nevals, 2);
        assert_eq!(y, y_before);
        assert_relative_eq!(jac, a, epsilon = 1e-6);
    }
}
