use nalgebra::{DMatrix, DVector};

use crate::error::{LinearSolverError, PolysolError};
use crate::linear_solver_error;
use crate::scalar::Scalar;

/// Dense LU factorization with partial pivoting, with forward/back
/// substitution for both the direct and the transposed system.
///
/// The factorization overwrites the owned matrix in place. A zero pivot does
/// not abort the elimination: the offending column is skipped and recorded,
/// and the solves refuse to run until a successful refactorization. This lets
/// the caller finish building a stale iteration matrix and decide on a retry
/// policy instead of unwinding mid-update.
#[derive(Clone, Debug)]
pub struct DenseLu<T: Scalar> {
    matrix: DMatrix<T>,
    ipiv: Vec<usize>,
    singular: Option<usize>,
    factored: bool,
}

impl<T: Scalar> DenseLu<T> {
    pub fn new(n: usize) -> Self {
        Self {
            matrix: DMatrix::zeros(n, n),
            ipiv: vec![0; n],
            singular: None,
            factored: false,
        }
    }

    /// The matrix to be factored. Writing to it invalidates any previous
    /// factorization only once [Self::factorize] is called again.
    pub fn matrix_mut(&mut self) -> &mut DMatrix<T> {
        &mut self.matrix
    }

    pub fn matrix(&self) -> &DMatrix<T> {
        &self.matrix
    }

    /// Column index of the last zero pivot of the most recent factorization,
    /// if any.
    pub fn singular(&self) -> Option<usize> {
        self.singular
    }

    /// Shrink to a smaller problem dimension, discarding any factorization.
    pub fn resize(&mut self, n: usize) {
        self.matrix = DMatrix::zeros(n, n);
        self.ipiv = vec![0; n];
        self.singular = None;
        self.factored = false;
    }

    /// Factor the owned matrix in place as `P * A = L * U` by Gaussian
    /// elimination with partial pivoting.
    pub fn factorize(&mut self) -> Result<(), PolysolError> {
        let n = self.matrix.nrows();
        if n != self.matrix.ncols() {
            return Err(PolysolError::from(LinearSolverError::MatrixNotSquare {
                nrows: n,
                ncols: self.matrix.ncols(),
            }));
        }
        let a = &mut self.matrix;
        self.singular = None;
        self.factored = true;
        if n == 0 {
            return Ok(());
        }
        for k in 0..n - 1 {
            // find the pivot row for column k
            let mut p = k;
            let mut vmax = a[(k, k)].abs();
            for i in k + 1..n {
                let v = a[(i, k)].abs();
                if v > vmax {
                    vmax = v;
                    p = i;
                }
            }
            self.ipiv[k] = p;
            // zero pivot: this column is already triangularized
            if a[(p, k)] == T::zero() {
                self.singular = Some(k);
                continue;
            }
            if p != k {
                a.swap((p, k), (k, k));
            }
            // compute multipliers
            let t = -T::one() / a[(k, k)];
            for i in k + 1..n {
                a[(i, k)] *= t;
            }
            // column elimination with row interchange applied lazily
            for j in k + 1..n {
                let t = a[(p, j)];
                if p != k {
                    a[(p, j)] = a[(k, j)];
                    a[(k, j)] = t;
                }
                for i in k + 1..n {
                    let m = a[(i, k)];
                    a[(i, j)] += t * m;
                }
            }
        }
        self.ipiv[n - 1] = n - 1;
        if a[(n - 1, n - 1)] == T::zero() {
            self.singular = Some(n - 1);
        }
        Ok(())
    }

    fn check_solvable(&self, b: &DVector<T>) -> Result<(), PolysolError> {
        if !self.factored {
            return Err(linear_solver_error!(LuNotFactorized));
        }
        if let Some(column) = self.singular {
            return Err(PolysolError::from(LinearSolverError::SingularMatrix {
                column,
            }));
        }
        if b.len() != self.matrix.nrows() {
            return Err(PolysolError::from(
                LinearSolverError::MatrixVectorNotCompatible {
                    expected: self.matrix.nrows(),
                    found: b.len(),
                },
            ));
        }
        Ok(())
    }

    /// Solve `A * x = b`, overwriting `b` with `x`.
    pub fn solve_in_place(&self, b: &mut DVector<T>) -> Result<(), PolysolError> {
        self.check_solvable(b)?;
        let n = b.len();
        let a = &self.matrix;
        // L * y = b
        for k in 0..n.saturating_sub(1) {
            let p = self.ipiv[k];
            let t = b[p];
            if p != k {
                b[p] = b[k];
                b[k] = t;
            }
            for i in k + 1..n {
                let m = a[(i, k)];
                b[i] += t * m;
            }
        }
        // U * x = y
        for k in (0..n).rev() {
            b[k] /= a[(k, k)];
            let t = -b[k];
            for i in 0..k {
                let m = a[(i, k)];
                b[i] += t * m;
            }
        }
        Ok(())
    }

    /// Solve `A^T * x = b`, overwriting `b` with `x`.
    pub fn solve_transpose_in_place(&self, b: &mut DVector<T>) -> Result<(), PolysolError> {
        self.check_solvable(b)?;
        let n = b.len();
        let a = &self.matrix;
        // U^T * y = b
        for k in 0..n {
            let mut t = T::zero();
            for i in 0..k {
                t += a[(i, k)] * b[i];
            }
            b[k] = (b[k] - t) / a[(k, k)];
        }
        // L^T * x = y
        for k in (0..n.saturating_sub(1)).rev() {
            let mut t = T::zero();
            for i in k + 1..n {
                t += a[(i, k)] * b[i];
            }
            b[k] += t;
            let p = self.ipiv[k];
            if p != k {
                b.swap_rows(p, k);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn factor(a: DMatrix<f64>) -> DenseLu<f64> {
        let mut lu = DenseLu::new(a.nrows());
        lu.matrix_mut().copy_from(&a);
        lu.factorize().unwrap();
        lu
    }

    #[test]
    fn solves_direct_system() {
        let a = dmatrix![2.0, 1.0, 1.0; 4.0, -6.0, 0.0; -2.0, 7.0, 2.0];
        let x_exact = dvector![1.0, -2.0, 3.0];
        let mut b = &a * &x_exact;
        let lu = factor(a);
        assert!(lu.singular().is_none());
        lu.solve_in_place(&mut b).unwrap();
        assert_relative_eq!(b, x_exact, epsilon = 1e-12);
    }

    #[test]
    fn solves_transposed_system() {
        let a = dmatrix![3.0, -1.0, 2.0; 1.0, 5.0, -2.0; 0.5, 0.0, 4.0];
        let x_exact = dvector![0.5, 2.0, -1.5];
        let mut b = a.transpose() * &x_exact;
        let lu = factor(a);
        lu.solve_transpose_in_place(&mut b).unwrap();
        assert_relative_eq!(b, x_exact, epsilon = 1e-12);
    }

    #[test]
    fn one_by_one_system() {
        let lu = factor(dmatrix![4.0]);
        let mut b = dvector![2.0];
        lu.solve_in_place(&mut b).unwrap();
        assert_relative_eq!(b[0], 0.5);
    }

    #[test]
    fn singular_matrix_is_flagged_not_panicked() {
        let a = dmatrix![1.0, 2.0; 2.0, 4.0];
        let mut lu = DenseLu::new(2);
        lu.matrix_mut().copy_from(&a);
        lu.factorize().unwrap();
        assert!(lu.singular().is_some());
        let mut b = dvector![1.0, 1.0];
        assert!(lu.solve_in_place(&mut b).is_err());
    }

    #[test]
    fn solve_before_factorize_is_an_error() {
        let lu = DenseLu::<f64>::new(2);
        let mut b = dvector![1.0, 1.0];
        assert!(lu.solve_in_place(&mut b).is_err());
    }
}
