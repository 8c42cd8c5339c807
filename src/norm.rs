use nalgebra::{DMatrix, DVector};

use crate::scalar::Scalar;

/// Weighted max-norm of `v`:
///
/// `max_i |v[i]| * w[i]`
///
/// The weights are the reciprocal error weights, so a norm of one corresponds
/// to an error exactly at the requested tolerance.
pub fn vector_norm<T: Scalar>(v: &DVector<T>, w: &DVector<T>) -> T {
    let mut vm = T::zero();
    for i in 0..v.len() {
        let term = v[i].abs() * w[i];
        if term > vm {
            vm = term;
        }
    }
    vm
}

/// As [vector_norm], but over a single column of a matrix.
pub fn column_norm<T: Scalar>(a: &DMatrix<T>, col: usize, w: &DVector<T>) -> T {
    let mut vm = T::zero();
    for i in 0..a.nrows() {
        let term = a[(i, col)].abs() * w[i];
        if term > vm {
            vm = term;
        }
    }
    vm
}

/// Norm of a full `n x n` matrix consistent with the weighted max-norm on
/// vectors:
///
/// `max_i ( w[i] * sum_j |a[(i, j)]| / w[j] )`
pub fn matrix_norm<T: Scalar>(a: &DMatrix<T>, w: &DVector<T>) -> T {
    let n = a.nrows();
    let mut an = T::zero();
    for i in 0..n {
        let mut sum = T::zero();
        for j in 0..n {
            sum += a[(i, j)].abs() / w[j];
        }
        let row = sum * w[i];
        if row > an {
            an = row;
        }
    }
    an
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn vector_norm_is_weighted_max() {
        let v = dvector![1.0, -4.0, 2.0];
        let w = dvector![1.0, 0.5, 2.0];
        assert_eq!(vector_norm(&v, &w), 4.0);
    }

    #[test]
    fn matrix_norm_is_consistent_with_vector_norm() {
        let a = dmatrix![1.0, -2.0; 3.0, 4.0];
        let w = dvector![1.0, 2.0];
        // row 0: 1.0 * (|1|/1 + |-2|/2) = 2, row 1: 2.0 * (|3|/1 + |4|/2) = 10
        assert_eq!(matrix_norm(&a, &w), 10.0);

        // the induced norm bounds |A v|_w / |v|_w
        let v = dvector![0.3, -0.7];
        let av = &a * &v;
        assert!(vector_norm(&av, &w) <= matrix_norm(&a, &w) * vector_norm(&v, &w) + 1e-14);
    }
}
