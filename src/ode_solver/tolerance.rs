use nalgebra::DVector;

use crate::error::OdeSolverError;
use crate::scalar::Scalar;

/// A relative or absolute tolerance, either one value broadcast over all
/// components or one value per component.
#[derive(Clone, Debug)]
pub enum Tolerance<T: Scalar> {
    Scalar(T),
    Vector(DVector<T>),
}

impl<T: Scalar> Tolerance<T> {
    pub fn get(&self, i: usize) -> T {
        match self {
            Tolerance::Scalar(v) => *v,
            Tolerance::Vector(v) => v[i],
        }
    }

    /// Largest component, used when deriving the initial step size.
    pub fn max_value(&self, n: usize) -> T {
        match self {
            Tolerance::Scalar(v) => *v,
            Tolerance::Vector(v) => {
                let mut m = v[0];
                for i in 1..n {
                    if v[i] > m {
                        m = v[i];
                    }
                }
                m
            }
        }
    }

    pub(crate) fn validate(&self, n: usize) -> Result<(), OdeSolverError> {
        if let Tolerance::Vector(v) = self {
            if v.len() != n {
                return Err(OdeSolverError::ToleranceSizeMismatch {
                    expected: n,
                    found: v.len(),
                });
            }
        }
        for i in 0..n {
            if self.get(i) < T::zero() {
                return Err(OdeSolverError::NegativeTolerance { index: i });
            }
        }
        Ok(())
    }
}

impl<T: Scalar> From<T> for Tolerance<T> {
    fn from(v: T) -> Self {
        Tolerance::Scalar(v)
    }
}

impl<T: Scalar> From<DVector<T>> for Tolerance<T> {
    fn from(v: DVector<T>) -> Self {
        Tolerance::Vector(v)
    }
}

/// Load `ewt` with the (not yet inverted) error weights
/// `rtol[i] * |y[i]| + atol[i]`.
pub(crate) fn error_weights_inplace<T: Scalar>(
    rtol: &Tolerance<T>,
    atol: &Tolerance<T>,
    y_col: impl Fn(usize) -> T,
    ewt: &mut DVector<T>,
) {
    for i in 0..ewt.len() {
        ewt[i] = rtol.get(i) * y_col(i).abs() + atol.get(i);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn scalar_broadcasts_and_vector_indexes() {
        let s = Tolerance::from(1e-6);
        assert_eq!(s.get(0), 1e-6);
        assert_eq!(s.get(7), 1e-6);
        let v = Tolerance::from(dvector![1e-3, 1e-9]);
        assert_eq!(v.get(1), 1e-9);
        assert_eq!(v.max_value(2), 1e-3);
    }

    #[test]
    fn validation_rejects_bad_inputs() {
        assert!(Tolerance::from(dvector![1e-6]).validate(2).is_err());
        assert!(Tolerance::from(-1e-6).validate(2).is_err());
        assert!(Tolerance::from(dvector![1e-6, 1e-6]).validate(2).is_ok());
    }
}
