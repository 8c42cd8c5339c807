use std::marker::PhantomData;

use nalgebra::DVector;

use crate::op::OdeRhs;
use crate::scalar::Scalar;

/// Adapts a plain Rust closure `(t, y, dydt)` into an [OdeRhs].
pub struct Closure<T, F>
where
    T: Scalar,
    F: FnMut(T, &DVector<T>, &mut DVector<T>),
{
    func: F,
    nstates: usize,
    _phantom: PhantomData<T>,
}

impl<T, F> Closure<T, F>
where
    T: Scalar,
    F: FnMut(T, &DVector<T>, &mut DVector<T>),
{
    pub fn new(nstates: usize, func: F) -> Self {
        Self {
            func,
            nstates,
            _phantom: PhantomData,
        }
    }
}

impl<T, F> OdeRhs<T> for Closure<T, F>
where
    T: Scalar,
    F: FnMut(T, &DVector<T>, &mut DVector<T>),
{
    fn nstates(&self) -> usize {
        self.nstates
    }

    fn call_inplace(&mut self, t: T, y: &DVector<T>, dydt: &mut DVector<T>) {
        (self.func)(t, y, dydt)
    }
}
