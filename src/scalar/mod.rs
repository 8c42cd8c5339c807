use std::fmt::Display;

/// Scalar floating point type used throughout the library.
///
/// Implemented for `f64` and `f32`. The solver is tuned for double precision;
/// single precision is usable for loose tolerances only.
pub trait Scalar:
    nalgebra::RealField + num_traits::ToPrimitive + Display + Copy + PartialOrd
{
    const EPSILON: Self;
    const INFINITY: Self;

    fn from_f64(value: f64) -> Self;
    fn from_usize(value: usize) -> Self;
}

pub type IndexType = usize;

impl Scalar for f64 {
    const EPSILON: Self = f64::EPSILON;
    const INFINITY: Self = f64::INFINITY;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn from_usize(value: usize) -> Self {
        value as f64
    }
}

impl Scalar for f32 {
    const EPSILON: Self = f32::EPSILON;
    const INFINITY: Self = f32::INFINITY;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn from_usize(value: usize) -> Self {
        value as f32
    }
}
