pub mod coefficients;
pub mod config;
pub mod controller;
pub mod corrector;
pub mod history;
pub mod lsoda;
pub mod stepper;
pub mod tolerance;
