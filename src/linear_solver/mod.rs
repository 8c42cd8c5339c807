pub mod lu;

pub use lu::DenseLu;
