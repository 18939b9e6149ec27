#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub mod classify;
pub mod config;
pub mod distributions;
pub mod drift;
pub mod error;
pub mod features;
pub mod identification;
pub mod math;
pub mod predict;
pub mod provider;
pub mod segment;
pub mod solver;
pub mod uncertainty;
pub mod weighting;

pub use config::{BasisConfig, Config};
pub use error::{Error, Stage};
pub use identification::{identify, identify_all, SaturationModel};
pub use segment::Segment;

pub type Result<T> = ::std::result::Result<T, Error>;
