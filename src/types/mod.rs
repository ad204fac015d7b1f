//! Value types shared by the evaluation modes
mod interval;
pub use interval::Interval;
