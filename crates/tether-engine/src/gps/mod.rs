//! Position acquisition.

pub mod collector;
pub mod source;

pub use collector::GpsCollector;
pub use source::{GpsSource, SimulatedGps};
