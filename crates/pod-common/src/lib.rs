//! Shared types for the Pod Manager workspace: the error domain, structured
//! logging setup, fixed-point insulin quantities, and core configuration.

pub mod config;
pub mod error;
pub mod logging;
pub mod units;

pub use error::{PodError, Result};
pub use units::Units;
