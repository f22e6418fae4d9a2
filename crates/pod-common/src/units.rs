//! Fixed-point insulin quantities.
//!
//! Dosage math must never drift, so `Units` stores hundredths-of-a-unit as an
//! exact `u32` (0.05 U is the smallest deliverable increment, so the public
//! constructors reject anything not a multiple of 5 hundredths).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PodError, Result};

/// One insulin quantity, stored as hundredths of a unit (e.g. `5` == 0.05 U).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Units(pub u32);

impl Units {
    pub const STEP_HUNDREDTHS: u32 = 5;
    pub const ZERO: Units = Units(0);

    /// Build from a hundredths-of-a-unit count, validating the 0.05 step.
    pub fn from_hundredths(hundredths: u32) -> Result<Self> {
        if hundredths % Self::STEP_HUNDREDTHS != 0 {
            return Err(PodError::InvalidParameter(format!(
                "{} is not a multiple of 0.05 U",
                hundredths as f64 / 100.0
            )));
        }
        Ok(Units(hundredths))
    }

    /// Build from a decimal amount, rounding to the nearest hundredth first.
    pub fn from_decimal(amount: f64) -> Result<Self> {
        if amount < 0.0 {
            return Err(PodError::InvalidParameter(format!(
                "{amount} is negative"
            )));
        }
        let hundredths = (amount * 100.0).round() as u32;
        Self::from_hundredths(hundredths)
    }

    pub fn as_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: Units) -> Units {
        Units(self.0.saturating_sub(rhs.0))
    }

    /// Number of 0.05 U ticks represented by this quantity.
    pub fn ticks(self) -> u32 {
        self.0 / Self::STEP_HUNDREDTHS
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_decimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_multiple_of_point_zero_five() {
        assert!(Units::from_hundredths(3).is_err());
        assert!(Units::from_hundredths(5).is_ok());
    }

    #[test]
    fn ticks_counts_half_tenths() {
        let u = Units::from_decimal(0.50).unwrap();
        assert_eq!(u.ticks(), 10);
    }

    #[test]
    fn display_renders_decimal() {
        let u = Units::from_decimal(1.25).unwrap();
        assert_eq!(u.to_string(), "1.25");
    }
}
