//! Settlement value objects: consumption quantity and money.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Computes how many service units a finished session consumes.
///
/// One unit is started per hour, rounded up:
/// - no actual duration reported: bill the planned `duration_minutes`
/// - actual duration of exactly zero: no-show, nothing consumed
/// - otherwise: bill the actual duration
pub fn consumption_quantity(
    actual_duration_minutes: Option<i64>,
    duration_minutes: i64,
) -> Result<u32, DomainError> {
    let minutes = match actual_duration_minutes {
        None => {
            if duration_minutes < 0 {
                return Err(DomainError::InvalidDuration {
                    field: "duration_minutes",
                    minutes: duration_minutes,
                });
            }
            duration_minutes
        }
        Some(0) => return Ok(0),
        Some(actual) if actual < 0 => {
            return Err(DomainError::InvalidDuration {
                field: "actual_duration_minutes",
                minutes: actual,
            });
        }
        Some(actual) => actual,
    };

    // minutes is non-negative here
    let hours = minutes.unsigned_abs().div_ceil(60);
    u32::try_from(hours).map_err(|_| DomainError::InvalidDuration {
        field: "duration_minutes",
        minutes,
    })
}

/// Money amount represented in minor units (cents / fen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Multiplies by a quantity, rejecting amounts that overflow.
    pub fn multiply(&self, quantity: u32) -> Result<Money, DomainError> {
        self.0
            .checked_mul(i64::from(quantity))
            .map(Money)
            .ok_or_else(|| {
                DomainError::Validation(format!("amount overflow: {self} x {quantity}"))
            })
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{sign}{}.{:02}", (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}
