//! Job trigger expressions
//!
//! ```text
//! every 45s | every 10m | every 2h | @every-minute | @hourly | @daily
//! ```

use std::fmt;
use std::time::Duration;

use super::error::{ConfigError, ConfigResult};

/// Fixed-period trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    period: Duration,
}

impl Trigger {
    pub fn every(period: Duration) -> Self {
        Self { period }
    }

    pub fn parse(expr: &str) -> ConfigResult<Self> {
        let expr = expr.trim();
        let invalid = || ConfigError::InvalidTrigger(expr.to_string());

        let period = match expr {
            "@every-minute" => Duration::from_secs(60),
            "@hourly" => Duration::from_secs(3_600),
            "@daily" => Duration::from_secs(86_400),
            _ => {
                let spec = expr.strip_prefix("every").ok_or_else(invalid)?.trim();
                if spec.len() < 2 {
                    return Err(invalid());
                }
                let (amount, unit) = spec.split_at(spec.len() - 1);
                let amount: u64 = amount.trim().parse().map_err(|_| invalid())?;
                let secs = match unit {
                    "s" => amount,
                    "m" => amount.checked_mul(60).ok_or_else(invalid)?,
                    "h" => amount.checked_mul(3_600).ok_or_else(invalid)?,
                    _ => return Err(invalid()),
                };
                if secs == 0 {
                    return Err(invalid());
                }
                Duration::from_secs(secs)
            }
        };
        Ok(Self { period })
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {}s", self.period.as_secs())
    }
}
