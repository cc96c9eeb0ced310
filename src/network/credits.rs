use crate::{AppError, AppResult};

/// Flow-control allowance granted to the client. Lives behind the
/// connection's credit lock; `0 <= total <= max` holds after every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credits {
    total: u16,
    max: u16,
}

impl Credits {
    /// a fresh connection may send exactly one request (the negotiate)
    pub fn new(max: u16) -> Self {
        Credits {
            total: 1.min(max),
            max,
        }
    }

    pub fn total(&self) -> u16 {
        self.total
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Grants up to `requested` credits, clamped to the headroom left below
    /// `max`. Returns the number actually granted.
    pub fn grant(&mut self, requested: u16) -> u16 {
        let granted = requested.min(self.max - self.total);
        self.total += granted;
        granted
    }

    /// Charges a request against the allowance.
    pub fn consume(&mut self, charge: u16) -> AppResult<()> {
        if charge > self.total {
            return Err(AppError::InvalidOperation(format!(
                "credit charge {} exceeds available {}",
                charge, self.total
            )));
        }
        self.total -= charge;
        Ok(())
    }

    pub fn set_max(&mut self, max: u16) {
        self.max = max;
        self.total = self.total.min(max);
    }
}
