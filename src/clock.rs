//! Injectable time source.
//!
//! Freshness checks, retention cutoffs and artifact names all depend on "now". Production
//! code uses [`Clock::System`]; tests pin and advance time with [`Clock::fixed`].

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(Arc<RwLock<DateTime<Utc>>>),
}

impl Clock {
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Clock::Fixed(Arc::new(RwLock::new(at)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at.read(),
        }
    }

    /// Move a fixed clock. No-op on the system clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Clock::Fixed(at) = self {
            *at.write() = to;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Clock::Fixed(at) = self {
            let mut at = at.write();
            *at += by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_clock_is_shared_between_clones() {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap());
        let other = clock.clone();
        clock.advance(Duration::hours(1));
        assert_eq!(other.now(), Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap());
    }
}
