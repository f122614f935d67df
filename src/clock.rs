//! Injected evaluation clock.
//!
//! Every core path that needs "now" reads it from a `Clock` value so that
//! digest runs and tests are reproducible. Temporal extraction and the
//! intrinsic section assignment never touch the clock at all; only the
//! decay stage and admission windows do.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    /// A clock frozen at `t`. Used in tests and for `now_override` runs.
    pub fn fixed(t: DateTime<Utc>) -> Self {
        Clock::Fixed(t)
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(t) => *t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_clock_is_stable() {
        let t = Utc.with_ymd_and_hms(2025, 11, 10, 12, 0, 0).unwrap();
        let clock = Clock::fixed(t);
        assert_eq!(clock.now(), t);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = Clock::system();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
