//! Engine clock, the single source of "now".
//!
//! RULE: Nothing in the engine reads the wall clock directly.
//! All due-work decisions take the pass timestamp from this clock, so
//! tests and replay tooling can run on frozen time without sleeping.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub enum Clock {
    /// Wall-clock time.
    System,
    /// Frozen time, advanced manually. Used in tests and the runner.
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(at: DateTime<Utc>) -> Self {
        Clock::Fixed(at)
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }

    /// Advance a fixed clock. Returns the new time.
    /// Panics on a system clock, callers must check.
    pub fn advance(&mut self, by: Duration) -> DateTime<Utc> {
        match self {
            Clock::System => panic!("advance() called on a system clock"),
            Clock::Fixed(at) => {
                *at += by;
                *at
            }
        }
    }
}
