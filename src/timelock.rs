use near_sdk::{near, Timestamp};

use crate::error::EscrowError;

const NANOS_IN_SEC: u64 = 1_000_000_000;

/// Refund deadline of an escrow. It stays unset until the first deposit is locked.
#[near(serializers = [borsh])]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timelock {
    /// Absolute block timestamp in nanoseconds, `0` while not started.
    pub expires_at: Timestamp,
}

impl Timelock {
    pub fn is_started(&self) -> bool {
        self.expires_at != 0
    }

    /// Starts the clock at `now`. A started deadline is never moved.
    pub fn start(&mut self, now: Timestamp, duration_sec: u64) {
        if self.is_started() {
            return;
        }
        // never 0, which would read as "not started"
        self.expires_at = now
            .saturating_add(duration_sec.saturating_mul(NANOS_IN_SEC))
            .max(1);
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.is_started() && now >= self.expires_at
    }

    pub fn assert_expired(&self, now: Timestamp) -> Result<(), EscrowError> {
        if self.is_expired(now) {
            Ok(())
        } else {
            Err(EscrowError::EscrowNotExpired)
        }
    }
}
