//! Timeout policy and client configuration.
//!
//! Each request class escalates through two phases measured from submission:
//! Alert (surface a user-visible notice, keep waiting) then Fail (give up).
//! An ack from the enclave pushes the Fail deadline to `ack_time + ack_delay`,
//! never pulling it earlier.

use std::time::Duration;

/// Alert/Fail durations for one request class. Both measured from submission.
#[derive(Debug, Clone, Copy)]
pub struct Phases {
    pub alert: Duration,
    pub fail: Duration,
}

impl Phases {
    pub fn new(alert: Duration, fail: Duration) -> Self {
        Self { alert, fail }
    }
}

/// Per-class timeout phases plus the global ack extension.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub me: Phases,
    pub pair: Phases,
    pub sign: Phases,

    /// How long an ack buys the enclave past the moment it was received.
    pub ack_delay: Duration,
}

impl Default for Timeouts {
    /// Production-safe defaults. Sign waits longest before alerting since the
    /// enclave may be prompting a human; pairing waits on a whole ceremony.
    fn default() -> Self {
        Self {
            me: Phases::new(Duration::from_secs(5), Duration::from_secs(20)),
            pair: Phases::new(Duration::from_secs(30), Duration::from_secs(120)),
            sign: Phases::new(Duration::from_secs(8), Duration::from_secs(30)),
            ack_delay: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    /// Millisecond-scale phases for tests, so the state machine is observable
    /// inside a test time budget. The ack delay stays well above the fail
    /// window so ack extension is actually exercised.
    #[must_use]
    pub fn short() -> Self {
        let phases = Phases::new(Duration::from_millis(100), Duration::from_millis(200));
        Self {
            me: phases,
            pair: phases,
            sign: phases,
            ack_delay: Duration::from_millis(1000),
        }
    }
}

/// Everything the client needs beyond its collaborators.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub timeouts: Timeouts,

    /// How old a cached profile may be before `request_me(false)` goes back
    /// to the network instead of serving from cache.
    pub me_stale_after: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            me_stale_after: Duration::from_secs(15 * 60),
        }
    }
}

impl ClientConfig {
    /// Test configuration: short phases, generous cache tolerance.
    #[must_use]
    pub fn short() -> Self {
        Self {
            timeouts: Timeouts::short(),
            ..Self::default()
        }
    }
}
