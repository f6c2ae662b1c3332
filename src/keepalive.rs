//! Keep-alive bookkeeping.
//!
//! A PINGREQ goes out only when the connection has been idle in both
//! directions for a full keep-alive interval; ordinary traffic proves
//! liveness on its own. Once a ping is outstanding, silence from the broker
//! for 1.5 intervals since the last read is treated as a dead connection.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum KeepAliveDecision {
    /// Nothing due; re-check after this long.
    Wait(Duration),
    SendPing,
    Timeout,
}

pub(crate) struct KeepAlive {
    interval: Duration,
    inner: Mutex<KeepAliveState>,
}

struct KeepAliveState {
    last_write: Instant,
    last_read: Instant,
    ping_outstanding: bool,
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            inner: Mutex::new(KeepAliveState {
                last_write: now,
                last_read: now,
                ping_outstanding: false,
            }),
        }
    }

    pub fn record_write(&self) {
        self.inner.lock().last_write = Instant::now();
    }

    /// Any inbound packet proves the broker alive, not just PINGRESP.
    pub fn record_read(&self) {
        let mut state = self.inner.lock();
        state.last_read = Instant::now();
        state.ping_outstanding = false;
    }

    pub fn record_ping_sent(&self) {
        let mut state = self.inner.lock();
        state.ping_outstanding = true;
        state.last_write = Instant::now();
    }

    pub fn decision(&self, now: Instant) -> KeepAliveDecision {
        if self.interval.is_zero() {
            return KeepAliveDecision::Wait(Duration::from_secs(3600));
        }
        let state = self.inner.lock();
        if state.ping_outstanding {
            let deadline = state.last_read + self.interval + self.interval / 2;
            if now >= deadline {
                return KeepAliveDecision::Timeout;
            }
            return KeepAliveDecision::Wait(deadline - now);
        }
        let due = state.last_write.max(state.last_read) + self.interval;
        if now >= due {
            KeepAliveDecision::SendPing
        } else {
            KeepAliveDecision::Wait(due - now)
        }
    }
}
