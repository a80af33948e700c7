//! Two-tier liveness tracking.
//!
//! [`PingMonitor`] proves the relay hop is alive with transport-level
//! ping/pong. [`HeartbeatMonitor`] proves the remote host itself answers,
//! using end-to-end heartbeats correlated by id. Both are plain state
//! trackers: the connection actor owns the timers and feeds them `now`.

use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// What the actor should do after a pong deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongTimeout {
    /// Still under the missed-pong threshold.
    Tolerated { missed: u32 },
    /// The socket should be treated as dead.
    Dead { missed: u32 },
}

#[derive(Debug)]
pub struct PingMonitor {
    interval: Duration,
    timeout: Duration,
    max_missed: u32,
    missed: u32,
    outstanding: Option<(u64, Instant)>,
    next_ping_at: Option<Instant>,
}

impl PingMonitor {
    pub fn new(interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            timeout,
            max_missed,
            missed: 0,
            outstanding: None,
            next_ping_at: None,
        }
    }

    /// Arm the periodic ping after a successful handshake.
    pub fn start(&mut self, now: Instant) {
        self.missed = 0;
        self.outstanding = None;
        self.next_ping_at = Some(now + self.interval);
    }

    /// Cancel both the interval and the pong deadline.
    pub fn stop(&mut self) {
        self.missed = 0;
        self.outstanding = None;
        self.next_ping_at = None;
    }

    pub fn next_ping_at(&self) -> Option<Instant> {
        self.next_ping_at
    }

    pub fn pong_deadline(&self) -> Option<Instant> {
        self.outstanding.map(|(_, deadline)| deadline)
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Record a ping carrying `timestamp`. Also re-arms the interval so an
    /// out-of-band probe pushes the next periodic ping back.
    pub fn on_ping_sent(&mut self, timestamp: u64, now: Instant) {
        self.outstanding = Some((timestamp, now + self.timeout));
        self.next_ping_at = Some(now + self.interval);
    }

    /// Interval fired while a pong is still pending: skip this ping.
    pub fn defer(&mut self, now: Instant) {
        self.next_ping_at = Some(now + self.interval);
    }

    /// Returns true when the pong answered the outstanding ping. A pong that
    /// carries no timestamp is accepted; one echoing a different timestamp is
    /// ignored.
    pub fn on_pong(&mut self, timestamp: Option<u64>) -> bool {
        let Some((expected, _)) = self.outstanding else {
            return false;
        };
        if timestamp.is_some_and(|ts| ts != expected) {
            return false;
        }
        self.outstanding = None;
        self.missed = 0;
        true
    }

    pub fn on_pong_timeout(&mut self) -> PongTimeout {
        self.outstanding = None;
        self.missed += 1;
        if self.missed > self.max_missed {
            PongTimeout::Dead {
                missed: self.missed,
            }
        } else {
            PongTimeout::Tolerated {
                missed: self.missed,
            }
        }
    }
}

/// A heartbeat awaiting its ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub id: String,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTimeout {
    /// Relay is up but the host did not answer in time.
    Degraded { missed: u32 },
    /// Too many consecutive misses: rebuild the connection.
    Stale { missed: u32 },
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    stale_after: u32,
    missed: u32,
    pending: Option<(HeartbeatRecord, Instant)>,
    next_beat_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration, stale_after: u32) -> Self {
        Self {
            interval,
            timeout,
            stale_after: stale_after.max(1),
            missed: 0,
            pending: None,
            next_beat_at: None,
        }
    }

    /// Arm heartbeats; the first probe is due immediately.
    pub fn start(&mut self, now: Instant) {
        self.missed = 0;
        self.pending = None;
        self.next_beat_at = Some(now);
    }

    pub fn stop(&mut self) {
        self.missed = 0;
        self.pending = None;
        self.next_beat_at = None;
    }

    /// Stop probing without forgetting the miss count.
    pub fn pause(&mut self) {
        self.pending = None;
        self.next_beat_at = None;
    }

    pub fn next_beat_at(&self) -> Option<Instant> {
        self.next_beat_at
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, deadline)| *deadline)
    }

    pub fn pending(&self) -> Option<&HeartbeatRecord> {
        self.pending.as_ref().map(|(record, _)| record)
    }

    /// Issue a new heartbeat unless one is already outstanding.
    pub fn begin(&mut self, now: Instant) -> Option<HeartbeatRecord> {
        self.next_beat_at = Some(now + self.interval);
        if self.pending.is_some() {
            return None;
        }
        let record = HeartbeatRecord {
            id: Uuid::new_v4().to_string(),
            sent_at: now,
        };
        self.pending = Some((record.clone(), now + self.timeout));
        Some(record)
    }

    /// Match an ack by id. Returns the round-trip time, or `None` when the id
    /// does not belong to the outstanding heartbeat.
    pub fn on_ack(&mut self, id: &str, now: Instant) -> Option<Duration> {
        match &self.pending {
            Some((record, _)) if record.id == id => {
                let rtt = now.saturating_duration_since(record.sent_at);
                self.pending = None;
                self.missed = 0;
                Some(rtt)
            }
            _ => None,
        }
    }

    pub fn on_timeout(&mut self) -> HeartbeatTimeout {
        self.pending = None;
        self.missed += 1;
        if self.missed >= self.stale_after {
            HeartbeatTimeout::Stale {
                missed: self.missed,
            }
        } else {
            HeartbeatTimeout::Degraded {
                missed: self.missed,
            }
        }
    }
}
